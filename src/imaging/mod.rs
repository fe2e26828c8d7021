// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Synthesis imaging.
//!
//! [`SynthesisImager`] is the pipeline's contract with the external imaging
//! engine: visibilities, a clean mask and a stopping threshold in; a sky
//! image, a model (attached to the dataset as a side channel) and
//! image-plane statistics out. [`GridImager`] is the in-crate reference
//! implementation: Briggs-weighted uv gridding, an FFT dirty image and a
//! shallow masked component search that populates the MODEL column. The
//! image-plane RMS comes from an annulus away from the source; it is the
//! self-cal loop's convergence signal, so it must be measured on a
//! signal-free region.

mod error;

pub use error::ImagingError;

use std::f64::consts::TAU;

use log::{debug, trace};
use marlu::{c32, c64, constants::VEL_C};
use ndarray::prelude::*;
use rayon::prelude::*;
use rustfft::{num_complex::Complex as FftComplex, FftPlanner};
use serde::Serialize;

use crate::obs::VisDataset;

/// An elliptical sky region enclosing the known source extent. Offsets and
/// axes are in radians; the position angle is east of north.
#[derive(Debug, Clone, Copy)]
pub struct EllipseMask {
    pub l_off_rad: f64,
    pub m_off_rad: f64,
    pub semimajor_rad: f64,
    pub semiminor_rad: f64,
    pub pa_rad: f64,
}

impl EllipseMask {
    pub fn contains(&self, l: f64, m: f64) -> bool {
        let dl = l - self.l_off_rad;
        let dm = m - self.m_off_rad;
        let (s_pa, c_pa) = self.pa_rad.sin_cos();
        let along = dl * s_pa + dm * c_pa;
        let across = dl * c_pa - dm * s_pa;
        (along / self.semimajor_rad).powi(2) + (across / self.semiminor_rad).powi(2) <= 1.0
    }
}

/// Imaging inputs, mirroring the external imaging engine's contract.
#[derive(Debug, Clone)]
pub struct ImagingParams {
    /// Image size in pixels per side (even).
    pub size: usize,

    /// Angular pixel size \[rad\].
    pub cell_rad: f64,

    /// Briggs robust parameter; 2 is effectively natural weighting.
    pub robust: f64,

    /// Cap on minor-cycle iterations.
    pub niter: usize,

    /// Minor-cycle loop gain.
    pub gain: f64,

    /// Stop cleaning once the masked peak drops below this \[Jy\].
    pub threshold_jy: f64,

    pub mask: EllipseMask,

    /// Multiscale basis \[pixels\]. The reference imager only supports delta
    /// components; non-zero scales are accepted and ignored.
    pub scales: Vec<usize>,

    /// RMS annulus inner/outer radii from the phase centre \[rad\]. Must sit
    /// outside the mask for the RMS to be meaningful.
    pub annulus_rad: (f64, f64),

    /// Parallelise the gridding and model prediction internally. A
    /// configuration flag of the imager, not a pipeline-level concurrency
    /// concern.
    pub parallel: bool,

    /// Spws to image; `None` means the continuum spws.
    pub spw_ids: Option<Vec<usize>>,
}

/// Image-plane scalars derived from an imaging run.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ImageStats {
    pub rms_jy: f64,
    pub peak_jy: f64,
    pub peak_snr: f64,
    pub flux_in_mask_jy: f64,
}

/// A delta component extracted by the minor cycles.
#[derive(Debug, Clone, Copy)]
pub struct CleanComponent {
    pub l_rad: f64,
    pub m_rad: f64,
    pub flux_jy: f64,
}

/// The products of one imaging run.
#[derive(Debug)]
pub struct ImageProducts {
    /// The dirty image \[Jy/beam\].
    pub image: Array2<f64>,

    /// The dirty image after component subtraction.
    pub residual: Array2<f64>,

    /// The point-spread function, unit peak.
    pub psf: Array2<f64>,

    pub components: Vec<CleanComponent>,

    pub stats: ImageStats,
}

/// The external imaging contract. Implementations attach model visibilities
/// to the dataset as a side channel, the one sanctioned in-place mutation.
pub trait SynthesisImager {
    fn image(
        &self,
        ds: &mut VisDataset,
        params: &ImagingParams,
    ) -> Result<ImageProducts, ImagingError>;
}

/// The reference imager.
#[derive(Debug, Default)]
pub struct GridImager;

impl SynthesisImager for GridImager {
    fn image(
        &self,
        ds: &mut VisDataset,
        params: &ImagingParams,
    ) -> Result<ImageProducts, ImagingError> {
        if params.size == 0 || params.size % 2 != 0 {
            return Err(ImagingError::BadImageSize { size: params.size });
        }
        let spw_ids = match &params.spw_ids {
            Some(ids) => ids.clone(),
            None => ds.continuum_spw_ids(),
        };
        if spw_ids.is_empty() {
            return Err(ImagingError::NoSpwsToImage {
                dataset: ds.name.clone(),
            });
        }

        let samples = collect_samples(ds, &spw_ids);
        if samples.is_empty() {
            return Err(ImagingError::AllDataFlagged {
                dataset: ds.name.clone(),
            });
        }
        debug!(
            "imaging {}: {} samples over spws {:?}, {}x{} pixels",
            ds.name,
            samples.len(),
            spw_ids,
            params.size,
            params.size
        );

        let (dirty, psf) = grid_and_invert(&samples, params);

        // Shallow masked component search on a copy of the dirty image.
        let n = params.size;
        let mut residual = dirty.clone();
        let mut component_image = Array2::<f64>::zeros((n, n));
        let mask_pixels = mask_pixel_list(params);
        let mut num_cycles = 0;
        for _ in 0..params.niter {
            let Some(&(pi, pj)) = mask_pixels
                .iter()
                .max_by(|&&(ai, aj), &&(bi, bj)| {
                    residual[(ai, aj)]
                        .abs()
                        .partial_cmp(&residual[(bi, bj)].abs())
                        .expect("image is not NaN")
                })
            else {
                break;
            };
            let peak = residual[(pi, pj)];
            if peak.abs() < params.threshold_jy {
                break;
            }
            let flux = params.gain * peak;
            subtract_psf(&mut residual, &psf, pi, pj, flux);
            component_image[(pi, pj)] += flux;
            num_cycles += 1;
        }
        trace!("{}: {} minor cycles", ds.name, num_cycles);

        let components: Vec<CleanComponent> = component_image
            .indexed_iter()
            .filter(|(_, &f)| f != 0.0)
            .map(|((i, j), &f)| {
                let (l, m) = pixel_to_lm(i, j, n, params.cell_rad);
                CleanComponent {
                    l_rad: l,
                    m_rad: m,
                    flux_jy: f,
                }
            })
            .collect();

        // Attach the model to the dataset.
        predict_model(ds, &spw_ids, &components, params.parallel);

        let stats = image_stats(&dirty, &residual, &psf, &components, params);
        Ok(ImageProducts {
            image: dirty,
            residual,
            psf,
            components,
            stats,
        })
    }
}

/// A weighted visibility sample in wavelengths.
struct UvSample {
    u_lambda: f64,
    v_lambda: f64,
    vis: c64,
    weight: f64,
}

fn collect_samples(ds: &VisDataset, spw_ids: &[usize]) -> Vec<UvSample> {
    let mut samples = vec![];
    for &spw in spw_ids {
        let sd = &ds.spw_data[spw];
        let vis = sd.best();
        let freqs = ds.spws[spw].freqs_hz();
        for t in 0..ds.num_timesteps() {
            for b in 0..ds.num_baselines() {
                let uvw = ds.uvws_m[(t, b)];
                for (c, &freq) in freqs.iter().enumerate() {
                    if sd.flags[(t, b, c)] {
                        continue;
                    }
                    let w = sd.weights[(t, b, c)] as f64;
                    if w <= 0.0 {
                        continue;
                    }
                    let lambda = VEL_C / freq;
                    let v = vis[(t, b, c)];
                    samples.push(UvSample {
                        u_lambda: uvw.u / lambda,
                        v_lambda: uvw.v / lambda,
                        vis: c64::new(v.re as f64, v.im as f64),
                        weight: w,
                    });
                }
            }
        }
    }
    samples
}

/// Grid the samples (and their hermitian conjugates), apply Briggs
/// weighting, and invert to a dirty image and PSF, both in Jy/beam with the
/// PSF peak at one.
fn grid_and_invert(samples: &[UvSample], params: &ImagingParams) -> (Array2<f64>, Array2<f64>) {
    let n = params.size;
    let du = 1.0 / (n as f64 * params.cell_rad);

    // First pass: gridded natural weight density, for the Briggs factor.
    let mut density = Array2::<f64>::zeros((n, n));
    let mut sum_w = 0.0;
    for s in samples {
        for (u, v, _) in [(s.u_lambda, s.v_lambda, false), (-s.u_lambda, -s.v_lambda, true)] {
            if let Some((iu, iv)) = uv_to_cell(u, v, du, n) {
                density[(iu, iv)] += s.weight;
                sum_w += s.weight;
            }
        }
    }
    let mean_density = density.iter().map(|d| d * d).sum::<f64>() / sum_w.max(f64::MIN_POSITIVE);
    let f2 = (5.0 * 10f64.powf(-params.robust)).powi(2) / mean_density.max(f64::MIN_POSITIVE);

    // Second pass: grid data and weights with the robust factor applied.
    let mut grid_vis = Array2::<c64>::zeros((n, n));
    let mut grid_wt = Array2::<c64>::zeros((n, n));
    let mut sum_rw = 0.0;
    for s in samples {
        for (u, v, conj) in [(s.u_lambda, s.v_lambda, false), (-s.u_lambda, -s.v_lambda, true)] {
            if let Some((iu, iv)) = uv_to_cell(u, v, du, n) {
                let rw = s.weight / (1.0 + density[(iu, iv)] * f2);
                let vis = if conj { s.vis.conj() } else { s.vis };
                grid_vis[(iu, iv)] += vis * rw;
                grid_wt[(iu, iv)] += c64::new(rw, 0.0);
                sum_rw += rw;
            }
        }
    }

    let dirty = invert_grid(&grid_vis, sum_rw, params.parallel);
    let psf = invert_grid(&grid_wt, sum_rw, params.parallel);
    (dirty, psf)
}

fn uv_to_cell(u: f64, v: f64, du: f64, n: usize) -> Option<(usize, usize)> {
    let iu = (u / du).round() + n as f64 / 2.0;
    let iv = (v / du).round() + n as f64 / 2.0;
    (iu >= 0.0 && iu < n as f64 && iv >= 0.0 && iv < n as f64)
        .then(|| (iu as usize, iv as usize))
}

/// Inverse-FFT a centred uv grid into a centred image, normalised by the
/// weight sum. Also used by the alignment engine's cross-correlation search.
pub(crate) fn invert_grid(grid: &Array2<c64>, sum_w: f64, parallel: bool) -> Array2<f64> {
    let n = grid.nrows();
    let mut work: Vec<FftComplex<f64>> = Vec::with_capacity(n * n);
    for v in grid.iter() {
        work.push(FftComplex::new(v.re, v.im));
    }
    fftshift_inplace(&mut work, n);

    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_inverse(n);

    // Rows are contiguous.
    if parallel {
        work.par_chunks_exact_mut(n).for_each(|row| fft.process(row));
    } else {
        work.chunks_exact_mut(n).for_each(|row| fft.process(row));
    }
    // Columns via transpose, transform, transpose back.
    transpose_inplace(&mut work, n);
    if parallel {
        work.par_chunks_exact_mut(n).for_each(|col| fft.process(col));
    } else {
        work.chunks_exact_mut(n).for_each(|col| fft.process(col));
    }
    transpose_inplace(&mut work, n);

    fftshift_inplace(&mut work, n);
    let norm = 1.0 / sum_w.max(f64::MIN_POSITIVE);
    Array2::from_shape_vec((n, n), work.iter().map(|v| v.re * norm).collect())
        .expect("shape matches by construction")
}

/// Swap quadrants in place; for even n, its own inverse.
fn fftshift_inplace(data: &mut [FftComplex<f64>], n: usize) {
    let h = n / 2;
    for i in 0..h {
        for j in 0..n {
            let src = i * n + j;
            let dst = ((i + h) % n) * n + ((j + h) % n);
            data.swap(src, dst);
        }
    }
}

fn transpose_inplace(data: &mut [FftComplex<f64>], n: usize) {
    for i in 0..n {
        for j in (i + 1)..n {
            data.swap(i * n + j, j * n + i);
        }
    }
}

/// Pixel indices to (l, m), image centred on the phase centre.
fn pixel_to_lm(i: usize, j: usize, n: usize, cell_rad: f64) -> (f64, f64) {
    // Axis 0 carries u -> l, axis 1 carries v -> m.
    let l = (i as f64 - n as f64 / 2.0) * cell_rad;
    let m = (j as f64 - n as f64 / 2.0) * cell_rad;
    (l, m)
}

fn mask_pixel_list(params: &ImagingParams) -> Vec<(usize, usize)> {
    let n = params.size;
    let mut pixels = vec![];
    for i in 0..n {
        for j in 0..n {
            let (l, m) = pixel_to_lm(i, j, n, params.cell_rad);
            if params.mask.contains(l, m) {
                pixels.push((i, j));
            }
        }
    }
    pixels
}

fn subtract_psf(residual: &mut Array2<f64>, psf: &Array2<f64>, pi: usize, pj: usize, flux: f64) {
    let n = residual.nrows();
    let h = n / 2;
    for i in 0..n {
        for j in 0..n {
            // PSF centre lands on the peak pixel; edges clip.
            let (Some(si), Some(sj)) = (
                (i + h).checked_sub(pi).filter(|&x| x < n),
                (j + h).checked_sub(pj).filter(|&x| x < n),
            ) else {
                continue;
            };
            residual[(i, j)] -= flux * psf[(si, sj)];
        }
    }
}

/// Predict model visibilities from delta components by direct transform and
/// attach them to the dataset.
fn predict_model(
    ds: &mut VisDataset,
    spw_ids: &[usize],
    components: &[CleanComponent],
    parallel: bool,
) {
    for &spw in spw_ids {
        let freqs = ds.spws[spw].freqs_hz();
        let dim = ds.spw_data[spw].data.dim();
        let uvws = ds.uvws_m.clone();
        let mut model = Array3::<c32>::zeros(dim);

        let predict_row = |t: usize, mut row: ArrayViewMut2<c32>| {
            for b in 0..dim.1 {
                let uvw = uvws[(t, b)];
                for (c, &freq) in freqs.iter().enumerate() {
                    let lambda = VEL_C / freq;
                    let (u_l, v_l) = (uvw.u / lambda, uvw.v / lambda);
                    let mut acc = c64::new(0.0, 0.0);
                    for comp in components {
                        let phase = -TAU * (u_l * comp.l_rad + v_l * comp.m_rad);
                        acc += c64::from_polar(comp.flux_jy, phase);
                    }
                    row[(b, c)] = c32::new(acc.re as f32, acc.im as f32);
                }
            }
        };

        if parallel {
            model
                .outer_iter_mut()
                .into_par_iter()
                .enumerate()
                .for_each(|(t, row)| predict_row(t, row));
        } else {
            model
                .outer_iter_mut()
                .enumerate()
                .for_each(|(t, row)| predict_row(t, row));
        }
        ds.set_model(spw, model);
    }
}

fn image_stats(
    dirty: &Array2<f64>,
    residual: &Array2<f64>,
    psf: &Array2<f64>,
    components: &[CleanComponent],
    params: &ImagingParams,
) -> ImageStats {
    let n = params.size;
    let (r_in, r_out) = params.annulus_rad;

    // RMS over the annulus of the residual image: a signal-free region, or
    // the estimate is meaningless.
    let mut sum_sq = 0.0;
    let mut count = 0usize;
    for i in 0..n {
        for j in 0..n {
            let (l, m) = pixel_to_lm(i, j, n, params.cell_rad);
            let r = (l * l + m * m).sqrt();
            if r >= r_in && r <= r_out && !params.mask.contains(l, m) {
                sum_sq += residual[(i, j)].powi(2);
                count += 1;
            }
        }
    }
    let rms_jy = (sum_sq / count.max(1) as f64).sqrt();

    // Peak over the mask of the dirty image.
    let peak_jy = mask_pixel_list(params)
        .iter()
        .map(|&(i, j)| dirty[(i, j)])
        .fold(0.0_f64, f64::max);

    // Rough beam area from the PSF main lobe, for converting residual
    // Jy/beam to Jy.
    let beam_area: f64 = psf.iter().filter(|&&p| p > 0.5).sum();
    let residual_flux: f64 = mask_pixel_list(params)
        .iter()
        .map(|&(i, j)| residual[(i, j)])
        .sum::<f64>()
        / beam_area.max(1.0);
    let flux_in_mask_jy =
        components.iter().map(|c| c.flux_jy).sum::<f64>() + residual_flux;

    ImageStats {
        rms_jy,
        peak_jy,
        peak_snr: peak_jy / rms_jy.max(f64::MIN_POSITIVE),
        flux_in_mask_jy,
    }
}
