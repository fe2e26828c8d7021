// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Flux-scale reconciliation.
//!
//! Datasets observing the same disk should agree on its flux; in practice
//! independently-calibrated EBs carry multiplicative scale offsets of a few
//! percent. The offset is estimated from the ratio of deprojected
//! visibility-amplitude profiles over overlapping baseline lengths.
//!
//! The trap: a dataset whose fast phase noise has not yet been removed is
//! decoherent, and decoherence also suppresses amplitudes, increasingly so
//! at longer baselines. A flat ratio across baseline length is a genuine
//! scale offset (safe to correct with one scalar); a baseline-dependent
//! trend is decoherence and wants *more self-calibration*, not rescaling.
//! The decision policy here separates the two with a weighted
//! linear-regression slope test.

mod error;
#[cfg(feature = "plotting")]
pub mod plotting;
#[cfg(test)]
mod tests;

pub use error::FluxScaleError;

use log::{debug, warn};
use marlu::constants::VEL_C;
use ndarray::prelude::*;
use serde::Serialize;
use vec1::Vec1;

use crate::math::{fit_line, weighted_mean};
use crate::obs::{DataColumn, VisDataset};
use crate::solutions::{CalMode, GainTable, SpwBlock, Timeblock};
use crate::solve::apply::{apply_gains, ApplyMode, ApplyParams, Interp};

/// The disk's sky geometry, used to deproject baselines onto a common
/// physical axis.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DiskGeometry {
    pub incl_deg: f64,

    /// Position angle of the major axis, east of north \[deg\].
    pub pa_deg: f64,
}

/// Tunables for the estimate and the rescale decision.
#[derive(Debug, Clone)]
pub struct FluxScaleParams {
    /// Number of deprojected-baseline bins over the overlapping range.
    pub nbins: usize,

    /// Ratios within this fraction of 1 are left alone.
    pub ratio_tolerance: f64,

    /// A slope this many standard errors from zero is decoherence.
    pub slope_sigma: f64,

    /// Below this overlap fraction the estimate is flagged untrustworthy.
    pub min_overlap_fraction: f64,
}

impl Default for FluxScaleParams {
    fn default() -> Self {
        FluxScaleParams {
            nbins: 10,
            ratio_tolerance: crate::constants::DEFAULT_FLUX_RATIO_TOLERANCE,
            slope_sigma: crate::constants::DEFAULT_FLUX_SLOPE_SIGMA,
            min_overlap_fraction: 0.2,
        }
    }
}

/// One bin of the amplitude-ratio profile.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RatioBin {
    pub rdep_klambda: f64,
    pub ratio: f64,
    pub err: f64,
}

/// The result of comparing one dataset against the reference.
#[derive(Debug, Clone, Serialize)]
pub struct FluxScaleEstimate {
    pub reference: String,
    pub comparison: String,

    /// Weighted-mean amplitude ratio comparison/reference.
    pub ratio: f64,
    pub ratio_err: f64,

    /// Ratio trend against deprojected baseline length.
    pub slope_per_klambda: f64,
    pub slope_err: f64,

    pub bins: Vec<RatioBin>,

    /// Fraction of the union baseline range the two datasets share. A low
    /// value means very different baseline distributions (e.g. SB vs LB) and
    /// an estimate that needs corroboration.
    pub overlap_fraction: f64,

    pub low_overlap: bool,
}

impl FluxScaleEstimate {
    /// How many standard errors the slope sits from zero.
    pub fn slope_significance(&self) -> f64 {
        if self.slope_err <= 0.0 {
            return 0.0;
        }
        (self.slope_per_klambda / self.slope_err).abs()
    }
}

/// What to do about a measured flux-scale estimate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum RescaleDecision {
    /// Ratio consistent with unity; leave the dataset alone.
    NoChange,

    /// A genuine flat offset; divide the dataset's amplitudes by the ratio.
    Rescale { factor: f64 },

    /// Baseline-dependent trend: decoherence masquerading as a flux offset.
    /// Rescaling would mask the real problem; self-calibrate further and
    /// re-measure instead.
    DeferDecoherent,
}

/// Deproject a uv point onto the disk's frame, returning the effective
/// baseline length in kilolambda.
fn deproject(u_lambda: f64, v_lambda: f64, geometry: &DiskGeometry) -> f64 {
    let (s_pa, c_pa) = geometry.pa_deg.to_radians().sin_cos();
    let cos_i = geometry.incl_deg.to_radians().cos();
    // Rotate into the disk frame; the minor-axis direction forshortens by
    // cos(i).
    let up = u_lambda * c_pa - v_lambda * s_pa;
    let vp = u_lambda * s_pa + v_lambda * c_pa;
    ((up * cos_i).powi(2) + vp.powi(2)).sqrt() / 1000.0
}

/// Per-sample (deprojected baseline, amplitude, weight) triples over the
/// continuum spws of the best column.
fn deprojected_samples(ds: &VisDataset, geometry: &DiskGeometry) -> Vec<(f64, f64, f64)> {
    let mut samples = vec![];
    for &spw in &ds.continuum_spw_ids() {
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
                    let rdep = deproject(uvw.u / lambda, uvw.v / lambda, geometry);
                    let amp = (vis[(t, b, c)].norm()) as f64;
                    samples.push((rdep, amp, w));
                }
            }
        }
    }
    samples
}

/// Estimate the flux-scale ratio of `comparison` to `reference`.
pub fn estimate_flux_scale(
    reference: &VisDataset,
    comparison: &VisDataset,
    geometry: &DiskGeometry,
    params: &FluxScaleParams,
) -> Result<FluxScaleEstimate, FluxScaleError> {
    let ref_samples = deprojected_samples(reference, geometry);
    let cmp_samples = deprojected_samples(comparison, geometry);
    if ref_samples.is_empty() || cmp_samples.is_empty() {
        return Err(FluxScaleError::NoData {
            dataset: if ref_samples.is_empty() {
                reference.name.clone()
            } else {
                comparison.name.clone()
            },
        });
    }

    let range = |samples: &[(f64, f64, f64)]| {
        samples.iter().fold((f64::MAX, f64::MIN), |(lo, hi), s| {
            (lo.min(s.0), hi.max(s.0))
        })
    };
    let (ref_lo, ref_hi) = range(&ref_samples);
    let (cmp_lo, cmp_hi) = range(&cmp_samples);
    let lo = ref_lo.max(cmp_lo);
    let hi = ref_hi.min(cmp_hi);
    if hi <= lo {
        return Err(FluxScaleError::NoOverlap {
            reference: reference.name.clone(),
            comparison: comparison.name.clone(),
        });
    }
    let overlap_fraction = (hi - lo) / (ref_hi.max(cmp_hi) - ref_lo.min(cmp_lo));
    let low_overlap = overlap_fraction < params.min_overlap_fraction;
    if low_overlap {
        warn!(
            "{} vs {}: only {:.0}% of the baseline range overlaps; treat this flux ratio as indicative, not authoritative",
            comparison.name,
            reference.name,
            overlap_fraction * 100.0
        );
    }

    // Weighted mean amplitude per bin for both datasets, then the per-bin
    // ratio.
    let bin_width = (hi - lo) / params.nbins as f64;
    let bin_profile = |samples: &[(f64, f64, f64)]| -> Vec<Option<(f64, f64)>> {
        (0..params.nbins)
            .map(|i| {
                let b_lo = lo + i as f64 * bin_width;
                let b_hi = b_lo + bin_width;
                let (amps, ws): (Vec<f64>, Vec<f64>) = samples
                    .iter()
                    .filter(|s| s.0 >= b_lo && s.0 < b_hi)
                    .map(|s| (s.1, s.2))
                    .unzip();
                weighted_mean(&amps, &ws)
            })
            .collect()
    };
    let ref_profile = bin_profile(&ref_samples);
    let cmp_profile = bin_profile(&cmp_samples);

    let mut bins = vec![];
    for i in 0..params.nbins {
        if let (Some((ra, re)), Some((ca, ce))) = (ref_profile[i], cmp_profile[i]) {
            if ra <= 0.0 {
                continue;
            }
            let ratio = ca / ra;
            // First-order error propagation on the ratio.
            let err = ratio * ((ce / ca).powi(2) + (re / ra).powi(2)).sqrt();
            bins.push(RatioBin {
                rdep_klambda: lo + (i as f64 + 0.5) * bin_width,
                ratio,
                err: err.max(1e-12),
            });
        }
    }
    if bins.len() < 2 {
        return Err(FluxScaleError::TooFewBins {
            reference: reference.name.clone(),
            comparison: comparison.name.clone(),
            bins: bins.len(),
        });
    }

    let weights: Vec<f64> = bins.iter().map(|b| 1.0 / (b.err * b.err)).collect();
    let ratios: Vec<f64> = bins.iter().map(|b| b.ratio).collect();
    let rdeps: Vec<f64> = bins.iter().map(|b| b.rdep_klambda).collect();
    let (ratio, ratio_err) =
        weighted_mean(&ratios, &weights).expect("bins have positive weights");
    let line = fit_line(&rdeps, &ratios, &weights).expect("at least two bins");

    debug!(
        "{} / {}: ratio {:.4} +/- {:.4}, slope {:+.3e}/klambda ({:.1} sigma)",
        comparison.name,
        reference.name,
        ratio,
        ratio_err,
        line.slope,
        (line.slope / line.slope_err).abs()
    );

    Ok(FluxScaleEstimate {
        reference: reference.name.clone(),
        comparison: comparison.name.clone(),
        ratio,
        ratio_err,
        slope_per_klambda: line.slope,
        slope_err: line.slope_err,
        bins,
        overlap_fraction,
        low_overlap,
    })
}

/// The embedded decision policy: rescale only flat, significant offsets.
pub fn rescale_decision(
    estimate: &FluxScaleEstimate,
    params: &FluxScaleParams,
) -> RescaleDecision {
    if estimate.slope_significance() > params.slope_sigma {
        return RescaleDecision::DeferDecoherent;
    }
    if (estimate.ratio - 1.0).abs() > params.ratio_tolerance {
        RescaleDecision::Rescale {
            factor: 1.0 / estimate.ratio,
        }
    } else {
        RescaleDecision::NoChange
    }
}

/// Multiply a dataset's visibility amplitudes by `factor`.
///
/// The correction goes through the calibration-table machinery rather than
/// editing the data arrays, so the dataset's lineage records it like any
/// other calibration; the result is then split back to a plain data column.
pub fn rescale_flux(
    ds: &VisDataset,
    factor: f64,
    out_name: &str,
) -> Result<VisDataset, FluxScaleError> {
    if factor <= 0.0 {
        return Err(FluxScaleError::BadFactor { factor });
    }
    // corrected = data / (g_i conj(g_j)); a uniform gain of 1/sqrt(factor)
    // multiplies every amplitude by factor.
    let g = marlu::c64::new(1.0 / factor.sqrt(), 0.0);
    let timestamps = ds.timestamps.clone();
    let median = *timestamps
        .as_slice()
        .get(timestamps.len() / 2)
        .expect("datasets have timestamps");
    let table = GainTable {
        name: format!("{out_name}.fluxscale.g"),
        mode: CalMode::AmpPhase,
        antennas: ds.antennas.clone(),
        timeblocks: Vec1::new(Timeblock {
            index: 0,
            range: 0..ds.num_timesteps(),
            timestamps,
            median,
        }),
        spwblocks: ds
            .spws
            .iter()
            .map(|spw| SpwBlock {
                index: spw.id,
                spw_ids: vec![spw.id],
                source_ebs: vec![spw.source_eb.clone()],
                centre_freq_hz: spw.centre_freq_hz(),
            })
            .collect(),
        gains: Array3::from_elem((1, ds.num_antennas(), ds.spws.len()), g),
        snrs: Array3::from_elem((1, ds.num_antennas(), ds.spws.len()), f64::INFINITY),
        solved_from: ds.name.clone(),
        refant: None,
    };
    let applied = apply_gains(
        ds,
        &table,
        &ApplyParams {
            out_name: format!("{out_name}.applied"),
            spw_map: (0..ds.spws.len()).collect(),
            interp: Interp::Nearest,
            calwt: true,
            apply_mode: ApplyMode::CalOnly,
        },
    )
    .map_err(|e| FluxScaleError::Apply {
        dataset: ds.name.clone(),
        message: e.to_string(),
    })?;
    let out = applied
        .split(out_name, DataColumn::Corrected)
        .expect("applycal always writes a corrected column");
    Ok(out)
}
