// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Synthetic execution blocks.
//!
//! Generates visibility datasets from an analytic disk model, with
//! injectable corruptions: per-antenna phase noise, amplitude drifts, a
//! flux-scale error, a pointing-centre offset and a decoherence taper. This
//! is the substrate for the pipeline's end-to-end tests and the `simulate`
//! subcommand.

mod error;

pub use error::SimulateError;

use std::f64::consts::TAU;
use std::ops::Range;

use hifitime::Epoch;
use log::debug;
use marlu::{c32, c64, constants::VEL_C, RADec, UVW};
use ndarray::prelude::*;
use vec1::Vec1;

use crate::constants::MAS_TO_RAD;
use crate::math::Xorshift;
use crate::obs::{Antenna, SpectralWindow, SpwData, SpwIntent, VisDataset};

/// Sidereal rate \[rad/s\].
const EARTH_ROT_RAD_PER_S: f64 = TAU / 86164.0905;

/// One component of the analytic sky model: a point or circular Gaussian.
#[derive(Debug, Clone, Copy)]
pub struct SkyComponent {
    /// Eastward angular offset from the phase centre \[rad\].
    pub l_rad: f64,

    /// Northward angular offset from the phase centre \[rad\].
    pub m_rad: f64,

    pub flux_jy: f64,

    /// FWHM of a circular Gaussian \[rad\]; 0 makes a point source.
    pub fwhm_rad: f64,
}

/// The analytic sky model visibilities are generated from.
#[derive(Debug, Clone)]
pub struct DiskModel {
    pub components: Vec<SkyComponent>,
}

impl DiskModel {
    /// A single point source at the phase centre.
    pub fn point(flux_jy: f64) -> DiskModel {
        DiskModel {
            components: vec![SkyComponent {
                l_rad: 0.0,
                m_rad: 0.0,
                flux_jy,
                fwhm_rad: 0.0,
            }],
        }
    }

    /// A compact disk: a point core plus a Gaussian envelope.
    pub fn compact_disk(core_jy: f64, envelope_jy: f64, envelope_fwhm_mas: f64) -> DiskModel {
        DiskModel {
            components: vec![
                SkyComponent {
                    l_rad: 0.0,
                    m_rad: 0.0,
                    flux_jy: core_jy,
                    fwhm_rad: 0.0,
                },
                SkyComponent {
                    l_rad: 0.0,
                    m_rad: 0.0,
                    flux_jy: envelope_jy,
                    fwhm_rad: envelope_fwhm_mas * MAS_TO_RAD,
                },
            ],
        }
    }

    /// The model visibility at a uv point \[wavelengths\].
    pub fn visibility(&self, u_lambda: f64, v_lambda: f64) -> c64 {
        let mut acc = c64::new(0.0, 0.0);
        for comp in &self.components {
            let r2 = u_lambda * u_lambda + v_lambda * v_lambda;
            let amp = if comp.fwhm_rad > 0.0 {
                // Fourier transform of a circular Gaussian of the given FWHM.
                comp.flux_jy
                    * (-(std::f64::consts::PI * comp.fwhm_rad).powi(2) * r2
                        / (4.0 * std::f64::consts::LN_2))
                        .exp()
            } else {
                comp.flux_jy
            };
            let phase = -TAU * (u_lambda * comp.l_rad + v_lambda * comp.m_rad);
            acc += c64::from_polar(amp, phase);
        }
        acc
    }
}

/// A spectral-window recipe for the simulator.
#[derive(Debug, Clone)]
pub struct SpwSetup {
    pub first_freq_hz: f64,
    pub chan_width_hz: f64,
    pub num_chans: usize,
    pub intent: SpwIntent,
}

impl SpwSetup {
    /// A single-chunk continuum window centred near 233 GHz (ALMA band 6).
    pub fn band6_continuum(num_chans: usize) -> SpwSetup {
        SpwSetup {
            first_freq_hz: 232.6e9,
            chan_width_hz: 128e6 / num_chans as f64,
            num_chans,
            intent: SpwIntent::Continuum,
        }
    }
}

/// Everything needed to manufacture one synthetic EB.
#[derive(Debug, Clone)]
pub struct SimParams {
    pub name: String,
    pub num_antennas: usize,

    /// Rough array diameter \[m\]. ~300 m mimics a short-baseline
    /// configuration, ~10 km a long-baseline one.
    pub array_extent_m: f64,

    pub num_times: usize,
    pub integration_s: f64,
    pub num_scans: usize,

    /// Gap between scans, in integrations.
    pub scan_gap_ints: usize,

    pub start_gpst_s: f64,
    pub phase_centre: RADec,
    pub latitude_rad: f64,
    pub spws: Vec<SpwSetup>,

    /// Standard deviation of per-antenna atmospheric phase noise \[deg\].
    /// Realised as a temporally-correlated random walk, so power exists on
    /// all timescales and shorter solution intervals recover more of it.
    pub phase_noise_deg: f64,

    /// Standard deviation of slow per-antenna amplitude drifts (fractional).
    pub amp_drift_std: f64,

    /// Multiplies all signal amplitudes; an injected flux-scale error.
    pub flux_scale: f64,

    /// Apparent source offset from the phase centre \[mas\]; an injected
    /// astrometric error.
    pub pointing_offset_mas: (f64, f64),

    /// If set, signal amplitudes are tapered by exp(-(r/scale)^2) with r the
    /// baseline length in kilolambda, simulating decoherence.
    pub decoherence_scale_klambda: Option<f64>,

    /// Per-visibility thermal noise \[Jy\].
    pub noise_jy: f64,

    pub seed: u64,
}

impl SimParams {
    /// Sensible defaults for a short-baseline EB of a southern disk.
    pub fn new(name: &str) -> SimParams {
        SimParams {
            name: name.to_string(),
            num_antennas: 8,
            array_extent_m: 300.0,
            num_times: 60,
            integration_s: 6.0,
            num_scans: 4,
            scan_gap_ints: 10,
            start_gpst_s: 1.3e9,
            phase_centre: RADec::from_degrees(248.0, -24.0),
            latitude_rad: -23.02_f64.to_radians(),
            spws: vec![SpwSetup::band6_continuum(4)],
            phase_noise_deg: 0.0,
            amp_drift_std: 0.0,
            flux_scale: 1.0,
            pointing_offset_mas: (0.0, 0.0),
            decoherence_scale_klambda: None,
            noise_jy: 0.01,
            seed: 0xA1A,
        }
    }
}

/// Antenna positions on a loose spiral, scaled to the requested extent.
fn antenna_layout(num_antennas: usize, extent_m: f64) -> Vec<Antenna> {
    let golden = std::f64::consts::PI * (3.0 - 5.0_f64.sqrt());
    (0..num_antennas)
        .map(|k| {
            let frac = (k + 1) as f64 / num_antennas as f64;
            let r = extent_m / 2.0 * (0.15 + 0.85 * frac);
            let th = k as f64 * golden;
            Antenna {
                name: format!("DA{:02}", 41 + k),
                station: format!("A{:03}", k * 7 + 1),
                position_enu_m: [r * th.cos(), r * th.sin(), 0.0],
            }
        })
        .collect()
}

/// ENU baseline difference to equatorial XYZ at the given latitude.
fn enu_to_xyz(enu: [f64; 3], latitude_rad: f64) -> [f64; 3] {
    let (s_lat, c_lat) = latitude_rad.sin_cos();
    [
        -enu[1] * s_lat + enu[2] * c_lat,
        enu[0],
        enu[1] * c_lat + enu[2] * s_lat,
    ]
}

/// Equatorial baseline XYZ to UVW for an hour angle and declination.
fn xyz_to_uvw(xyz: [f64; 3], ha: f64, dec: f64) -> UVW {
    let (s_ha, c_ha) = ha.sin_cos();
    let (s_dec, c_dec) = dec.sin_cos();
    UVW {
        u: xyz[0] * s_ha + xyz[1] * c_ha,
        v: -xyz[0] * s_dec * c_ha + xyz[1] * s_dec * s_ha + xyz[2] * c_dec,
        w: xyz[0] * c_dec * c_ha - xyz[1] * c_dec * s_ha + xyz[2] * s_dec,
    }
}

/// Manufacture a synthetic EB.
pub fn simulate_eb(params: &SimParams, model: &DiskModel) -> Result<VisDataset, SimulateError> {
    if params.num_antennas < 3 {
        return Err(SimulateError::NotEnoughAntennas {
            num: params.num_antennas,
        });
    }
    if params.spws.is_empty() {
        return Err(SimulateError::NoSpws);
    }
    if params.num_times == 0 || params.num_scans == 0 {
        return Err(SimulateError::NoTimesteps);
    }

    let mut rng = Xorshift::new(params.seed);
    let antennas = antenna_layout(params.num_antennas, params.array_extent_m);
    let num_ants = antennas.len();
    let baselines: Vec<(usize, usize)> = (0..num_ants)
        .flat_map(|a1| ((a1 + 1)..num_ants).map(move |a2| (a1, a2)))
        .collect();
    let num_bls = baselines.len();

    // Timestamps with inter-scan gaps; hour angle swings through transit.
    let ints_per_scan = params.num_times.div_ceil(params.num_scans);
    let mut timestamps = Vec::with_capacity(params.num_times);
    let mut scans: Vec<Range<usize>> = vec![];
    let mut int_counter = 0usize;
    for t in 0..params.num_times {
        let scan = t / ints_per_scan;
        if scans.len() <= scan {
            scans.push(t..t);
            if scan > 0 {
                int_counter += params.scan_gap_ints;
            }
        }
        scans[scan].end = t + 1;
        timestamps.push(Epoch::from_gpst_seconds(
            params.start_gpst_s + int_counter as f64 * params.integration_s,
        ));
        int_counter += 1;
    }
    let total_span_s = (params.num_times + params.scan_gap_ints * (params.num_scans - 1)) as f64
        * params.integration_s;

    // Per-antenna atmospheric phase streams: random walks normalised to the
    // requested standard deviation.
    let phase_noise_rad = params.phase_noise_deg.to_radians();
    let mut ant_phases = Array2::<f64>::zeros((params.num_times, num_ants));
    if phase_noise_rad > 0.0 {
        for a in 0..num_ants {
            let mut p = 0.0;
            for t in 0..params.num_times {
                p += rng.next_gaussian();
                ant_phases[(t, a)] = p;
            }
        }
        // Normalise each antenna's stream: zero mean, target std.
        for a in 0..num_ants {
            let mut col = ant_phases.column_mut(a);
            let mean = col.mean().expect("non-empty");
            let std = (col.iter().map(|p| (p - mean).powi(2)).sum::<f64>()
                / col.len() as f64)
                .sqrt()
                .max(1e-12);
            col.mapv_inplace(|p| (p - mean) / std * phase_noise_rad);
        }
    }

    // Slow per-antenna amplitude drifts: a linear ramp across the EB.
    let mut ant_amps = Array2::<f64>::from_elem((params.num_times, num_ants), 1.0);
    if params.amp_drift_std > 0.0 {
        for a in 0..num_ants {
            let slope = rng.next_gaussian() * params.amp_drift_std;
            for t in 0..params.num_times {
                let frac = t as f64 / params.num_times.max(1) as f64 - 0.5;
                ant_amps[(t, a)] = 1.0 + slope * frac * 2.0;
            }
        }
    }

    let (l_off, m_off) = (
        params.pointing_offset_mas.0 * MAS_TO_RAD,
        params.pointing_offset_mas.1 * MAS_TO_RAD,
    );

    let xyzs: Vec<[f64; 3]> = baselines
        .iter()
        .map(|&(a1, a2)| {
            let p1 = antennas[a1].position_enu_m;
            let p2 = antennas[a2].position_enu_m;
            enu_to_xyz(
                [p2[0] - p1[0], p2[1] - p1[1], p2[2] - p1[2]],
                params.latitude_rad,
            )
        })
        .collect();

    let mut uvws_m = Array2::from_elem((params.num_times, num_bls), UVW::default());
    let t0 = timestamps[0];
    for (t, &ts) in timestamps.iter().enumerate() {
        let dt = (ts - t0).to_seconds();
        let ha = (dt - total_span_s / 2.0) * EARTH_ROT_RAD_PER_S;
        for (b, xyz) in xyzs.iter().enumerate() {
            uvws_m[(t, b)] = xyz_to_uvw(*xyz, ha, params.phase_centre.dec);
        }
    }

    let weight = 1.0 / (params.noise_jy * params.noise_jy).max(1e-12);
    let mut spws = vec![];
    let mut spw_data = vec![];
    for (id, setup) in params.spws.iter().enumerate() {
        let spw = SpectralWindow {
            id,
            source_eb: params.name.clone(),
            first_freq_hz: setup.first_freq_hz,
            chan_width_hz: setup.chan_width_hz,
            num_chans: setup.num_chans,
            intent: setup.intent,
        };
        let freqs = spw.freqs_hz();
        let dim = (params.num_times, num_bls, setup.num_chans);
        let mut data = Array3::<c32>::zeros(dim);
        let weights = Array3::<f32>::from_elem(dim, weight as f32);
        let flags = Array3::from_elem(dim, false);

        for t in 0..params.num_times {
            for (b, &(a1, a2)) in baselines.iter().enumerate() {
                let uvw = uvws_m[(t, b)];
                // Corrupting gains for this sample's antennas.
                let g1 = c64::from_polar(ant_amps[(t, a1)], ant_phases[(t, a1)]);
                let g2 = c64::from_polar(ant_amps[(t, a2)], ant_phases[(t, a2)]);
                let g12 = g1 * g2.conj();
                for (c, &freq) in freqs.iter().enumerate() {
                    let lambda = VEL_C / freq;
                    let (u_l, v_l) = (uvw.u / lambda, uvw.v / lambda);
                    let mut vis = model.visibility(u_l, v_l);
                    // Injected pointing offset: shift the apparent source.
                    if l_off != 0.0 || m_off != 0.0 {
                        vis *= c64::from_polar(1.0, -TAU * (u_l * l_off + v_l * m_off));
                    }
                    vis *= params.flux_scale;
                    if let Some(scale) = params.decoherence_scale_klambda {
                        let r_kl = (u_l * u_l + v_l * v_l).sqrt() / 1000.0;
                        vis *= (-(r_kl / scale).powi(2)).exp();
                    }
                    vis *= g12;
                    let noisy = vis
                        + c64::new(
                            rng.next_gaussian() * params.noise_jy,
                            rng.next_gaussian() * params.noise_jy,
                        );
                    data[(t, b, c)] = c32::new(noisy.re as f32, noisy.im as f32);
                }
            }
        }

        spws.push(spw);
        spw_data.push(SpwData {
            data,
            corrected: None,
            model: None,
            weights,
            flags,
        });
    }

    debug!(
        "simulated EB {}: {num_ants} antennas, {num_bls} baselines, {} timesteps, {} spws",
        params.name,
        params.num_times,
        spws.len()
    );

    Ok(VisDataset {
        name: params.name.clone(),
        phase_centre: params.phase_centre,
        antennas,
        baselines,
        timestamps: Vec1::try_from_vec(timestamps).expect("num_times > 0"),
        scans,
        uvws_m,
        spws,
        spw_data,
        history: vec![format!("simulated (seed {})", params.seed)],
    })
}
