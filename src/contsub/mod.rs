// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Continuum subtraction and per-transition line extraction.
//!
//! The final calibration is derived from line-flagged continuum data and
//! applied to the full-resolution line-bearing datasets upstream of this
//! module; here a low-order polynomial continuum is fitted per baseline and
//! spectral window using only line-free channels, subtracted across the full
//! band, and the residual line emission is split out per transition.
//!
//! The line-free channel sets are derived once per frequency setup and
//! applied identically to every spw sharing that setup. Fitting different
//! channel ranges for different EBs of the same setup stamps a sawtooth
//! artefact into the subtracted spectra at EB boundaries, so the derivation
//! is keyed on the setup, not the spw.

pub mod lines;

mod error;
#[cfg(test)]
mod tests;

pub use error::ContsubError;
pub use lines::{lookup, Transition, TRANSITIONS};

use std::ops::Range;

use log::{debug, info};
use marlu::{c32, constants::VEL_C};
use ndarray::prelude::*;

use crate::math::{eval_polynomial, fit_polynomial};
use crate::obs::{DataColumn, SpectralWindow, VisDataset};

/// Continuum-fit inputs.
#[derive(Debug, Clone)]
pub struct ContsubParams {
    /// Polynomial order of the per-baseline continuum fit (0-2).
    pub fit_order: usize,

    /// Systemic velocity of the source \[km/s\], radio convention.
    pub vsys_kms: f64,

    /// Velocity half-width to exclude around each transition \[km/s\].
    pub vel_halfwidth_kms: f64,

    /// Catalog keys of the transitions present in the data.
    pub transitions: Vec<String>,
}

/// The line-free and line channel sets of one spw.
#[derive(Debug, Clone, PartialEq)]
pub struct FitspwEntry {
    pub spw_id: usize,

    /// Channels safe to fit continuum on.
    pub line_free: Vec<Range<usize>>,

    /// Channels covered by each transition found in this spw.
    pub line_chans: Vec<(String, Range<usize>)>,
}

/// The channels a transition occupies in a spw, given the source's systemic
/// velocity and a velocity half-width. `None` when the line falls outside
/// the window.
pub fn line_channel_range(
    spw: &SpectralWindow,
    rest_freq_hz: f64,
    vsys_kms: f64,
    vel_halfwidth_kms: f64,
) -> Option<Range<usize>> {
    // Radio convention: f = f0 (1 - v/c).
    let f_at = |v_kms: f64| rest_freq_hz * (1.0 - v_kms * 1e3 / VEL_C);
    let f_lo = f_at(vsys_kms + vel_halfwidth_kms).min(f_at(vsys_kms - vel_halfwidth_kms));
    let f_hi = f_at(vsys_kms + vel_halfwidth_kms).max(f_at(vsys_kms - vel_halfwidth_kms));

    let freqs = spw.freqs_hz();
    let mut lo = None;
    let mut hi = None;
    for (c, &f) in freqs.iter().enumerate() {
        let in_range = f >= f_lo && f <= f_hi;
        if in_range {
            if lo.is_none() {
                lo = Some(c);
            }
            hi = Some(c + 1);
        }
    }
    match (lo, hi) {
        (Some(lo), Some(hi)) => Some(lo..hi),
        _ => None,
    }
}

/// Derive the line-free channel sets for every spw, once per frequency
/// setup.
pub fn derive_fitspw(
    ds: &VisDataset,
    params: &ContsubParams,
) -> Result<Vec<FitspwEntry>, ContsubError> {
    let transitions: Vec<&'static Transition> = params
        .transitions
        .iter()
        .map(|name| {
            lookup(name).ok_or_else(|| ContsubError::UnknownTransition { name: name.clone() })
        })
        .collect::<Result<_, _>>()?;

    // Channel sets are computed per unique frequency setup and shared by all
    // spws with that setup.
    let setup_key = |spw: &SpectralWindow| {
        format!(
            "{:.0}:{:.0}:{}",
            spw.first_freq_hz, spw.chan_width_hz, spw.num_chans
        )
    };
    let mut per_setup: indexmap::IndexMap<String, (Vec<Range<usize>>, Vec<(String, Range<usize>)>)> =
        indexmap::IndexMap::new();

    let mut entries = vec![];
    for spw in &ds.spws {
        let key = setup_key(spw);
        if !per_setup.contains_key(&key) {
            let mut line_chans = vec![];
            for t in &transitions {
                if let Some(range) = line_channel_range(
                    spw,
                    t.rest_freq_hz,
                    params.vsys_kms,
                    params.vel_halfwidth_kms,
                ) {
                    line_chans.push((t.name(), range));
                }
            }
            // Complement of the union of line ranges.
            let mut is_line = vec![false; spw.num_chans];
            for (_, range) in &line_chans {
                for c in range.clone() {
                    is_line[c] = true;
                }
            }
            let mut line_free = vec![];
            let mut start = None;
            for (c, &line) in is_line.iter().enumerate() {
                match (line, start) {
                    (false, None) => start = Some(c),
                    (true, Some(s)) => {
                        line_free.push(s..c);
                        start = None;
                    }
                    _ => (),
                }
            }
            if let Some(s) = start {
                line_free.push(s..spw.num_chans);
            }
            per_setup.insert(key.clone(), (line_free, line_chans));
        }
        let (line_free, line_chans) = per_setup[&key].clone();
        entries.push(FitspwEntry {
            spw_id: spw.id,
            line_free,
            line_chans,
        });
    }

    for entry in &entries {
        debug!(
            "spw {}: {} line-free ranges, lines: {:?}",
            entry.spw_id,
            entry.line_free.len(),
            entry
                .line_chans
                .iter()
                .map(|(n, r)| format!("{n}@{r:?}"))
                .collect::<Vec<_>>()
        );
    }
    Ok(entries)
}

/// Fit and subtract a per-baseline continuum, producing a new dataset.
///
/// The fit uses only the line-free channels but is evaluated (and
/// subtracted) across the whole band; slight extrapolation beyond the exact
/// line-free range is expected behaviour, not an error. Rows with too few
/// line-free channels to support the fit are flagged.
pub fn subtract_continuum(
    ds: &VisDataset,
    fitspw: &[FitspwEntry],
    params: &ContsubParams,
) -> Result<VisDataset, ContsubError> {
    if params.fit_order > 2 {
        return Err(ContsubError::BadFitOrder {
            order: params.fit_order,
        });
    }
    if fitspw.len() != ds.spws.len() {
        return Err(ContsubError::FitspwMismatch {
            entries: fitspw.len(),
            spws: ds.spws.len(),
        });
    }

    let column = if ds.has_corrected() {
        DataColumn::Corrected
    } else {
        DataColumn::Data
    };
    let mut out = ds.split(&format!("{}.contsub", ds.name), column)?;

    for (spw_id, entry) in fitspw.iter().enumerate() {
        let spw = &out.spws[spw_id];
        let num_chans = spw.num_chans;
        // Normalised frequency axis keeps the normal equations
        // well-conditioned.
        let centre = spw.centre_freq_hz();
        let half_bw = (spw.bandwidth_hz() / 2.0).max(1.0);
        let xs: Vec<f64> = spw
            .freqs_hz()
            .iter()
            .map(|f| (f - centre) / half_bw)
            .collect();
        let line_free: Vec<usize> = entry
            .line_free
            .iter()
            .flat_map(|r| r.clone())
            .filter(|&c| c < num_chans)
            .collect();

        let spw_data = &mut out.spw_data[spw_id];
        let (num_times, num_bls, _) = spw_data.data.dim();
        for t in 0..num_times {
            for b in 0..num_bls {
                let mut fit_x = Vec::with_capacity(line_free.len());
                let mut fit_re = Vec::with_capacity(line_free.len());
                let mut fit_im = Vec::with_capacity(line_free.len());
                let mut fit_w = Vec::with_capacity(line_free.len());
                for &c in &line_free {
                    if spw_data.flags[(t, b, c)] {
                        continue;
                    }
                    let w = spw_data.weights[(t, b, c)] as f64;
                    if w <= 0.0 {
                        continue;
                    }
                    let v = spw_data.data[(t, b, c)];
                    fit_x.push(xs[c]);
                    fit_re.push(v.re as f64);
                    fit_im.push(v.im as f64);
                    fit_w.push(w);
                }
                if fit_x.len() < params.fit_order + 2 {
                    // Not enough line-free data for a meaningful fit.
                    for c in 0..num_chans {
                        spw_data.flags[(t, b, c)] = true;
                    }
                    continue;
                }
                let coeffs_re = fit_polynomial(&fit_x, &fit_re, &fit_w, params.fit_order);
                let coeffs_im = fit_polynomial(&fit_x, &fit_im, &fit_w, params.fit_order);
                for c in 0..num_chans {
                    let cont = c32::new(
                        eval_polynomial(&coeffs_re, xs[c]) as f32,
                        eval_polynomial(&coeffs_im, xs[c]) as f32,
                    );
                    spw_data.data[(t, b, c)] -= cont;
                }
            }
        }
    }

    out.push_history(format!(
        "contsub order {} over {} spws",
        params.fit_order,
        fitspw.len()
    ));
    info!("{}: continuum subtracted -> {}", ds.name, out.name);
    Ok(out)
}

/// Split one transition's channels out of a continuum-subtracted dataset.
pub fn extract_transition(
    ds: &VisDataset,
    transition_name: &str,
    params: &ContsubParams,
) -> Result<VisDataset, ContsubError> {
    let transition = lookup(transition_name).ok_or_else(|| ContsubError::UnknownTransition {
        name: transition_name.to_string(),
    })?;

    // The spw containing the line, with the widest margin around it.
    let mut best: Option<(usize, Range<usize>)> = None;
    for spw in &ds.spws {
        if let Some(range) = line_channel_range(
            spw,
            transition.rest_freq_hz,
            params.vsys_kms,
            params.vel_halfwidth_kms,
        ) {
            let better = match &best {
                None => true,
                Some((_, existing)) => range.len() > existing.len(),
            };
            if better {
                best = Some((spw.id, range));
            }
        }
    }
    let Some((spw_id, range)) = best else {
        return Err(ContsubError::TransitionNotCovered {
            name: transition_name.to_string(),
            dataset: ds.name.clone(),
        });
    };

    let column = if ds.has_corrected() {
        DataColumn::Corrected
    } else {
        DataColumn::Data
    };
    let mut out = ds.split_spws(
        &format!("{}.{}", ds.name, transition_name),
        column,
        &[spw_id],
    )?;

    // Trim to the line channels.
    let spw = &mut out.spws[0];
    spw.first_freq_hz += range.start as f64 * spw.chan_width_hz;
    spw.num_chans = range.len();
    let spw_data = &mut out.spw_data[0];
    spw_data.data = spw_data
        .data
        .slice(s![.., .., range.clone()])
        .to_owned();
    spw_data.weights = spw_data
        .weights
        .slice(s![.., .., range.clone()])
        .to_owned();
    spw_data.flags = spw_data
        .flags
        .slice(s![.., .., range.clone()])
        .to_owned();
    spw_data.corrected = None;
    spw_data.model = None;

    out.push_history(format!(
        "extracted {} ({} channels) from spw {}",
        transition_name,
        range.len(),
        spw_id
    ));
    Ok(out)
}
