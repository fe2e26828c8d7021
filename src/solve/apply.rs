// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Applying gain tables to datasets.
//!
//! Gains are solved on a subset (or combination) of spws but applied across
//! the full spw list, directed by an explicit spw-mapping table. The mapping
//! is correctness-critical bookkeeping: applying gains to the wrong window
//! silently corrupts it, so its shape is asserted here rather than trusted.

use log::debug;
use marlu::{c32, c64};
use ndarray::prelude::*;
use strum_macros::{Display, EnumString};
use thiserror::Error;

use crate::obs::VisDataset;
use crate::solutions::GainTable;

/// How to interpolate gains across time between solution intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum Interp {
    #[strum(serialize = "nearest")]
    Nearest,

    #[strum(serialize = "linear")]
    Linear,
}

/// Calibrate-only leaves samples without valid solutions untouched;
/// calibrate-and-flag flags them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum ApplyMode {
    #[strum(serialize = "calonly")]
    CalOnly,

    #[strum(serialize = "calflag")]
    CalFlag,
}

#[derive(Debug, Clone)]
pub struct ApplyParams {
    /// The name of the output dataset.
    pub out_name: String,

    /// For every spw of the target dataset, the index of the table spwblock
    /// whose solution applies to it. Its length must equal the dataset's spw
    /// count; build it with [`build_spw_map`] and rebuild it after every
    /// concatenation.
    pub spw_map: Vec<usize>,

    pub interp: Interp,

    /// Scale weights by the applied gain amplitudes.
    pub calwt: bool,

    pub apply_mode: ApplyMode,
}

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("Gain table {table} has no antenna matching {antenna} of dataset {dataset}")]
    UnknownAntenna {
        table: String,
        dataset: String,
        antenna: String,
    },
}

/// Build the spw-mapping table for applying `table` to `ds`.
///
/// A spw solved directly maps to its own block. A spw that wasn't solved
/// (a line spw, or any spw under a combined solve) maps to the block
/// containing a solved spw from the same originating EB; failing that, to
/// the block with the nearest centre frequency. The result always has
/// exactly one entry per dataset spw.
pub fn build_spw_map(ds: &VisDataset, table: &GainTable) -> Vec<usize> {
    let same_dataset = table.solved_from == ds.name;
    ds.spws
        .iter()
        .map(|spw| {
            // Directly solved? Only meaningful when the ids refer to this
            // dataset's spw numbering.
            if same_dataset {
                if let Some(block) = table
                    .spwblocks
                    .iter()
                    .find(|b| b.spw_ids.contains(&spw.id))
                {
                    return block.index;
                }
            }
            // Same originating EB: the table was solved on (a derivative of)
            // the data this spw came from.
            if let Some(block) = table
                .spwblocks
                .iter()
                .find(|b| b.source_ebs.contains(&spw.source_eb))
            {
                return block.index;
            }
            // Fall back to the nearest block in frequency.
            table
                .spwblocks
                .iter()
                .min_by(|a, b| {
                    let da = (a.centre_freq_hz - spw.centre_freq_hz()).abs();
                    let db = (b.centre_freq_hz - spw.centre_freq_hz()).abs();
                    da.partial_cmp(&db).expect("frequencies are not NaN")
                })
                .map(|b| b.index)
                .expect("tables always have at least one spwblock")
        })
        .collect()
}

/// Apply a gain table, producing a new dataset with a corrected column.
///
/// The correction divides out the antenna gains: corrected = data /
/// (g_i conj(g_j)). Solutions are never reused across rounds; each round's
/// table is consumed exactly once, here.
pub fn apply_gains(
    ds: &VisDataset,
    table: &GainTable,
    params: &ApplyParams,
) -> Result<VisDataset, ApplyError> {
    // A stale spw map is a silent corruption; make it loud.
    assert_eq!(
        params.spw_map.len(),
        ds.spws.len(),
        "spw map length must match the dataset's spw count; rebuild it after concatenation"
    );
    assert!(
        params.spw_map.iter().all(|&s| s < table.spwblocks.len()),
        "spw map refers to a spwblock the table doesn't have"
    );

    // Dataset antenna index -> table antenna index.
    let ant_map: Vec<usize> = ds
        .antennas
        .iter()
        .map(|ant| {
            table
                .antennas
                .iter()
                .position(|ta| ta.name == ant.name && ta.station == ant.station)
                .ok_or_else(|| ApplyError::UnknownAntenna {
                    table: table.name.clone(),
                    dataset: ds.name.clone(),
                    antenna: ant.label(),
                })
        })
        .collect::<Result<_, _>>()?;

    let mut out = ds.clone();
    out.name = params.out_name.clone();

    // Timeblock ranges index the solved dataset's time axis; they are only
    // meaningful here when this is that dataset. Cross-dataset application
    // (e.g. a combined-solve table onto one full-resolution EB) matches by
    // timestamp instead.
    let same_dataset = table.solved_from == ds.name;

    for (spw_id, spw_data) in out.spw_data.iter_mut().enumerate() {
        let block = params.spw_map[spw_id];
        let (num_times, _, num_chans) = spw_data.data.dim();
        let mut corrected = spw_data.best().clone();
        let mut flags = spw_data.flags.clone();
        let mut weights = spw_data.weights.clone();

        for t in 0..num_times {
            let ts = ds.timestamps.as_slice()[t];
            for (b, &(a1, a2)) in ds.baselines.iter().enumerate() {
                let g1 = gain_at(table, ts, same_dataset.then_some(t), ant_map[a1], block, params.interp);
                let g2 = gain_at(table, ts, same_dataset.then_some(t), ant_map[a2], block, params.interp);
                match (g1, g2) {
                    (Some(g1), Some(g2)) => {
                        let g12 = g1 * g2.conj();
                        let norm_sqr = g12.norm_sqr();
                        for c in 0..num_chans {
                            let d = corrected[(t, b, c)];
                            let cd = c64::new(d.re as f64, d.im as f64) / g12;
                            corrected[(t, b, c)] = c32::new(cd.re as f32, cd.im as f32);
                            if params.calwt {
                                weights[(t, b, c)] *= norm_sqr as f32;
                            }
                        }
                    }
                    _ => {
                        // No valid solution for one of the antennas.
                        if params.apply_mode == ApplyMode::CalFlag {
                            for c in 0..num_chans {
                                flags[(t, b, c)] = true;
                            }
                        }
                    }
                }
            }
        }

        spw_data.corrected = Some(corrected);
        spw_data.flags = flags;
        spw_data.weights = weights;
    }

    out.push_history(format!(
        "applycal {} (solved from {}, mode {}, spw map {:?}) -> {}",
        table.name, table.solved_from, table.mode, params.spw_map, params.out_name
    ));
    debug!(
        "applied {} to {} -> {}",
        table.name, ds.name, params.out_name
    );
    Ok(out)
}

/// The gain for one antenna at one timestep, or `None` if no valid solution
/// covers it.
fn gain_at(
    table: &GainTable,
    ts: hifitime::Epoch,
    t_index: Option<usize>,
    ant: usize,
    block: usize,
    interp: Interp,
) -> Option<c64> {
    // If a timeblock directly covers this timestep index and is unflagged,
    // it wins regardless of interpolation mode.
    if let Some(t_index) = t_index {
        if let Some(tb) = table
            .timeblocks
            .iter()
            .find(|tb| tb.range.contains(&t_index))
        {
            if !table.is_flagged(tb.index, ant, block) {
                return Some(table.gains[(tb.index, ant, block)]);
            }
        }
    }

    // Otherwise interpolate from unflagged neighbours by median timestamp.
    let mut valid: Vec<(f64, c64)> = table
        .timeblocks
        .iter()
        .filter(|tb| !table.is_flagged(tb.index, ant, block))
        .map(|tb| {
            (
                (ts - tb.median).to_seconds(),
                table.gains[(tb.index, ant, block)],
            )
        })
        .collect();
    if valid.is_empty() {
        return None;
    }
    valid.sort_by(|a, b| {
        a.0.abs()
            .partial_cmp(&b.0.abs())
            .expect("durations are not NaN")
    });

    match interp {
        Interp::Nearest => Some(valid[0].1),
        Interp::Linear => {
            // The two nearest solutions bracketing (or nearest to) the
            // timestep; linear in the complex plane, renormalised so
            // phase-only tables stay phase-only.
            let (dt0, g0) = valid[0];
            let bracket = valid
                .iter()
                .skip(1)
                .find(|(dt, _)| dt.signum() != dt0.signum());
            match bracket {
                None => Some(g0),
                Some(&(dt1, g1)) => {
                    let span = (dt1 - dt0).abs();
                    if span <= f64::EPSILON {
                        return Some(g0);
                    }
                    let f = dt0.abs() / span;
                    let mut g = g0 * (1.0 - f) + g1 * f;
                    let target_norm = g0.norm() * (1.0 - f) + g1.norm() * f;
                    if g.norm() > 0.0 {
                        g = g / g.norm() * target_norm;
                    }
                    Some(g)
                }
            }
        }
    }
}
