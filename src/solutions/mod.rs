// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Gain solution tables.
//!
//! A [`GainTable`] is produced once per self-cal round by the gain solver,
//! possibly amended by a flagging policy, consumed exactly once by "apply",
//! and never reused across rounds: each round solves a strictly fresh table
//! against the previous round's corrected visibilities. Flagged (invalid)
//! solutions are stored as NaN, like everything downstream expects.

mod error;
pub mod io;
#[cfg(feature = "plotting")]
pub mod plotting;
#[cfg(test)]
mod tests;

pub use error::*;

use std::ops::Range;

use hifitime::Epoch;
use marlu::c64;
use ndarray::prelude::*;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};
use vec1::Vec1;

use crate::obs::Antenna;

/// Calibration mode: phase-only early rounds, then phase+amplitude. Solving
/// amplitude before the phases are coherent is meaningless, so the pipeline
/// enforces phase-before-amplitude ordering.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter, EnumString, Serialize, Deserialize,
)]
pub enum CalMode {
    #[strum(serialize = "p")]
    #[serde(rename = "p")]
    Phase,

    #[strum(serialize = "ap")]
    #[serde(rename = "ap")]
    AmpPhase,
}

/// A collection of timesteps solved together: one solution interval's worth.
#[derive(Debug, Clone)]
pub struct Timeblock {
    /// The timeblock index within the table.
    pub index: usize,

    /// The range of timestep indices (into the solved dataset's time axis)
    /// this block covers. Timesteps in a block are contiguous.
    pub range: Range<usize>,

    /// The timestamps comprising this timeblock.
    pub timestamps: Vec1<Epoch>,

    /// The median timestamp.
    pub median: Epoch,
}

/// A group of spectral windows solved jointly. With "combine spw" the whole
/// dataset collapses to a single block; the apply step then broadcasts that
/// block's solution across all spws via the spw-mapping table.
///
/// A block remembers which EBs its spws originated from and its centre
/// frequency, so a table solved on a (possibly concatenated, channel-
/// averaged) continuum dataset can later be mapped onto the full-resolution
/// line-bearing datasets.
#[derive(Debug, Clone, PartialEq)]
pub struct SpwBlock {
    /// The block index within the table.
    pub index: usize,

    /// The solved dataset's spw ids this block was solved from.
    pub spw_ids: Vec<usize>,

    /// The originating EBs of those spws.
    pub source_ebs: Vec<String>,

    /// Mean centre frequency of the block's spws \[Hz\].
    pub centre_freq_hz: f64,
}

/// A manual override flag: antenna (bare name or `name@station` label),
/// optionally narrowed to particular spws and/or a time range. These
/// represent operator decisions about systematic failures that clear the SNR
/// bar on a subset of solutions; they persist only for the round's table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagEntry {
    pub antenna: String,

    /// Dataset spw ids to flag; `None` flags all.
    pub spw_ids: Option<Vec<usize>>,

    /// GPST second range to flag; `None` flags all times.
    pub time_range_gpst_s: Option<(f64, f64)>,
}

/// Per-antenna complex gain corrections for one self-cal round.
#[derive(Debug, Clone)]
pub struct GainTable {
    pub name: String,
    pub mode: CalMode,

    /// The antennas solved for, in dataset order.
    pub antennas: Vec<Antenna>,

    pub timeblocks: Vec1<Timeblock>,
    pub spwblocks: Vec<SpwBlock>,

    /// Shape (num_timeblocks, num_antennas, num_spwblocks). NaN means the
    /// solution is flagged.
    pub gains: Array3<c64>,

    /// Per-solution signal-to-noise ratios, same shape as `gains`.
    pub snrs: Array3<f64>,

    /// The name of the dataset this table was solved from. Lineage: round
    /// N's table must have been solved from the dataset that round N-1's
    /// accepted table was applied to.
    pub solved_from: String,

    /// The session-resolved label of the reference antenna actually used.
    pub refant: Option<String>,
}

impl GainTable {
    pub fn num_solutions(&self) -> usize {
        self.gains.len()
    }

    pub fn is_flagged(&self, t: usize, a: usize, s: usize) -> bool {
        self.gains[(t, a, s)].re.is_nan()
    }

    pub fn flag_solution(&mut self, t: usize, a: usize, s: usize) {
        self.gains[(t, a, s)] = c64::new(f64::NAN, f64::NAN);
    }

    pub fn flagged_count(&self) -> usize {
        self.gains.iter().filter(|g| g.re.is_nan()).count()
    }

    pub fn flagged_fraction(&self) -> f64 {
        self.flagged_count() as f64 / self.num_solutions().max(1) as f64
    }

    /// Flagged-solution counts per (spwblock, timeblock): the per-round
    /// diagnostic a human inspects to decide whether manual flags are
    /// warranted.
    pub fn flagged_counts(&self) -> Array2<usize> {
        let (num_tb, num_ants, num_sb) = self.gains.dim();
        let mut counts = Array2::zeros((num_sb, num_tb));
        for t in 0..num_tb {
            for a in 0..num_ants {
                for s in 0..num_sb {
                    if self.is_flagged(t, a, s) {
                        counts[(s, t)] += 1;
                    }
                }
            }
        }
        counts
    }

    /// The fraction of an antenna's solutions that are flagged.
    pub fn antenna_flagged_fraction(&self, a: usize) -> f64 {
        let (num_tb, _, num_sb) = self.gains.dim();
        let total = num_tb * num_sb;
        let flagged = (0..num_tb)
            .flat_map(|t| (0..num_sb).map(move |s| (t, s)))
            .filter(|&(t, s)| self.is_flagged(t, a, s))
            .count();
        flagged as f64 / total.max(1) as f64
    }

    /// Apply one manual override flag entry.
    pub fn apply_flag(&mut self, entry: &FlagEntry) -> usize {
        let (num_tb, num_ants, num_sb) = self.gains.dim();
        let mut flagged = 0;
        for a in 0..num_ants {
            if !self.antennas[a].matches_label(&entry.antenna) {
                continue;
            }
            for t in 0..num_tb {
                if let Some((start, end)) = entry.time_range_gpst_s {
                    let med = self.timeblocks[t].median.to_gpst_seconds();
                    if med < start || med > end {
                        continue;
                    }
                }
                for s in 0..num_sb {
                    if let Some(spw_ids) = &entry.spw_ids {
                        if !self.spwblocks[s].spw_ids.iter().any(|id| spw_ids.contains(id)) {
                            continue;
                        }
                    }
                    if !self.is_flagged(t, a, s) {
                        self.flag_solution(t, a, s);
                        flagged += 1;
                    }
                }
            }
        }
        flagged
    }

    /// Clip mode: flag any solution whose amplitude falls outside
    /// [min, max]. Returns the number of newly flagged solutions.
    pub fn clip_amplitudes(&mut self, min: f64, max: f64) -> usize {
        let mut flagged = 0;
        for g in self.gains.iter_mut() {
            if g.re.is_nan() {
                continue;
            }
            let amp = g.norm();
            if amp < min || amp > max {
                *g = c64::new(f64::NAN, f64::NAN);
                flagged += 1;
            }
        }
        flagged
    }

    /// Median unflagged solution SNR, a round-level quality summary.
    pub fn median_snr(&self) -> Option<f64> {
        let mut snrs: Vec<f64> = self
            .snrs
            .iter()
            .zip(self.gains.iter())
            .filter(|(_, g)| !g.re.is_nan())
            .map(|(&s, _)| s)
            .collect();
        if snrs.is_empty() {
            return None;
        }
        snrs.sort_unstable_by(|a, b| a.partial_cmp(b).expect("SNRs are not NaN"));
        Some(snrs[snrs.len() / 2])
    }
}

/// Build solution-interval timeblocks from a dataset's timestamps and scan
/// boundaries. `interval_s` of `None` means one block per scan; an interval
/// longer than a scan also collapses to scan blocks, since solutions never
/// span a scan boundary.
pub fn timeblocks_from_scans(
    timestamps: &Vec1<Epoch>,
    scans: &[Range<usize>],
    interval_s: Option<f64>,
) -> Vec1<Timeblock> {
    let mut blocks: Vec<Timeblock> = vec![];
    for scan in scans {
        let scan_times = &timestamps.as_slice()[scan.clone()];
        let scan_start = scan_times[0];
        // Which block within this scan does each timestep fall into?
        let mut current: Option<(usize, Range<usize>)> = None;
        for (i, &ts) in scan_times.iter().enumerate() {
            let block_index = match interval_s {
                None => 0,
                Some(int_s) => ((ts - scan_start).to_seconds() / int_s).floor() as usize,
            };
            match &mut current {
                Some((idx, range)) if *idx == block_index => range.end = scan.start + i + 1,
                _ => {
                    if let Some((_, range)) = current.take() {
                        blocks.push(make_timeblock(blocks.len(), range, timestamps));
                    }
                    current = Some((block_index, scan.start + i..scan.start + i + 1));
                }
            }
        }
        if let Some((_, range)) = current.take() {
            blocks.push(make_timeblock(blocks.len(), range, timestamps));
        }
    }
    Vec1::try_from_vec(blocks).expect("scans are non-empty")
}

fn make_timeblock(index: usize, range: Range<usize>, timestamps: &Vec1<Epoch>) -> Timeblock {
    let block_times: Vec<Epoch> = timestamps.as_slice()[range.clone()].to_vec();
    let median = block_times[block_times.len() / 2];
    Timeblock {
        index,
        range,
        timestamps: Vec1::try_from_vec(block_times).expect("range is non-empty"),
        median,
    }
}
