// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Swappable policies for the human-in-the-loop steps.
//!
//! Automatic SNR gating catches random noise failures; it does not catch an
//! antenna that is systematically sick yet clears the SNR bar on a subset of
//! solutions. Catching those is an operator judgement in interactive use;
//! [`FlagPolicy`] makes that judgement an injectable, testable strategy, and
//! [`ApprovalGate`] makes the "operator looks at the round and nods" step
//! explicit (auto-continue by default).

use crate::solutions::{FlagEntry, GainTable};

use super::RoundRecord;

/// Decide which extra (manual-override style) flags to put on a freshly
/// solved table before it is applied.
pub trait FlagPolicy {
    fn extra_flags(&self, table: &GainTable) -> Vec<FlagEntry>;
}

/// The trivial policy: trust the solver's own gating.
pub struct NoExtraFlags;

impl FlagPolicy for NoExtraFlags {
    fn extra_flags(&self, _table: &GainTable) -> Vec<FlagEntry> {
        vec![]
    }
}

/// Flag whole antennas whose solutions fail too often: an antenna that is
/// low-SNR across many timestamps is a hardware/pointing problem, not random
/// noise, and its surviving solutions shouldn't be trusted either.
pub struct AutoSnrPolicy {
    /// Flag an antenna once more than this fraction of its solutions are
    /// already flagged.
    pub max_low_fraction: f64,
}

impl Default for AutoSnrPolicy {
    fn default() -> Self {
        AutoSnrPolicy {
            max_low_fraction: 0.5,
        }
    }
}

impl FlagPolicy for AutoSnrPolicy {
    fn extra_flags(&self, table: &GainTable) -> Vec<FlagEntry> {
        table
            .antennas
            .iter()
            .enumerate()
            .filter(|&(a, _)| table.antenna_flagged_fraction(a) > self.max_low_fraction)
            .map(|(_, ant)| FlagEntry {
                antenna: ant.label(),
                spw_ids: None,
                time_range_gpst_s: None,
            })
            .collect()
    }
}

/// A fixed list of operator-supplied flags, e.g. from a configuration file
/// after inspecting the previous run's plots.
pub struct ManualFlags(pub Vec<FlagEntry>);

impl FlagPolicy for ManualFlags {
    fn extra_flags(&self, _table: &GainTable) -> Vec<FlagEntry> {
        self.0.clone()
    }
}

/// Several policies in sequence.
pub struct CompositePolicy<'a>(pub Vec<&'a dyn FlagPolicy>);

impl FlagPolicy for CompositePolicy<'_> {
    fn extra_flags(&self, table: &GainTable) -> Vec<FlagEntry> {
        self.0
            .iter()
            .flat_map(|p| p.extra_flags(table))
            .collect()
    }
}

/// The between-rounds approval step. `Auto` continues unconditionally;
/// `Review` consults a callback (an interactive prompt, a test harness).
pub enum ApprovalGate<'a> {
    Auto,
    Review(&'a dyn Fn(&RoundRecord) -> bool),
}

impl ApprovalGate<'_> {
    pub fn approve(&self, record: &RoundRecord) -> bool {
        match self {
            ApprovalGate::Auto => true,
            ApprovalGate::Review(f) => f(record),
        }
    }
}

/// When to keep shortening the solution interval, and when a round is good
/// enough to keep.
#[derive(Debug, Clone, Copy)]
pub struct ConvergencePolicy {
    /// Keep shortening while each round improves peak SNR by at least this
    /// fraction.
    pub min_improvement: f64,

    /// Reject a round whose table has more than this fraction of flagged
    /// solutions.
    pub max_flagged_fraction: f64,

    /// Accept a round whose peak SNR does not drop by more than this
    /// fraction.
    pub regression_tolerance: f64,

    /// Reject a round that moves the flux in the mask by more than this
    /// fraction.
    pub max_flux_drift: f64,
}

impl Default for ConvergencePolicy {
    fn default() -> Self {
        ConvergencePolicy {
            min_improvement: crate::constants::DEFAULT_MIN_SNR_IMPROVEMENT,
            max_flagged_fraction: crate::constants::DEFAULT_MAX_FLAGGED_FRACTION,
            regression_tolerance: crate::constants::DEFAULT_REGRESSION_TOLERANCE,
            max_flux_drift: 0.2,
        }
    }
}
