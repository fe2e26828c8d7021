// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Useful constants.

use std::f64::consts::PI;

/// Radians per milliarcsecond.
pub const MAS_TO_RAD: f64 = PI / 180.0 / 3600.0 / 1000.0;

/// Radians per arcsecond.
pub const ARCSEC_TO_RAD: f64 = PI / 180.0 / 3600.0;

/// Radians per degree.
pub const DEG_TO_RAD: f64 = PI / 180.0;

/// The minimum signal-to-noise ratio a gain solution needs to be kept.
pub const DEFAULT_MIN_SOLUTION_SNR: f64 = 3.0;

/// The minimum number of unflagged baselines an antenna needs in a solution
/// interval for its gain solution to be trusted.
pub const DEFAULT_MIN_BASELINES_PER_ANTENNA: usize = 4;

/// Flux-scale ratios within this fraction of 1 are left alone.
pub const DEFAULT_FLUX_RATIO_TOLERANCE: f64 = 0.04;

/// A flux-ratio slope this many standard errors from zero is classified as
/// decoherence rather than a genuine flux-scale offset.
pub const DEFAULT_FLUX_SLOPE_SIGMA: f64 = 3.0;

/// A self-cal round must improve the peak SNR by this fraction for the
/// schedule to keep shortening the solution interval.
pub const DEFAULT_MIN_SNR_IMPROVEMENT: f64 = 0.02;

/// A round whose gain table has more than this fraction of flagged solutions
/// is not applied.
pub const DEFAULT_MAX_FLAGGED_FRACTION: f64 = 0.25;

/// Tolerated fractional peak-SNR regression when accepting a round.
pub const DEFAULT_REGRESSION_TOLERANCE: f64 = 0.005;

/// Clean-threshold multiplier on the previous round's image RMS.
pub const DEFAULT_THRESHOLD_SIGMA: f64 = 6.0;

/// The maximum number of iterations the reference gain solver performs.
pub const DEFAULT_MAX_SOLVER_ITERATIONS: usize = 50;

/// The reference solver's convergence thresholds; see
/// [`crate::solve::AntsolSolver`] for their meaning.
pub const DEFAULT_SOLVER_STOP_THRESHOLD: f64 = 1e-8;
pub const DEFAULT_SOLVER_MIN_THRESHOLD: f64 = 1e-4;
