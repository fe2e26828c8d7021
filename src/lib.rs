// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Self-calibration and flux-reconciliation pipeline for multi-configuration
//! ALMA observations of protoplanetary disks.
//!
//! The crate orchestrates external numerical primitives (a synthesis imager
//! and a per-antenna gain solver, both behind traits with in-crate reference
//! implementations) into a convergent calibration procedure: phase-centre
//! alignment, iterative self-calibration with a shrinking solution-interval
//! schedule, flux-scale reconciliation across datasets, concatenation across
//! array configurations, and finally continuum subtraction and line
//! extraction.

pub mod align;
pub mod cli;
pub mod config;
pub mod constants;
pub mod context;
pub mod contsub;
pub mod fluxscale;
pub mod imaging;
pub(crate) mod math;
pub mod merge;
mod messages;
pub mod obs;
pub mod selfcal;
pub mod simulate;
pub mod solutions;
pub mod solve;
pub mod unit_parsing;

// Re-exports.
pub use cli::AlmaSelfcalError;
pub use context::PipelineContext;
pub use obs::VisDataset;
pub use selfcal::{SelfcalLoop, SelfcalOutcome};
pub use solutions::GainTable;

use is_terminal::IsTerminal;

lazy_static::lazy_static! {
    /// Are progress bars to be drawn? This should only be true if stdout is a
    /// terminal and the user hasn't asked for no progress bars.
    pub static ref PROGRESS_BARS: std::sync::atomic::AtomicBool =
        std::sync::atomic::AtomicBool::new(std::io::stdout().is_terminal());
}
