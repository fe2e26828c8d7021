// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use thiserror::Error;

use crate::imaging::ImagingError;
use crate::obs::io::WriteDatasetError;
use crate::solutions::WriteSolutionsError;
use crate::solve::apply::ApplyError;
use crate::solve::SolveError;

#[derive(Debug, Error)]
pub enum SelfcalError {
    #[error("Self-cal schedules must be phase rounds first, then at most one amplitude+phase round; got a phase round after an amplitude round")]
    PhaseAfterAmplitude,

    #[error("Self-cal schedules allow at most one amplitude+phase round; got {count}")]
    MultipleAmplitudeRounds { count: usize },

    #[error("Gain table {table} was solved from {solved_from}, but this round's input is {expected}; the calibration chain is desynchronised")]
    BrokenLineage {
        table: String,
        solved_from: String,
        expected: String,
    },

    #[error(transparent)]
    Imaging(#[from] ImagingError),

    #[error(transparent)]
    Solve(#[from] SolveError),

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error(transparent)]
    WriteDataset(#[from] WriteDatasetError),

    #[error(transparent)]
    WriteSolutions(#[from] WriteSolutionsError),
}
