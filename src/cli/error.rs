// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The top-level error type. Everything a subcommand can fail with funnels
//! into this for a single user-facing rendering in `main`.

use thiserror::Error;

use crate::align::AlignError;
use crate::config::ConfigError;
use crate::contsub::ContsubError;
use crate::fluxscale::FluxScaleError;
use crate::imaging::ImagingError;
use crate::merge::MergeError;
use crate::obs::io::{ReadDatasetError, WriteDatasetError};
use crate::obs::{ConcatError, SplitError};
use crate::selfcal::SelfcalError;
use crate::simulate::SimulateError;
use crate::solutions::{ReadSolutionsError, WriteSolutionsError};
use crate::solve::apply::ApplyError;
use crate::solve::SolveError;
use crate::unit_parsing::UnitParseError;

#[derive(Debug, Error)]
pub enum AlmaSelfcalError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    ReadDataset(#[from] ReadDatasetError),

    #[error(transparent)]
    WriteDataset(#[from] WriteDatasetError),

    #[error(transparent)]
    ReadSolutions(#[from] ReadSolutionsError),

    #[error(transparent)]
    WriteSolutions(#[from] WriteSolutionsError),

    #[error(transparent)]
    Align(#[from] AlignError),

    #[error(transparent)]
    Imaging(#[from] ImagingError),

    #[error(transparent)]
    Solve(#[from] SolveError),

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error(transparent)]
    Selfcal(#[from] SelfcalError),

    #[error(transparent)]
    FluxScale(#[from] FluxScaleError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Contsub(#[from] ContsubError),

    #[error(transparent)]
    UnitParse(#[from] UnitParseError),

    #[error(transparent)]
    Simulate(#[from] SimulateError),

    #[error(transparent)]
    Split(#[from] SplitError),

    #[error(transparent)]
    Concat(#[from] ConcatError),

    #[cfg(feature = "plotting")]
    #[error(transparent)]
    Plot(#[from] crate::solutions::PlotError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
