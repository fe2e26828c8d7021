// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use thiserror::Error;

use crate::align::AlignError;
use crate::fluxscale::FluxScaleError;
use crate::obs::io::WriteDatasetError;
use crate::obs::{ConcatError, SplitError};
use crate::selfcal::SelfcalError;
use crate::solve::apply::ApplyError;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("No execution blocks were given")]
    NoEbs,

    #[error("No antennas matching [{names}] are present in dataset {dataset}; the reference-antenna list must be re-derived for this membership")]
    NoRefantCandidates { names: String, dataset: String },

    #[error(transparent)]
    Align(#[from] AlignError),

    #[error(transparent)]
    Concat(#[from] ConcatError),

    #[error(transparent)]
    Split(#[from] SplitError),

    #[error(transparent)]
    Selfcal(#[from] SelfcalError),

    #[error(transparent)]
    FluxScale(#[from] FluxScaleError),

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error(transparent)]
    WriteDataset(#[from] WriteDatasetError),
}
