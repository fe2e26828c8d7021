// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContsubError {
    #[error("Unknown transition '{name}'; not in the catalog")]
    UnknownTransition { name: String },

    #[error("Continuum fit order {order} is not supported; use 0-2")]
    BadFitOrder { order: usize },

    #[error("fitspw has {entries} entries but the dataset has {spws} spws; re-derive it for this dataset")]
    FitspwMismatch { entries: usize, spws: usize },

    #[error("Transition {name} is not covered by any spw of dataset {dataset}")]
    TransitionNotCovered { name: String, dataset: String },

    #[error(transparent)]
    Split(#[from] crate::obs::SplitError),
}
