// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Errors from dataset transformations.

use thiserror::Error;

use super::DataColumn;

#[derive(Debug, Error)]
pub enum SplitError {
    #[error("Dataset {dataset} has no {column} column to split out")]
    MissingColumn {
        column: DataColumn,
        dataset: String,
    },

    #[error("No spw {spw} in this dataset")]
    NoSuchSpw { spw: usize },

    #[error("Channel-averaging width must be at least 1")]
    BadChannelWidth,
}

#[derive(Debug, Error)]
pub enum ConcatError {
    #[error("No datasets were given to concatenate")]
    NoDatasets,

    #[error("Datasets {a} and {b} have phase centres {separation_arcsec:.3}\" apart; align them before concatenating")]
    PhaseCentreMismatch {
        a: String,
        b: String,
        separation_arcsec: f64,
    },

    #[error("Datasets {a} and {b} overlap in time; cannot concatenate")]
    OverlappingTimeRanges { a: String, b: String },
}
