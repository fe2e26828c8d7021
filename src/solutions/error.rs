// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Error types associated with reading, writing and plotting gain tables.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReadSolutionsError {
    #[error("{file}: doesn't appear to be a gain table (bad magic)")]
    BadMagic { file: String },

    #[error("{file}: bad {what} in gain table")]
    BadValue { file: String, what: &'static str },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum WriteSolutionsError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(feature = "plotting")]
#[derive(Debug, Error)]
pub enum PlotError {
    #[error("Error from the plotters library: {0}")]
    Draw(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
