// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AlignError {
    #[error("Offset estimation was asked to compare dataset {name} against itself; callers must skip the reference dataset")]
    SelfComparison { name: String },

    #[error("Bad alignment grid size {npix}; must be an even, non-zero pixel count")]
    BadGridSize { npix: usize },

    #[error("Dataset {dataset} has no spw {spw}")]
    NoSuchSpw { dataset: String, spw: usize },

    #[error("Datasets {reference} and {offset} share no uv cells; offset estimation is degenerate")]
    NoOverlap { reference: String, offset: String },
}
