// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImagingError {
    #[error("Bad image size {size}; must be an even, non-zero number of pixels")]
    BadImageSize { size: usize },

    #[error("Dataset {dataset} has no spws selected for imaging")]
    NoSpwsToImage { dataset: String },

    #[error("All data in dataset {dataset} are flagged or zero-weighted")]
    AllDataFlagged { dataset: String },
}
