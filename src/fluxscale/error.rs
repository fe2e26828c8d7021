// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FluxScaleError {
    #[error("Dataset {dataset} has no unflagged continuum data to compare")]
    NoData { dataset: String },

    #[error("Datasets {reference} and {comparison} have no overlapping deprojected baseline range; their flux scales cannot be compared directly")]
    NoOverlap {
        reference: String,
        comparison: String,
    },

    #[error("Only {bins} usable ratio bins between {reference} and {comparison}; need at least 2")]
    TooFewBins {
        reference: String,
        comparison: String,
        bins: usize,
    },

    #[error("Flux rescale factor must be positive, got {factor}")]
    BadFactor { factor: f64 },

    #[error("Applying the flux-scale table to {dataset} failed: {message}")]
    Apply { dataset: String, message: String },
}
