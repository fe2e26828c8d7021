// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SolveError {
    #[error("Dataset {dataset} has no model attached; run imaging before solving")]
    MissingModel { dataset: String },

    #[error("Dataset {dataset} has no continuum spws to solve on")]
    NoContinuumSpws { dataset: String },

    #[error("None of the reference antennas [{refants}] are present in dataset {dataset}; re-derive the reference antenna list for this dataset's membership")]
    NoRefant { dataset: String, refants: String },

    #[error("Could not parse '{solint}' as a solution interval")]
    BadSolint { solint: String },

    #[error("Could not parse '{combine}' as a combine policy (expected 'spw', 'scan' or 'spw,scan')")]
    BadCombine { combine: String },
}
