// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimulateError {
    #[error("Can't simulate an array of {num} antennas; need at least 3")]
    NotEnoughAntennas { num: usize },

    #[error("No spectral windows were specified")]
    NoSpws,

    #[error("No timesteps or no scans were specified")]
    NoTimesteps,
}
