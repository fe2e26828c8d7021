// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use thiserror::Error;

use crate::solve::SolveError;
use crate::unit_parsing::UnitParseError;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Bad value for {field}: {message}")]
    BadValue {
        field: &'static str,
        message: String,
    },

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Unit(#[from] UnitParseError),

    #[error(transparent)]
    Solve(#[from] SolveError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
