// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Antennas and their station pads.

use serde::{Deserialize, Serialize};

/// One antenna of the array.
///
/// A named antenna (e.g. "DA50") may occupy different station pads in
/// different observing sessions; the (name, station) pair is what identifies
/// an antenna within a dataset, and reference-antenna lists must be written
/// in the session-resolved `name@station` form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Antenna {
    /// Antenna name, e.g. "DA50".
    pub name: String,

    /// The station pad the antenna occupied during the observation, e.g.
    /// "A045".
    pub station: String,

    /// East-north-up position relative to the array centre \[metres\].
    pub position_enu_m: [f64; 3],
}

impl Antenna {
    /// The session-resolved label, e.g. "DA50@A045".
    pub fn label(&self) -> String {
        format!("{}@{}", self.name, self.station)
    }

    /// Does a label match this antenna? A bare name matches any station; a
    /// full `name@station` label must match both.
    pub fn matches_label(&self, label: &str) -> bool {
        match label.split_once('@') {
            Some((name, station)) => self.name == name && self.station == station,
            None => self.name == label,
        }
    }
}
