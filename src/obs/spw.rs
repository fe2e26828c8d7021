// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Spectral windows.

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

/// What a spectral window was set up for. Line spws are flagged out of the
/// continuum datasets that self-calibration runs on, and are the ones that
/// continuum subtraction operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter, EnumString, Serialize, Deserialize)]
pub enum SpwIntent {
    #[strum(serialize = "continuum")]
    Continuum,

    #[strum(serialize = "line")]
    Line,
}

/// A contiguous frequency sub-band of the receiver bandpass, subdivided into
/// channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectralWindow {
    /// Index within the owning dataset. Concatenation renumbers these, always
    /// appending new spws after all existing ones.
    pub id: usize,

    /// The EB this spw originated from. Preserved across concatenation, since
    /// gain solutions and frequency bookkeeping stay anchored to the original
    /// EB's windows.
    pub source_eb: String,

    /// Centre frequency of the first channel \[Hz\].
    pub first_freq_hz: f64,

    /// Channel width \[Hz\].
    pub chan_width_hz: f64,

    /// Number of channels.
    pub num_chans: usize,

    pub intent: SpwIntent,
}

impl SpectralWindow {
    /// Channel centre frequencies \[Hz\].
    pub fn freqs_hz(&self) -> Vec<f64> {
        (0..self.num_chans)
            .map(|c| self.first_freq_hz + c as f64 * self.chan_width_hz)
            .collect()
    }

    /// The centre frequency of the whole window \[Hz\].
    pub fn centre_freq_hz(&self) -> f64 {
        self.first_freq_hz + (self.num_chans as f64 - 1.0) / 2.0 * self.chan_width_hz
    }

    /// The channel whose centre is closest to `freq_hz`, if the frequency
    /// falls inside the window.
    pub fn channel_at(&self, freq_hz: f64) -> Option<usize> {
        let c = ((freq_hz - self.first_freq_hz) / self.chan_width_hz).round();
        (c >= 0.0 && c < self.num_chans as f64).then_some(c as usize)
    }

    /// Total bandwidth \[Hz\].
    pub fn bandwidth_hz(&self) -> f64 {
        self.chan_width_hz.abs() * self.num_chans as f64
    }
}
