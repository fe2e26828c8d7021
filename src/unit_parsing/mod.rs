// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Code to parse strings into plain numbers or some quantity with a unit.

mod error;
#[cfg(test)]
mod tests;

pub(crate) use error::*;

use strum::IntoEnumIterator;
use strum_macros::{EnumIter, EnumString, IntoStaticStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, EnumString, IntoStaticStr)]
pub(crate) enum TimeFormat {
    /// Seconds
    S,

    /// Minutes
    Min,

    NoUnit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, EnumString, IntoStaticStr)]
pub(crate) enum AngleFormat {
    /// Arcseconds
    Arcsec,

    /// Milliarcseconds
    Mas,

    NoUnit,
}

/// Parse a string that may have a unit of time attached to it.
pub(crate) fn parse_time(s: &str) -> Result<(f64, TimeFormat), UnitParseError> {
    // Try to parse a naked number.
    let maybe_number: Option<f64> = s.trim().parse().ok();
    if let Some(number) = maybe_number {
        return Ok((number, TimeFormat::NoUnit));
    };

    // That didn't work; let's search over our supported formats.
    for time_format in TimeFormat::iter().filter(|&tf| tf != TimeFormat::NoUnit) {
        let time_format_str: &'static str = time_format.into();
        let suffix = s
            .trim()
            .trim_start_matches(|c| char::is_numeric(c) || c == '.')
            .trim();
        if suffix.to_uppercase() == time_format_str.to_uppercase() {
            let prefix = s.trim().trim_end_matches(char::is_alphabetic).trim();
            let number: f64 = match prefix.parse() {
                Ok(n) => n,
                Err(_) => {
                    return Err(UnitParseError::GotTimeUnitButCantParse {
                        input: s.to_string(),
                        unit: time_format_str,
                    })
                }
            };
            return Ok((number, time_format));
        }
    }

    // If we made it this far, we don't know how to parse the string.
    Err(UnitParseError::Unknown {
        input: s.to_string(),
        unit_type: "time",
    })
}

/// Parse a string that may have an angular unit attached to it.
pub(crate) fn parse_angle(s: &str) -> Result<(f64, AngleFormat), UnitParseError> {
    let maybe_number: Option<f64> = s.trim().parse().ok();
    if let Some(number) = maybe_number {
        return Ok((number, AngleFormat::NoUnit));
    };

    for angle_format in AngleFormat::iter().filter(|&af| af != AngleFormat::NoUnit) {
        let angle_format_str: &'static str = angle_format.into();
        let suffix = s
            .trim()
            .trim_start_matches(|c| char::is_numeric(c) || c == '.')
            .trim();
        if suffix.to_uppercase() == angle_format_str.to_uppercase() {
            let prefix = s.trim().trim_end_matches(char::is_alphabetic).trim();
            let number: f64 = match prefix.parse() {
                Ok(n) => n,
                Err(_) => {
                    return Err(UnitParseError::GotAngleUnitButCantParse {
                        input: s.to_string(),
                        unit: angle_format_str,
                    })
                }
            };
            return Ok((number, angle_format));
        }
    }

    Err(UnitParseError::Unknown {
        input: s.to_string(),
        unit_type: "angle",
    })
}

impl TimeFormat {
    /// Convert a number in this format to seconds. A naked number is assumed
    /// to already be in seconds.
    pub(crate) fn to_seconds(self, number: f64) -> f64 {
        match self {
            TimeFormat::S | TimeFormat::NoUnit => number,
            TimeFormat::Min => number * 60.0,
        }
    }
}

impl AngleFormat {
    /// Convert a number in this format to radians. A naked number is assumed
    /// to be in arcseconds, the conventional cell-size unit.
    pub(crate) fn to_radians(self, number: f64) -> f64 {
        match self {
            AngleFormat::Arcsec | AngleFormat::NoUnit => number * crate::constants::ARCSEC_TO_RAD,
            AngleFormat::Mas => number * crate::constants::MAS_TO_RAD,
        }
    }
}
