// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use super::*;

use approx::assert_abs_diff_eq;

#[test]
fn test_parse_time_str_without_units() {
    let result = parse_time("1");
    assert!(result.is_ok(), "{:?}", result.unwrap_err());
    let pair = result.unwrap();
    assert_abs_diff_eq!(pair.0, 1.0);
    assert_eq!(pair.1, TimeFormat::NoUnit);

    let result = parse_time(" 360.0 ");
    assert!(result.is_ok(), "{:?}", result.unwrap_err());
    let pair = result.unwrap();
    assert_abs_diff_eq!(pair.0, 360.0);
    assert_eq!(pair.1, TimeFormat::NoUnit);
}

#[test]
fn test_parse_time_str_with_units() {
    // Iterate over all possible units.
    for time_format in TimeFormat::iter().filter(|&tf| tf != TimeFormat::NoUnit) {
        let time_format_str: &'static str = time_format.into();
        for time_format_str in [
            time_format_str.to_lowercase(),
            time_format_str.to_uppercase(),
        ] {
            let result = parse_time(&format!("1{}", time_format_str));
            assert!(result.is_ok(), "{:?}", result.unwrap_err());
            let pair = result.unwrap();
            assert_abs_diff_eq!(pair.0, 1.0);
            assert_eq!(pair.1, time_format);

            let result = parse_time(&format!(" 1.0 {} ", time_format_str));
            assert!(result.is_ok(), "{:?}", result.unwrap_err());
            let pair = result.unwrap();
            assert_abs_diff_eq!(pair.0, 1.0);
            assert_eq!(pair.1, time_format);
        }
    }
}

#[test]
fn test_time_conversions() {
    assert_abs_diff_eq!(TimeFormat::S.to_seconds(120.0), 120.0);
    assert_abs_diff_eq!(TimeFormat::Min.to_seconds(2.0), 120.0);
    assert_abs_diff_eq!(TimeFormat::NoUnit.to_seconds(18.0), 18.0);
}

#[test]
fn test_parse_angle_str() {
    let (n, f) = parse_angle("0.025arcsec").unwrap();
    assert_abs_diff_eq!(n, 0.025);
    assert_eq!(f, AngleFormat::Arcsec);

    let (n, f) = parse_angle("8mas").unwrap();
    assert_abs_diff_eq!(n, 8.0);
    assert_eq!(f, AngleFormat::Mas);

    let (n, f) = parse_angle("0.003").unwrap();
    assert_abs_diff_eq!(n, 0.003);
    assert_eq!(f, AngleFormat::NoUnit);

    // Arcsec and mas agree on what a radian is.
    assert_abs_diff_eq!(
        AngleFormat::Arcsec.to_radians(0.008),
        AngleFormat::Mas.to_radians(8.0),
        epsilon = 1e-15
    );
}

#[test]
fn test_parse_time_garbage() {
    assert!(parse_time("four score").is_err());
    assert!(parse_time("1.0parsec").is_err());
}
