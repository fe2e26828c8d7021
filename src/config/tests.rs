// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use approx::assert_abs_diff_eq;
use indoc::indoc;

use super::*;
use crate::constants::{ARCSEC_TO_RAD, MAS_TO_RAD};
use crate::solutions::CalMode;
use crate::solve::Solint;

fn full_example() -> &'static str {
    indoc! {r#"
        [target]
        name = "tw_psc"
        ra_deg = 248.125
        dec_deg = -24.04
        incl_deg = 36.5
        pa_deg = 140.0
        vsys_kms = 4.6

        [[eb]]
        id = "sb_eb1"
        config = "SB"
        path = "data/sb_eb1.vis"

        [[eb]]
        id = "lb_eb1"
        config = "LB"
        path = "data/lb_eb1.vis"

        [alignment]
        npix = [256, 512, 1024]
        cell = "8mas"
        spw = 2

        [selfcal]
        refants = ["DA50", "DA45", "DV22"]
        schedule = [
            { mode = "p", solint = "inf", combine = "spw" },
            { mode = "p", solint = "360s", combine = "spw" },
            { mode = "p", solint = "120s", combine = "spw" },
            { mode = "p", solint = "60s", combine = "spw" },
            { mode = "p", solint = "18s", combine = "spw,scan" },
            { mode = "ap", solint = "scan", combine = "spw" },
        ]
        per_eb_schedule = [{ mode = "p", solint = "inf", combine = "spw" }]
        min_snr = 2.5
        threshold_sigma = 5.0

        [imaging]
        size = 512
        cell = "0.025arcsec"
        robust = 0.5
        niter = 2000
        annulus = ["3arcsec", "6arcsec"]

        [imaging.mask]
        semimajor = "1.5arcsec"
        semiminor = "1.2arcsec"
        pa_deg = 140.0

        [fluxscale]
        ratio_tolerance = 0.04

        [contsub]
        fit_order = 1
        vel_halfwidth_kms = 12.0
        transitions = ["12CO_2-1", "13CO_2-1", "C18O_2-1"]

        [pipeline]
        generations = 2
        channel_average_width = 8
        output_dir = "runs/tw_psc"
    "#}
}

#[test]
fn full_example_parses_and_validates() {
    let config = parse_str(full_example()).unwrap();

    assert_eq!(config.target.name, "tw_psc");
    assert_abs_diff_eq!(config.target.geometry.incl_deg, 36.5);
    assert_abs_diff_eq!(config.target.vsys_kms, 4.6);
    assert_abs_diff_eq!(
        config.target.phase_centre.ra,
        248.125_f64.to_radians(),
        epsilon = 1e-12
    );

    assert_eq!(config.ebs.len(), 2);
    assert_eq!(config.ebs[0].id, "sb_eb1");
    assert_eq!(config.ebs[1].config, ArrayConfig::Long);

    assert_eq!(config.merge.align.npix_list.len(), 3);
    assert_abs_diff_eq!(config.merge.align.cell_rad, 8.0 * MAS_TO_RAD, epsilon = 1e-15);
    assert_eq!(config.merge.align.spw, 2);

    // The schedule round-trips with shrinking solints and one trailing ap
    // round.
    let schedule = &config.merge.combined_schedule;
    assert_eq!(schedule.len(), 6);
    assert_eq!(schedule[0].mode, CalMode::Phase);
    assert_eq!(schedule[0].solint, Solint::Inf);
    assert!(schedule[0].combine.spws && !schedule[0].combine.scans);
    assert!(schedule[4].combine.scans);
    assert_eq!(schedule[5].mode, CalMode::AmpPhase);
    assert_eq!(schedule[5].solint, Solint::Scan);
    match schedule[1].solint {
        Solint::Dur(d) => assert_abs_diff_eq!(d.to_seconds(), 360.0),
        other => panic!("expected 360s, got {other:?}"),
    }

    assert!(config.merge.per_eb_schedule.is_some());
    assert_abs_diff_eq!(config.merge.selfcal.min_snr, 2.5);
    assert_abs_diff_eq!(config.merge.selfcal.threshold_sigma, 5.0);
    // Defaults fill the rest.
    assert_eq!(config.merge.selfcal.min_baselines_per_antenna, 4);
    assert!(config.merge.selfcal.solnorm);

    assert_eq!(config.merge.selfcal.imaging.size, 512);
    assert_abs_diff_eq!(
        config.merge.selfcal.imaging.cell_rad,
        0.025 * ARCSEC_TO_RAD,
        epsilon = 1e-15
    );
    assert_abs_diff_eq!(
        config.merge.selfcal.imaging.mask.semimajor_rad,
        1.5 * ARCSEC_TO_RAD,
        epsilon = 1e-12
    );
    assert_abs_diff_eq!(
        config.merge.selfcal.imaging.annulus_rad.1,
        6.0 * ARCSEC_TO_RAD,
        epsilon = 1e-12
    );

    assert_eq!(config.contsub.transitions.len(), 3);
    assert_abs_diff_eq!(config.contsub.vsys_kms, 4.6);
    assert_eq!(config.merge.generations, 2);
    assert_eq!(config.merge.channel_average_width, Some(8));
    assert_eq!(config.output_dir, std::path::PathBuf::from("runs/tw_psc"));
}

#[test]
fn bad_values_are_rejected_with_field_names() {
    let cases: [(&str, &str, &str); 5] = [
        ("incl_deg = 36.5", "incl_deg = 95.0", "target.incl_deg"),
        ("size = 512", "size = 511", "imaging.size"),
        (
            r#"transitions = ["12CO_2-1", "13CO_2-1", "C18O_2-1"]"#,
            r#"transitions = ["unobtainium_1-0"]"#,
            "contsub.transitions",
        ),
        ("generations = 2", "generations = 0", "pipeline.generations"),
        (
            r#"annulus = ["3arcsec", "6arcsec"]"#,
            r#"annulus = ["6arcsec", "3arcsec"]"#,
            "imaging.annulus",
        ),
    ];
    for (old, new, field) in cases {
        let text = full_example().replace(old, new);
        match parse_str(&text) {
            Err(ConfigError::BadValue { field: f, .. }) => assert_eq!(f, field),
            other => panic!("expected BadValue for {field}, got {other:?}"),
        }
    }
}

#[test]
fn bad_solints_and_unknown_keys_are_rejected() {
    let text = full_example().replace(r#"solint = "360s""#, r#"solint = "whenever""#);
    assert!(matches!(parse_str(&text), Err(ConfigError::Solve(_))));

    let text = format!("{}\nnonsense = 1\n", full_example());
    assert!(matches!(parse_str(&text), Err(ConfigError::Toml(_))));
}

#[test]
fn minimal_config_uses_defaults() {
    let text = indoc! {r#"
        [target]
        name = "disk"
        ra_deg = 100.0
        dec_deg = -30.0
        incl_deg = 20.0
        pa_deg = 0.0
        vsys_kms = 5.0

        [alignment]
        npix = [256]
        cell = "20mas"

        [selfcal]
        refants = ["DA41"]
        schedule = [{ mode = "p", solint = "inf" }]

        [imaging]
        size = 256
        cell = "50mas"
        annulus = ["2arcsec", "4arcsec"]

        [imaging.mask]
        semimajor = "1arcsec"
        semiminor = "1arcsec"

        [contsub]
        transitions = ["12CO_2-1"]
    "#};
    let config = parse_str(text).unwrap();
    assert!(config.ebs.is_empty());
    assert_eq!(config.merge.generations, 2);
    assert!(config.merge.per_eb_schedule.is_none());
    assert_abs_diff_eq!(config.merge.fluxscale.ratio_tolerance, 0.04);
    assert_abs_diff_eq!(config.merge.selfcal.min_snr, 3.0);
    assert_eq!(config.output_dir, std::path::PathBuf::from("pipeline_run"));
    // An empty combine string means no combining.
    assert!(!config.merge.combined_schedule[0].combine.spws);
}
