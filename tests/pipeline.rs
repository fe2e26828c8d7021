// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! End-to-end pipeline test through the public API: synthetic EBs on disk,
//! a TOML configuration, the merge controller, and continuum subtraction.

use indoc::indoc;

use alma_selfcal::config;
use alma_selfcal::context::PipelineContext;
use alma_selfcal::contsub::{derive_fitspw, extract_transition, subtract_continuum};
use alma_selfcal::imaging::GridImager;
use alma_selfcal::merge::{EbInput, MergeController};
use alma_selfcal::obs::io::{read_dataset, write_dataset};
use alma_selfcal::obs::SpwIntent;
use alma_selfcal::selfcal::SelfcalLoop;
use alma_selfcal::simulate::{simulate_eb, DiskModel, SimParams, SpwSetup};
use alma_selfcal::solve::AntsolSolver;

fn write_synthetic_eb(
    dir: &std::path::Path,
    name: &str,
    day: f64,
    seed: u64,
) -> std::path::PathBuf {
    let mut params = SimParams::new(name);
    params.num_times = 12;
    params.num_scans = 2;
    params.start_gpst_s = 1.3e9 + day * 86400.0;
    params.phase_noise_deg = 15.0;
    params.noise_jy = 2e-3;
    params.seed = seed;
    params.spws = vec![
        SpwSetup::band6_continuum(4),
        SpwSetup {
            first_freq_hz: 230.518e9,
            chan_width_hz: 1e6,
            num_chans: 64,
            intent: SpwIntent::Line,
        },
    ];
    let ds = simulate_eb(&params, &DiskModel::point(1.0)).unwrap();
    let path = dir.join(format!("{name}.vis"));
    write_dataset(&ds, &path).unwrap();
    path
}

#[test]
fn config_driven_pipeline_runs_to_line_extraction() {
    let dir = tempfile::tempdir().unwrap();
    let eb1 = write_synthetic_eb(dir.path(), "eb1", 0.0, 41);
    let eb2 = write_synthetic_eb(dir.path(), "eb2", 1.0, 42);
    let run_dir = dir.path().join("run");

    let toml = indoc! {r#"
        [target]
        name = "synth_disk"
        ra_deg = 248.0
        dec_deg = -24.0
        incl_deg = 30.0
        pa_deg = 120.0
        vsys_kms = 5.0

        [[eb]]
        id = "eb1"
        config = "SB"
        path = "EB1_PATH"

        [[eb]]
        id = "eb2"
        config = "SB"
        path = "EB2_PATH"

        [alignment]
        npix = [128]
        cell = "100mas"

        [selfcal]
        refants = ["DA41", "DA42"]
        schedule = [{ mode = "p", solint = "inf", combine = "spw" }]
        min_improvement = 0.0

        [imaging]
        size = 128
        cell = "50mas"
        niter = 200
        annulus = ["1.6arcsec", "2.9arcsec"]

        [imaging.mask]
        semimajor = "0.4arcsec"
        semiminor = "0.4arcsec"

        [contsub]
        fit_order = 1
        vel_halfwidth_kms = 10.0
        transitions = ["12CO_2-1"]

        [pipeline]
        generations = 1
        output_dir = "RUN_DIR"
    "#}
    .replace("EB1_PATH", &eb1.display().to_string())
    .replace("EB2_PATH", &eb2.display().to_string())
    .replace("RUN_DIR", &run_dir.display().to_string());

    let config = config::parse_str(&toml).unwrap();
    let mut ctx = PipelineContext::with_run_dir(&config.output_dir).unwrap();

    let ebs: Vec<EbInput> = config
        .ebs
        .iter()
        .map(|entry| {
            let mut dataset = read_dataset(&entry.path).unwrap();
            dataset.name = entry.id.clone();
            EbInput {
                dataset,
                config: entry.config,
            }
        })
        .collect();

    let controller = MergeController {
        selfcal: SelfcalLoop::new(&GridImager, &AntsolSolver),
    };
    let result = controller.run(&mut ctx, &ebs, &config.merge).unwrap();
    assert!(result.dataset.name.starts_with("synth_disk_all_g0"));
    assert_eq!(result.calibrated_ebs.len(), 2);

    // Round records were accumulated and the checkpoints landed on disk.
    assert!(!ctx.round_records.is_empty());
    assert!(run_dir.join("synth_disk_SB_g0.vis").exists());

    // Continuum subtraction and line extraction on each calibrated EB.
    for ds in &result.calibrated_ebs {
        let fitspw = derive_fitspw(ds, &config.contsub).unwrap();
        let subtracted = subtract_continuum(ds, &fitspw, &config.contsub).unwrap();
        let line = extract_transition(&subtracted, "12CO_2-1", &config.contsub).unwrap();
        assert_eq!(line.spws.len(), 1);
        assert!(line.spws[0].num_chans < 64);
        ctx.checkpoint_dataset(&line).unwrap();
    }

    let report = ctx.write_report().unwrap().unwrap();
    assert!(report.exists());
    let text = std::fs::read_to_string(report).unwrap();
    assert!(text.contains("rounds"));
}
