// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use vec1::vec1;

use super::*;
use crate::constants::MAS_TO_RAD;
use crate::imaging::GridImager;
use crate::selfcal::ConvergencePolicy;
use crate::simulate::{simulate_eb, DiskModel, SimParams};
use crate::solutions::CalMode;
use crate::solve::{AntsolSolver, CombinePolicy};

fn eb(name: &str, day: f64, extent_m: f64, flux_scale: f64, seed: u64) -> VisDataset {
    let mut params = SimParams::new(name);
    params.num_times = 12;
    params.num_scans = 2;
    params.array_extent_m = extent_m;
    params.start_gpst_s = 1.3e9 + day * 86400.0;
    params.phase_noise_deg = 15.0;
    params.noise_jy = 2e-3;
    params.flux_scale = flux_scale;
    params.seed = seed;
    simulate_eb(&params, &DiskModel::point(1.0)).unwrap()
}

fn schedule_entry() -> ScheduleEntry {
    ScheduleEntry {
        mode: CalMode::Phase,
        solint: crate::solve::Solint::Inf,
        combine: CombinePolicy {
            scans: false,
            spws: true,
        },
    }
}

fn merge_params() -> MergeParams {
    MergeParams {
        target: "tst_disk".to_string(),
        geometry: DiskGeometry {
            incl_deg: 30.0,
            pa_deg: 120.0,
        },
        align: crate::align::AlignParams {
            npix_list: vec1![128],
            cell_rad: 100.0 * MAS_TO_RAD,
            spw: 0,
        },
        refant_names: vec1!["DA41".to_string(), "DA42".to_string()],
        per_eb_schedule: None,
        combined_schedule: vec1![schedule_entry()],
        channel_average_width: Some(4),
        selfcal: SelfcalParams {
            name: String::new(),
            schedule: vec1![schedule_entry()],
            refants: vec1!["placeholder".to_string()],
            min_snr: 3.0,
            min_baselines_per_antenna: 4,
            solnorm: true,
            threshold_sigma: 6.0,
            interp: crate::solve::apply::Interp::Nearest,
            apply_mode: crate::solve::apply::ApplyMode::CalFlag,
            calwt: false,
            imaging: crate::imaging::tests::test_params(128, 50.0),
            convergence: ConvergencePolicy {
                min_improvement: 0.0,
                ..Default::default()
            },
        },
        fluxscale: crate::fluxscale::FluxScaleParams::default(),
        generations: 2,
    }
}

fn inputs() -> Vec<EbInput> {
    vec![
        EbInput {
            dataset: eb("eb1", 0.0, 300.0, 1.0, 11),
            config: ArrayConfig::Short,
        },
        EbInput {
            dataset: eb("eb2", 1.0, 300.0, 1.15, 22),
            config: ArrayConfig::Short,
        },
        EbInput {
            dataset: eb("eb3", 2.0, 500.0, 1.0, 33),
            config: ArrayConfig::Long,
        },
    ]
}

#[test]
fn refants_are_session_resolved() {
    let ds = eb("eb1", 0.0, 300.0, 1.0, 1);
    let labels = resolve_refants(&vec1!["DA42".to_string(), "DA41".to_string()], &ds).unwrap();
    assert_eq!(labels[0], ds.antennas[1].label());
    assert_eq!(labels[1], ds.antennas[0].label());
    assert!(labels[0].contains('@'));

    assert!(matches!(
        resolve_refants(&vec1!["DV99".to_string()], &ds),
        Err(MergeError::NoRefantCandidates { .. })
    ));
}

#[test]
fn controller_rejects_empty_input() {
    let controller = MergeController {
        selfcal: crate::selfcal::SelfcalLoop::new(&GridImager, &AntsolSolver),
    };
    let mut ctx = PipelineContext::new();
    assert!(matches!(
        controller.run(&mut ctx, &[], &merge_params()),
        Err(MergeError::NoEbs)
    ));
}

#[test]
fn two_generation_pipeline_produces_calibrated_ebs() {
    let controller = MergeController {
        selfcal: crate::selfcal::SelfcalLoop::new(&GridImager, &AntsolSolver),
    };
    let mut ctx = PipelineContext::new();
    let params = merge_params();
    let result = controller.run(&mut ctx, &inputs(), &params).unwrap();

    // The last generation's full-array dataset is the final product.
    assert!(result.dataset.name.starts_with("tst_disk_all_g1"));
    assert_eq!(result.generations.len(), 2);

    // Generation 1 starts from generation 0's recommended scales.
    assert_eq!(
        result.generations[1].input_scales,
        result.generations[0].next_scales
    );
    // The deliberately bright EB is pulled back towards unity.
    let eb2_next = result.generations[0].next_scales["eb2"];
    assert!(
        eb2_next < 0.97,
        "eb2 next-generation scale {eb2_next} should correct the 15% offset"
    );

    // One calibrated full-resolution dataset per input EB, calibration
    // folded into the data column.
    assert_eq!(result.calibrated_ebs.len(), 3);
    for (ds, eb) in result.calibrated_ebs.iter().zip(inputs().iter()) {
        assert!(ds.name.starts_with(&format!("{}.g1", eb.dataset.name)));
        assert!(ds.name.ends_with(".cal"));
        assert!(!ds.has_corrected());
        // The replayed tables show up in the lineage.
        assert!(ds.history.iter().any(|h| h.contains("applycal")));
        // Alignment was replayed onto the full-resolution data too.
        assert!(ds.history.iter().any(|h| h.contains("phase-shifted")));
    }

    // Every selfcal stage ran: per config (SB, LB) and full array, twice.
    let names: Vec<&str> = ctx
        .round_records
        .iter()
        .map(|r| r.table_name.as_str())
        .collect();
    assert!(names.iter().any(|n| n.contains("tst_disk_SB_g0")));
    assert!(names.iter().any(|n| n.contains("tst_disk_LB_g0")));
    assert!(names.iter().any(|n| n.contains("tst_disk_all_g0")));
    assert!(names.iter().any(|n| n.contains("tst_disk_all_g1")));

    // The cross-config and per-EB flux checks were recorded.
    assert!(!ctx.flux_history.is_empty());
    // Alignment reports cover the two non-reference EBs per generation.
    assert_eq!(ctx.alignment_reports.len(), 4);
}
