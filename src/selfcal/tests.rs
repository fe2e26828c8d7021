// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use marlu::c64;
use ndarray::prelude::*;
use vec1::vec1;

use super::policy::ManualFlags;
use super::*;
use crate::imaging::GridImager;
use crate::obs::VisDataset;
use crate::simulate::{simulate_eb, DiskModel, SimParams};
use crate::solutions::{timeblocks_from_scans, FlagEntry, GainTable};
use crate::solve::{make_spwblocks, AntsolSolver, SolveError};

fn phase_noisy_eb(phase_noise_deg: f64) -> VisDataset {
    let mut params = SimParams::new("eb1");
    params.num_times = 40;
    params.integration_s = 30.0;
    params.num_scans = 2;
    params.scan_gap_ints = 4;
    params.phase_noise_deg = phase_noise_deg;
    params.noise_jy = 2e-3;
    simulate_eb(&params, &DiskModel::point(1.0)).unwrap()
}

fn base_params(ds: &VisDataset, schedule: Vec1<ScheduleEntry>) -> SelfcalParams {
    SelfcalParams {
        name: "eb1_selfcal".to_string(),
        schedule,
        refants: vec1![ds.antennas[0].label()],
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
    }
}

fn entry(mode: crate::solutions::CalMode, solint: &str) -> ScheduleEntry {
    ScheduleEntry {
        mode,
        solint: solint.parse().unwrap(),
        combine: crate::solve::CombinePolicy {
            scans: false,
            spws: true,
        },
    }
}

use crate::solutions::CalMode::{AmpPhase, Phase};

#[test]
fn schedules_enforce_phase_before_amplitude() {
    let bad = vec1![entry(AmpPhase, "scan"), entry(Phase, "inf")];
    assert!(matches!(
        validate_schedule(&bad),
        Err(SelfcalError::PhaseAfterAmplitude)
    ));

    let two_amps = vec1![
        entry(Phase, "inf"),
        entry(AmpPhase, "scan"),
        entry(AmpPhase, "scan")
    ];
    assert!(matches!(
        validate_schedule(&two_amps),
        Err(SelfcalError::MultipleAmplitudeRounds { count: 2 })
    ));

    let good = vec1![
        entry(Phase, "inf"),
        entry(Phase, "120s"),
        entry(AmpPhase, "scan")
    ];
    assert!(validate_schedule(&good).is_ok());
}

/// Antenna-dependent phase noise, no amplitude errors: three phase-only
/// rounds with shrinking intervals must strictly increase the peak SNR and
/// leave the residual phases small.
#[test]
fn shrinking_solints_strictly_improve_a_phase_noisy_dataset() {
    let ds = phase_noisy_eb(30.0);
    let schedule = vec1![
        entry(Phase, "inf"),
        entry(Phase, "120s"),
        entry(Phase, "30s")
    ];
    let params = base_params(&ds, schedule);

    let mut ctx = crate::context::PipelineContext::new();
    let selfcal = SelfcalLoop::new(&GridImager, &AntsolSolver);
    let result = selfcal.run(&mut ctx, ds, &params).unwrap();

    assert_eq!(result.outcome, SelfcalOutcome::Converged);
    assert_eq!(result.rounds.len(), 3);
    for round in &result.rounds {
        assert!(round.accepted, "round {} not accepted: {}", round.index, round.reason);
        let post = round.post_stats.unwrap();
        assert!(
            post.peak_snr > round.pre_stats.peak_snr,
            "round {}: peak SNR {:.1} -> {:.1} did not increase",
            round.index,
            round.pre_stats.peak_snr,
            post.peak_snr
        );
    }

    // Residual phases against the known truth: the source is a 1 Jy point
    // at the phase centre, so the corrected phases should scatter tightly
    // around zero.
    let spw_data = &result.dataset.spw_data[0];
    let corrected = spw_data.corrected.as_ref().unwrap();
    let mut sum_sq = 0.0;
    let mut count = 0usize;
    for ((idx, v), &flag) in corrected.indexed_iter().zip(spw_data.flags.iter()) {
        let _ = idx;
        if flag {
            continue;
        }
        sum_sq += (v.arg() as f64).powi(2);
        count += 1;
    }
    let rms_deg = (sum_sq / count as f64).sqrt().to_degrees();
    assert!(
        rms_deg < 5.0,
        "residual phase RMS {rms_deg:.2} deg after three rounds"
    );

    // The round chain is intact: round N solved from round N-1's output.
    assert_eq!(result.rounds[0].dataset_in, "eb1");
    assert_eq!(
        result.rounds[1].dataset_in,
        result.rounds[0].dataset_out.as_deref().unwrap()
    );
    assert_eq!(
        result.rounds[2].dataset_in,
        result.rounds[1].dataset_out.as_deref().unwrap()
    );
}

/// A solver stub that hands back deliberately corrupting gains.
struct SabotageSolver;

impl crate::solve::GainSolver for SabotageSolver {
    fn solve(
        &self,
        ds: &VisDataset,
        params: &crate::solve::SolveParams,
    ) -> Result<GainTable, SolveError> {
        let timeblocks = timeblocks_from_scans(&ds.timestamps, &ds.scans, None);
        let spwblocks = make_spwblocks(ds, true);
        let dim = (timeblocks.len(), ds.num_antennas(), spwblocks.len());
        let mut gains = Array3::from_elem(dim, c64::new(1.0, 0.0));
        for (a, mut lane) in gains.axis_iter_mut(Axis(1)).enumerate() {
            let phase = a as f64 * 1.1;
            lane.fill(c64::from_polar(1.0, phase));
        }
        Ok(GainTable {
            name: params.table_name.clone(),
            mode: params.mode,
            antennas: ds.antennas.clone(),
            timeblocks,
            spwblocks,
            gains,
            snrs: Array3::from_elem(dim, 100.0),
            solved_from: ds.name.clone(),
            refant: None,
        })
    }
}

#[test]
fn a_regressing_round_is_discarded_and_stops_the_loop() {
    let ds = phase_noisy_eb(0.0);
    let input_name = ds.name.clone();
    let params = base_params(&ds, vec1![entry(Phase, "inf")]);

    let mut ctx = crate::context::PipelineContext::new();
    let selfcal = SelfcalLoop::new(&GridImager, &SabotageSolver);
    let result = selfcal.run(&mut ctx, ds, &params).unwrap();

    assert_eq!(
        result.outcome,
        SelfcalOutcome::Stopped(StopReason::Regression)
    );
    assert!(!result.rounds[0].accepted);
    // The input checkpoint is untouched; the loop hands back the last good
    // dataset.
    assert_eq!(result.dataset.name, input_name);
    assert!(result.dataset.spw_data[0].corrected.is_none());
}

/// A solver stub whose solutions are all flagged.
struct HopelessSolver;

impl crate::solve::GainSolver for HopelessSolver {
    fn solve(
        &self,
        ds: &VisDataset,
        params: &crate::solve::SolveParams,
    ) -> Result<GainTable, SolveError> {
        let timeblocks = timeblocks_from_scans(&ds.timestamps, &ds.scans, None);
        let spwblocks = make_spwblocks(ds, true);
        let dim = (timeblocks.len(), ds.num_antennas(), spwblocks.len());
        Ok(GainTable {
            name: params.table_name.clone(),
            mode: params.mode,
            antennas: ds.antennas.clone(),
            timeblocks,
            spwblocks,
            gains: Array3::from_elem(dim, c64::new(f64::NAN, f64::NAN)),
            snrs: Array3::zeros(dim),
            solved_from: ds.name.clone(),
            refant: None,
        })
    }
}

#[test]
fn a_flag_explosion_is_not_applied() {
    let ds = phase_noisy_eb(0.0);
    let params = base_params(&ds, vec1![entry(Phase, "30s")]);

    let mut ctx = crate::context::PipelineContext::new();
    let selfcal = SelfcalLoop::new(&GridImager, &HopelessSolver);
    let result = selfcal.run(&mut ctx, ds, &params).unwrap();

    // The round is rejected without an apply; with no amplitude round to
    // fall through to, the loop ends.
    assert!(!result.rounds[0].accepted);
    assert!(result.rounds[0].dataset_out.is_none());
    assert!(result.rounds[0].reason.contains("flagged"));
    assert!(result.dataset.spw_data[0].corrected.is_none());
}

/// A solver stub with broken lineage.
struct AmnesiacSolver;

impl crate::solve::GainSolver for AmnesiacSolver {
    fn solve(
        &self,
        ds: &VisDataset,
        params: &crate::solve::SolveParams,
    ) -> Result<GainTable, SolveError> {
        let mut table = SabotageSolver.solve(ds, params)?;
        table.solved_from = "some_other_dataset".to_string();
        Ok(table)
    }
}

#[test]
fn broken_lineage_is_a_hard_error() {
    let ds = phase_noisy_eb(0.0);
    let params = base_params(&ds, vec1![entry(Phase, "inf")]);
    let mut ctx = crate::context::PipelineContext::new();
    let selfcal = SelfcalLoop::new(&GridImager, &AmnesiacSolver);
    assert!(matches!(
        selfcal.run(&mut ctx, ds, &params),
        Err(SelfcalError::BrokenLineage { .. })
    ));
}

#[test]
fn the_approval_gate_can_veto_a_round() {
    let ds = phase_noisy_eb(20.0);
    let params = base_params(&ds, vec1![entry(Phase, "inf")]);
    let mut ctx = crate::context::PipelineContext::new();
    let veto = |_: &RoundRecord| false;
    let selfcal = SelfcalLoop {
        imager: &GridImager,
        solver: &AntsolSolver,
        flag_policy: &NoExtraFlags,
        gate: ApprovalGate::Review(&veto),
    };
    let result = selfcal.run(&mut ctx, ds, &params).unwrap();
    assert_eq!(
        result.outcome,
        SelfcalOutcome::Stopped(StopReason::OperatorVeto)
    );
    assert!(result.dataset.spw_data[0].corrected.is_none());
}

#[test]
fn manual_flag_policy_reaches_the_table() {
    let ds = phase_noisy_eb(20.0);
    let flagged_antenna = ds.antennas[3].label();
    let mut params = base_params(&ds, vec1![entry(Phase, "inf")]);
    // Flagging one antenna of eight shouldn't break acceptance.
    params.convergence.max_flagged_fraction = 0.5;

    let policy = ManualFlags(vec![FlagEntry {
        antenna: flagged_antenna,
        spw_ids: None,
        time_range_gpst_s: None,
    }]);
    let mut ctx = crate::context::PipelineContext::new();
    let selfcal = SelfcalLoop {
        imager: &GridImager,
        solver: &AntsolSolver,
        flag_policy: &policy,
        gate: ApprovalGate::Auto,
    };
    let result = selfcal.run(&mut ctx, ds, &params).unwrap();
    assert_eq!(result.rounds[0].extra_flag_entries, 1);
    // An eighth of the solutions went with it.
    assert!(result.rounds[0].flagged_fraction >= 1.0 / 8.0 - 1e-9);
}

#[test]
fn auto_snr_policy_flags_systematically_sick_antennas() {
    // A table where antenna 2 is flagged in 3 of 4 timeblocks already.
    let ds = phase_noisy_eb(0.0);
    let timeblocks = timeblocks_from_scans(&ds.timestamps, &ds.scans, Some(300.0));
    let spwblocks = make_spwblocks(&ds, true);
    let dim = (timeblocks.len(), ds.num_antennas(), spwblocks.len());
    let mut table = GainTable {
        name: "t.g".to_string(),
        mode: crate::solutions::CalMode::Phase,
        antennas: ds.antennas.clone(),
        timeblocks,
        spwblocks,
        gains: Array3::from_elem(dim, c64::new(1.0, 0.0)),
        snrs: Array3::from_elem(dim, 20.0),
        solved_from: ds.name.clone(),
        refant: None,
    };
    for t in 0..dim.0.min(3) {
        table.flag_solution(t, 2, 0);
    }

    let policy = AutoSnrPolicy {
        max_low_fraction: 0.5,
    };
    let flags = policy.extra_flags(&table);
    assert_eq!(flags.len(), 1);
    assert_eq!(flags[0].antenna, ds.antennas[2].label());

    // Below the threshold: nothing flagged.
    let lax = AutoSnrPolicy {
        max_low_fraction: 0.9,
    };
    assert!(lax.extra_flags(&table).is_empty());
}
