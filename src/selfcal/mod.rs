// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The self-calibration loop.
//!
//! One round is image -> solve -> flag -> apply -> re-image -> evaluate.
//! Rounds walk a schedule of (mode, solution interval, combine) entries with
//! monotonically shrinking intervals: shorter intervals track faster
//! atmospheric phase errors but spread the SNR thinner, so the loop keeps
//! shortening only while the image keeps improving and the flagged-solution
//! fraction stays sane. Phase-only rounds come first; a single
//! amplitude+phase round may follow. Amplitude before coherent phases is
//! meaningless, so the ordering is enforced, not advised.
//!
//! Every round solves against the previous round's *corrected* data and
//! consumes its own fresh gain table exactly once. Lineage is tracked
//! through dataset names and verified; a round solved against the wrong
//! generation of data silently desynchronises the calibration chain.

mod error;
pub mod policy;
#[cfg(test)]
mod tests;

pub use error::SelfcalError;
pub use policy::{ApprovalGate, AutoSnrPolicy, ConvergencePolicy, FlagPolicy, NoExtraFlags};

use log::{info, warn};
use serde::Serialize;
use vec1::Vec1;

use crate::context::PipelineContext;
use crate::imaging::{ImageStats, ImagingParams, SynthesisImager};
use crate::obs::VisDataset;
use crate::solutions::{CalMode, GainTable};
use crate::solve::apply::{apply_gains, build_spw_map, ApplyMode, ApplyParams, Interp};
use crate::solve::{CombinePolicy, GainSolver, SolveParams, Solint};

/// One entry of the self-cal schedule.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleEntry {
    pub mode: CalMode,
    pub solint: Solint,
    pub combine: CombinePolicy,
}

/// Everything the loop needs beyond the dataset.
#[derive(Debug, Clone)]
pub struct SelfcalParams {
    /// Stem for round dataset/table names.
    pub name: String,

    /// The schedule, shrinking solution intervals then (optionally) one
    /// amplitude+phase entry. The concrete interval sequence is policy, not
    /// architecture; it comes from configuration.
    pub schedule: Vec1<ScheduleEntry>,

    /// Session-resolved reference antenna labels.
    pub refants: Vec1<String>,

    pub min_snr: f64,
    pub min_baselines_per_antenna: usize,

    /// Normalise amplitude solutions in amplitude rounds.
    pub solnorm: bool,

    /// Clean threshold for each round: this many times the previous round's
    /// image RMS.
    pub threshold_sigma: f64,

    pub interp: Interp,
    pub apply_mode: ApplyMode,
    pub calwt: bool,

    /// Base imaging setup; the per-round threshold is filled in by the loop
    /// and the mask stays fixed for before/after comparability.
    pub imaging: ImagingParams,

    pub convergence: ConvergencePolicy,
}

/// Why the loop stopped before finishing its schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopReason {
    /// A round degraded the image beyond tolerance and was discarded.
    Regression,

    /// An amplitude round degraded the image and was discarded.
    AmpRegression,

    /// The operator (approval gate) rejected a round.
    OperatorVeto,
}

/// Terminal state of a self-cal run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SelfcalOutcome {
    /// The schedule completed, or improvement plateaued and any amplitude
    /// round was taken.
    Converged,

    Stopped(StopReason),
}

/// The per-round record: what an operator (or a test) inspects.
#[derive(Debug, Clone, Serialize)]
pub struct RoundRecord {
    pub index: usize,
    pub stage: String,
    pub mode: CalMode,
    pub solint: String,
    pub combine_spws: bool,
    pub combine_scans: bool,
    pub table_name: String,
    pub dataset_in: String,
    pub dataset_out: Option<String>,
    pub pre_stats: ImageStats,
    pub post_stats: Option<ImageStats>,
    pub flagged_fraction: f64,
    pub extra_flag_entries: usize,
    pub accepted: bool,
    pub reason: String,
}

/// The result of a self-cal run: the best dataset, the accepted tables (in
/// application order, for re-application to full-resolution data), the round
/// history and the terminal state.
#[derive(Debug)]
pub struct SelfcalResult {
    pub dataset: VisDataset,
    pub tables: Vec<GainTable>,
    pub rounds: Vec<RoundRecord>,
    pub outcome: SelfcalOutcome,
}

/// The loop itself. The imager and solver are injected; the flagging policy
/// turns the human "look at the plots, flag that antenna" step into a
/// swappable strategy, and the approval gate is the explicit version of the
/// operator pausing between rounds (auto-continue by default).
pub struct SelfcalLoop<'a> {
    pub imager: &'a dyn SynthesisImager,
    pub solver: &'a dyn GainSolver,
    pub flag_policy: &'a dyn FlagPolicy,
    pub gate: ApprovalGate<'a>,
}

impl<'a> SelfcalLoop<'a> {
    pub fn new(imager: &'a dyn SynthesisImager, solver: &'a dyn GainSolver) -> SelfcalLoop<'a> {
        SelfcalLoop {
            imager,
            solver,
            flag_policy: &NoExtraFlags,
            gate: ApprovalGate::Auto,
        }
    }

    /// Run the schedule over a dataset.
    pub fn run(
        &self,
        ctx: &mut PipelineContext,
        mut ds: VisDataset,
        params: &SelfcalParams,
    ) -> Result<SelfcalResult, SelfcalError> {
        validate_schedule(&params.schedule)?;

        let mut rounds: Vec<RoundRecord> = vec![];
        let mut tables: Vec<GainTable> = vec![];
        let mut last_rms: Option<f64> = None;
        let mut outcome = SelfcalOutcome::Converged;
        let mut entries = params.schedule.iter().enumerate().peekable();

        while let Some((index, entry)) = entries.next() {
            let mut round = self.run_round(ctx, &ds, params, index, entry, last_rms)?;
            let improvement = round
                .post_stats
                .map(|post| post.peak_snr / round.pre_stats.peak_snr - 1.0);
            info!(
                "{}: round {index} ({} {}): peak SNR {:.1} -> {}, flagged {:.1}%: {}",
                params.name,
                entry.mode,
                entry.solint,
                round.pre_stats.peak_snr,
                round
                    .post_stats
                    .map_or_else(|| "n/a".to_string(), |p| format!("{:.1}", p.peak_snr)),
                round.flagged_fraction * 100.0,
                round.reason
            );

            let record = round.record();
            rounds.push(record.clone());
            ctx.round_records.push(record);

            if round.accepted {
                // Adopt the corrected dataset; the next round must solve
                // against it.
                ds = round.applied.take().expect("accepted rounds carry a dataset");
                tables.push(round.table.take().expect("accepted rounds carry a table"));
                ctx.checkpoint_dataset(&ds)?;
                last_rms = round.post_stats.map(|p| p.rms_jy);

                match entry.mode {
                    CalMode::AmpPhase => {
                        // One amplitude round is the end of the schedule.
                        break;
                    }
                    CalMode::Phase => {
                        let plateaued = improvement
                            .is_some_and(|i| i < params.convergence.min_improvement);
                        if plateaued {
                            info!(
                                "{}: peak-SNR improvement {:.2}% is below {:.2}%; stopping the interval shortening",
                                params.name,
                                improvement.unwrap_or(0.0) * 100.0,
                                params.convergence.min_improvement * 100.0
                            );
                            skip_to_amp(&mut entries);
                        }
                    }
                }
            } else {
                // Discard the round; ds is unchanged.
                match round.failure {
                    RoundFailure::TooManyFlagged => {
                        // The interval is not statistically supportable;
                        // treat like a plateau and try the amplitude round.
                        warn!(
                            "{}: round {index} flagged {:.0}% of solutions; the solution interval is not supportable",
                            params.name,
                            round.flagged_fraction * 100.0
                        );
                        skip_to_amp(&mut entries);
                    }
                    RoundFailure::Regression => {
                        outcome = SelfcalOutcome::Stopped(match entry.mode {
                            CalMode::Phase => StopReason::Regression,
                            CalMode::AmpPhase => StopReason::AmpRegression,
                        });
                        break;
                    }
                    RoundFailure::Veto => {
                        outcome = SelfcalOutcome::Stopped(StopReason::OperatorVeto);
                        break;
                    }
                    RoundFailure::None => unreachable!("rejected rounds carry a failure"),
                }
            }
        }

        info!("{}: self-cal finished: {:?}", params.name, outcome);
        Ok(SelfcalResult {
            dataset: ds,
            tables,
            rounds,
            outcome,
        })
    }

    fn run_round(
        &self,
        ctx: &mut PipelineContext,
        ds: &VisDataset,
        params: &SelfcalParams,
        index: usize,
        entry: &ScheduleEntry,
        last_rms: Option<f64>,
    ) -> Result<Round, SelfcalError> {
        let mut imaging = params.imaging.clone();
        if let Some(rms) = last_rms {
            imaging.threshold_jy = params.threshold_sigma * rms;
        }

        // IMAGED: image the current best data with the fixed mask. This
        // attaches the model the solver needs.
        let mut pre_ds = ds.clone();
        let pre = self.imager.image(&mut pre_ds, &imaging)?;

        // SOLVED: a strictly fresh table against this round's input.
        let table_name = format!("{}.round{}.{}", params.name, index, entry.mode);
        let solve_params = SolveParams {
            table_name: table_name.clone(),
            mode: entry.mode,
            solint: entry.solint,
            combine: entry.combine,
            refants: params.refants.clone(),
            min_snr: params.min_snr,
            min_baselines_per_antenna: params.min_baselines_per_antenna,
            solnorm: params.solnorm && entry.mode == CalMode::AmpPhase,
            max_iterations: crate::constants::DEFAULT_MAX_SOLVER_ITERATIONS,
            stop_threshold: crate::constants::DEFAULT_SOLVER_STOP_THRESHOLD,
            min_threshold: crate::constants::DEFAULT_SOLVER_MIN_THRESHOLD,
        };
        let mut table = self.solver.solve(&pre_ds, &solve_params)?;

        // Round lineage: the table must come from this round's input data.
        if table.solved_from != ds.name {
            return Err(SelfcalError::BrokenLineage {
                table: table.name.clone(),
                solved_from: table.solved_from.clone(),
                expected: ds.name.clone(),
            });
        }

        // FLAGGED: the policy's extra flags on top of the solver's SNR
        // gating.
        let extra = self.flag_policy.extra_flags(&table);
        let mut extra_flagged = 0;
        for entry in &extra {
            extra_flagged += table.apply_flag(entry);
        }
        if !extra.is_empty() {
            info!(
                "{}: flagging policy added {} entries ({} solutions)",
                table_name,
                extra.len(),
                extra_flagged
            );
        }
        let flagged_fraction = table.flagged_fraction();
        ctx.checkpoint_table(&table)?;

        let mut round = Round {
            index,
            entry: *entry,
            table_name,
            dataset_in: ds.name.clone(),
            pre_stats: pre.stats,
            post_stats: None,
            dataset_out: None,
            applied: None,
            table: None,
            flagged_fraction,
            extra_flag_entries: extra.len(),
            accepted: false,
            failure: RoundFailure::None,
            reason: String::new(),
        };

        if flagged_fraction > params.convergence.max_flagged_fraction {
            round.failure = RoundFailure::TooManyFlagged;
            round.reason = format!(
                "rejected: {:.0}% of solutions flagged (limit {:.0}%)",
                flagged_fraction * 100.0,
                params.convergence.max_flagged_fraction * 100.0
            );
            return Ok(round);
        }

        // APPLIED: copy-out to a new dataset; the spw map is rebuilt for
        // this dataset every time, never cached.
        let out_name = format!("{}.round{}", params.name, index);
        let applied = apply_gains(
            &pre_ds,
            &table,
            &ApplyParams {
                out_name: out_name.clone(),
                spw_map: build_spw_map(&pre_ds, &table),
                interp: params.interp,
                calwt: params.calwt,
                apply_mode: params.apply_mode,
            },
        )?;

        // REIMAGED: same mask, same threshold, for a like-for-like
        // comparison.
        let mut post_ds = applied;
        let post = self.imager.image(&mut post_ds, &imaging)?;
        round.post_stats = Some(post.stats);

        // EVALUATED. Flux stability is only demanded of amplitude rounds:
        // phase rounds recovering coherence legitimately *raise* the flux in
        // the mask, while an amplitude solve that moves it is rescaling the
        // source.
        let snr_ok = post.stats.peak_snr
            >= pre.stats.peak_snr * (1.0 - params.convergence.regression_tolerance);
        let flux_ok = entry.mode == CalMode::Phase
            || (post.stats.flux_in_mask_jy - pre.stats.flux_in_mask_jy).abs()
                <= params.convergence.max_flux_drift * pre.stats.flux_in_mask_jy.abs().max(1e-12);

        if !snr_ok {
            round.failure = RoundFailure::Regression;
            round.reason = format!(
                "rejected: peak SNR regressed {:.1} -> {:.1}",
                pre.stats.peak_snr, post.stats.peak_snr
            );
            return Ok(round);
        }
        if !flux_ok {
            round.failure = RoundFailure::Regression;
            round.reason = format!(
                "rejected: flux in mask drifted implausibly {:.3} -> {:.3} Jy",
                pre.stats.flux_in_mask_jy, post.stats.flux_in_mask_jy
            );
            return Ok(round);
        }

        round.accepted = true;
        round.dataset_out = Some(out_name);
        round.applied = Some(post_ds);
        round.table = Some(table);
        round.reason = "accepted".to_string();

        // The approval gate: a human in interactive use, auto-continue
        // otherwise.
        if !self.gate.approve(&round.record()) {
            round.accepted = false;
            round.applied = None;
            round.table = None;
            round.dataset_out = None;
            round.failure = RoundFailure::Veto;
            round.reason = "rejected by operator".to_string();
        }
        Ok(round)
    }
}

/// Skip forward so the next schedule entry taken is the first amplitude one
/// (if any remain).
fn skip_to_amp<'s, I: Iterator<Item = (usize, &'s ScheduleEntry)>>(
    entries: &mut std::iter::Peekable<I>,
) {
    while let Some((_, next)) = entries.peek() {
        if next.mode == CalMode::AmpPhase {
            break;
        }
        entries.next();
    }
}

/// Phase-before-amplitude is a correctness invariant of the procedure, not a
/// preference; reject schedules that violate it.
fn validate_schedule(schedule: &Vec1<ScheduleEntry>) -> Result<(), SelfcalError> {
    let mut seen_amp = false;
    let mut amp_count = 0;
    for entry in schedule {
        match entry.mode {
            CalMode::AmpPhase => {
                seen_amp = true;
                amp_count += 1;
            }
            CalMode::Phase if seen_amp => {
                return Err(SelfcalError::PhaseAfterAmplitude);
            }
            CalMode::Phase => (),
        }
    }
    if amp_count > 1 {
        return Err(SelfcalError::MultipleAmplitudeRounds { count: amp_count });
    }
    Ok(())
}

/// Internal working state for one round; flattens into a [`RoundRecord`].
struct Round {
    index: usize,
    entry: ScheduleEntry,
    table_name: String,
    dataset_in: String,
    pre_stats: ImageStats,
    post_stats: Option<ImageStats>,
    dataset_out: Option<String>,
    applied: Option<VisDataset>,
    table: Option<GainTable>,
    flagged_fraction: f64,
    extra_flag_entries: usize,
    accepted: bool,
    failure: RoundFailure,
    reason: String,
}

#[derive(PartialEq, Eq, Clone, Copy)]
enum RoundFailure {
    None,
    TooManyFlagged,
    Regression,
    Veto,
}

impl Round {
    fn record(&self) -> RoundRecord {
        RoundRecord {
            index: self.index,
            stage: "selfcal".to_string(),
            mode: self.entry.mode,
            solint: self.entry.solint.to_string(),
            combine_spws: self.entry.combine.spws,
            combine_scans: self.entry.combine.scans,
            table_name: self.table_name.clone(),
            dataset_in: self.dataset_in.clone(),
            dataset_out: self.dataset_out.clone(),
            pre_stats: self.pre_stats,
            post_stats: self.post_stats,
            flagged_fraction: self.flagged_fraction,
            extra_flag_entries: self.extra_flag_entries,
            accepted: self.accepted,
            reason: self.reason.clone(),
        }
    }

}
