// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Gain solving.
//!
//! The [`GainSolver`] trait is the pipeline's contract with the external
//! numerical solver; [`AntsolSolver`] is the in-crate reference
//! implementation, an alternating per-antenna least-squares ("antsol") with
//! even-iteration averaging to accelerate convergence. Solutions are gated
//! on a minimum SNR and a minimum number of baselines per antenna; failing
//! solutions are flagged, not fatal.

pub mod apply;
mod error;

pub use error::SolveError;

use std::str::FromStr;

use hifitime::Duration;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use itertools::Itertools;
use log::{debug, info, trace};
use marlu::{c32, c64};
use ndarray::prelude::*;
use vec1::Vec1;

use crate::obs::VisDataset;
use crate::solutions::{timeblocks_from_scans, CalMode, GainTable, SpwBlock, Timeblock};
use crate::unit_parsing::parse_time;

/// A solution interval. `Inf` and `Scan` both solve one solution per scan
/// (solutions never span a scan boundary); `Dur` subdivides scans.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Solint {
    Inf,
    Scan,
    Dur(Duration),
}

impl Solint {
    /// The sub-scan interval in seconds, if there is one.
    fn interval_s(self) -> Option<f64> {
        match self {
            Solint::Inf | Solint::Scan => None,
            Solint::Dur(d) => Some(d.to_seconds()),
        }
    }
}

impl FromStr for Solint {
    type Err = SolveError;

    fn from_str(s: &str) -> Result<Solint, SolveError> {
        match s.trim().to_lowercase().as_str() {
            "inf" => Ok(Solint::Inf),
            "scan" => Ok(Solint::Scan),
            other => {
                let (number, format) =
                    parse_time(other).map_err(|_| SolveError::BadSolint {
                        solint: s.to_string(),
                    })?;
                let seconds = format.to_seconds(number);
                if seconds <= 0.0 {
                    return Err(SolveError::BadSolint {
                        solint: s.to_string(),
                    });
                }
                Ok(Solint::Dur(Duration::from_seconds(seconds)))
            }
        }
    }
}

impl std::fmt::Display for Solint {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Solint::Inf => write!(f, "inf"),
            Solint::Scan => write!(f, "scan"),
            Solint::Dur(d) => write!(f, "{}s", d.to_seconds()),
        }
    }
}

/// Whether to combine data across scans and/or spws when solving. Combining
/// buys SNR at the cost of time/frequency resolution of the correction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CombinePolicy {
    pub scans: bool,
    pub spws: bool,
}

impl FromStr for CombinePolicy {
    type Err = SolveError;

    /// Parse e.g. "", "spw", "scan", "spw,scan".
    fn from_str(s: &str) -> Result<CombinePolicy, SolveError> {
        let mut combine = CombinePolicy::default();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match part.to_lowercase().as_str() {
                "spw" => combine.spws = true,
                "scan" => combine.scans = true,
                _ => {
                    return Err(SolveError::BadCombine {
                        combine: s.to_string(),
                    })
                }
            }
        }
        Ok(combine)
    }
}

/// Everything a gain solve needs beyond the dataset itself.
#[derive(Debug, Clone)]
pub struct SolveParams {
    /// The name the output table will carry.
    pub table_name: String,

    pub mode: CalMode,
    pub solint: Solint,
    pub combine: CombinePolicy,

    /// Session-resolved reference antenna labels (`name@station`), in order
    /// of preference. Must be re-derived whenever dataset membership
    /// changes.
    pub refants: Vec1<String>,

    /// Solutions below this SNR are flagged.
    pub min_snr: f64,

    /// Antennas with fewer unflagged baselines than this in a solution
    /// interval have their solution flagged.
    pub min_baselines_per_antenna: usize,

    /// Normalise amplitude solutions to a mean of one (amplitude mode only).
    pub solnorm: bool,

    pub max_iterations: usize,

    /// Convergence: iteration stops once every antenna's squared gain update
    /// falls below this.
    pub stop_threshold: f64,

    /// A block whose worst antenna precision is above this never converged.
    pub min_threshold: f64,
}

impl SolveParams {
    pub fn new(table_name: &str, mode: CalMode, solint: Solint, refants: Vec1<String>) -> Self {
        SolveParams {
            table_name: table_name.to_string(),
            mode,
            solint,
            combine: CombinePolicy::default(),
            refants,
            min_snr: crate::constants::DEFAULT_MIN_SOLUTION_SNR,
            min_baselines_per_antenna: crate::constants::DEFAULT_MIN_BASELINES_PER_ANTENNA,
            solnorm: false,
            max_iterations: crate::constants::DEFAULT_MAX_SOLVER_ITERATIONS,
            stop_threshold: crate::constants::DEFAULT_SOLVER_STOP_THRESHOLD,
            min_threshold: crate::constants::DEFAULT_SOLVER_MIN_THRESHOLD,
        }
    }
}

/// The external gain-solving contract: visibilities with a model attached in
/// and a fresh table of per-antenna corrections out.
pub trait GainSolver {
    fn solve(&self, ds: &VisDataset, params: &SolveParams) -> Result<GainTable, SolveError>;
}

/// Group a dataset's continuum spws into solve blocks.
pub fn make_spwblocks(ds: &VisDataset, combine_spws: bool) -> Vec<SpwBlock> {
    let continuum_spw_ids = ds.continuum_spw_ids();
    let block_of = |index: usize, spw_ids: Vec<usize>| {
        let mut source_ebs: Vec<String> = spw_ids
            .iter()
            .map(|&id| ds.spws[id].source_eb.clone())
            .collect();
        source_ebs.dedup();
        let centre_freq_hz = spw_ids
            .iter()
            .map(|&id| ds.spws[id].centre_freq_hz())
            .sum::<f64>()
            / spw_ids.len().max(1) as f64;
        SpwBlock {
            index,
            spw_ids,
            source_ebs,
            centre_freq_hz,
        }
    };
    if combine_spws {
        vec![block_of(0, continuum_spw_ids)]
    } else {
        continuum_spw_ids
            .iter()
            .enumerate()
            .map(|(index, &id)| block_of(index, vec![id]))
            .collect()
    }
}

/// Per-solve-block convergence diagnostics.
#[derive(Debug)]
struct BlockResult {
    num_iterations: usize,
    converged: bool,
    max_precision: f64,
    num_failed: usize,
}

/// The reference solver.
#[derive(Debug, Default)]
pub struct AntsolSolver;

impl GainSolver for AntsolSolver {
    fn solve(&self, ds: &VisDataset, params: &SolveParams) -> Result<GainTable, SolveError> {
        let continuum_spws = ds.continuum_spw_ids();
        if continuum_spws.is_empty() {
            return Err(SolveError::NoContinuumSpws {
                dataset: ds.name.clone(),
            });
        }
        for &spw in &continuum_spws {
            if ds.spw_data[spw].model.is_none() {
                return Err(SolveError::MissingModel {
                    dataset: ds.name.clone(),
                });
            }
        }

        // The reference antenna: the first preference present in this
        // dataset.
        let refant_index = params
            .refants
            .iter()
            .find_map(|label| {
                ds.antennas
                    .iter()
                    .position(|ant| ant.matches_label(label))
            })
            .ok_or_else(|| SolveError::NoRefant {
                dataset: ds.name.clone(),
                refants: params.refants.iter().join(", "),
            })?;

        let scans: Vec<std::ops::Range<usize>> = if params.combine.scans {
            vec![0..ds.num_timesteps()]
        } else {
            ds.scans.clone()
        };
        let timeblocks = timeblocks_from_scans(&ds.timestamps, &scans, params.solint.interval_s());
        let spwblocks = make_spwblocks(ds, params.combine.spws);

        let num_ants = ds.num_antennas();
        let dim = (timeblocks.len(), num_ants, spwblocks.len());
        let mut gains = Array3::from_elem(dim, c64::new(1.0, 0.0));
        let mut snrs = Array3::zeros(dim);

        debug!(
            "solving {}: mode {}, solint {}, {} timeblocks x {} spwblocks",
            params.table_name,
            params.mode,
            params.solint,
            timeblocks.len(),
            spwblocks.len()
        );
        let pb = make_solve_progress_bar(
            timeblocks.len() * spwblocks.len(),
            format!("Solving {}", params.table_name),
        );

        let mut num_flagged_low_snr = 0;
        let mut num_flagged_few_baselines = 0;
        for timeblock in &timeblocks {
            for spwblock in &spwblocks {
                let mut block_gains = gains
                    .slice_mut(s![timeblock.index, .., spwblock.index]);
                let mut block_snrs = snrs.slice_mut(s![timeblock.index, .., spwblock.index]);
                let result = solve_block(
                    ds,
                    timeblock,
                    spwblock,
                    params,
                    refant_index,
                    block_gains.view_mut(),
                    block_snrs.view_mut(),
                    &mut num_flagged_low_snr,
                    &mut num_flagged_few_baselines,
                );

                let status = if result.converged {
                    format!(
                        "timeblock {:>3} spwblock {}: converged ({:>2}): {:.3e}, {} failed",
                        timeblock.index,
                        spwblock.index,
                        result.num_iterations,
                        result.max_precision,
                        result.num_failed
                    )
                } else {
                    format!(
                        "timeblock {:>3} spwblock {}: failed    ({:>2}): {:.3e} > {:e}",
                        timeblock.index,
                        spwblock.index,
                        result.num_iterations,
                        result.max_precision,
                        params.min_threshold
                    )
                };
                trace!("{status}");
                pb.inc(1);
            }
        }
        pb.finish_and_clear();

        let table = GainTable {
            name: params.table_name.clone(),
            mode: params.mode,
            antennas: ds.antennas.clone(),
            timeblocks,
            spwblocks,
            gains,
            snrs,
            solved_from: ds.name.clone(),
            refant: Some(ds.antennas[refant_index].label()),
        };

        // The flagged-solution counts are the primary per-round diagnostic.
        let counts = table.flagged_counts();
        for (s, row) in counts.outer_iter().enumerate() {
            let per_time = row.iter().map(|c| c.to_string()).join(" ");
            info!(
                "{}: spwblock {s}: flagged solutions per timeblock: [{per_time}]",
                params.table_name
            );
        }
        info!(
            "{}: {}/{} solutions flagged ({} low SNR, {} too few baselines)",
            params.table_name,
            table.flagged_count(),
            table.num_solutions(),
            num_flagged_low_snr,
            num_flagged_few_baselines,
        );

        Ok(table)
    }
}

fn make_solve_progress_bar(len: usize, message: String) -> ProgressBar {
    ProgressBar::with_draw_target(
        Some(len as u64),
        if crate::PROGRESS_BARS.load(std::sync::atomic::Ordering::Relaxed) {
            ProgressDrawTarget::stdout()
        } else {
            ProgressDrawTarget::hidden()
        },
    )
    .with_style(
        ProgressStyle::default_bar()
            .template("{msg}: [{wide_bar:.blue}] {pos:3}/{len:3}")
            .expect("valid template")
            .progress_chars("=> "),
    )
    .with_position(0)
    .with_message(message)
}

/// Solve one (timeblock, spwblock) pair in place. Failed or gated antennas
/// get NaN gains.
#[allow(clippy::too_many_arguments)]
fn solve_block(
    ds: &VisDataset,
    timeblock: &Timeblock,
    spwblock: &SpwBlock,
    params: &SolveParams,
    refant_index: usize,
    mut gains: ArrayViewMut1<c64>,
    mut snrs: ArrayViewMut1<f64>,
    num_flagged_low_snr: &mut usize,
    num_flagged_few_baselines: &mut usize,
) -> BlockResult {
    let num_ants = gains.len();
    let mut g: Vec<c64> = vec![c64::new(1.0, 0.0); num_ants];
    let mut g_new: Vec<c64> = vec![c64::new(1.0, 0.0); num_ants];
    let mut precisions: Vec<f64> = vec![0.0; num_ants];
    let mut failed: Vec<bool> = vec![false; num_ants];

    // Accumulators reused across iterations.
    let mut top: Vec<c64> = vec![c64::new(0.0, 0.0); num_ants];
    let mut bot: Vec<f64> = vec![0.0; num_ants];

    let mut iteration = 0;
    while iteration < params.max_iterations {
        iteration += 1;
        top.iter_mut().for_each(|t| *t = c64::new(0.0, 0.0));
        bot.iter_mut().for_each(|b| *b = 0.0);

        accumulation_loop(ds, timeblock, spwblock, &g, &mut top, &mut bot);

        for a in 0..num_ants {
            if failed[a] {
                continue;
            }
            if bot[a] <= 0.0 {
                failed[a] = true;
                g[a] = c64::new(1.0, 0.0);
                g_new[a] = c64::new(1.0, 0.0);
                continue;
            }
            let div = top[a] / bot[a];
            if div.re.is_nan() || div.im.is_nan() {
                failed[a] = true;
            } else {
                g_new[a] = div;
            }
        }

        let num_failed = failed.iter().filter(|&&f| f).count();
        if num_ants - num_failed <= 2 {
            break;
        }

        // On every even iteration, test for convergence and set the new gain
        // solution as the average of the last two; this accelerates the
        // alternating updates.
        if iteration % 2 == 0 {
            for a in 0..num_ants {
                if failed[a] {
                    continue;
                }
                precisions[a] = (g_new[a] - g[a]).norm_sqr();
                g[a] = (g[a] + g_new[a]) * 0.5;
            }
            if precisions
                .iter()
                .zip(failed.iter())
                .filter(|(_, &f)| !f)
                .all(|(&p, _)| p < params.stop_threshold)
            {
                break;
            }
        } else {
            for a in 0..num_ants {
                if !failed[a] {
                    g[a] = g_new[a];
                }
            }
        }
    }

    let max_precision = precisions
        .iter()
        .zip(failed.iter())
        .filter(|(_, &f)| !f)
        .fold(0.0_f64, |acc, (&p, _)| acc.max(p));
    let num_failed = failed.iter().filter(|&&f| f).count();
    let converged = num_ants - num_failed > 2 && max_precision < params.min_threshold;

    if !converged {
        failed.iter_mut().for_each(|f| *f = true);
    }

    // Phase-only solutions keep unit magnitude.
    if params.mode == CalMode::Phase {
        for a in 0..num_ants {
            let norm = g[a].norm();
            if norm > 0.0 {
                g[a] /= norm;
            }
        }
    }

    // Reference all phases to the reference antenna (or, if it failed, to
    // the first healthy antenna).
    let reference = if failed[refant_index] {
        failed.iter().position(|&f| !f)
    } else {
        Some(refant_index)
    };
    if let Some(r) = reference {
        let ref_phase = c64::from_polar(1.0, -g[r].arg());
        for a in 0..num_ants {
            if !failed[a] {
                g[a] *= ref_phase;
            }
        }
    }

    // Normalise amplitudes if asked (amplitude mode only).
    if params.solnorm && params.mode == CalMode::AmpPhase {
        let (sum, count) = g
            .iter()
            .zip(failed.iter())
            .filter(|(_, &f)| !f)
            .fold((0.0, 0usize), |(s, c), (gn, _)| (s + gn.norm(), c + 1));
        if count > 0 && sum > 0.0 {
            let mean = sum / count as f64;
            for a in 0..num_ants {
                if !failed[a] {
                    g[a] /= mean;
                }
            }
        }
    }

    // SNR estimation and gating.
    let (snr_vec, baselines_per_ant) = estimate_snrs(ds, timeblock, spwblock, &g);
    for a in 0..num_ants {
        if failed[a] {
            gains[a] = c64::new(f64::NAN, f64::NAN);
            snrs[a] = 0.0;
            continue;
        }
        if baselines_per_ant[a] < params.min_baselines_per_antenna {
            gains[a] = c64::new(f64::NAN, f64::NAN);
            snrs[a] = snr_vec[a];
            *num_flagged_few_baselines += 1;
            continue;
        }
        if snr_vec[a] < params.min_snr {
            gains[a] = c64::new(f64::NAN, f64::NAN);
            snrs[a] = snr_vec[a];
            *num_flagged_low_snr += 1;
            continue;
        }
        gains[a] = g[a];
        snrs[a] = snr_vec[a];
    }

    BlockResult {
        num_iterations: iteration,
        converged,
        max_precision,
        num_failed,
    }
}

/// One pass of the alternating update: accumulate, for every antenna, the
/// weighted projection of the data onto the current model prediction.
///
/// With data D_ij ~ g_i conj(g_j) M_ij, the least-squares update for g_i is
/// sum(w D x*) / sum(w |x|^2) with x = conj(g_j) M_ij; antenna i is updated
/// from both baseline slots.
fn accumulation_loop(
    ds: &VisDataset,
    timeblock: &Timeblock,
    spwblock: &SpwBlock,
    g: &[c64],
    top: &mut [c64],
    bot: &mut [f64],
) {
    for &spw in &spwblock.spw_ids {
        let sd = &ds.spw_data[spw];
        let data = sd.best();
        let model = sd.model.as_ref().expect("model presence already checked");
        for t in timeblock.range.clone() {
            for (b, &(a1, a2)) in ds.baselines.iter().enumerate() {
                for c in 0..ds.spws[spw].num_chans {
                    if sd.flags[(t, b, c)] {
                        continue;
                    }
                    let w = sd.weights[(t, b, c)] as f64;
                    if w <= 0.0 {
                        continue;
                    }
                    let d: c64 = promote(data[(t, b, c)]);
                    let m: c64 = promote(model[(t, b, c)]);

                    // Antenna a1's slot: x = conj(g_j) M.
                    let x = g[a2].conj() * m;
                    top[a1] += d * x.conj() * w;
                    bot[a1] += x.norm_sqr() * w;

                    // Antenna a2's slot: conj(D) ~ g_j conj(g_i) conj(M).
                    let y = g[a1].conj() * m.conj();
                    top[a2] += d.conj() * y.conj() * w;
                    bot[a2] += y.norm_sqr() * w;
                }
            }
        }
    }
}

/// Per-antenna solution SNRs from the residual scatter, plus the number of
/// distinct unflagged baselines per antenna.
fn estimate_snrs(
    ds: &VisDataset,
    timeblock: &Timeblock,
    spwblock: &SpwBlock,
    g: &[c64],
) -> (Vec<f64>, Vec<usize>) {
    let num_ants = g.len();
    let mut resid_w = vec![0.0_f64; num_ants];
    let mut resid = vec![0.0_f64; num_ants];
    let mut signal = vec![0.0_f64; num_ants];
    let mut baseline_seen = vec![std::collections::HashSet::new(); num_ants];

    for &spw in &spwblock.spw_ids {
        let sd = &ds.spw_data[spw];
        let data = sd.best();
        let model = sd.model.as_ref().expect("model presence already checked");
        for t in timeblock.range.clone() {
            for (b, &(a1, a2)) in ds.baselines.iter().enumerate() {
                for c in 0..ds.spws[spw].num_chans {
                    if sd.flags[(t, b, c)] {
                        continue;
                    }
                    let w = sd.weights[(t, b, c)] as f64;
                    if w <= 0.0 {
                        continue;
                    }
                    let d: c64 = promote(data[(t, b, c)]);
                    let m: c64 = promote(model[(t, b, c)]);
                    let r = d - g[a1] * g[a2].conj() * m;
                    for (ant, other) in [(a1, a2), (a2, a1)] {
                        resid_w[ant] += w;
                        resid[ant] += w * r.norm_sqr();
                        signal[ant] += w * m.norm_sqr();
                        baseline_seen[ant].insert(other);
                    }
                }
            }
        }
    }

    let snrs = (0..num_ants)
        .map(|a| {
            if resid_w[a] <= 0.0 || signal[a] <= 0.0 {
                return 0.0;
            }
            // Residual variance per unit weight (real+imag parts).
            let s2 = resid[a] / (2.0 * resid_w[a]);
            if s2 <= 0.0 {
                return f64::INFINITY;
            }
            let sigma_g = (s2 / signal[a]).sqrt();
            g[a].norm() / sigma_g.max(1e-300)
        })
        .collect();
    let counts = baseline_seen.iter().map(|s| s.len()).collect();
    (snrs, counts)
}

#[inline]
fn promote(v: c32) -> c64 {
    c64::new(v.re as f64, v.im as f64)
}
