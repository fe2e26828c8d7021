// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The multi-dataset merge controller.
//!
//! Orchestrates the full sequence: per-EB self-cal (fast, tolerant of low
//! SNR) -> alignment -> per-configuration concatenation and self-cal ->
//! cross-configuration flux check and rescale -> full-array concatenation
//! and self-cal -> final per-EB flux check. The whole sequence is one
//! "refinement generation"; generation N+1 starts over from per-EB datasets
//! rescaled by generation N's flux measurements, because rescaling changes
//! the relative visibility weighting and can pull the combined solves to a
//! different (better) solution.
//!
//! Bookkeeping rules enforced here: reference antennas are re-resolved to
//! `name@station` labels every time dataset membership changes, and spw
//! mapping tables are rebuilt after every concatenation (stale maps are
//! asserted against at apply time).

mod error;
#[cfg(test)]
mod tests;

pub use error::MergeError;

use indexmap::IndexMap;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};
use vec1::Vec1;

use crate::align::{align_datasets, apply_offset, AlignParams};
use crate::context::PipelineContext;
use crate::fluxscale::{
    estimate_flux_scale, rescale_decision, rescale_flux, DiskGeometry, FluxScaleParams,
    RescaleDecision,
};
use crate::obs::{concat, DataColumn, VisDataset};
use crate::selfcal::{ScheduleEntry, SelfcalLoop, SelfcalOutcome, SelfcalParams};
use crate::solutions::GainTable;
use crate::solve::apply::{apply_gains, build_spw_map, ApplyParams};

/// Array configuration of an EB.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, EnumString, Serialize, Deserialize,
)]
pub enum ArrayConfig {
    #[strum(serialize = "SB")]
    #[serde(rename = "SB")]
    Short,

    #[strum(serialize = "LB")]
    #[serde(rename = "LB")]
    Long,
}

/// One execution block plus its configuration tag.
#[derive(Debug, Clone)]
pub struct EbInput {
    pub dataset: VisDataset,
    pub config: ArrayConfig,
}

/// Controller inputs.
#[derive(Debug, Clone)]
pub struct MergeParams {
    /// Output naming stem, usually the source name.
    pub target: String,

    pub geometry: DiskGeometry,
    pub align: AlignParams,

    /// Reference antennas by bare name, in preference order; resolved to
    /// session `name@station` labels against each dataset they're used on.
    pub refant_names: Vec1<String>,

    /// Schedule for the quick per-EB self-cal pass; `None` skips it.
    pub per_eb_schedule: Option<Vec1<ScheduleEntry>>,

    /// Schedule for the combined (per-configuration and full-array) passes.
    pub combined_schedule: Vec1<ScheduleEntry>,

    /// Channel-averaging width for the continuum working copies the solves
    /// run on; `None` solves at full channel resolution.
    pub channel_average_width: Option<usize>,

    /// Template for self-cal tunables; name/schedule/refants are filled in
    /// per stage.
    pub selfcal: SelfcalParams,

    pub fluxscale: FluxScaleParams,

    /// How many refinement generations to run (the reference procedure runs
    /// two).
    pub generations: usize,
}

/// What one generation measured and decided.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationOutcome {
    pub generation: usize,
    pub final_dataset: String,

    /// The flux scales applied to each EB going *into* this generation.
    pub input_scales: IndexMap<String, f64>,

    /// The flux scales recommended for the next generation.
    pub next_scales: IndexMap<String, f64>,

    pub selfcal_outcomes: Vec<(String, SelfcalOutcome)>,
}

/// The controller's product.
#[derive(Debug)]
pub struct MergeResult {
    /// The final full-array, self-calibrated continuum dataset.
    pub dataset: VisDataset,

    /// Per original EB: the aligned, rescaled, full-resolution dataset with
    /// the final calibration applied and folded into its data column. This
    /// is what continuum subtraction consumes.
    pub calibrated_ebs: Vec<VisDataset>,

    pub generations: Vec<GenerationOutcome>,
}

/// Resolve bare antenna-name preferences into this dataset's session labels.
/// Station identifiers are not stable across configurations, so this runs
/// against every dataset the labels will be used on.
pub fn resolve_refants(
    names: &Vec1<String>,
    ds: &VisDataset,
) -> Result<Vec1<String>, MergeError> {
    let labels: Vec<String> = names
        .iter()
        .flat_map(|name| {
            ds.antennas
                .iter()
                .filter(|ant| ant.matches_label(name))
                .map(|ant| ant.label())
        })
        .collect();
    Vec1::try_from_vec(labels).map_err(|_| MergeError::NoRefantCandidates {
        names: names.as_slice().join(", "),
        dataset: ds.name.clone(),
    })
}

pub struct MergeController<'a> {
    pub selfcal: SelfcalLoop<'a>,
}

impl MergeController<'_> {
    /// Run the full multi-generation pipeline.
    pub fn run(
        &self,
        ctx: &mut PipelineContext,
        ebs: &[EbInput],
        params: &MergeParams,
    ) -> Result<MergeResult, MergeError> {
        if ebs.is_empty() {
            return Err(MergeError::NoEbs);
        }

        let mut scales: IndexMap<String, f64> = ebs
            .iter()
            .map(|eb| (eb.dataset.name.clone(), 1.0))
            .collect();
        let mut outcomes = vec![];
        let mut last = None;
        for generation in 0..params.generations.max(1) {
            ctx.generation = generation;
            info!(
                "=== {}: refinement generation {} (input scales {:?}) ===",
                params.target, generation, scales
            );
            let (result, outcome) = self.run_generation(ctx, ebs, params, generation, &scales)?;
            scales = outcome.next_scales.clone();
            outcomes.push(outcome);
            last = Some(result);
        }
        let mut result = last.expect("at least one generation runs");
        result.generations = outcomes;
        Ok(result)
    }

    /// One full sequence: scale -> per-EB selfcal -> align -> per-config
    /// concat+selfcal -> cross-config flux check -> full concat+selfcal ->
    /// final flux check -> full-resolution application.
    fn run_generation(
        &self,
        ctx: &mut PipelineContext,
        ebs: &[EbInput],
        params: &MergeParams,
        generation: usize,
        scales: &IndexMap<String, f64>,
    ) -> Result<(MergeResult, GenerationOutcome), MergeError> {
        let mut selfcal_outcomes = vec![];
        // Per EB: the gain tables to replay onto the full-resolution data,
        // in application order.
        let mut tables_per_eb: IndexMap<String, Vec<GainTable>> = IndexMap::new();
        // Extra scalar factors picked up mid-generation (cross-config
        // rescale).
        let mut mid_scales: IndexMap<String, f64> = IndexMap::new();

        // 1. Scaled full-resolution inputs.
        let mut fullres: Vec<VisDataset> = vec![];
        for eb in ebs {
            let scale = scales.get(&eb.dataset.name).copied().unwrap_or(1.0);
            let name = format!("{}.g{generation}", eb.dataset.name);
            let ds = if (scale - 1.0).abs() > 1e-12 {
                rescale_flux(&eb.dataset, scale, &name)?
            } else {
                let mut ds = eb.dataset.clone();
                ds.name = name;
                ds
            };
            tables_per_eb.insert(ds.name.clone(), vec![]);
            fullres.push(ds);
        }

        // 2. Continuum working copies, optionally channel-averaged, then the
        // quick per-EB self-cal.
        let mut working: Vec<VisDataset> = vec![];
        for ds in &fullres {
            let mut work = match params.channel_average_width {
                Some(width) => ds.average_channels(&format!("{}.avg", ds.name), width)?,
                None => {
                    let mut w = ds.clone();
                    w.name = format!("{}.avg", ds.name);
                    w
                }
            };
            if let Some(schedule) = &params.per_eb_schedule {
                let sc_params = SelfcalParams {
                    name: format!("{}.percal", ds.name),
                    schedule: schedule.clone(),
                    refants: resolve_refants(&params.refant_names, &work)?,
                    ..params.selfcal.clone()
                };
                let result = self.selfcal.run(ctx, work, &sc_params)?;
                selfcal_outcomes.push((sc_params.name.clone(), result.outcome));
                tables_per_eb
                    .get_mut(&ds.name)
                    .expect("inserted above")
                    .extend(result.tables);
                work = split_best(&result.dataset, &format!("{}.percal", ds.name))?;
            }
            working.push(work);
        }

        // 3. Alignment: everything to the first short-baseline EB (or the
        // first EB when there is none). The offsets measured on the working
        // copies are replayed onto the full-resolution datasets.
        let ref_index = ebs
            .iter()
            .position(|eb| eb.config == ArrayConfig::Short)
            .unwrap_or(0);
        let others: Vec<&VisDataset> = working
            .iter()
            .enumerate()
            .filter(|&(i, _)| i != ref_index)
            .map(|(_, ds)| ds)
            .collect();
        let (mut aligned, reports) = align_datasets(&working[ref_index], &others, &params.align)?;
        // align_datasets returns [reference, others...]; restore EB order.
        let mut aligned_in_order: Vec<Option<VisDataset>> = vec![None; working.len()];
        aligned_in_order[ref_index] = Some(aligned.remove(0));
        let mut aligned_iter = aligned.into_iter();
        for i in 0..working.len() {
            if i != ref_index {
                aligned_in_order[i] = Some(aligned_iter.next().expect("one per other"));
            }
        }
        let working: Vec<VisDataset> = aligned_in_order
            .into_iter()
            .map(|ds| ds.expect("all filled"))
            .collect();
        for (i, ds) in fullres.iter_mut().enumerate() {
            let (dra, ddec) = if i == ref_index {
                (0.0, 0.0)
            } else {
                let report = &reports[if i < ref_index { i } else { i - 1 }];
                (report.chosen_dra_mas, report.chosen_ddec_mas)
            };
            *ds = apply_offset(ds, dra, ddec, &format!("{}.shifted", ds.name));
        }
        ctx.alignment_reports.extend(reports);

        // 4. Per-configuration concatenation and self-cal.
        let mut per_config: IndexMap<ArrayConfig, VisDataset> = IndexMap::new();
        for config in [ArrayConfig::Short, ArrayConfig::Long] {
            let members: Vec<&VisDataset> = working
                .iter()
                .zip(ebs.iter())
                .filter(|(_, eb)| eb.config == config)
                .map(|(ds, _)| ds)
                .collect();
            if members.is_empty() {
                continue;
            }
            let combined = concat(
                &members,
                &format!("{}_{config}_g{generation}", params.target),
            )?;
            ctx.checkpoint_dataset(&combined)?;
            let sc_params = SelfcalParams {
                name: combined.name.clone(),
                schedule: params.combined_schedule.clone(),
                refants: resolve_refants(&params.refant_names, &combined)?,
                ..params.selfcal.clone()
            };
            let result = self.selfcal.run(ctx, combined, &sc_params)?;
            selfcal_outcomes.push((sc_params.name.clone(), result.outcome));
            for (ds, eb) in fullres.iter().zip(ebs.iter()) {
                if eb.config == config {
                    let key = table_key(&ds.name);
                    tables_per_eb
                        .get_mut(&key)
                        .expect("inserted above")
                        .extend(result.tables.iter().cloned());
                }
            }
            per_config.insert(config, result.dataset);
        }

        // 5. Cross-configuration flux check. Rescaling only happens for a
        // flat ratio; a baseline-dependent trend is decoherence and wants
        // more self-cal, not a rescale.
        if let (Some(sb), Some(lb)) = (
            per_config.get(&ArrayConfig::Short),
            per_config.get(&ArrayConfig::Long),
        ) {
            let estimate = estimate_flux_scale(sb, lb, &params.geometry, &params.fluxscale)?;
            let decision = rescale_decision(&estimate, &params.fluxscale);
            info!(
                "{} vs {}: flux ratio {:.4}, slope {:.1} sigma -> {:?}",
                estimate.comparison,
                estimate.reference,
                estimate.ratio,
                estimate.slope_significance(),
                decision
            );
            ctx.flux_history.push(estimate);
            match decision {
                RescaleDecision::Rescale { factor } => {
                    let lb = per_config
                        .get_mut(&ArrayConfig::Long)
                        .expect("checked above");
                    *lb = rescale_flux(lb, factor, &format!("{}.rescaled", lb.name))?;
                    for eb in ebs.iter().filter(|eb| eb.config == ArrayConfig::Long) {
                        mid_scales.insert(format!("{}.g{generation}", eb.dataset.name), factor);
                    }
                }
                RescaleDecision::DeferDecoherent => {
                    warn!(
                        "long-baseline data show a baseline-dependent amplitude ratio (decoherence); deferring any flux rescale until after further self-calibration"
                    );
                }
                RescaleDecision::NoChange => (),
            }
        }

        // 6. Full-array concatenation and self-cal.
        let split_members: Vec<VisDataset> = per_config
            .values()
            .map(|ds| split_best(ds, &format!("{}.precat", ds.name)))
            .collect::<Result<_, _>>()?;
        let member_refs: Vec<&VisDataset> = split_members.iter().collect();
        let combined = concat(&member_refs, &format!("{}_all_g{generation}", params.target))?;
        ctx.checkpoint_dataset(&combined)?;
        let sc_params = SelfcalParams {
            name: combined.name.clone(),
            schedule: params.combined_schedule.clone(),
            refants: resolve_refants(&params.refant_names, &combined)?,
            ..params.selfcal.clone()
        };
        let result = self.selfcal.run(ctx, combined, &sc_params)?;
        selfcal_outcomes.push((sc_params.name.clone(), result.outcome));
        for tables in tables_per_eb.values_mut() {
            tables.extend(result.tables.iter().cloned());
        }
        let final_ds = result.dataset;

        // 7. Final flux cross-check of each EB against the combined result;
        // these ratios seed the next generation.
        let mut next_scales: IndexMap<String, f64> = IndexMap::new();
        for (eb, work) in ebs.iter().zip(working.iter()) {
            let scale_in = scales.get(&eb.dataset.name).copied().unwrap_or(1.0)
                * mid_scales.get(&table_key(&work.name)).copied().unwrap_or(1.0);
            match estimate_flux_scale(&final_ds, work, &params.geometry, &params.fluxscale) {
                Ok(estimate) => {
                    let decision = rescale_decision(&estimate, &params.fluxscale);
                    let next = match decision {
                        RescaleDecision::Rescale { factor } => scale_in * factor,
                        _ => scale_in,
                    };
                    info!(
                        "{}: flux ratio vs {} is {:.4} -> next-generation scale {:.4}",
                        work.name, final_ds.name, estimate.ratio, next
                    );
                    ctx.flux_history.push(estimate);
                    next_scales.insert(eb.dataset.name.clone(), next);
                }
                Err(e) => {
                    warn!("{}: final flux check skipped: {e}", work.name);
                    next_scales.insert(eb.dataset.name.clone(), scale_in);
                }
            }
        }

        // 8. Replay the accepted tables onto the aligned full-resolution
        // datasets: the final calibration applied to the line-bearing data.
        let mut calibrated_ebs = vec![];
        for ds in &fullres {
            let key = table_key(&ds.name);
            let mut current = match mid_scales.get(&key) {
                Some(&factor) => rescale_flux(ds, factor, &format!("{key}.mid"))?,
                None => ds.clone(),
            };
            for (i, table) in tables_per_eb
                .get(&key)
                .expect("inserted above")
                .iter()
                .enumerate()
            {
                current = apply_gains(
                    &current,
                    table,
                    &ApplyParams {
                        out_name: format!("{key}.fullres{i}"),
                        spw_map: build_spw_map(&current, table),
                        interp: params.selfcal.interp,
                        calwt: params.selfcal.calwt,
                        apply_mode: params.selfcal.apply_mode,
                    },
                )?;
            }
            let out = split_best(&current, &format!("{key}.cal"))?;
            ctx.checkpoint_dataset(&out)?;
            calibrated_ebs.push(out);
        }

        ctx.checkpoint_dataset(&final_ds)?;
        let outcome = GenerationOutcome {
            generation,
            final_dataset: final_ds.name.clone(),
            input_scales: scales.clone(),
            next_scales,
            selfcal_outcomes,
        };
        Ok((
            MergeResult {
                dataset: final_ds,
                calibrated_ebs,
                generations: vec![],
            },
            outcome,
        ))
    }
}

/// Fold any corrected column into a fresh data column.
fn split_best(ds: &VisDataset, name: &str) -> Result<VisDataset, crate::obs::SplitError> {
    let column = if ds.has_corrected() {
        DataColumn::Corrected
    } else {
        DataColumn::Data
    };
    ds.split(name, column)
}

/// The key used in the per-EB table map: the generation-scaled dataset name
/// before any alignment suffix.
fn table_key(name: &str) -> String {
    name.split(".shifted")
        .next()
        .unwrap_or(name)
        .split(".avg")
        .next()
        .unwrap_or(name)
        .split(".percal")
        .next()
        .unwrap_or(name)
        .to_string()
}
