// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The `run` subcommand: the full pipeline from a TOML configuration.

use std::path::PathBuf;

use clap::Parser;
use log::{info, warn};

use super::AlmaSelfcalError;
use crate::config;
use crate::context::PipelineContext;
use crate::contsub::{derive_fitspw, extract_transition, subtract_continuum, ContsubError};
use crate::imaging::GridImager;
use crate::merge::{EbInput, MergeController};
use crate::messages;
use crate::obs::io::read_dataset;
use crate::selfcal::SelfcalLoop;
use crate::solve::AntsolSolver;

#[derive(Debug, Parser)]
pub(super) struct RunArgs {
    /// Path to the pipeline TOML configuration file.
    #[clap(name = "CONFIG_FILE", parse(from_os_str))]
    config: PathBuf,
}

pub(super) fn run(args: RunArgs, dry_run: bool) -> Result<(), AlmaSelfcalError> {
    let config = config::load(&args.config)?;
    messages::report_config(&config);
    if dry_run {
        info!("Dry run requested; stopping.");
        return Ok(());
    }

    let mut ctx = PipelineContext::with_run_dir(&config.output_dir)?;

    // Ingest the EB checkpoints, renaming each to its configured id so
    // every downstream name is predictable.
    let mut ebs = vec![];
    for entry in &config.ebs {
        let mut dataset = read_dataset(&entry.path)?;
        dataset.name = entry.id.clone();
        messages::report_dataset(&dataset);
        ebs.push(EbInput {
            dataset,
            config: entry.config,
        });
    }

    // Alignment, self-calibration, flux reconciliation and merging.
    let controller = MergeController {
        selfcal: SelfcalLoop::new(&GridImager, &AntsolSolver),
    };
    let result = controller.run(&mut ctx, &ebs, &config.merge)?;
    messages::report_rounds(&ctx.round_records);

    // Continuum subtraction and per-transition extraction on the calibrated
    // full-resolution datasets.
    for ds in &result.calibrated_ebs {
        let fitspw = derive_fitspw(ds, &config.contsub)?;
        let subtracted = subtract_continuum(ds, &fitspw, &config.contsub)?;
        ctx.checkpoint_dataset(&subtracted)?;
        for transition in &config.contsub.transitions {
            match extract_transition(&subtracted, transition, &config.contsub) {
                Ok(line) => {
                    ctx.checkpoint_dataset(&line)?;
                    info!("extracted {} -> {}", transition, line.name);
                }
                Err(ContsubError::TransitionNotCovered { .. }) => {
                    warn!("{}: no spw covers {transition}; skipping", ds.name);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    ctx.write_report()?;
    Ok(())
}
