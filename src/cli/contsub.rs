// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The `contsub` subcommand.

use std::path::PathBuf;

use clap::Parser;
use log::{info, warn};

use super::AlmaSelfcalError;
use crate::contsub::{
    derive_fitspw, extract_transition, subtract_continuum, ContsubError, ContsubParams,
};
use crate::obs::io::{read_dataset, write_dataset};

#[derive(Debug, Parser)]
pub(super) struct ContsubCliArgs {
    /// The calibrated, full-resolution dataset checkpoint.
    #[clap(name = "DATASET", parse(from_os_str))]
    dataset: PathBuf,

    /// Systemic velocity of the source [km/s], radio convention.
    #[clap(long)]
    vsys: f64,

    /// Velocity half-width excluded around each transition [km/s].
    #[clap(long, default_value = "15.0")]
    vel_halfwidth: f64,

    /// Polynomial order of the continuum fit (0-2).
    #[clap(long, default_value = "1")]
    fit_order: usize,

    /// Catalog keys of the transitions to protect and extract, e.g.
    /// "12CO_2-1".
    #[clap(long, multiple_values(true), required = true)]
    transitions: Vec<String>,

    /// Where to write the subtracted and extracted datasets.
    #[clap(short, long, parse(from_os_str), default_value = ".")]
    outdir: PathBuf,
}

pub(super) fn run(args: ContsubCliArgs, dry_run: bool) -> Result<(), AlmaSelfcalError> {
    let ds = read_dataset(&args.dataset)?;
    let params = ContsubParams {
        fit_order: args.fit_order,
        vsys_kms: args.vsys,
        vel_halfwidth_kms: args.vel_halfwidth,
        transitions: args.transitions.clone(),
    };

    let fitspw = derive_fitspw(&ds, &params)?;
    for entry in &fitspw {
        info!(
            "spw {}: {} line-free ranges, {} lines",
            entry.spw_id,
            entry.line_free.len(),
            entry.line_chans.len()
        );
    }
    if dry_run {
        info!("Dry run requested; stopping.");
        return Ok(());
    }

    std::fs::create_dir_all(&args.outdir)?;
    let subtracted = subtract_continuum(&ds, &fitspw, &params)?;
    let path = args.outdir.join(format!("{}.vis", subtracted.name));
    write_dataset(&subtracted, &path)?;
    info!("wrote {}", path.display());

    for transition in &args.transitions {
        match extract_transition(&subtracted, transition, &params) {
            Ok(line) => {
                let path = args.outdir.join(format!("{}.vis", line.name));
                write_dataset(&line, &path)?;
                info!("wrote {}", path.display());
            }
            Err(ContsubError::TransitionNotCovered { .. }) => {
                warn!("no spw covers {transition}; skipping");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
