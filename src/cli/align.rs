// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The `align` subcommand.

use std::path::PathBuf;

use clap::Parser;
use log::info;
use vec1::Vec1;

use super::AlmaSelfcalError;
use crate::align::{align_datasets, AlignParams};
use crate::obs::io::{read_dataset, write_dataset};
use crate::unit_parsing::parse_angle;

#[derive(Debug, Parser)]
pub(super) struct AlignCliArgs {
    /// The reference dataset checkpoint.
    #[clap(name = "REFERENCE", parse(from_os_str))]
    reference: PathBuf,

    /// The dataset checkpoints to align to the reference.
    #[clap(name = "DATASETS", parse(from_os_str), required = true)]
    datasets: Vec<PathBuf>,

    /// Grid sizes to fit the offset at; the estimate is resolution-sensitive
    /// and every resolution is reported.
    #[clap(long, multiple_values(true), default_values = &["256", "512", "1024"])]
    npix: Vec<usize>,

    /// The image-domain cell size of the offset grids, e.g. "8mas".
    #[clap(long, default_value = "8mas")]
    cell: String,

    /// The representative spw to compare on.
    #[clap(long, default_value = "0")]
    spw: usize,

    /// Where to write the shifted datasets.
    #[clap(short, long, parse(from_os_str), default_value = ".")]
    outdir: PathBuf,
}

pub(super) fn run(args: AlignCliArgs, dry_run: bool) -> Result<(), AlmaSelfcalError> {
    let reference = read_dataset(&args.reference)?;
    let others: Vec<crate::obs::VisDataset> = args
        .datasets
        .iter()
        .map(read_dataset)
        .collect::<Result<_, _>>()?;
    let other_refs: Vec<&crate::obs::VisDataset> = others.iter().collect();

    let (number, format) = parse_angle(&args.cell)?;
    let params = AlignParams {
        npix_list: Vec1::try_from_vec(args.npix.clone()).expect("clap enforces at least one"),
        cell_rad: format.to_radians(number),
        spw: args.spw,
    };

    if dry_run {
        info!("Dry run requested; stopping.");
        return Ok(());
    }

    let (aligned, reports) = align_datasets(&reference, &other_refs, &params)?;
    for report in &reports {
        info!(
            "{}: corrected by ({:+.3}, {:+.3}) mas over {} resolutions",
            report.dataset,
            report.chosen_dra_mas,
            report.chosen_ddec_mas,
            report.fits.len()
        );
    }
    std::fs::create_dir_all(&args.outdir)?;
    for ds in &aligned {
        let path = args.outdir.join(format!("{}.vis", ds.name));
        write_dataset(ds, &path)?;
        info!("wrote {}", path.display());
    }
    Ok(())
}
