// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The `solutions-plot` subcommand.

use std::path::PathBuf;

use clap::Parser;
use log::info;

use super::AlmaSelfcalError;
use crate::solutions::{io::read_table, plotting::plot_table};

#[derive(Debug, Parser)]
pub(super) struct SolutionsPlotArgs {
    /// The gain table to plot.
    #[clap(name = "TABLE", parse(from_os_str))]
    table: PathBuf,

    /// Output filename stem; defaults to the table path without its
    /// extension.
    #[clap(short, long, parse(from_os_str))]
    output_stem: Option<PathBuf>,
}

pub(super) fn run(args: SolutionsPlotArgs) -> Result<(), AlmaSelfcalError> {
    let table = read_table(&args.table)?;
    let stem = args.output_stem.unwrap_or_else(|| args.table.clone());
    let files = plot_table(&table, stem)?;
    for f in files {
        info!("wrote {}", f.display());
    }
    Ok(())
}
