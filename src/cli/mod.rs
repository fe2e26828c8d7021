// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Command-line interface code. More specific options for subcommands are
//! contained in modules.
//!
//! Only 3 things should be public in this module: `AlmaSelfcal`,
//! `AlmaSelfcal::run`, and `AlmaSelfcalError`.

mod align;
mod contsub;
mod error;
mod fluxscale;
mod run;
mod simulate;
#[cfg(feature = "plotting")]
mod solutions_plot;

pub use error::AlmaSelfcalError;

use clap::{AppSettings, Args, Parser, Subcommand};
use log::info;

use crate::PROGRESS_BARS;

// Add build-time information from the "built" crate.
include!(concat!(env!("OUT_DIR"), "/built.rs"));

#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    about = r#"Self-calibration and flux-reconciliation pipeline for multi-configuration ALMA
observations of protoplanetary disks."#
)]
#[clap(global_setting(AppSettings::DeriveDisplayOrder))]
#[clap(disable_help_subcommand = true)]
#[clap(infer_subcommands = true)]
#[clap(propagate_version = true)]
#[clap(infer_long_args = true)]
pub struct AlmaSelfcal {
    #[clap(flatten)]
    global_opts: GlobalArgs,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct GlobalArgs {
    /// Don't draw progress bars.
    #[clap(long)]
    #[clap(global = true)]
    no_progress_bars: bool,

    /// The verbosity of the program. Increase by specifying multiple times
    /// (e.g. -vv). The default is to print only high-level information.
    #[clap(short, long, parse(from_occurrences))]
    #[clap(global = true)]
    verbosity: u8,

    /// Only verify that arguments were correctly ingested and print out
    /// high-level information.
    #[clap(long)]
    #[clap(global = true)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
#[clap(arg_required_else_help = true)]
enum Command {
    #[clap(about = r#"Run the full pipeline described by a TOML configuration file:
alignment, iterative self-calibration, flux reconciliation, merging,
continuum subtraction and line extraction."#)]
    Run(run::RunArgs),

    #[clap(about = "Measure and correct phase-centre offsets between datasets.")]
    Align(align::AlignCliArgs),

    #[clap(about = r#"Compare the flux scales of two datasets over their overlapping
deprojected baselines and report the rescale decision."#)]
    FluxScale(fluxscale::FluxScaleCliArgs),

    #[clap(about = "Fit and subtract a per-baseline continuum, then split out transitions.")]
    Contsub(contsub::ContsubCliArgs),

    #[clap(about = "Manufacture a synthetic execution block for testing.")]
    Simulate(simulate::SimulateCliArgs),

    #[cfg(feature = "plotting")]
    #[clap(alias = "plot-solutions")]
    #[clap(about = r#"Plot a gain table. Only available if compiled with the "plotting" feature."#)]
    SolutionsPlot(solutions_plot::SolutionsPlotArgs),
}

impl AlmaSelfcal {
    pub fn run(self) -> Result<(), AlmaSelfcalError> {
        // Set up logging.
        let GlobalArgs {
            verbosity,
            dry_run,
            no_progress_bars,
        } = self.global_opts;
        setup_logging(verbosity).expect("Failed to initialise logging.");
        if no_progress_bars {
            PROGRESS_BARS.store(false, std::sync::atomic::Ordering::Relaxed);
        }

        let sub_command = match &self.command {
            Command::Run(_) => "run",
            Command::Align(_) => "align",
            Command::FluxScale(_) => "flux-scale",
            Command::Contsub(_) => "contsub",
            Command::Simulate(_) => "simulate",
            #[cfg(feature = "plotting")]
            Command::SolutionsPlot(_) => "solutions-plot",
        };
        info!("alma_selfcal {} {}", sub_command, env!("CARGO_PKG_VERSION"));
        display_build_info();

        match self.command {
            Command::Run(args) => run::run(args, dry_run)?,
            Command::Align(args) => align::run(args, dry_run)?,
            Command::FluxScale(args) => fluxscale::run(args)?,
            Command::Contsub(args) => contsub::run(args, dry_run)?,
            Command::Simulate(args) => simulate::run(args)?,
            #[cfg(feature = "plotting")]
            Command::SolutionsPlot(args) => solutions_plot::run(args)?,
        }

        info!("alma_selfcal {} complete.", sub_command);
        Ok(())
    }
}

/// Activate a logger. All log messages are put onto `stdout`. `env_logger`
/// automatically only uses colours and fancy symbols if we're on a tty (e.g.
/// a terminal); piped output will be formatted sensibly.
fn setup_logging(verbosity: u8) -> Result<(), log::SetLoggerError> {
    let mut builder = env_logger::Builder::from_default_env();
    builder.target(env_logger::Target::Stdout);
    builder.format_target(false);
    match verbosity {
        0 => builder.filter_level(log::LevelFilter::Info),
        1 => builder.filter_level(log::LevelFilter::Debug),
        _ => builder.filter_level(log::LevelFilter::Trace),
    };
    builder.try_init()?;
    Ok(())
}

/// Write info-level log lines of how this executable was compiled.
fn display_build_info() {
    match GIT_COMMIT_HASH {
        Some(hash) => {
            info!("Compiled on git commit hash: {hash}");
        }
        None => info!("<no git info>"),
    }
    if let Some(dirty) = GIT_DIRTY {
        if dirty {
            info!("         The local source tree was dirty");
        }
    }
    info!("            Compiled at: {BUILT_TIME_UTC}");
    info!("                   With: {RUSTC_VERSION}");
}
