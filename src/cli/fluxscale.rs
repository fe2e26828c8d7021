// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The `flux-scale` subcommand.

use std::path::PathBuf;

use clap::Parser;
use log::info;

use super::AlmaSelfcalError;
use crate::fluxscale::{
    estimate_flux_scale, rescale_decision, rescale_flux, DiskGeometry, FluxScaleParams,
    RescaleDecision,
};
use crate::obs::io::{read_dataset, write_dataset};

#[derive(Debug, Parser)]
pub(super) struct FluxScaleCliArgs {
    /// The reference dataset checkpoint.
    #[clap(name = "REFERENCE", parse(from_os_str))]
    reference: PathBuf,

    /// The dataset checkpoint to compare against the reference.
    #[clap(name = "COMPARISON", parse(from_os_str))]
    comparison: PathBuf,

    /// Disk inclination [degrees].
    #[clap(long)]
    incl: f64,

    /// Disk position angle, east of north [degrees].
    #[clap(long)]
    pa: f64,

    /// Number of deprojected-baseline bins.
    #[clap(long, default_value = "10")]
    nbins: usize,

    /// Apply the rescale decision and write the corrected dataset here.
    #[clap(long, parse(from_os_str))]
    apply_to: Option<PathBuf>,

    /// Write a ratio-vs-baseline diagnostic plot here.
    #[cfg(feature = "plotting")]
    #[clap(long, parse(from_os_str))]
    plot: Option<PathBuf>,
}

pub(super) fn run(args: FluxScaleCliArgs) -> Result<(), AlmaSelfcalError> {
    let reference = read_dataset(&args.reference)?;
    let comparison = read_dataset(&args.comparison)?;
    let geometry = DiskGeometry {
        incl_deg: args.incl,
        pa_deg: args.pa,
    };
    let params = FluxScaleParams {
        nbins: args.nbins,
        ..Default::default()
    };

    let estimate = estimate_flux_scale(&reference, &comparison, &geometry, &params)?;
    info!(
        "{} / {}: ratio {:.4} +/- {:.4}",
        estimate.comparison, estimate.reference, estimate.ratio, estimate.ratio_err
    );
    info!(
        "slope {:+.3e} per klambda ({:.1} sigma), overlap {:.0}%",
        estimate.slope_per_klambda,
        estimate.slope_significance(),
        estimate.overlap_fraction * 100.0
    );
    for bin in &estimate.bins {
        info!(
            "  {:8.1} klambda: {:.4} +/- {:.4}",
            bin.rdep_klambda, bin.ratio, bin.err
        );
    }

    #[cfg(feature = "plotting")]
    if let Some(plot) = &args.plot {
        crate::fluxscale::plotting::plot_estimate(&estimate, plot)?;
        info!("wrote {}", plot.display());
    }

    let decision = rescale_decision(&estimate, &params);
    info!("decision: {decision:?}");
    if let Some(out) = args.apply_to {
        match decision {
            RescaleDecision::Rescale { factor } => {
                let name = out
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("rescaled")
                    .to_string();
                let rescaled = rescale_flux(&comparison, factor, &name)?;
                write_dataset(&rescaled, &out)?;
                info!("wrote {}", out.display());
            }
            RescaleDecision::NoChange => info!("no rescale needed; nothing written"),
            RescaleDecision::DeferDecoherent => {
                info!("decoherence signature; rescale deferred, nothing written")
            }
        }
    }
    Ok(())
}
