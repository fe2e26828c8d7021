// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The `simulate` subcommand: synthetic EBs for testing and demos.

use std::path::PathBuf;

use clap::Parser;
use log::info;

use super::AlmaSelfcalError;
use crate::obs::io::write_dataset;
use crate::obs::SpwIntent;
use crate::simulate::{simulate_eb, DiskModel, SimParams, SpwSetup};

#[derive(Debug, Parser)]
pub(super) struct SimulateCliArgs {
    /// The name (and id) of the synthetic EB.
    #[clap(name = "NAME")]
    name: String,

    /// Where to write the dataset checkpoint.
    #[clap(short, long, parse(from_os_str))]
    output: PathBuf,

    #[clap(long, default_value = "12")]
    num_antennas: usize,

    /// Rough array diameter [m]; ~300 mimics a short-baseline
    /// configuration, ~10000 a long-baseline one.
    #[clap(long, default_value = "300.0")]
    array_extent: f64,

    #[clap(long, default_value = "120")]
    num_times: usize,

    #[clap(long, default_value = "6.0")]
    integration: f64,

    #[clap(long, default_value = "4")]
    num_scans: usize,

    /// Start time as GPST seconds; stagger EBs so they can be concatenated.
    #[clap(long, default_value = "1300000000.0")]
    start_gpst: f64,

    /// Point-source flux of the disk core [Jy].
    #[clap(long, default_value = "0.5")]
    core_flux: f64,

    /// Flux of the Gaussian envelope [Jy]; 0 for a bare point source.
    #[clap(long, default_value = "0.8")]
    envelope_flux: f64,

    /// FWHM of the Gaussian envelope [mas].
    #[clap(long, default_value = "800.0")]
    envelope_fwhm: f64,

    /// Per-antenna atmospheric phase noise [degrees].
    #[clap(long, default_value = "25.0")]
    phase_noise: f64,

    /// Slow per-antenna amplitude drift (fractional standard deviation).
    #[clap(long, default_value = "0.0")]
    amp_drift: f64,

    /// Injected flux-scale error (multiplies all amplitudes).
    #[clap(long, default_value = "1.0")]
    flux_scale: f64,

    /// Injected pointing offset [mas], as "dRA,dDec".
    #[clap(long, allow_hyphen_values = true)]
    pointing_offset: Option<String>,

    /// Decoherence taper scale [klambda]; omit for no decoherence.
    #[clap(long)]
    decoherence_scale: Option<f64>,

    /// Per-visibility thermal noise [Jy].
    #[clap(long, default_value = "0.01")]
    noise: f64,

    /// Also include a 12CO-covering line spw.
    #[clap(long)]
    with_line_spw: bool,

    #[clap(long, default_value = "2666")]
    seed: u64,
}

pub(super) fn run(args: SimulateCliArgs) -> Result<(), AlmaSelfcalError> {
    let mut params = SimParams::new(&args.name);
    params.num_antennas = args.num_antennas;
    params.array_extent_m = args.array_extent;
    params.num_times = args.num_times;
    params.integration_s = args.integration;
    params.num_scans = args.num_scans;
    params.start_gpst_s = args.start_gpst;
    params.phase_noise_deg = args.phase_noise;
    params.amp_drift_std = args.amp_drift;
    params.flux_scale = args.flux_scale;
    params.decoherence_scale_klambda = args.decoherence_scale;
    params.noise_jy = args.noise;
    params.seed = args.seed;
    params.spws = vec![
        SpwSetup::band6_continuum(128),
        SpwSetup::band6_continuum(128),
    ];
    if args.with_line_spw {
        params.spws.push(SpwSetup {
            first_freq_hz: 230.508e9,
            chan_width_hz: 488e3,
            num_chans: 128,
            intent: SpwIntent::Line,
        });
    }
    if let Some(offset) = &args.pointing_offset {
        let mut parts = offset.split(',').map(|p| p.trim().parse::<f64>());
        match (parts.next(), parts.next()) {
            (Some(Ok(dra)), Some(Ok(ddec))) => params.pointing_offset_mas = (dra, ddec),
            _ => {
                return Err(AlmaSelfcalError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("could not parse pointing offset '{offset}' as 'dRA,dDec' in mas"),
                )))
            }
        }
    }

    let model = if args.envelope_flux > 0.0 {
        DiskModel::compact_disk(args.core_flux, args.envelope_flux, args.envelope_fwhm)
    } else {
        DiskModel::point(args.core_flux)
    };
    let ds = simulate_eb(&params, &model)?;
    write_dataset(&ds, &args.output)?;
    info!(
        "wrote {} ({} antennas, {} timesteps, {} spws)",
        args.output.display(),
        ds.num_antennas(),
        ds.num_timesteps(),
        ds.spws.len()
    );
    Ok(())
}
