// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Messages to report to the user.
//!
//! Grouped here so the high-level narrative of a run reads coherently
//! instead of being scattered through the code that happens to know the
//! numbers.

use itertools::Itertools;
use log::info;

use crate::config::PipelineConfig;
use crate::obs::VisDataset;
use crate::selfcal::RoundRecord;

pub(crate) fn report_config(config: &PipelineConfig) {
    info!("Target: {}", config.target.name);
    info!(
        "  phase centre: RA {:.5} deg, Dec {:.5} deg",
        config.target.phase_centre.ra.to_degrees(),
        config.target.phase_centre.dec.to_degrees()
    );
    info!(
        "  geometry: incl {:.1} deg, PA {:.1} deg, vsys {:.2} km/s",
        config.target.geometry.incl_deg, config.target.geometry.pa_deg, config.target.vsys_kms
    );
    info!("{} EBs:", config.ebs.len());
    for eb in &config.ebs {
        info!("  {} ({}) from {}", eb.id, eb.config, eb.path.display());
    }
    info!(
        "Self-cal schedule: {}",
        config
            .merge
            .combined_schedule
            .iter()
            .map(|e| format!("{} {}", e.mode, e.solint))
            .join(" -> ")
    );
    info!(
        "Refinement generations: {}; output to {}",
        config.merge.generations,
        config.output_dir.display()
    );
}

pub(crate) fn report_dataset(ds: &VisDataset) {
    info!(
        "{}: {} antennas, {} baselines, {} timesteps over {} scans",
        ds.name,
        ds.num_antennas(),
        ds.num_baselines(),
        ds.num_timesteps(),
        ds.scans.len()
    );
    for spw in &ds.spws {
        info!(
            "  spw {} ({}, {}): {:.4} GHz, {} x {:.1} kHz channels",
            spw.id,
            spw.source_eb,
            spw.intent,
            spw.centre_freq_hz() / 1e9,
            spw.num_chans,
            spw.chan_width_hz / 1e3
        );
    }
}

pub(crate) fn report_rounds(records: &[RoundRecord]) {
    info!("Self-cal round summary ({} rounds):", records.len());
    for r in records {
        info!(
            "  {} [{} {}]: SNR {:.1} -> {}, flagged {:.1}%, {}",
            r.table_name,
            r.mode,
            r.solint,
            r.pre_stats.peak_snr,
            r.post_stats
                .map_or_else(|| "n/a".to_string(), |p| format!("{:.1}", p.peak_snr)),
            r.flagged_fraction * 100.0,
            if r.accepted {
                "accepted"
            } else {
                r.reason.as_str()
            }
        );
    }
}
