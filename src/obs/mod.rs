// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The visibility-dataset model.
//!
//! A [`VisDataset`] is the unit the pipeline operates on: one execution block
//! (EB), or a concatenation of EBs. Datasets are never mutated in place by a
//! pipeline stage; every stage reads a dataset and writes a *new* one
//! ([`VisDataset::split`], [`concat`]), so that every stage boundary is a
//! restartable checkpoint. The one sanctioned exception is the MODEL column,
//! which the synthesis imager attaches to an existing dataset as a side
//! channel.

mod antenna;
mod error;
pub mod io;
mod spw;
#[cfg(test)]
mod tests;

pub use antenna::Antenna;
pub use error::{ConcatError, SplitError};
pub use spw::{SpectralWindow, SpwIntent};

use std::ops::Range;

use hifitime::Epoch;
use itertools::Itertools;
use log::debug;
use marlu::{c32, RADec, UVW};
use ndarray::prelude::*;
use strum_macros::{Display, EnumIter, EnumString};
use vec1::Vec1;

use crate::constants::ARCSEC_TO_RAD;

/// The visibility columns a dataset can carry. `Data` is always present;
/// `Corrected` appears after applying calibration, `Model` after imaging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter, EnumString)]
pub enum DataColumn {
    #[strum(serialize = "data")]
    Data,

    #[strum(serialize = "corrected")]
    Corrected,

    #[strum(serialize = "model")]
    Model,
}

/// Per-spectral-window visibility arrays. All arrays have shape
/// (num_timesteps, num_baselines, num_chans).
#[derive(Debug, Clone)]
pub struct SpwData {
    pub data: Array3<c32>,
    pub corrected: Option<Array3<c32>>,
    pub model: Option<Array3<c32>>,
    pub weights: Array3<f32>,
    pub flags: Array3<bool>,
}

impl SpwData {
    /// The named column, if present.
    pub fn column(&self, column: DataColumn) -> Option<&Array3<c32>> {
        match column {
            DataColumn::Data => Some(&self.data),
            DataColumn::Corrected => self.corrected.as_ref(),
            DataColumn::Model => self.model.as_ref(),
        }
    }

    /// The corrected column if calibration has been applied, otherwise the
    /// observed data.
    pub fn best(&self) -> &Array3<c32> {
        self.corrected.as_ref().unwrap_or(&self.data)
    }
}

/// A visibility dataset: one EB, or a concatenation of EBs.
#[derive(Debug, Clone)]
pub struct VisDataset {
    /// Unique identifier, also the stem of the on-disk checkpoint name.
    pub name: String,

    /// The observed field's phase centre.
    pub phase_centre: RADec,

    /// The antennas present in this dataset. The same named antenna may
    /// occupy different station pads in different observing sessions, so
    /// antenna identity is the (name, station) pair.
    pub antennas: Vec<Antenna>,

    /// Cross-correlation baselines as (antenna index, antenna index) pairs
    /// with the first index smaller.
    pub baselines: Vec<(usize, usize)>,

    /// Timestamps of every integration, ascending.
    pub timestamps: Vec1<Epoch>,

    /// Scan boundaries as ranges of timestep indices. Contiguous and
    /// covering.
    pub scans: Vec<Range<usize>>,

    /// Baseline coordinates in metres, shape (num_timesteps, num_baselines).
    pub uvws_m: Array2<UVW>,

    /// The spectral windows. Concatenation appends; each spw remembers its
    /// originating EB.
    pub spws: Vec<SpectralWindow>,

    /// Visibility arrays, parallel to `spws`.
    pub spw_data: Vec<SpwData>,

    /// Processing lineage, one entry per transformation.
    pub history: Vec<String>,
}

impl VisDataset {
    pub fn num_antennas(&self) -> usize {
        self.antennas.len()
    }

    pub fn num_baselines(&self) -> usize {
        self.baselines.len()
    }

    pub fn num_timesteps(&self) -> usize {
        self.timestamps.len()
    }

    /// The ids of spws flagged as continuum intent.
    pub fn continuum_spw_ids(&self) -> Vec<usize> {
        self.spws
            .iter()
            .filter(|spw| spw.intent == SpwIntent::Continuum)
            .map(|spw| spw.id)
            .collect()
    }

    /// The integration time, from the first two timestamps. Datasets with a
    /// single integration have no meaningful resolution.
    pub fn time_res(&self) -> Option<hifitime::Duration> {
        let ts = self.timestamps.as_slice();
        (ts.len() > 1).then(|| ts[1] - ts[0])
    }

    /// Does any spw carry a corrected column?
    pub fn has_corrected(&self) -> bool {
        self.spw_data.iter().any(|s| s.corrected.is_some())
    }

    /// Does every spw carry a model column?
    pub fn has_model(&self) -> bool {
        self.spw_data.iter().all(|s| s.model.is_some())
    }

    /// Attach model visibilities to a spw. This is the imager's side channel
    /// and deliberately the only in-place mutation a dataset supports.
    pub fn set_model(&mut self, spw_id: usize, model: Array3<c32>) {
        assert_eq!(model.dim(), self.spw_data[spw_id].data.dim());
        self.spw_data[spw_id].model = Some(model);
    }

    /// Record a transformation in the dataset's lineage.
    pub fn push_history<S: AsRef<str>>(&mut self, entry: S) {
        self.history.push(entry.as_ref().to_string());
    }

    /// Copy out a new dataset whose DATA column is this dataset's `column`.
    /// This mirrors the copy-on-write discipline of the underlying tooling:
    /// "split" always produces a new dataset, and the corrected/model columns
    /// do not carry over.
    pub fn split(&self, name: &str, column: DataColumn) -> Result<VisDataset, SplitError> {
        self.split_spws(name, column, &(0..self.spws.len()).collect::<Vec<_>>())
    }

    /// Like [`VisDataset::split`], but keeping only the given spws (renumbered
    /// from zero in the given order).
    pub fn split_spws(
        &self,
        name: &str,
        column: DataColumn,
        spw_ids: &[usize],
    ) -> Result<VisDataset, SplitError> {
        let mut spws = vec![];
        let mut spw_data = vec![];
        for (new_id, &old_id) in spw_ids.iter().enumerate() {
            let spw = self
                .spws
                .get(old_id)
                .ok_or(SplitError::NoSuchSpw { spw: old_id })?;
            let old_data = &self.spw_data[old_id];
            let data = old_data
                .column(column)
                .ok_or(SplitError::MissingColumn {
                    column,
                    dataset: self.name.clone(),
                })?
                .clone();
            spws.push(SpectralWindow {
                id: new_id,
                ..spw.clone()
            });
            spw_data.push(SpwData {
                data,
                corrected: None,
                model: None,
                weights: old_data.weights.clone(),
                flags: old_data.flags.clone(),
            });
        }

        let mut out = VisDataset {
            name: name.to_string(),
            phase_centre: self.phase_centre,
            antennas: self.antennas.clone(),
            baselines: self.baselines.clone(),
            timestamps: self.timestamps.clone(),
            scans: self.scans.clone(),
            uvws_m: self.uvws_m.clone(),
            spws,
            spw_data,
            history: self.history.clone(),
        };
        out.push_history(format!(
            "split {} -> {} (column {column}, {} spws)",
            self.name,
            name,
            spw_ids.len()
        ));
        Ok(out)
    }

    /// Average groups of `width` channels together in every spw, weights
    /// respected, producing a new dataset. Used to make the channel-averaged
    /// continuum datasets that self-calibration runs on.
    pub fn average_channels(&self, name: &str, width: usize) -> Result<VisDataset, SplitError> {
        if width == 0 {
            return Err(SplitError::BadChannelWidth);
        }
        let mut out = self.split(name, DataColumn::Data)?;
        for (spw, spw_data) in out.spws.iter_mut().zip(out.spw_data.iter_mut()) {
            let (num_times, num_bls, num_chans) = spw_data.data.dim();
            let num_out = num_chans.div_ceil(width);
            let mut data = Array3::zeros((num_times, num_bls, num_out));
            let mut weights = Array3::zeros((num_times, num_bls, num_out));
            let mut flags = Array3::from_elem((num_times, num_bls, num_out), true);
            for t in 0..num_times {
                for b in 0..num_bls {
                    for oc in 0..num_out {
                        let chans = oc * width..((oc + 1) * width).min(num_chans);
                        let mut acc = c32::new(0.0, 0.0);
                        let mut wsum = 0.0f32;
                        for c in chans {
                            if !spw_data.flags[(t, b, c)] {
                                let w = spw_data.weights[(t, b, c)];
                                acc += spw_data.data[(t, b, c)] * w;
                                wsum += w;
                            }
                        }
                        if wsum > 0.0 {
                            data[(t, b, oc)] = acc / wsum;
                            weights[(t, b, oc)] = wsum;
                            flags[(t, b, oc)] = false;
                        }
                    }
                }
            }
            spw.first_freq_hz += (width as f64 - 1.0) / 2.0 * spw.chan_width_hz;
            spw.chan_width_hz *= width as f64;
            spw.num_chans = num_out;
            spw_data.data = data;
            spw_data.weights = weights;
            spw_data.flags = flags;
        }
        out.push_history(format!("average_channels width {width}"));
        Ok(out)
    }

    /// Flag samples matching a selection: any of the given antenna labels
    /// (bare name or `name@station`), optionally narrowed to particular spws
    /// and/or a GPST-second time range. Flags are only ever added, never
    /// cleared. Returns the number of newly flagged samples.
    pub fn flag_selection(
        &mut self,
        spw_ids: Option<&[usize]>,
        time_range_gpst_s: Option<(f64, f64)>,
        antennas: &[String],
    ) -> usize {
        let ant_selected: Vec<bool> = self
            .antennas
            .iter()
            .map(|ant| antennas.iter().any(|label| ant.matches_label(label)))
            .collect();
        let bl_selected: Vec<bool> = self
            .baselines
            .iter()
            .map(|&(a1, a2)| ant_selected[a1] || ant_selected[a2])
            .collect();
        let time_selected: Vec<bool> = self
            .timestamps
            .iter()
            .map(|ts| match time_range_gpst_s {
                None => true,
                Some((start, end)) => {
                    let s = ts.to_gpst_seconds();
                    s >= start && s <= end
                }
            })
            .collect();

        let mut flagged = 0;
        for (spw_id, spw_data) in self.spw_data.iter_mut().enumerate() {
            if let Some(ids) = spw_ids {
                if !ids.contains(&spw_id) {
                    continue;
                }
            }
            let (num_times, num_bls, num_chans) = spw_data.data.dim();
            for t in 0..num_times {
                if !time_selected[t] {
                    continue;
                }
                for b in 0..num_bls {
                    if !bl_selected[b] {
                        continue;
                    }
                    for c in 0..num_chans {
                        if !spw_data.flags[(t, b, c)] {
                            spw_data.flags[(t, b, c)] = true;
                            flagged += 1;
                        }
                    }
                }
            }
        }
        if flagged > 0 {
            self.push_history(format!(
                "flagged {flagged} samples (antennas [{}])",
                antennas.join(", ")
            ));
        }
        flagged
    }

    /// The fraction of samples flagged, over all spws.
    pub fn flagged_fraction(&self) -> f64 {
        let (flagged, total) = self
            .spw_data
            .iter()
            .fold((0usize, 0usize), |(f, t), spw_data| {
                (
                    f + spw_data.flags.iter().filter(|&&x| x).count(),
                    t + spw_data.flags.len(),
                )
            });
        flagged as f64 / total.max(1) as f64
    }
}

/// Concatenate datasets into one, preserving per-original-EB spectral-window
/// identity: every input's spws are appended after all existing ones, and the
/// antenna tables are merged by (name, station) identity with baseline
/// indices remapped.
///
/// Inputs must share a phase centre (to within an arcsecond; run alignment
/// first) and must not overlap in time. Corrected/model columns do not carry
/// over; split them into the data column first.
pub fn concat(datasets: &[&VisDataset], name: &str) -> Result<VisDataset, ConcatError> {
    let mut datasets = datasets.to_vec();
    if datasets.is_empty() {
        return Err(ConcatError::NoDatasets);
    }
    datasets.sort_by(|a, b| {
        a.timestamps
            .first()
            .partial_cmp(b.timestamps.first())
            .expect("timestamps are never NaN")
    });

    let phase_centre = datasets[0].phase_centre;
    for ds in &datasets[1..] {
        let sep = phase_centre.separation(ds.phase_centre);
        if sep > ARCSEC_TO_RAD {
            return Err(ConcatError::PhaseCentreMismatch {
                a: datasets[0].name.clone(),
                b: ds.name.clone(),
                separation_arcsec: sep / ARCSEC_TO_RAD,
            });
        }
    }
    for pair in datasets.windows(2) {
        if pair[1].timestamps.first() <= pair[0].timestamps.last() {
            return Err(ConcatError::OverlappingTimeRanges {
                a: pair[0].name.clone(),
                b: pair[1].name.clone(),
            });
        }
    }

    // Merge antenna tables. Identity is the (name, station) pair; the same
    // named antenna on a different pad is a distinct antenna.
    let mut antennas: Vec<Antenna> = vec![];
    let mut ant_maps: Vec<Vec<usize>> = vec![];
    for ds in &datasets {
        let mut map = Vec::with_capacity(ds.antennas.len());
        for ant in &ds.antennas {
            let i = match antennas
                .iter()
                .position(|a| a.name == ant.name && a.station == ant.station)
            {
                Some(i) => i,
                None => {
                    antennas.push(ant.clone());
                    antennas.len() - 1
                }
            };
            map.push(i);
        }
        ant_maps.push(map);
    }

    // The union baseline list: every remapped baseline that appears in any
    // input.
    let mut baselines: Vec<(usize, usize)> = datasets
        .iter()
        .zip(ant_maps.iter())
        .flat_map(|(ds, map)| {
            ds.baselines.iter().map(move |&(a1, a2)| {
                let (m1, m2) = (map[a1], map[a2]);
                (m1.min(m2), m1.max(m2))
            })
        })
        .unique()
        .collect();
    baselines.sort_unstable();
    let baseline_index: std::collections::HashMap<(usize, usize), usize> = baselines
        .iter()
        .enumerate()
        .map(|(i, &bl)| (bl, i))
        .collect();

    let timestamps: Vec<Epoch> = datasets
        .iter()
        .flat_map(|ds| ds.timestamps.iter().copied())
        .collect();
    let num_times = timestamps.len();
    let num_bls = baselines.len();

    // Per input dataset: its rows in the output time axis, and its baseline
    // remap into the union list.
    let mut time_offsets = vec![0usize; datasets.len()];
    let mut acc = 0;
    for (i, ds) in datasets.iter().enumerate() {
        time_offsets[i] = acc;
        acc += ds.num_timesteps();
    }
    let bl_maps: Vec<Vec<usize>> = datasets
        .iter()
        .zip(ant_maps.iter())
        .map(|(ds, map)| {
            ds.baselines
                .iter()
                .map(|&(a1, a2)| {
                    let (m1, m2) = (map[a1], map[a2]);
                    baseline_index[&(m1.min(m2), m1.max(m2))]
                })
                .collect()
        })
        .collect();

    let mut scans = vec![];
    for (i, ds) in datasets.iter().enumerate() {
        for scan in &ds.scans {
            scans.push(scan.start + time_offsets[i]..scan.end + time_offsets[i]);
        }
    }

    let mut uvws_m = Array2::from_elem((num_times, num_bls), UVW::default());
    for (i, ds) in datasets.iter().enumerate() {
        for t in 0..ds.num_timesteps() {
            for (b, &ob) in bl_maps[i].iter().enumerate() {
                uvws_m[(t + time_offsets[i], ob)] = ds.uvws_m[(t, b)];
            }
        }
    }

    // Append every input's spws after all existing ones. Rows belonging to
    // other inputs stay flagged with zero weight.
    let mut spws = vec![];
    let mut spw_data = vec![];
    for (i, ds) in datasets.iter().enumerate() {
        for (spw, sd) in ds.spws.iter().zip(ds.spw_data.iter()) {
            let num_chans = spw.num_chans;
            let mut data = Array3::zeros((num_times, num_bls, num_chans));
            let mut weights = Array3::zeros((num_times, num_bls, num_chans));
            let mut flags = Array3::from_elem((num_times, num_bls, num_chans), true);
            for t in 0..ds.num_timesteps() {
                for (b, &ob) in bl_maps[i].iter().enumerate() {
                    for c in 0..num_chans {
                        data[(t + time_offsets[i], ob, c)] = sd.data[(t, b, c)];
                        weights[(t + time_offsets[i], ob, c)] = sd.weights[(t, b, c)];
                        flags[(t + time_offsets[i], ob, c)] = sd.flags[(t, b, c)];
                    }
                }
            }
            spws.push(SpectralWindow {
                id: spws.len(),
                ..spw.clone()
            });
            spw_data.push(SpwData {
                data,
                corrected: None,
                model: None,
                weights,
                flags,
            });
        }
    }

    debug!(
        "concat {} -> {name}: {} antennas, {} baselines, {} spws",
        datasets.iter().map(|ds| ds.name.as_str()).join(" + "),
        antennas.len(),
        num_bls,
        spws.len()
    );

    let mut out = VisDataset {
        name: name.to_string(),
        phase_centre,
        antennas,
        baselines,
        timestamps: Vec1::try_from_vec(timestamps).expect("at least one input dataset"),
        scans,
        uvws_m,
        spws,
        spw_data,
        history: vec![],
    };
    out.push_history(format!(
        "concat [{}] -> {name}",
        datasets.iter().map(|ds| ds.name.as_str()).join(", ")
    ));
    Ok(out)
}
