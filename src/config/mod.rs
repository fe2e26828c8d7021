// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Pipeline configuration.
//!
//! A TOML file describes the target, the EBs, the self-cal schedule and the
//! various policy thresholds; it is deserialised into loosely-typed raw
//! structs and then validated into the strongly-typed parameter objects the
//! pipeline modules take. Everything numeric that has a sane default has
//! one, so a minimal file is short.

mod error;
#[cfg(test)]
mod tests;

pub use error::ConfigError;

use std::path::{Path, PathBuf};

use marlu::RADec;
use serde::Deserialize;
use vec1::Vec1;

use crate::align::AlignParams;
use crate::constants::*;
use crate::contsub::ContsubParams;
use crate::fluxscale::{DiskGeometry, FluxScaleParams};
use crate::imaging::{EllipseMask, ImagingParams};
use crate::merge::{ArrayConfig, MergeParams};
use crate::selfcal::{ConvergencePolicy, ScheduleEntry, SelfcalParams};
use crate::solutions::CalMode;
use crate::solve::apply::{ApplyMode, Interp};
use crate::solve::{CombinePolicy, Solint};
use crate::unit_parsing::parse_angle;

/// The validated configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub target: TargetConfig,
    pub ebs: Vec<EbEntry>,
    pub merge: MergeParams,
    pub contsub: ContsubParams,
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct TargetConfig {
    pub name: String,
    pub phase_centre: RADec,
    pub geometry: DiskGeometry,
    pub vsys_kms: f64,
}

/// One EB: identifier, array configuration and the checkpoint to read it
/// from.
#[derive(Debug, Clone)]
pub struct EbEntry {
    pub id: String,
    pub config: ArrayConfig,
    pub path: PathBuf,
}

/// Load and validate a configuration file.
pub fn load<P: AsRef<Path>>(path: P) -> Result<PipelineConfig, ConfigError> {
    let text = std::fs::read_to_string(&path)?;
    parse_str(&text)
}

/// Parse and validate configuration text.
pub fn parse_str(text: &str) -> Result<PipelineConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(text)?;
    raw.validate()
}

// Raw deserialisation targets.

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    target: RawTarget,
    #[serde(default)]
    eb: Vec<RawEb>,
    alignment: RawAlignment,
    selfcal: RawSelfcal,
    imaging: RawImaging,
    #[serde(default)]
    fluxscale: RawFluxscale,
    contsub: RawContsub,
    #[serde(default)]
    pipeline: RawPipeline,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTarget {
    name: String,
    ra_deg: f64,
    dec_deg: f64,
    incl_deg: f64,
    pa_deg: f64,
    vsys_kms: f64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEb {
    id: String,
    config: ArrayConfig,
    path: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAlignment {
    npix: Vec<usize>,
    cell: String,
    #[serde(default)]
    spw: usize,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawScheduleEntry {
    mode: String,
    solint: String,
    #[serde(default)]
    combine: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSelfcal {
    refants: Vec<String>,
    schedule: Vec<RawScheduleEntry>,
    #[serde(default)]
    per_eb_schedule: Vec<RawScheduleEntry>,
    #[serde(default = "default_min_snr")]
    min_snr: f64,
    #[serde(default = "default_minblperant")]
    min_baselines_per_antenna: usize,
    #[serde(default = "default_true")]
    solnorm: bool,
    #[serde(default = "default_threshold_sigma")]
    threshold_sigma: f64,
    #[serde(default = "default_min_improvement")]
    min_improvement: f64,
    #[serde(default = "default_max_flagged_fraction")]
    max_flagged_fraction: f64,
    #[serde(default = "default_interp")]
    interp: String,
    #[serde(default = "default_apply_mode")]
    apply_mode: String,
    #[serde(default)]
    calwt: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawImaging {
    size: usize,
    cell: String,
    #[serde(default = "default_robust")]
    robust: f64,
    #[serde(default = "default_niter")]
    niter: usize,
    #[serde(default = "default_gain")]
    gain: f64,
    #[serde(default = "default_scales")]
    scales: Vec<usize>,
    #[serde(default)]
    parallel: bool,
    mask: RawMask,
    annulus: [String; 2],
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawMask {
    #[serde(default)]
    l_off: Option<String>,
    #[serde(default)]
    m_off: Option<String>,
    semimajor: String,
    semiminor: String,
    #[serde(default)]
    pa_deg: f64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFluxscale {
    #[serde(default = "default_nbins")]
    nbins: usize,
    #[serde(default = "default_ratio_tolerance")]
    ratio_tolerance: f64,
    #[serde(default = "default_slope_sigma")]
    slope_sigma: f64,
    #[serde(default = "default_min_overlap")]
    min_overlap_fraction: f64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawContsub {
    #[serde(default = "default_fit_order")]
    fit_order: usize,
    #[serde(default = "default_vel_halfwidth")]
    vel_halfwidth_kms: f64,
    transitions: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPipeline {
    #[serde(default = "default_generations")]
    generations: usize,
    #[serde(default)]
    channel_average_width: Option<usize>,
    #[serde(default = "default_output_dir")]
    output_dir: PathBuf,
}

impl Default for RawFluxscale {
    fn default() -> Self {
        RawFluxscale {
            nbins: default_nbins(),
            ratio_tolerance: default_ratio_tolerance(),
            slope_sigma: default_slope_sigma(),
            min_overlap_fraction: default_min_overlap(),
        }
    }
}

impl Default for RawPipeline {
    fn default() -> Self {
        RawPipeline {
            generations: default_generations(),
            channel_average_width: None,
            output_dir: default_output_dir(),
        }
    }
}

fn default_min_snr() -> f64 {
    DEFAULT_MIN_SOLUTION_SNR
}
fn default_minblperant() -> usize {
    DEFAULT_MIN_BASELINES_PER_ANTENNA
}
fn default_true() -> bool {
    true
}
fn default_threshold_sigma() -> f64 {
    DEFAULT_THRESHOLD_SIGMA
}
fn default_min_improvement() -> f64 {
    DEFAULT_MIN_SNR_IMPROVEMENT
}
fn default_max_flagged_fraction() -> f64 {
    DEFAULT_MAX_FLAGGED_FRACTION
}
fn default_interp() -> String {
    "nearest".to_string()
}
fn default_apply_mode() -> String {
    "calflag".to_string()
}
fn default_robust() -> f64 {
    0.5
}
fn default_niter() -> usize {
    1000
}
fn default_gain() -> f64 {
    0.1
}
fn default_scales() -> Vec<usize> {
    vec![0]
}
fn default_nbins() -> usize {
    10
}
fn default_ratio_tolerance() -> f64 {
    DEFAULT_FLUX_RATIO_TOLERANCE
}
fn default_slope_sigma() -> f64 {
    DEFAULT_FLUX_SLOPE_SIGMA
}
fn default_min_overlap() -> f64 {
    0.2
}
fn default_fit_order() -> usize {
    1
}
fn default_vel_halfwidth() -> f64 {
    15.0
}
fn default_generations() -> usize {
    2
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("pipeline_run")
}

impl RawConfig {
    fn validate(self) -> Result<PipelineConfig, ConfigError> {
        let bad = |field: &'static str, message: String| ConfigError::BadValue { field, message };

        if !(0.0..90.0).contains(&self.target.incl_deg) {
            return Err(bad(
                "target.incl_deg",
                format!("{} is outside [0, 90)", self.target.incl_deg),
            ));
        }

        let target = TargetConfig {
            name: self.target.name.clone(),
            phase_centre: RADec::from_degrees(self.target.ra_deg, self.target.dec_deg),
            geometry: DiskGeometry {
                incl_deg: self.target.incl_deg,
                pa_deg: self.target.pa_deg,
            },
            vsys_kms: self.target.vsys_kms,
        };

        let ebs: Vec<EbEntry> = self
            .eb
            .iter()
            .map(|eb| EbEntry {
                id: eb.id.clone(),
                config: eb.config,
                path: eb.path.clone(),
            })
            .collect();

        // Alignment.
        let npix_list = Vec1::try_from_vec(self.alignment.npix.clone())
            .map_err(|_| bad("alignment.npix", "at least one grid size".to_string()))?;
        let (cell_n, cell_f) = parse_angle(&self.alignment.cell)?;
        let align = AlignParams {
            npix_list,
            cell_rad: cell_f.to_radians(cell_n),
            spw: self.alignment.spw,
        };

        // Schedules.
        let parse_schedule = |raw: &[RawScheduleEntry],
                              field: &'static str|
         -> Result<Vec<ScheduleEntry>, ConfigError> {
            raw.iter()
                .map(|e| {
                    let mode: CalMode = e
                        .mode
                        .parse()
                        .map_err(|_| bad(field, format!("bad mode '{}'", e.mode)))?;
                    let solint: Solint = e.solint.parse()?;
                    let combine: CombinePolicy = e.combine.parse()?;
                    Ok(ScheduleEntry {
                        mode,
                        solint,
                        combine,
                    })
                })
                .collect()
        };
        let schedule = Vec1::try_from_vec(parse_schedule(&self.selfcal.schedule, "selfcal.schedule")?)
            .map_err(|_| {
                bad(
                    "selfcal.schedule",
                    "at least one schedule entry".to_string(),
                )
            })?;
        let per_eb = parse_schedule(&self.selfcal.per_eb_schedule, "selfcal.per_eb_schedule")?;
        let per_eb_schedule = Vec1::try_from_vec(per_eb).ok();

        let refant_names = Vec1::try_from_vec(self.selfcal.refants.clone())
            .map_err(|_| bad("selfcal.refants", "at least one antenna name".to_string()))?;

        let interp: Interp = self
            .selfcal
            .interp
            .parse()
            .map_err(|_| bad("selfcal.interp", format!("bad value '{}'", self.selfcal.interp)))?;
        let apply_mode: ApplyMode = self.selfcal.apply_mode.parse().map_err(|_| {
            bad(
                "selfcal.apply_mode",
                format!("bad value '{}'", self.selfcal.apply_mode),
            )
        })?;

        // Imaging.
        if self.imaging.size == 0 || self.imaging.size % 2 != 0 {
            return Err(bad(
                "imaging.size",
                format!("{} must be an even, non-zero pixel count", self.imaging.size),
            ));
        }
        let (n, f) = parse_angle(&self.imaging.cell)?;
        let cell_rad = f.to_radians(n);
        let angle = |s: &String| -> Result<f64, ConfigError> {
            let (n, f) = parse_angle(s)?;
            Ok(f.to_radians(n))
        };
        let mask = EllipseMask {
            l_off_rad: self.imaging.mask.l_off.as_ref().map(angle).transpose()?.unwrap_or(0.0),
            m_off_rad: self.imaging.mask.m_off.as_ref().map(angle).transpose()?.unwrap_or(0.0),
            semimajor_rad: angle(&self.imaging.mask.semimajor)?,
            semiminor_rad: angle(&self.imaging.mask.semiminor)?,
            pa_rad: self.imaging.mask.pa_deg * DEG_TO_RAD,
        };
        let annulus_rad = (angle(&self.imaging.annulus[0])?, angle(&self.imaging.annulus[1])?);
        if annulus_rad.1 <= annulus_rad.0 {
            return Err(bad(
                "imaging.annulus",
                "outer radius must exceed inner radius".to_string(),
            ));
        }
        let imaging = ImagingParams {
            size: self.imaging.size,
            cell_rad,
            robust: self.imaging.robust,
            niter: self.imaging.niter,
            gain: self.imaging.gain,
            threshold_jy: 0.0,
            mask,
            scales: self.imaging.scales.clone(),
            annulus_rad,
            parallel: self.imaging.parallel,
            spw_ids: None,
        };

        let fluxscale = FluxScaleParams {
            nbins: nonzero(self.fluxscale.nbins, default_nbins()),
            ratio_tolerance: positive(self.fluxscale.ratio_tolerance, default_ratio_tolerance()),
            slope_sigma: positive(self.fluxscale.slope_sigma, default_slope_sigma()),
            min_overlap_fraction: self.fluxscale.min_overlap_fraction,
        };

        // Contsub: every named transition must exist in the catalog.
        for name in &self.contsub.transitions {
            if crate::contsub::lookup(name).is_none() {
                return Err(bad(
                    "contsub.transitions",
                    format!("unknown transition '{name}'"),
                ));
            }
        }
        if self.contsub.fit_order > 2 {
            return Err(bad(
                "contsub.fit_order",
                format!("{} is not in 0-2", self.contsub.fit_order),
            ));
        }
        let contsub = ContsubParams {
            fit_order: self.contsub.fit_order,
            vsys_kms: self.target.vsys_kms,
            vel_halfwidth_kms: self.contsub.vel_halfwidth_kms,
            transitions: self.contsub.transitions.clone(),
        };

        let selfcal = SelfcalParams {
            name: String::new(),
            schedule: schedule.clone(),
            refants: refant_names.clone(),
            min_snr: self.selfcal.min_snr,
            min_baselines_per_antenna: self.selfcal.min_baselines_per_antenna,
            solnorm: self.selfcal.solnorm,
            threshold_sigma: self.selfcal.threshold_sigma,
            interp,
            apply_mode,
            calwt: self.selfcal.calwt,
            imaging,
            convergence: ConvergencePolicy {
                min_improvement: self.selfcal.min_improvement,
                max_flagged_fraction: self.selfcal.max_flagged_fraction,
                ..Default::default()
            },
        };

        let generations = self.pipeline.generations;
        if generations == 0 {
            return Err(bad("pipeline.generations", "must be at least 1".to_string()));
        }
        let merge = MergeParams {
            target: target.name.clone(),
            geometry: target.geometry,
            align,
            refant_names,
            per_eb_schedule,
            combined_schedule: schedule,
            channel_average_width: self.pipeline.channel_average_width,
            selfcal,
            fluxscale,
            generations,
        };

        Ok(PipelineConfig {
            target,
            ebs,
            merge,
            contsub,
            output_dir: self.pipeline.output_dir.clone(),
        })
    }
}

fn nonzero(value: usize, fallback: usize) -> usize {
    if value == 0 {
        fallback
    } else {
        value
    }
}

fn positive(value: f64, fallback: f64) -> f64 {
    if value > 0.0 {
        value
    } else {
        fallback
    }
}
