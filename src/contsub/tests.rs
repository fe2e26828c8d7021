// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use approx::assert_abs_diff_eq;
use marlu::c32;

use super::*;
use crate::obs::{SpwIntent, VisDataset};
use crate::simulate::{simulate_eb, DiskModel, SimParams, SpwSetup};

fn co_spw_setup() -> SpwSetup {
    // 64 channels straddling the 12CO 2-1 line at vsys ~ 5 km/s.
    SpwSetup {
        first_freq_hz: 230.518e9,
        chan_width_hz: 1e6,
        num_chans: 64,
        intent: SpwIntent::Line,
    }
}

fn line_eb() -> VisDataset {
    let mut params = SimParams::new("eb1");
    params.num_times = 6;
    params.num_scans = 1;
    params.noise_jy = 0.0;
    params.spws = vec![SpwSetup::band6_continuum(4), co_spw_setup()];
    simulate_eb(&params, &DiskModel::point(0.4)).unwrap()
}

fn contsub_params() -> ContsubParams {
    ContsubParams {
        fit_order: 1,
        vsys_kms: 5.0,
        vel_halfwidth_kms: 10.0,
        transitions: vec!["12CO_2-1".to_string()],
    }
}

#[test]
fn catalog_knows_the_usual_suspects() {
    let co = lookup("12CO_2-1").unwrap();
    assert_abs_diff_eq!(co.rest_freq_hz, 230.538e9, epsilon = 1e6);
    assert!(lookup("13CO_2-1").is_some());
    assert!(lookup("C18O_2-1").is_some());
    assert!(lookup("unobtainium_1-0").is_none());
}

#[test]
fn line_channels_follow_the_systemic_velocity() {
    let ds = line_eb();
    let spw = &ds.spws[1];
    let co = lookup("12CO_2-1").unwrap();

    let at_rest = line_channel_range(spw, co.rest_freq_hz, 0.0, 10.0).unwrap();
    let redshifted = line_channel_range(spw, co.rest_freq_hz, 12.0, 10.0).unwrap();
    // Radio convention: higher velocity means lower sky frequency.
    assert!(redshifted.start < at_rest.start);
    assert_eq!(at_rest.len(), redshifted.len());

    // A wider velocity range grabs more channels.
    let wide = line_channel_range(spw, co.rest_freq_hz, 0.0, 20.0).unwrap();
    assert!(wide.len() > at_rest.len());

    // A line far outside the window is not covered.
    assert!(line_channel_range(&ds.spws[0], 100e9, 0.0, 10.0).is_none());
}

#[test]
fn fitspw_is_identical_across_ebs_sharing_a_setup() {
    // Two EBs concatenated: their line spws share a frequency setup, so the
    // derived channel sets must be identical even though the spw ids (and
    // source EBs) differ.
    let a = line_eb();
    let mut params_b = SimParams::new("eb2");
    params_b.num_times = 6;
    params_b.num_scans = 1;
    params_b.start_gpst_s = 1.3e9 + 86400.0;
    params_b.spws = vec![SpwSetup::band6_continuum(4), co_spw_setup()];
    let b = simulate_eb(&params_b, &DiskModel::point(0.4)).unwrap();
    let joint = crate::obs::concat(&[&a, &b], "joint").unwrap();

    let entries = derive_fitspw(&joint, &contsub_params()).unwrap();
    assert_eq!(entries.len(), 4);
    // spws 1 and 3 are the two EBs' line windows.
    assert_eq!(entries[1].line_free, entries[3].line_free);
    assert_eq!(entries[1].line_chans, entries[3].line_chans);
    assert!(!entries[1].line_chans.is_empty());
    // The continuum spws contain no catalogued line.
    assert!(entries[0].line_chans.is_empty());
    assert_eq!(entries[0].line_free, vec![0..4]);
}

#[test]
fn continuum_ramp_is_removed_and_the_line_survives() {
    let mut ds = line_eb();
    let entries = derive_fitspw(&ds, &contsub_params()).unwrap();
    let line_range = entries[1].line_chans[0].1.clone();

    // Overwrite the line spw with a known linear continuum ramp plus a line
    // bump.
    let (num_times, num_bls, num_chans) = ds.spw_data[1].data.dim();
    for t in 0..num_times {
        for b in 0..num_bls {
            for c in 0..num_chans {
                let ramp = 0.5 + 0.003 * c as f32;
                let line = if line_range.contains(&c) { 0.25 } else { 0.0 };
                ds.spw_data[1].data[(t, b, c)] = c32::new(ramp + line, 0.1 - 0.001 * c as f32);
            }
        }
    }

    let out = subtract_continuum(&ds, &entries, &contsub_params()).unwrap();
    assert_eq!(out.name, "eb1.contsub");

    let data = &out.spw_data[1].data;
    // Line-free channels go to zero; the fit is exact for a linear ramp.
    for c in [0usize, 1, entries[1].line_free.last().unwrap().end - 1] {
        assert_abs_diff_eq!(data[(0, 0, c)].re, 0.0, epsilon = 1e-3);
        assert_abs_diff_eq!(data[(0, 0, c)].im, 0.0, epsilon = 1e-3);
    }
    // The line bump survives, continuum removed under it (the fit
    // extrapolates across the line gap).
    for c in line_range.clone() {
        assert_abs_diff_eq!(data[(0, 0, c)].re, 0.25, epsilon = 1e-3);
    }
}

#[test]
fn extraction_trims_to_the_line() {
    let ds = line_eb();
    let params = contsub_params();
    let entries = derive_fitspw(&ds, &params).unwrap();
    let out = subtract_continuum(&ds, &entries, &params).unwrap();

    let line = extract_transition(&out, "12CO_2-1", &params).unwrap();
    assert_eq!(line.name, "eb1.contsub.12CO_2-1");
    assert_eq!(line.spws.len(), 1);
    let expected = entries[1].line_chans[0].1.clone();
    assert_eq!(line.spws[0].num_chans, expected.len());
    // The trimmed window still brackets the redshifted line frequency.
    let co = lookup("12CO_2-1").unwrap();
    let f_line = co.rest_freq_hz * (1.0 - params.vsys_kms * 1e3 / marlu::constants::VEL_C);
    let freqs = line.spws[0].freqs_hz();
    assert!(freqs.first().unwrap() < &f_line && &f_line < freqs.last().unwrap());

    // Unknown and uncovered transitions are errors.
    assert!(matches!(
        extract_transition(&out, "bogus", &params),
        Err(ContsubError::UnknownTransition { .. })
    ));
    assert!(matches!(
        extract_transition(&out, "13CO_2-1", &params),
        Err(ContsubError::TransitionNotCovered { .. })
    ));
}

#[test]
fn stale_fitspw_is_rejected() {
    let ds = line_eb();
    let params = contsub_params();
    let entries = derive_fitspw(&ds, &params).unwrap();
    let shrunk = &entries[..1];
    assert!(matches!(
        subtract_continuum(&ds, shrunk, &params),
        Err(ContsubError::FitspwMismatch { .. })
    ));
}
