// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use approx::assert_abs_diff_eq;

use super::*;
use crate::simulate::{simulate_eb, DiskModel, SimParams};

fn small_eb(name: &str, start_gpst_s: f64) -> VisDataset {
    let mut params = SimParams::new(name);
    params.num_times = 12;
    params.num_scans = 2;
    params.start_gpst_s = start_gpst_s;
    params.noise_jy = 0.005;
    simulate_eb(&params, &DiskModel::point(0.5)).unwrap()
}

#[test]
fn split_copies_out_the_requested_column() {
    let mut ds = small_eb("eb1", 1.3e9);
    // No corrected column yet.
    assert!(matches!(
        ds.split("eb1_cal", DataColumn::Corrected),
        Err(SplitError::MissingColumn { .. })
    ));

    // Attach a fake corrected column and split it out.
    let corrected = ds.spw_data[0].data.mapv(|v| v * 2.0f32);
    ds.spw_data[0].corrected = Some(corrected);
    let out = ds.split("eb1_cal", DataColumn::Corrected).unwrap();
    assert_eq!(out.name, "eb1_cal");
    assert!(out.spw_data[0].corrected.is_none());
    assert!(out.spw_data[0].model.is_none());
    assert_abs_diff_eq!(
        out.spw_data[0].data[(0, 0, 0)].re,
        ds.spw_data[0].data[(0, 0, 0)].re * 2.0,
        epsilon = 1e-6
    );
    // Lineage records the transformation.
    assert!(out.history.iter().any(|h| h.contains("split")));
}

#[test]
fn split_spws_renumbers_from_zero() {
    let mut params = SimParams::new("eb1");
    params.num_times = 6;
    params.num_scans = 1;
    params.spws = vec![
        crate::simulate::SpwSetup::band6_continuum(4),
        crate::simulate::SpwSetup::band6_continuum(8),
    ];
    let ds = simulate_eb(&params, &DiskModel::point(0.5)).unwrap();
    let out = ds.split_spws("eb1_spw1", DataColumn::Data, &[1]).unwrap();
    assert_eq!(out.spws.len(), 1);
    assert_eq!(out.spws[0].id, 0);
    assert_eq!(out.spws[0].num_chans, 8);
}

#[test]
fn concat_appends_spws_and_remaps_antennas() {
    let a = small_eb("eb_a", 1.3e9);
    // Second EB well after the first, same array.
    let b = small_eb("eb_b", 1.3e9 + 86400.0);
    let joint = concat(&[&a, &b], "joint").unwrap();

    assert_eq!(joint.spws.len(), a.spws.len() + b.spws.len());
    // Spw identity is preserved through concatenation.
    assert_eq!(joint.spws[0].source_eb, "eb_a");
    assert_eq!(joint.spws[a.spws.len()].source_eb, "eb_b");
    // Same antennas in both inputs here, so the union is no bigger.
    assert_eq!(joint.num_antennas(), a.num_antennas());
    assert_eq!(joint.num_timesteps(), a.num_timesteps() + b.num_timesteps());

    // Rows belonging to the other EB are flagged with zero weight.
    let spw0 = &joint.spw_data[0];
    let t_b = a.num_timesteps();
    assert!(spw0.flags[(t_b, 0, 0)]);
    assert_abs_diff_eq!(spw0.weights[(t_b, 0, 0)], 0.0);
    assert!(!spw0.flags[(0, 0, 0)]);
}

#[test]
fn concat_unions_disjoint_antenna_tables() {
    let a = small_eb("eb_a", 1.3e9);
    let mut b = small_eb("eb_b", 1.3e9 + 86400.0);
    // Same antenna names on different pads are distinct antennas.
    for ant in b.antennas.iter_mut() {
        ant.station = format!("W{}", ant.station);
    }
    let joint = concat(&[&a, &b], "joint").unwrap();
    assert_eq!(joint.num_antennas(), a.num_antennas() + b.num_antennas());
}

#[test]
fn concat_rejects_overlapping_times() {
    let a = small_eb("eb_a", 1.3e9);
    let b = small_eb("eb_b", 1.3e9);
    assert!(matches!(
        concat(&[&a, &b], "joint"),
        Err(ConcatError::OverlappingTimeRanges { .. })
    ));
}

#[test]
fn concat_rejects_mismatched_phase_centres() {
    let a = small_eb("eb_a", 1.3e9);
    let mut b = small_eb("eb_b", 1.3e9 + 86400.0);
    b.phase_centre = marlu::RADec::from_degrees(248.1, -24.0);
    assert!(matches!(
        concat(&[&a, &b], "joint"),
        Err(ConcatError::PhaseCentreMismatch { .. })
    ));
}

#[test]
fn average_channels_preserves_total_flux() {
    let ds = small_eb("eb1", 1.3e9);
    let avg = ds.average_channels("eb1_avg", 4).unwrap();
    assert_eq!(avg.spws[0].num_chans, 1);
    // Equal weights, no flags: the average of the input channels.
    let mean: f32 = (0..4)
        .map(|c| ds.spw_data[0].data[(0, 0, c)].re)
        .sum::<f32>()
        / 4.0;
    assert_abs_diff_eq!(avg.spw_data[0].data[(0, 0, 0)].re, mean, epsilon = 1e-4);
    // Centre frequency is unchanged by symmetric averaging.
    assert_abs_diff_eq!(
        avg.spws[0].centre_freq_hz(),
        ds.spws[0].centre_freq_hz(),
        epsilon = 1.0
    );
}

#[test]
fn dataset_roundtrips_through_checkpoint() {
    let mut ds = small_eb("eb1", 1.3e9);
    ds.spw_data[0].model = Some(ds.spw_data[0].data.clone());
    ds.push_history("test entry");

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("eb1.vis");
    io::write_dataset(&ds, &path).unwrap();
    let back = io::read_dataset(&path).unwrap();

    assert_eq!(back.name, ds.name);
    assert_eq!(back.antennas, ds.antennas);
    assert_eq!(back.baselines, ds.baselines);
    assert_eq!(back.timestamps, ds.timestamps);
    assert_eq!(back.scans, ds.scans);
    assert_eq!(back.spws, ds.spws);
    assert_eq!(back.history, ds.history);
    assert!(back.spw_data[0].model.is_some());
    assert!(back.spw_data[0].corrected.is_none());
    let (orig, read) = (&ds.spw_data[0], &back.spw_data[0]);
    assert_abs_diff_eq!(orig.data[(3, 2, 1)].re, read.data[(3, 2, 1)].re);
    assert_abs_diff_eq!(orig.weights[(3, 2, 1)], read.weights[(3, 2, 1)]);
    assert_eq!(orig.flags[(3, 2, 1)], read.flags[(3, 2, 1)]);
    for (a, b) in ds.uvws_m.iter().zip(back.uvws_m.iter()) {
        assert_abs_diff_eq!(a.u, b.u);
        assert_abs_diff_eq!(a.v, b.v);
        assert_abs_diff_eq!(a.w, b.w);
    }
}

#[test]
fn flag_selection_targets_antennas_times_and_spws() {
    let mut ds = small_eb("eb1", 1.3e9);
    let target = ds.antennas[2].label();
    let t3 = ds.timestamps.as_slice()[3].to_gpst_seconds();

    // One antenna, one timestep, all spws.
    let flagged = ds.flag_selection(None, Some((t3 - 0.5, t3 + 0.5)), &[target.clone()]);
    let bls_with_ant: usize = ds
        .baselines
        .iter()
        .filter(|&&(a1, a2)| a1 == 2 || a2 == 2)
        .count();
    assert_eq!(flagged, bls_with_ant * ds.spws[0].num_chans);
    // Baseline 1 is (0, 2): flagged at the selected timestep only.
    assert!(ds.spw_data[0].flags[(3, 1, 0)]);
    assert!(!ds.spw_data[0].flags[(2, 1, 0)]);
    // Baseline 0 is (0, 1): untouched.
    assert!(!ds.spw_data[0].flags[(3, 0, 0)]);

    // Re-flagging the same selection adds nothing.
    assert_eq!(
        ds.flag_selection(None, Some((t3 - 0.5, t3 + 0.5)), &[target]),
        0
    );

    // Unknown spw selection flags nothing.
    assert_eq!(
        ds.flag_selection(Some(&[99]), None, &["DA43".to_string()]),
        0
    );
    assert!(ds.history.iter().any(|h| h.contains("flagged")));
}

#[test]
fn antenna_labels_resolve() {
    let ant = Antenna {
        name: "DA50".to_string(),
        station: "A045".to_string(),
        position_enu_m: [0.0; 3],
    };
    assert_eq!(ant.label(), "DA50@A045");
    assert!(ant.matches_label("DA50"));
    assert!(ant.matches_label("DA50@A045"));
    assert!(!ant.matches_label("DA50@W201"));
    assert!(!ant.matches_label("DA51"));
}
