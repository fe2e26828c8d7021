// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use approx::assert_abs_diff_eq;
use hifitime::Epoch;
use marlu::c64;
use ndarray::prelude::*;
use vec1::{vec1, Vec1};

use super::*;
use crate::obs::Antenna;

fn test_antennas(n: usize) -> Vec<Antenna> {
    (0..n)
        .map(|i| Antenna {
            name: format!("DA{:02}", 41 + i),
            station: format!("A{:03}", i),
            position_enu_m: [i as f64, 0.0, 0.0],
        })
        .collect()
}

fn test_table(num_tb: usize, num_ants: usize, num_sb: usize) -> GainTable {
    let timeblocks = Vec1::try_from_vec(
        (0..num_tb)
            .map(|i| {
                let ts = Epoch::from_gpst_seconds(1.3e9 + i as f64 * 60.0);
                Timeblock {
                    index: i,
                    range: i..i + 1,
                    timestamps: vec1![ts],
                    median: ts,
                }
            })
            .collect(),
    )
    .unwrap();
    let spwblocks = (0..num_sb)
        .map(|index| SpwBlock {
            index,
            spw_ids: vec![index],
            source_ebs: vec!["eb1".to_string()],
            centre_freq_hz: 232.6e9 + index as f64 * 2e9,
        })
        .collect();
    GainTable {
        name: "test.g".to_string(),
        mode: CalMode::Phase,
        antennas: test_antennas(num_ants),
        timeblocks,
        spwblocks,
        gains: Array3::from_elem((num_tb, num_ants, num_sb), c64::new(1.0, 0.0)),
        snrs: Array3::from_elem((num_tb, num_ants, num_sb), 10.0),
        solved_from: "eb1".to_string(),
        refant: Some("DA41@A000".to_string()),
    }
}

#[test]
fn flag_bookkeeping() {
    let mut table = test_table(4, 5, 2);
    assert_eq!(table.flagged_count(), 0);
    table.flag_solution(0, 0, 0);
    table.flag_solution(1, 0, 0);
    assert_eq!(table.flagged_count(), 2);
    assert!(table.is_flagged(0, 0, 0));
    assert_abs_diff_eq!(table.flagged_fraction(), 2.0 / 40.0);
    assert_abs_diff_eq!(table.antenna_flagged_fraction(0), 2.0 / 8.0);
    let counts = table.flagged_counts();
    assert_eq!(counts[(0, 0)], 1);
    assert_eq!(counts[(0, 1)], 1);
    assert_eq!(counts[(1, 0)], 0);
}

#[test]
fn manual_flag_entries_select_correctly() {
    let mut table = test_table(4, 5, 2);
    // Bare name, one spw, restricted time range covering the first two
    // timeblocks.
    let flagged = table.apply_flag(&FlagEntry {
        antenna: "DA43".to_string(),
        spw_ids: Some(vec![1]),
        time_range_gpst_s: Some((1.3e9 - 1.0, 1.3e9 + 61.0)),
    });
    assert_eq!(flagged, 2);
    assert!(table.is_flagged(0, 2, 1));
    assert!(table.is_flagged(1, 2, 1));
    assert!(!table.is_flagged(2, 2, 1));
    assert!(!table.is_flagged(0, 2, 0));

    // A full label selects only a matching station.
    let flagged = table.apply_flag(&FlagEntry {
        antenna: "DA41@A999".to_string(),
        spw_ids: None,
        time_range_gpst_s: None,
    });
    assert_eq!(flagged, 0);
}

#[test]
fn clip_flags_outliers() {
    let mut table = test_table(2, 3, 1);
    table.gains[(0, 1, 0)] = c64::new(5.0, 0.0);
    table.gains[(1, 2, 0)] = c64::new(0.01, 0.0);
    let flagged = table.clip_amplitudes(0.5, 2.0);
    assert_eq!(flagged, 2);
    assert!(table.is_flagged(0, 1, 0));
    assert!(table.is_flagged(1, 2, 0));
}

#[test]
fn timeblocks_never_span_scans() {
    let timestamps: Vec<Epoch> = (0..10)
        .map(|i| Epoch::from_gpst_seconds(1.3e9 + i as f64 * 10.0))
        .collect();
    let timestamps = Vec1::try_from_vec(timestamps).unwrap();
    let scans = vec![0..5, 5..10];

    // Infinite interval: one block per scan.
    let blocks = timeblocks_from_scans(&timestamps, &scans, None);
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[0].range, 0..5);
    assert_eq!(blocks[1].range, 5..10);

    // 20 s blocks within 50 s scans.
    let blocks = timeblocks_from_scans(&timestamps, &scans, Some(20.0));
    assert_eq!(blocks.len(), 6);
    assert_eq!(blocks[0].range, 0..2);
    assert_eq!(blocks[2].range, 4..5);
    assert_eq!(blocks[3].range, 5..7);

    // An interval longer than a scan collapses to scan blocks.
    let blocks = timeblocks_from_scans(&timestamps, &scans, Some(1e5));
    assert_eq!(blocks.len(), 2);

    // Indices are consecutive.
    for (i, b) in blocks.iter().enumerate() {
        assert_eq!(b.index, i);
    }
}

#[test]
fn table_roundtrips_through_disk() {
    let mut table = test_table(3, 4, 2);
    table.flag_solution(1, 1, 1);
    table.gains[(0, 0, 0)] = c64::new(0.9, 0.1);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("round1.g");
    io::write_table(&table, &path).unwrap();
    let back = io::read_table(&path).unwrap();

    assert_eq!(back.name, table.name);
    assert_eq!(back.mode, table.mode);
    assert_eq!(back.solved_from, table.solved_from);
    assert_eq!(back.refant, table.refant);
    assert_eq!(back.antennas, table.antennas);
    assert_eq!(back.spwblocks, table.spwblocks);
    assert_eq!(back.timeblocks.len(), table.timeblocks.len());
    assert_eq!(back.timeblocks[1].range, table.timeblocks[1].range);
    assert!(back.is_flagged(1, 1, 1));
    assert_abs_diff_eq!(back.gains[(0, 0, 0)].re, 0.9);
    assert_abs_diff_eq!(back.gains[(0, 0, 0)].im, 0.1);
    assert_abs_diff_eq!(back.snrs[(2, 3, 1)], 10.0);
}

#[cfg(feature = "plotting")]
#[test]
fn plotting_writes_one_file_per_spwblock() {
    let table = test_table(4, 5, 2);
    let dir = tempfile::tempdir().unwrap();
    let files = plotting::plot_table(&table, dir.path().join("round1")).unwrap();
    assert_eq!(files.len(), 2);
    for f in files {
        assert!(f.exists());
    }
}
