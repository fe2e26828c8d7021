// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Code to plot gain tables: per-antenna phase (and amplitude) against time,
//! one image per spw block. These are the diagnostics an operator inspects
//! between self-cal rounds.

use std::path::{Path, PathBuf};

use plotters::coord::Shift;
use plotters::prelude::*;

use super::{CalMode, GainTable, PlotError};

const X_PIXELS: u32 = 1600;
const Y_PIXELS: u32 = 900;

/// Plot a gain table. One output image per spw block, named
/// `<stem>_spw<block>.png`. Returns the files written.
pub fn plot_table<P: AsRef<Path>>(
    table: &GainTable,
    stem: P,
) -> Result<Vec<PathBuf>, PlotError> {
    let mut outputs = vec![];
    for spwblock in &table.spwblocks {
        let mut path = stem.as_ref().to_path_buf();
        path.set_extension("");
        let path = PathBuf::from(format!(
            "{}_spw{}.png",
            path.display(),
            spwblock.index
        ));
        draw_spwblock(table, spwblock.index, &path)?;
        outputs.push(path);
    }
    Ok(outputs)
}

fn draw_spwblock(table: &GainTable, s: usize, path: &Path) -> Result<(), PlotError> {
    let root = BitMapBackend::new(path, (X_PIXELS, Y_PIXELS)).into_drawing_area();
    root.fill(&WHITE)
        .map_err(|e| PlotError::Draw(e.to_string()))?;
    let root = root
        .titled(
            &format!("{} (spw block {s})", table.name),
            ("sans-serif", 30),
        )
        .map_err(|e| PlotError::Draw(e.to_string()))?;

    let num_ants = table.antennas.len();
    let cols = 4.min(num_ants);
    let rows = num_ants.div_ceil(cols);
    let areas = root.split_evenly((rows, cols));

    let t0 = table.timeblocks.first().median;
    let t_max = (table.timeblocks.last().median - t0).to_seconds() / 60.0;

    for (a, area) in areas.iter().enumerate().take(num_ants) {
        draw_antenna(table, a, s, t0, t_max, area)?;
    }
    root.present().map_err(|e| PlotError::Draw(e.to_string()))?;
    Ok(())
}

fn draw_antenna(
    table: &GainTable,
    a: usize,
    s: usize,
    t0: hifitime::Epoch,
    t_max: f64,
    area: &DrawingArea<BitMapBackend, Shift>,
) -> Result<(), PlotError> {
    let mut chart = ChartBuilder::on(area)
        .margin(8)
        .caption(table.antennas[a].label(), ("sans-serif", 16))
        .x_label_area_size(18)
        .y_label_area_size(30)
        .build_cartesian_2d(-1.0..t_max + 1.0, -200.0..200.0)
        .map_err(|e| PlotError::Draw(e.to_string()))?;
    chart
        .configure_mesh()
        .disable_mesh()
        .draw()
        .map_err(|e| PlotError::Draw(e.to_string()))?;

    // Phases in degrees.
    let phases: Vec<(f64, f64)> = table
        .timeblocks
        .iter()
        .enumerate()
        .filter(|&(t, _)| !table.is_flagged(t, a, s))
        .map(|(t, tb)| {
            (
                (tb.median - t0).to_seconds() / 60.0,
                table.gains[(t, a, s)].arg().to_degrees(),
            )
        })
        .collect();
    chart
        .draw_series(
            phases
                .iter()
                .map(|&(x, y)| Circle::new((x, y), 3, BLUE.filled())),
        )
        .map_err(|e| PlotError::Draw(e.to_string()))?;

    // Amplitudes too when the table carries them, scaled onto the same axes
    // (1.0 maps to 100).
    if table.mode == CalMode::AmpPhase {
        let amps: Vec<(f64, f64)> = table
            .timeblocks
            .iter()
            .enumerate()
            .filter(|&(t, _)| !table.is_flagged(t, a, s))
            .map(|(t, tb)| {
                (
                    (tb.median - t0).to_seconds() / 60.0,
                    table.gains[(t, a, s)].norm() * 100.0,
                )
            })
            .collect();
        chart
            .draw_series(
                amps.iter()
                    .map(|&(x, y)| Circle::new((x, y), 3, RED.filled())),
            )
            .map_err(|e| PlotError::Draw(e.to_string()))?;
    }
    Ok(())
}
