// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Plot a flux-scale estimate: the binned amplitude ratio against
//! deprojected baseline length, with the fitted trend line. The shape of
//! this plot is the diagnostic: flat means a genuine scale offset, a tilt
//! means decoherence.

use std::path::Path;

use plotters::prelude::*;

use super::FluxScaleEstimate;
use crate::solutions::PlotError;

const X_PIXELS: u32 = 1200;
const Y_PIXELS: u32 = 800;

pub fn plot_estimate<P: AsRef<Path>>(
    estimate: &FluxScaleEstimate,
    path: P,
) -> Result<(), PlotError> {
    let root = BitMapBackend::new(path.as_ref(), (X_PIXELS, Y_PIXELS)).into_drawing_area();
    root.fill(&WHITE)
        .map_err(|e| PlotError::Draw(e.to_string()))?;

    let x_max = estimate
        .bins
        .iter()
        .map(|b| b.rdep_klambda)
        .fold(0.0_f64, f64::max)
        * 1.05;
    let (y_lo, y_hi) = estimate.bins.iter().fold((f64::MAX, f64::MIN), |(lo, hi), b| {
        (lo.min(b.ratio - b.err), hi.max(b.ratio + b.err))
    });
    let pad = (y_hi - y_lo).max(0.02) * 0.2;

    let mut chart = ChartBuilder::on(&root)
        .margin(20)
        .caption(
            format!(
                "{} / {}: ratio {:.3}, slope {:.1} sigma",
                estimate.comparison,
                estimate.reference,
                estimate.ratio,
                estimate.slope_significance()
            ),
            ("sans-serif", 28),
        )
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(0.0..x_max, (y_lo - pad)..(y_hi + pad))
        .map_err(|e| PlotError::Draw(e.to_string()))?;
    chart
        .configure_mesh()
        .x_desc("deprojected baseline [klambda]")
        .y_desc("amplitude ratio")
        .draw()
        .map_err(|e| PlotError::Draw(e.to_string()))?;

    // Error bars and bin points.
    chart
        .draw_series(estimate.bins.iter().map(|b| {
            ErrorBar::new_vertical(
                b.rdep_klambda,
                b.ratio - b.err,
                b.ratio,
                b.ratio + b.err,
                BLUE.filled(),
                6,
            )
        }))
        .map_err(|e| PlotError::Draw(e.to_string()))?;

    // The weighted-mean ratio and the fitted trend.
    chart
        .draw_series(LineSeries::new(
            [(0.0, estimate.ratio), (x_max, estimate.ratio)],
            BLACK.mix(0.4),
        ))
        .map_err(|e| PlotError::Draw(e.to_string()))?;
    let trend = |x: f64| {
        estimate.ratio + estimate.slope_per_klambda * (x - x_max / 2.0)
    };
    chart
        .draw_series(LineSeries::new(
            [(0.0, trend(0.0)), (x_max, trend(x_max))],
            RED.filled(),
        ))
        .map_err(|e| PlotError::Draw(e.to_string()))?;

    root.present().map_err(|e| PlotError::Draw(e.to_string()))?;
    Ok(())
}
