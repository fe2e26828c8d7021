// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The pipeline context: run-wide bookkeeping that every stage reads and
//! extends. There are no implicit globals; anything a stage wants to leave
//! behind for later stages (or for the operator) goes through here.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::align::AlignmentReport;
use crate::fluxscale::FluxScaleEstimate;
use crate::obs::io::{write_dataset, WriteDatasetError};
use crate::obs::VisDataset;
use crate::selfcal::RoundRecord;
use crate::solutions::io::write_table;
use crate::solutions::{GainTable, WriteSolutionsError};

/// Run-wide state carried through every pipeline stage.
#[derive(Debug, Default)]
pub struct PipelineContext {
    /// Where checkpoints and reports land. `None` keeps everything in
    /// memory (tests, dry runs).
    pub run_dir: Option<PathBuf>,

    /// The refinement generation currently executing (0-based).
    pub generation: usize,

    /// Every self-cal round run so far, across all stages.
    pub round_records: Vec<RoundRecord>,

    /// Every flux-scale estimate measured so far. Generation N+1's input
    /// scales come from here.
    pub flux_history: Vec<FluxScaleEstimate>,

    /// Every alignment measurement made so far.
    pub alignment_reports: Vec<AlignmentReport>,
}

impl PipelineContext {
    pub fn new() -> PipelineContext {
        PipelineContext::default()
    }

    pub fn with_run_dir<P: AsRef<Path>>(run_dir: P) -> std::io::Result<PipelineContext> {
        std::fs::create_dir_all(&run_dir)?;
        Ok(PipelineContext {
            run_dir: Some(run_dir.as_ref().to_path_buf()),
            ..Default::default()
        })
    }

    /// Persist a dataset checkpoint, if a run directory is configured.
    /// Every stage boundary is restartable from these.
    pub fn checkpoint_dataset(
        &self,
        ds: &VisDataset,
    ) -> Result<Option<PathBuf>, WriteDatasetError> {
        let Some(dir) = &self.run_dir else {
            return Ok(None);
        };
        let path = dir.join(format!("{}.vis", ds.name));
        write_dataset(ds, &path)?;
        debug!("checkpointed {} -> {}", ds.name, path.display());
        Ok(Some(path))
    }

    /// Persist a gain table alongside the dataset checkpoints.
    pub fn checkpoint_table(
        &self,
        table: &GainTable,
    ) -> Result<Option<PathBuf>, WriteSolutionsError> {
        let Some(dir) = &self.run_dir else {
            return Ok(None);
        };
        let path = dir.join(format!("{}.gains", table.name));
        write_table(table, &path)?;
        debug!("checkpointed table {} -> {}", table.name, path.display());
        Ok(Some(path))
    }

    /// Write the accumulated round/flux/alignment records as a JSON report.
    pub fn write_report(&self) -> std::io::Result<Option<PathBuf>> {
        let Some(dir) = &self.run_dir else {
            return Ok(None);
        };
        let path = dir.join("pipeline_report.json");
        let report = serde_json::json!({
            "generation": self.generation,
            "rounds": self.round_records,
            "flux_history": self.flux_history,
            "alignment": self.alignment_reports,
        });
        serde_json::to_writer_pretty(BufWriter::new(File::create(&path)?), &report)?;
        info!("wrote pipeline report to {}", path.display());
        Ok(Some(path))
    }
}
