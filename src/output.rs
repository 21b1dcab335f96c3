use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use csv::Writer;
use serde::Serialize;
use tracing::info;

use crate::monte_carlo::{summarize_batch, IterationRecord, RngMode, ToyBatch, ToySummary};
use crate::template::Binning;
use crate::FactoryError;

pub const OUTPUT_SCHEMA_VERSION: &str = "1.0.0";

/// Consumer of a finished batch of pseudo-experiments.
pub trait ExperimentSink {
    fn consume(&mut self, batch: &ToyBatch) -> Result<(), FactoryError>;
}

#[derive(Debug, Default)]
pub struct MemorySink {
    pub batches: Vec<ToyBatch>,
}

impl ExperimentSink for MemorySink {
    fn consume(&mut self, batch: &ToyBatch) -> Result<(), FactoryError> {
        self.batches.push(batch.clone());
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct ExperimentRow<'a> {
    experiment: &'a str,
    bin: usize,
    low_edge: f64,
    high_edge: f64,
    counts: u64,
}

#[derive(Debug, Serialize)]
struct Manifest<'a> {
    schema_version: &'static str,
    seed: u64,
    rng_mode: RngMode,
    binning: Binning,
    summary: ToySummary,
    iterations: &'a [IterationRecord],
}

/// Writes `experiments.csv` and `manifest.json` into a directory.
#[derive(Debug, Clone)]
pub struct CsvSink {
    output_dir: PathBuf,
}

impl CsvSink {
    pub fn new(output_dir: impl Into<PathBuf>) -> Result<Self, FactoryError> {
        let output_dir = output_dir.into();
        fs::create_dir_all(&output_dir)?;
        Ok(Self { output_dir })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn write_experiments(&self, path: &Path, batch: &ToyBatch) -> Result<(), FactoryError> {
        let mut writer = Writer::from_path(path)?;
        for experiment in &batch.experiments {
            for (bin, &counts) in experiment.counts.iter().enumerate() {
                writer.serialize(ExperimentRow {
                    experiment: &experiment.name,
                    bin,
                    low_edge: experiment.binning.low_edge(bin),
                    high_edge: experiment.binning.high_edge(bin),
                    counts,
                })?;
            }
        }
        writer.flush()?;
        Ok(())
    }
}

impl ExperimentSink for CsvSink {
    fn consume(&mut self, batch: &ToyBatch) -> Result<(), FactoryError> {
        let csv_path = self.output_dir.join("experiments.csv");
        self.write_experiments(&csv_path, batch)?;

        let manifest = Manifest {
            schema_version: OUTPUT_SCHEMA_VERSION,
            seed: batch.seed,
            rng_mode: batch.rng_mode,
            binning: batch.binning,
            summary: summarize_batch(batch),
            iterations: &batch.iterations,
        };
        fs::write(
            self.output_dir.join("manifest.json"),
            serde_json::to_string_pretty(&manifest)?,
        )?;

        info!(
            n_experiments = batch.experiments.len(),
            path = %csv_path.display(),
            "experiments written"
        );
        Ok(())
    }
}

/// Create a new `<root>/<label>-<UTC timestamp>` run directory. When the name
/// is taken, `.1`, `.2`, ... is appended until `create_dir` succeeds.
pub fn create_run_dir(root: &Path, label: &str) -> Result<PathBuf, FactoryError> {
    fs::create_dir_all(root)?;
    let stem = format!("{label}-{}", Utc::now().format("%Y%m%dT%H%M%SZ"));

    let mut attempt = 0_u32;
    loop {
        let candidate = match attempt {
            0 => root.join(&stem),
            n => root.join(format!("{stem}.{n}")),
        };
        match fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => attempt += 1,
            Err(err) => return Err(err.into()),
        }
    }
}
