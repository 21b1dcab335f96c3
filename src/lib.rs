//! toyfactory - pseudo-experiment generation from binned templates
//!
//! Builds a composite model from yield-normalized 1-D templates, applies
//! randomized shape distortions to emulate systematic uncertainty, and draws
//! Poisson-fluctuated pseudo-experiments from the result. Every random draw
//! in a run comes from one explicitly threaded, deterministically seeded RNG.

pub mod component;
pub mod config;
pub mod distortion;
pub mod experiment;
pub mod model;
pub mod monte_carlo;
pub mod output;
pub mod store;
pub mod template;

use thiserror::Error;

pub use component::{load_components, ComponentSource, ComponentSpec};
pub use config::FactoryConfig;
pub use distortion::{
    DistortionChoice, DistortionEngine, DistortionMode, DistortionReport, DistortionRule, Scope,
};
pub use experiment::{generate_experiment, rebin_counts, PseudoExperiment};
pub use model::{build_model, NormalizationWindow};
pub use monte_carlo::{
    run_configured, run_monte_carlo, summarize_batch, RngMode, ToyBatch, ToyRunConfig,
};
pub use output::{CsvSink, ExperimentSink, MemorySink};
pub use store::{CachedStore, JsonTemplateStore, MemoryStore, StoreError, TemplateStore};
pub use template::{Binning, Template};

#[derive(Debug, Error)]
pub enum FactoryError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("could not resolve object '{object}' at '{path}'")]
    Lookup { path: String, object: String },
    #[error("numeric error: {0}")]
    Numeric(String),
    #[error("{context} binning mismatch: expected {expected}, got {got}")]
    BinningMismatch {
        context: &'static str,
        expected: String,
        got: String,
    },
    #[error("template store error: {0}")]
    Store(#[from] StoreError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
