use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::component::{load_components, ComponentSpec};
use crate::config::FactoryConfig;
use crate::distortion::{DistortionEngine, DistortionReport};
use crate::experiment::{generate_from_components, rebin_counts, rebinned, PseudoExperiment};
use crate::store::{CachedStore, TemplateStore};
use crate::template::Binning;
use crate::FactoryError;

pub const DEFAULT_EXPERIMENTS: usize = 100;

/// How the RNG stream is laid out over iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RngMode {
    /// One stream for the whole run; iteration `i` depends on all earlier draws.
    #[default]
    Shared,
    /// Iteration `i` uses stream `i` of the seed, independent of the others.
    PerIteration,
}

#[derive(Debug, Clone)]
pub struct ToyRunConfig {
    pub n_experiments: usize,
    pub seed: u64,
    pub rng_mode: RngMode,
    pub rebin: usize,
    pub name: String,
}

impl Default for ToyRunConfig {
    fn default() -> Self {
        Self {
            n_experiments: DEFAULT_EXPERIMENTS,
            seed: 0,
            rng_mode: RngMode::Shared,
            rebin: 1,
            name: "h".to_string(),
        }
    }
}

impl ToyRunConfig {
    pub fn from_config(config: &FactoryConfig) -> Self {
        Self {
            n_experiments: config.number_of_experiments,
            seed: config.seed,
            rng_mode: config.rng_mode,
            rebin: config.output.rebin,
            name: config.output.target().1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IterationRecord {
    pub index: usize,
    pub model_integral: f64,
    pub distortions: DistortionReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToyBatch {
    pub seed: u64,
    pub rng_mode: RngMode,
    pub binning: Binning,
    pub experiments: Vec<PseudoExperiment>,
    pub iterations: Vec<IterationRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToySummary {
    pub n_experiments: usize,
    pub seed: u64,
    pub mean_total_counts: f64,
    pub min_total_counts: u64,
    pub max_total_counts: u64,
    pub mean_model_integral: f64,
    pub undistorted_iterations: usize,
    pub warnings: usize,
}

/// RNG for iteration `index` under [`RngMode::PerIteration`].
pub fn iteration_rng(seed: u64, index: usize) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(index as u64);
    rng
}

/// Generate `config.n_experiments` pseudo-experiments. Each iteration works
/// on a fresh deep copy of `base`, distorts it, rebuilds the model and
/// draws one experiment.
pub fn run_monte_carlo<S: TemplateStore + ?Sized>(
    config: &ToyRunConfig,
    base: &[ComponentSpec],
    engine: &DistortionEngine,
    store: &mut S,
) -> Result<ToyBatch, FactoryError> {
    let first = base
        .first()
        .ok_or_else(|| FactoryError::Config("no components configured".to_string()))?;
    let model_binning = *first.template.binning();
    let binning = if config.rebin > 1 {
        rebinned(&model_binning, config.rebin)?
    } else {
        model_binning
    };

    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let mut experiments = Vec::with_capacity(config.n_experiments);
    let mut iterations = Vec::with_capacity(config.n_experiments);

    info!(
        n_experiments = config.n_experiments,
        seed = config.seed,
        "generating pseudo-experiments"
    );
    if engine.is_empty() {
        info!("no distortions configured, sampling the base model only");
    }
    for index in 0..config.n_experiments {
        if config.rng_mode == RngMode::PerIteration {
            rng = iteration_rng(config.seed, index);
        }

        let mut working = base.to_vec();
        let distortions = engine.apply(&mut working, store, &mut rng)?;
        let (model, mut experiment) =
            generate_from_components(&working, &mut rng, index, &config.name)?;
        if config.rebin > 1 {
            experiment = rebin_counts(&experiment, config.rebin)?;
        }

        debug!(
            iteration = index,
            total = experiment.total(),
            model_integral = model.integral(),
            "pseudo-experiment added to collection"
        );
        iterations.push(IterationRecord {
            index,
            model_integral: model.integral(),
            distortions,
        });
        experiments.push(experiment);
    }
    info!(n_experiments = experiments.len(), "done");

    Ok(ToyBatch {
        seed: config.seed,
        rng_mode: config.rng_mode,
        binning,
        experiments,
        iterations,
    })
}

/// Validate `config`, load the base components through a memoizing store
/// and run the full generation.
pub fn run_configured<S: TemplateStore>(
    config: &FactoryConfig,
    store: S,
) -> Result<ToyBatch, FactoryError> {
    config.validate()?;
    let binning = config.output_binning()?;
    let mut store = CachedStore::new(store);

    debug!("getting base component list from config");
    let base = load_components(config, &mut store, &binning)?;
    let engine = DistortionEngine::from_config(config)?;
    run_monte_carlo(&ToyRunConfig::from_config(config), &base, &engine, &mut store)
}

pub fn summarize_batch(batch: &ToyBatch) -> ToySummary {
    let totals = batch
        .experiments
        .iter()
        .map(PseudoExperiment::total)
        .collect::<Vec<_>>();
    let n = batch.experiments.len();

    let mean = |sum: f64| if n == 0 { 0.0 } else { sum / n as f64 };

    ToySummary {
        n_experiments: n,
        seed: batch.seed,
        mean_total_counts: mean(totals.iter().map(|&t| t as f64).sum()),
        min_total_counts: totals.iter().copied().min().unwrap_or(0),
        max_total_counts: totals.iter().copied().max().unwrap_or(0),
        mean_model_integral: mean(batch.iterations.iter().map(|r| r.model_integral).sum()),
        undistorted_iterations: batch
            .iterations
            .iter()
            .filter(|r| !r.distortions.matched_any)
            .count(),
        warnings: batch
            .iterations
            .iter()
            .map(|r| r.distortions.warnings.len())
            .sum(),
    }
}
