use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use toyfactory::output::create_run_dir;
use toyfactory::{
    monte_carlo::run_configured, CsvSink, ExperimentSink, FactoryConfig, JsonTemplateStore,
};

#[derive(Debug, Parser)]
#[command(name = "toy_factory")]
#[command(about = "Generate distorted pseudo-experiments from binned templates")]
struct Cli {
    /// JSON configuration file.
    config: PathBuf,

    /// Output directory; defaults to a timestamped directory under the
    /// configured output path.
    #[arg(long)]
    outdir: Option<PathBuf>,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    experiments: Option<usize>,

    /// Directory that template-store paths are resolved against.
    #[arg(long, default_value = ".")]
    store_dir: PathBuf,
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = FactoryConfig::from_json_file(&cli.config)
        .with_context(|| format!("failed to load config: {}", cli.config.display()))?;
    if let Some(seed) = cli.seed {
        config.seed = seed;
    }
    if let Some(n) = cli.experiments {
        config.number_of_experiments = n;
    }
    config.validate().context("invalid configuration")?;
    init_tracing(&config.logging);

    let binning = config.output_binning()?;
    let store = JsonTemplateStore::new(&cli.store_dir, binning);
    let batch = run_configured(&config, store).context("pseudo-experiment generation failed")?;

    let output_dir = match cli.outdir {
        Some(dir) => dir,
        None => {
            let (root, name) = config.output.target();
            create_run_dir(&root, &name).context("failed to create output directory")?
        }
    };
    let mut sink = CsvSink::new(&output_dir)?;
    sink.consume(&batch)
        .with_context(|| format!("failed to write output to {}", output_dir.display()))?;

    println!("Output directory: {}", output_dir.display());
    Ok(())
}
