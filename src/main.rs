//! Equi7 re-tiling CLI
//!
//! Re-tiles Equi7 rasters onto a lat/lon grid and publishes them to S3-compatible storage.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use equi7_retile::{build_runtime, run_pipeline, Catalog, Config};

#[derive(Parser)]
#[command(name = "equi7-retile")]
#[command(about = "Re-tile Equi7 rasters onto a lat/lon grid", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Override concurrency level
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    /// Override the catalog path
    #[arg(long, global = true)]
    catalog: Option<String>,

    /// Seed the task shuffle for a reproducible order
    #[arg(long, global = true)]
    seed: Option<u64>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the re-tiling batch (default if no command specified)
    Run,

    /// Load the catalog and report the work without processing
    Analyze,

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },
}

/// Command-line overrides applied on top of the configuration file.
struct Overrides {
    concurrency: Option<usize>,
    catalog: Option<String>,
    seed: Option<u64>,
}

impl Overrides {
    fn apply(&self, config: &mut Config) {
        if let Some(c) = self.concurrency {
            config.processing.concurrency = c;
        }
        if let Some(ref path) = self.catalog {
            config.catalog.path = path.clone();
        }
        if self.seed.is_some() {
            config.catalog.seed = self.seed;
        }
    }
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();
    let overrides = Overrides {
        concurrency: cli.concurrency,
        catalog: cli.catalog,
        seed: cli.seed,
    };

    match cli.command {
        None | Some(Commands::Run) => {
            run_command(cli.config, &overrides)?;
        }

        Some(Commands::Analyze) => {
            analyze_command(cli.config, &overrides)?;
        }

        Some(Commands::Validate) => {
            validate_command(cli.config)?;
        }

        Some(Commands::GenerateConfig { output }) => {
            generate_config_command(output)?;
        }
    }

    Ok(())
}

fn load_config(config_path: &PathBuf, overrides: &Overrides) -> Result<Config> {
    let mut config = Config::from_file(config_path)?;
    overrides.apply(&mut config);
    config.validate()?;
    Ok(config)
}

fn run_command(config_path: PathBuf, overrides: &Overrides) -> Result<()> {
    let config = load_config(&config_path, overrides)?;

    let runtime = build_runtime(config.processing.worker_threads)?;
    let summary = runtime.block_on(async { run_pipeline(config).await })?;

    if summary.has_failures() {
        anyhow::bail!(
            "{} tasks failed and {} catalog rows were rejected; re-run to retry",
            summary.failed.len(),
            summary.rejected.len()
        );
    }

    Ok(())
}

fn analyze_command(config_path: PathBuf, overrides: &Overrides) -> Result<()> {
    let config = load_config(&config_path, overrides)?;
    let runtime = build_runtime(None)?;

    runtime.block_on(async {
        let mut catalog = Catalog::load(&config.catalog, &config.store).await?;
        catalog.prepare(&config.catalog);

        println!("\n=== Work Analysis ===");
        println!("Catalog: {}", config.catalog.path);
        println!("{}", catalog.summary());

        println!("\n=== Output ===");
        match &config.store.local_path {
            Some(path) => println!("Local directory: {}", path),
            None => println!("Bucket: {} at {}", config.store.bucket, config.store.endpoint_url()),
        }
        println!("Key prefix: {}", config.store.key_prefix);
        println!("Probe URL base: {}/{}", config.store.read_base_url(), config.store.bucket);
        println!("Concurrency: {}", config.processing.concurrency);

        if let Some(task) = catalog.tasks().first() {
            let resolver = equi7_retile::ArtifactResolver::from_config(&config)?;
            let address = resolver.resolve(task);
            let command = equi7_retile::warp::build_warp_command(&config.warp, task, &address.local_path);
            println!("\n=== First task ===");
            println!("Key: {}", address.key);
            println!("URL: {}", address.url);
            println!("Command: {}", command.display());
        }

        println!("=====================\n");

        Ok(())
    })
}

fn validate_command(config_path: PathBuf) -> Result<()> {
    let config = Config::from_file(&config_path)?;
    config.validate()?;
    println!("Configuration is valid");
    Ok(())
}

fn generate_config_command(output: PathBuf) -> Result<()> {
    // Generate a commented YAML config
    let yaml = r#"# Equi7 Re-tiling Pipeline Configuration

# === CATALOG: Which tiles to re-project ===
catalog:
  # GeoJSON, JSON records or Parquet; local path or s3://bucket/key
  path: "equi7_tiles.geojson"

  # Fixed shuffle seed (omit for a fresh order every run)
  # seed: 42

  # Drop rows that resolve to the same output key
  deduplicate: true

# === STORE: Where published tiles go ===
store:
  # S3-compatible endpoint (host:port)
  endpoint: "192.168.49.30:8333"
  bucket: "tmp-global-geomorpho"

  # Credentials (omit to use AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY)
  # access_key: "..."
  # secret_key: "..."

  # Use HTTPS
  secure: false

  # Public base URL used for existence probes (defaults to the endpoint)
  # read_base_url: "http://192.168.49.30:8333"

  # Published keys are {key_prefix}/{TILE}_{equi7 tile}/{file_name}
  key_prefix: "latlon/v6"

  # Publish into a local directory instead of S3
  # local_path: "/data/latlon"

  # Multipart upload above this size (MiB), in parts of this size (MiB)
  multipart_threshold_mb: 64
  multipart_part_size_mb: 16

# === WARP: gdalwarp storage and performance options ===
# CRS, pixel size and extent are fixed and not configurable.
warp:
  gdalwarp_bin: "gdalwarp"
  cache_max_mb: 9216
  block_size: 1024
  compress: "DEFLATE"
  predictor: 2
  num_threads: 8
  sparse_ok: true
  big_tiff: true

# === PROCESSING: Performance tuning ===
processing:
  # Tasks in flight (each runs one gdalwarp process)
  concurrency: 70

  # Tokio async worker threads (null = num CPUs)
  # worker_threads: 16

  # Scratch directory for warp outputs
  work_dir: "/tmp/equi7-retile"

  # Existence probe timeout in seconds
  probe_timeout_secs: 30

  # What to do when a probe cannot tell: fail | treat_as_missing
  probe_failure_policy: fail

  # Print throughput metrics during processing
  enable_metrics: true
  metrics_interval_secs: 30

  # Save final metrics as JSON
  # metrics_output_path: "metrics.json"
"#;

    std::fs::write(&output, yaml)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}
