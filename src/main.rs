//! Variant-calling map-reduce CLI
//!
//! Runs the chunked alignment, pileup and merge pipeline against an object store.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use varcall_mapreduce::{build_runtime, clean_run, plan_partitions, run_pipeline, Config};

#[derive(Parser)]
#[command(name = "varcall")]
#[command(about = "Orchestrate chunked variant calling over an object store", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Override map and reduce concurrency
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline (default if no command specified)
    Run,

    /// Compute partition ranges for the stored pileups without reducing
    Plan,

    /// Validate configuration and chunk manifest
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },

    /// Delete the run's temporary artifacts
    Clean {
        /// Also delete cached reference indexes shared across runs
        #[arg(long)]
        indexes: bool,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        None | Some(Commands::Run) => {
            run_command(cli.config, cli.concurrency)?;
        }

        Some(Commands::Plan) => {
            plan_command(cli.config)?;
        }

        Some(Commands::Validate) => {
            validate_command(cli.config)?;
        }

        Some(Commands::GenerateConfig { output }) => {
            generate_config_command(output)?;
        }

        Some(Commands::Clean { indexes }) => {
            clean_command(cli.config, indexes)?;
        }
    }

    Ok(())
}

fn run_command(config_path: PathBuf, concurrency: Option<usize>) -> Result<()> {
    let mut config = Config::from_file(&config_path)?;

    // Apply overrides
    if let Some(c) = concurrency {
        config.processing.map_concurrency = c;
        config.processing.reduce_concurrency = c;
    }

    config.validate()?;

    let runtime = build_runtime(config.processing.worker_threads)?;
    runtime.block_on(async { run_pipeline(config).await })?;

    Ok(())
}

fn plan_command(config_path: PathBuf) -> Result<()> {
    let config = Config::from_file(&config_path)?;
    let budget = config.processing.partition_budget;
    let runtime = build_runtime(None)?;
    let jobs = runtime.block_on(plan_partitions(config))?;

    println!("\n=== Partition Plan (budget {}) ===", budget);
    for job in &jobs {
        println!(
            "Reference chunk {}: {} pileups, {} ranges",
            job.fasta_id,
            job.sources.len(),
            job.plan.len()
        );
        for (range, count) in job.plan.ranges().iter().zip(&job.plan.counts) {
            println!("  {} {} records", range, count);
        }
    }
    println!("=====================\n");
    Ok(())
}

fn validate_command(config_path: PathBuf) -> Result<()> {
    let config = Config::from_file(&config_path)?;
    config.validate()?;
    let manifest = varcall_mapreduce::ChunkManifest::from_file(&config.run.chunk_manifest)?;
    println!(
        "Configuration is valid ({} reference chunks, {} read chunks)",
        manifest.fasta.len(),
        manifest.fastq.len()
    );
    Ok(())
}

fn clean_command(config_path: PathBuf, indexes: bool) -> Result<()> {
    let config = Config::from_file(&config_path)?;
    let runtime = build_runtime(None)?;
    let deleted = runtime.block_on(clean_run(config, indexes))?;
    println!("Deleted {} objects", deleted);
    Ok(())
}

fn generate_config_command(output: PathBuf) -> Result<()> {
    // Generate a commented YAML config
    let yaml = r#"# Variant-calling map-reduce configuration

# === STORAGE: Where inputs, intermediates and outputs live ===
storage:
  # Bucket holding every artifact of the run
  bucket: "varcall-data"

  # AWS region
  region: "us-east-1"

  # Custom S3 endpoint (for LocalStack, MinIO, etc.)
  # endpoint_url: "http://localhost:4566"

  # Use a local directory as the bucket instead of S3
  # local_path: "/tmp/varcall-bucket"

# === RUN: Identity and inputs of this run ===
run:
  # Intermediates go under <tmp_prefix>/<run_id>/
  run_id: "run-001"
  tmp_prefix: "tmp"

  # Prefix of per-pair artifact names
  base_name: "sample"

  # Reference (fasta) and read (fastq) chunks, YAML or JSON;
  # relative paths are resolved against this file
  chunk_manifest: "chunks.yaml"

  # Passed to the index correction tool
  tolerance: 0

  # Only reduce reference chunks in this inclusive id range
  # fasta_chunk_range: [0, 9]

# === TOOLS: External programs ===
# Each tool is a program plus arguments. Placeholders such as {fasta} and
# {threads} are substituted per task; a lone {inputs} expands to one argument
# per input file.
tools:
  # Thread hint passed to tools (null = num CPUs)
  # threads: 8

  indexer:
    program: "gem-indexer"
    args: ["--input", "{fasta}", "--threads", "{threads}", "-o", "{output_stem}"]
    # The indexer exits with 1 on success
    success_codes: [1]

  reducer:
    program: "bash"
    args: ["/function/bin/mpileup_merge_reducev3.sh", "/function/bin/", "75%"]

# === PROCESSING: Performance tuning ===
processing:
  # Concurrent map-stage tasks
  map_concurrency: 64

  # Concurrent reduce workers across all reference chunks
  reduce_concurrency: 64

  # Maximum records per multi-key reduce range
  partition_budget: 20000000

  # Zero-based column holding the record key (mpileup position)
  key_column: 1

  # Balance from the key-count sidecars written next to each pileup
  use_key_sidecars: true

  # Parent directory for per-task working directories (null = system temp)
  # scratch_dir: "/mnt/scratch"

  # Tokio async worker threads (null = num CPUs)
  # worker_threads: 64

  # Print throughput metrics during processing
  enable_metrics: true

  # Metrics reporting interval in seconds
  metrics_interval_secs: 10

  # metrics_output_path: "metrics.json"
  # telemetry_output_path: "telemetry.json"

  # Also store task telemetry at <tmp_prefix>/<run_id>/telemetry.json
  upload_telemetry: true
"#;

    std::fs::write(&output, yaml)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_default() {
        // No subcommand - should default to Run
        let cli = Cli::try_parse_from(["varcall"]);
        assert!(cli.is_ok());
        assert!(cli.unwrap().command.is_none());
    }

    #[test]
    fn test_cli_parse_with_config() {
        let cli = Cli::try_parse_from(["varcall", "-c", "other.yaml"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("other.yaml"));
    }

    #[test]
    fn test_cli_parse_clean_indexes() {
        let cli = Cli::try_parse_from(["varcall", "clean", "--indexes"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Clean { indexes: true })));
    }

    #[test]
    fn test_generated_config_parses() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        generate_config_command(path.clone()).unwrap();

        let config = Config::from_file(&path).unwrap();
        config.validate().unwrap();
        assert_eq!(config.tools.indexer.success_codes, vec![1]);
        assert_eq!(config.run.chunk_manifest, dir.path().join("chunks.yaml"));
    }
}
