//! Configuration for a variant-calling run.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Object store holding inputs, intermediates and outputs
    pub storage: StorageConfig,

    /// Run identity and inputs
    pub run: RunConfig,

    /// External tool command lines
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Processing configuration
    #[serde(default)]
    pub processing: ProcessingConfig,
}

/// Object store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Bucket name. For a local store this is only a logical name used in keys.
    pub bucket: String,

    /// Local filesystem directory standing in for the bucket.
    /// If set, objects are read and written there instead of S3.
    #[serde(default)]
    pub local_path: Option<String>,

    /// AWS region (defaults to the environment)
    #[serde(default)]
    pub region: Option<String>,

    /// Custom S3 endpoint (for LocalStack, MinIO, etc.)
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

/// Run identity and inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Identifier namespacing every temporary artifact of the run
    pub run_id: String,

    /// Path (local) of the chunk manifest listing FASTA and FASTQ chunks
    pub chunk_manifest: PathBuf,

    /// Key prefix for temporary artifacts
    #[serde(default = "default_tmp_prefix")]
    pub tmp_prefix: String,

    /// Sample name used in artifact file names
    #[serde(default = "default_base_name")]
    pub base_name: String,

    /// Mismatch tolerance passed to the index-correction tool
    #[serde(default)]
    pub tolerance: u32,

    /// Only reduce reference chunks with ids in this inclusive range
    #[serde(default)]
    pub fasta_chunk_range: Option<[u32; 2]>,
}

/// Command line of one external tool.
///
/// Arguments may contain `{name}` placeholders filled in per invocation. An
/// argument that is exactly `{name}` may expand to several arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Exit codes treated as success
    #[serde(default = "default_success_codes")]
    pub success_codes: Vec<i32>,
}

impl ToolSpec {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            success_codes: default_success_codes(),
        }
    }

    pub fn with_success_codes(mut self, codes: &[i32]) -> Self {
        self.success_codes = codes.to_vec();
        self
    }
}

/// External tools used by each stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Thread count hint passed to tools (null = num CPUs)
    #[serde(default)]
    pub threads: Option<usize>,

    /// Reference indexer; writes `{output_stem}.gem`
    #[serde(default = "default_indexer")]
    pub indexer: ToolSpec,

    /// Aligner and filter; writes `<base>_map.index.txt` and
    /// `<base>_filt_wline_no.map` into its working directory
    #[serde(default = "default_aligner")]
    pub aligner: ToolSpec,

    /// Merges every alignment index of one read chunk; output on stdout
    #[serde(default = "default_index_merge")]
    pub index_merge: ToolSpec,

    /// Filters the merged index into `{output}`
    #[serde(default = "default_index_filter")]
    pub index_filter: ToolSpec,

    /// Applies the corrected index to a filtered map; writes
    /// `<map stem>_corrected.map`
    #[serde(default = "default_index_apply")]
    pub index_apply: ToolSpec,

    /// Pileup generator; writes `{corrected_map}.mpileup`
    #[serde(default = "default_pileup")]
    pub pileup: ToolSpec,

    /// Streaming reducer; rows on stdin, merged rows on stdout
    #[serde(default = "default_reducer")]
    pub reducer: ToolSpec,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            threads: None,
            indexer: default_indexer(),
            aligner: default_aligner(),
            index_merge: default_index_merge(),
            index_filter: default_index_filter(),
            index_apply: default_index_apply(),
            pileup: default_pileup(),
            reducer: default_reducer(),
        }
    }
}

impl ToolsConfig {
    /// Thread hint, resolved against the host's parallelism.
    pub fn threads(&self) -> usize {
        self.threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    fn all(&self) -> [(&'static str, &ToolSpec); 7] {
        [
            ("indexer", &self.indexer),
            ("aligner", &self.aligner),
            ("index_merge", &self.index_merge),
            ("index_filter", &self.index_filter),
            ("index_apply", &self.index_apply),
            ("pileup", &self.pileup),
            ("reducer", &self.reducer),
        ]
    }
}

/// Processing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Concurrent chunk stage invocations
    #[serde(default = "default_concurrency")]
    pub map_concurrency: usize,

    /// Concurrent reduce workers (across all partitions)
    #[serde(default = "default_concurrency")]
    pub reduce_concurrency: usize,

    /// Maximum records per multi-key partition range
    #[serde(default = "default_partition_budget")]
    pub partition_budget: u64,

    /// Zero-based column holding the record key
    #[serde(default = "default_key_column")]
    pub key_column: usize,

    /// Count keys from the sidecars written by the pileup stage instead of
    /// querying every pileup
    #[serde(default = "default_true")]
    pub use_key_sidecars: bool,

    /// Parent directory for per-task working directories (null = system temp)
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,

    /// Number of Tokio worker threads
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Enable metrics reporting
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Metrics reporting interval in seconds
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,

    /// Optional path to save metrics JSON after run completes
    #[serde(default)]
    pub metrics_output_path: Option<String>,

    /// Optional path to save per-task telemetry JSON after run completes
    #[serde(default)]
    pub telemetry_output_path: Option<String>,

    /// Also store the telemetry JSON under the run prefix
    #[serde(default = "default_true")]
    pub upload_telemetry: bool,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            map_concurrency: default_concurrency(),
            reduce_concurrency: default_concurrency(),
            partition_budget: default_partition_budget(),
            key_column: default_key_column(),
            use_key_sidecars: true,
            scratch_dir: None,
            worker_threads: None,
            enable_metrics: true,
            metrics_interval_secs: default_metrics_interval(),
            metrics_output_path: None,
            telemetry_output_path: None,
            upload_telemetry: true,
        }
    }
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let mut config: Config = match ext {
            "yaml" | "yml" => serde_yaml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => {
                // Try YAML first (it's a superset of JSON)
                serde_yaml::from_str(&contents)?
            }
        };

        // A relative manifest path is relative to the config file
        if config.run.chunk_manifest.is_relative() {
            if let Some(parent) = path.parent() {
                config.run.chunk_manifest = parent.join(&config.run.chunk_manifest);
            }
        }
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        Ok(config)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.storage.bucket.is_empty() {
            anyhow::bail!("storage.bucket must not be empty");
        }
        if self.storage.bucket.contains('/') {
            anyhow::bail!("storage.bucket must be a bucket name, not a path");
        }
        if self.storage.local_path.is_some() && self.storage.endpoint_url.is_some() {
            anyhow::bail!("Cannot specify both storage.local_path and storage.endpoint_url");
        }

        for (name, value) in [
            ("run.run_id", &self.run.run_id),
            ("run.tmp_prefix", &self.run.tmp_prefix),
            ("run.base_name", &self.run.base_name),
        ] {
            if value.trim_matches('/').is_empty() {
                anyhow::bail!("{} must not be empty", name);
            }
        }
        if self.run.run_id.contains('/') || self.run.base_name.contains('/') {
            anyhow::bail!("run.run_id and run.base_name must not contain '/'");
        }
        if let Some([first, last]) = self.run.fasta_chunk_range {
            if first > last {
                anyhow::bail!("run.fasta_chunk_range must be [first, last] with first <= last");
            }
        }

        for (name, tool) in self.tools.all() {
            if tool.program.is_empty() {
                anyhow::bail!("tools.{}.program must not be empty", name);
            }
            if tool.success_codes.is_empty() {
                anyhow::bail!("tools.{}.success_codes must not be empty", name);
            }
        }
        if self.tools.threads == Some(0) {
            anyhow::bail!("tools.threads must be > 0");
        }

        if self.processing.map_concurrency == 0 || self.processing.reduce_concurrency == 0 {
            anyhow::bail!("Concurrency must be > 0");
        }
        if self.processing.partition_budget == 0 {
            anyhow::bail!("Partition budget must be > 0");
        }
        if self.processing.enable_metrics && self.processing.metrics_interval_secs == 0 {
            anyhow::bail!("Metrics interval must be > 0");
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_tmp_prefix() -> String { "tmp".to_string() }
fn default_base_name() -> String { "sample".to_string() }
fn default_success_codes() -> Vec<i32> { vec![0] }
fn default_concurrency() -> usize { 64 }
fn default_partition_budget() -> u64 { crate::pipeline::DEFAULT_BUDGET }
fn default_key_column() -> usize { crate::index::DEFAULT_KEY_COLUMN }
fn default_true() -> bool { true }
fn default_metrics_interval() -> u64 { 10 }

fn default_indexer() -> ToolSpec {
    // gem-indexer exits with 1 on success
    ToolSpec::new(
        "gem-indexer",
        &["--input", "{fasta}", "--threads", "{threads}", "-o", "{output_stem}"],
    )
    .with_success_codes(&[1])
}

fn default_aligner() -> ToolSpec {
    ToolSpec::new(
        "/function/bin/map_index_and_filter_map_file_cmd_awsruntime.sh",
        &["{gem_index}", "{fastq}", "not-used", "{base_name}", "s3", "single-end"],
    )
}

fn default_index_merge() -> ToolSpec {
    ToolSpec::new(
        "/function/bin/binary_reducer.sh",
        &["/function/bin/merge_gem_alignment_metrics.sh", "4", "{inputs}"],
    )
}

fn default_index_filter() -> ToolSpec {
    ToolSpec::new("/function/bin/filter_merged_index.sh", &["{input}", "{output}"])
}

fn default_index_apply() -> ToolSpec {
    ToolSpec::new(
        "/function/bin/map_file_index_correction.sh",
        &["{corrected_index}", "{filtered_map}", "{tolerance}"],
    )
}

fn default_pileup() -> ToolSpec {
    ToolSpec::new("/function/bin/gempileup_run.sh", &["{corrected_map}", "{fasta}"])
}

fn default_reducer() -> ToolSpec {
    ToolSpec::new(
        "bash",
        &["/function/bin/mpileup_merge_reducev3.sh", "/function/bin/", "75%"],
    )
}
