//! The four map-side stages, each an [`IdempotentTask`].
//!
//! - index build: reference chunk -> `gem/fa<a>.gem`
//! - align and filter: reference index x read chunk -> map index + filtered map
//! - index correction: every map index of one read chunk -> corrected index
//! - pileup: reference chunk + filtered map + corrected index -> pileup + key counts

use super::metrics::Metrics;
use super::task::{IdempotentTask, TaskReport, WorkArea};
use crate::config::Config;
use crate::error::{PipelineError, PipelineResult};
use crate::index::{ChunkRef, KeyCounts, KeyLayout, Stage, StageKey};
use crate::io::{ChunkSource, Storage};
use crate::tool::{ExternalTool, ToolVars};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// External tools used by the map stages.
#[derive(Debug, Clone)]
pub struct StageTools {
    pub indexer: ExternalTool,
    pub aligner: ExternalTool,
    pub index_merge: ExternalTool,
    pub index_filter: ExternalTool,
    pub index_apply: ExternalTool,
    pub pileup: ExternalTool,
}

impl StageTools {
    pub fn from_config(config: &Config) -> Self {
        let tools = &config.tools;
        Self {
            indexer: ExternalTool::new("indexer", tools.indexer.clone()),
            aligner: ExternalTool::new("aligner", tools.aligner.clone()),
            index_merge: ExternalTool::new("index_merge", tools.index_merge.clone()),
            index_filter: ExternalTool::new("index_filter", tools.index_filter.clone()),
            index_apply: ExternalTool::new("index_apply", tools.index_apply.clone()),
            pileup: ExternalTool::new("pileup", tools.pileup.clone()),
        }
    }
}

/// Runs the map stages for one run.
pub struct ChunkStages {
    storage: Storage,
    layout: KeyLayout,
    chunks: Arc<dyn ChunkSource>,
    tools: StageTools,
    base_name: String,
    threads: usize,
    tolerance: u32,
    key_column: usize,
    scratch_dir: Option<PathBuf>,
    metrics: Arc<Metrics>,
}

async fn require_file(stage: Stage, path: &Path) -> PipelineResult<()> {
    if tokio::fs::try_exists(path).await? {
        Ok(())
    } else {
        Err(PipelineError::MissingOutput {
            stage: stage.to_string(),
            key: path.display().to_string(),
        })
    }
}

impl ChunkStages {
    pub fn new(
        config: &Config,
        storage: Storage,
        chunks: Arc<dyn ChunkSource>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let layout = KeyLayout::new(
            storage.bucket(),
            &config.run.tmp_prefix,
            &config.run.run_id,
            &config.run.base_name,
        );
        Self {
            storage,
            layout,
            chunks,
            tools: StageTools::from_config(config),
            base_name: config.run.base_name.clone(),
            threads: config.tools.threads(),
            tolerance: config.run.tolerance,
            key_column: config.processing.key_column,
            scratch_dir: config.processing.scratch_dir.clone(),
            metrics,
        }
    }

    pub fn layout(&self) -> &KeyLayout {
        &self.layout
    }

    fn task(&self, name: String, stage: Stage) -> IdempotentTask {
        IdempotentTask::new(name, stage, self.storage.clone())
            .in_scratch_dir(self.scratch_dir.clone())
            .with_metrics(self.metrics.clone())
    }

    /// Build the reference index for one reference chunk.
    pub async fn build_index(&self, fasta: &ChunkRef) -> PipelineResult<TaskReport> {
        let stage = Stage::IndexBuild;
        let index_name = format!("fa{}.gem", fasta.id);
        let key = self.layout.resolve(&StageKey::gem_index(fasta.id));

        self.task(format!("fa{}", fasta.id), stage)
            .with_output(key, &index_name)
            .run(|area: WorkArea| async move {
                let fasta_path = area
                    .fetch_chunk(self.chunks.as_ref(), fasta, &format!("fa{}.fasta", fasta.id))
                    .await?;
                let vars = ToolVars::new()
                    .set_path("fasta", &fasta_path)
                    .set("threads", self.threads)
                    .set_path("output_stem", &area.file(&format!("fa{}", fasta.id)));
                self.tools.indexer.run(stage, area.path(), &vars).await?;
                Ok(())
            })
            .await
    }

    /// Align one read chunk against one reference chunk's index.
    ///
    /// Both artifacts must exist to skip; one without the other recomputes both.
    pub async fn align_and_filter(&self, fasta: &ChunkRef, fastq: &ChunkRef) -> PipelineResult<TaskReport> {
        let stage = Stage::AlignFilter;
        let (a, q) = (fasta.id, fastq.id);
        let map_index = format!("{}_map.index.txt", self.base_name);
        let filtered_map = format!("{}_filt_wline_no.map", self.base_name);
        let gem_key = self.layout.resolve(&StageKey::gem_index(a));

        self.task(format!("fa{}-fq{}", a, q), stage)
            .with_output(self.layout.resolve(&StageKey::map_index(a, q)), &map_index)
            .with_output(self.layout.resolve(&StageKey::filtered_map(a, q)), &filtered_map)
            .run(|area: WorkArea| async move {
                let gem_path = area
                    .download_artifact(Stage::IndexBuild, &gem_key, &format!("fa{}.gem", a))
                    .await?;
                let fastq_path = area
                    .fetch_chunk(self.chunks.as_ref(), fastq, &format!("fq{}.fastq", q))
                    .await?;
                let vars = ToolVars::new()
                    .set_path("gem_index", &gem_path)
                    .set_path("fastq", &fastq_path)
                    .set("base_name", &self.base_name)
                    .set("threads", self.threads);
                self.tools.aligner.run(stage, area.path(), &vars).await?;
                Ok(())
            })
            .await
    }

    /// Merge the map indexes of every reference chunk for one read chunk.
    pub async fn correct_index(&self, fastq_id: u32, fasta_ids: &[u32]) -> PipelineResult<TaskReport> {
        let stage = Stage::IndexCorrection;
        let output_name = "merged_filtered_index.txt";
        let mut fasta_ids = fasta_ids.to_vec();
        fasta_ids.sort_unstable();
        fasta_ids.dedup();

        self.task(format!("fq{}", fastq_id), stage)
            .with_output(self.layout.resolve(&StageKey::corrected_index(fastq_id)), output_name)
            .run(|area: WorkArea| async move {
                let mut inputs = Vec::with_capacity(fasta_ids.len());
                for (i, a) in fasta_ids.iter().enumerate() {
                    let key = self.layout.resolve(&StageKey::map_index(*a, fastq_id));
                    let path = area
                        .download_artifact(Stage::AlignFilter, &key, &format!("index_{}.txt", i))
                        .await?;
                    inputs.push(path.display().to_string());
                }

                let intermediate = area.file("intermediate.txt");
                let vars = ToolVars::new()
                    .set_list("inputs", inputs)
                    .set("threads", self.threads);
                self.tools
                    .index_merge
                    .run_to_file(stage, area.path(), &vars, &intermediate)
                    .await?;

                let vars = ToolVars::new()
                    .set_path("input", &intermediate)
                    .set_path("output", &area.file(output_name));
                self.tools.index_filter.run(stage, area.path(), &vars).await?;
                Ok(())
            })
            .await
    }

    /// Produce the pileup for one (reference, read) pair, plus its key counts.
    pub async fn pileup(&self, fasta: &ChunkRef, fastq_id: u32) -> PipelineResult<TaskReport> {
        let stage = Stage::Pileup;
        let (a, q) = (fasta.id, fastq_id);
        let stem = format!("{}_fa{}-fq{}", self.base_name, a, q);
        let pileup_name = format!("{}.mpileup", stem);
        let keys_name = format!("{}.keys", pileup_name);

        self.task(format!("fa{}-fq{}", a, q), stage)
            .with_output(self.layout.resolve(&StageKey::pileup(a, q)), &pileup_name)
            .with_output(self.layout.resolve(&StageKey::pileup_key_counts(a, q)), &keys_name)
            .run(|area: WorkArea| async move {
                let fasta_path = area
                    .fetch_chunk(self.chunks.as_ref(), fasta, &format!("fa{}.fasta", a))
                    .await?;
                let map_path = area
                    .download_artifact(
                        Stage::AlignFilter,
                        &self.layout.resolve(&StageKey::filtered_map(a, q)),
                        &format!("{}_filt_wline_no.map", stem),
                    )
                    .await?;
                let index_path = area
                    .download_artifact(
                        Stage::IndexCorrection,
                        &self.layout.resolve(&StageKey::corrected_index(q)),
                        "merged_filtered_index.txt",
                    )
                    .await?;

                let vars = ToolVars::new()
                    .set_path("corrected_index", &index_path)
                    .set_path("filtered_map", &map_path)
                    .set("tolerance", self.tolerance);
                self.tools.index_apply.run(stage, area.path(), &vars).await?;
                let corrected_map = area.file(&format!("{}_filt_wline_no_corrected.map", stem));
                require_file(stage, &corrected_map).await?;

                let vars = ToolVars::new()
                    .set_path("corrected_map", &corrected_map)
                    .set_path("fasta", &fasta_path)
                    .set("threads", self.threads);
                self.tools.pileup.run(stage, area.path(), &vars).await?;
                let produced = area.file(&format!("{}_filt_wline_no_corrected.map.mpileup", stem));
                require_file(stage, &produced).await?;

                let pileup_path = area.file(&pileup_name);
                tokio::fs::rename(&produced, &pileup_path).await?;
                write_key_counts(&pileup_path, &area.file(&keys_name), self.key_column).await?;
                Ok(())
            })
            .await
    }
}

/// Scan a local pileup and write its `key\tcount` sidecar.
async fn write_key_counts(pileup: &Path, sidecar: &Path, key_column: usize) -> PipelineResult<KeyCounts> {
    let data = Bytes::from(tokio::fs::read(pileup).await?);
    let counts = KeyCounts::from_records(&data, key_column)?;
    tokio::fs::write(sidecar, counts.to_sidecar()).await?;
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolSpec;
    use crate::io::StoreChunkSource;
    use tempfile::TempDir;

    fn sh(script: &str, args: &[&str]) -> ToolSpec {
        let mut all = vec!["-c", script, "sh"];
        all.extend_from_slice(args);
        ToolSpec::new("sh", &all)
    }

    /// Tools that copy their inputs around so outputs are predictable.
    fn scripted_config(scratch: &TempDir) -> Config {
        let mut config = Config::from_yaml(
            r#"
storage:
  bucket: bucket
run:
  run_id: run-1
  chunk_manifest: chunks.yaml
  base_name: s
"#,
        )
        .unwrap();
        config.tools.indexer =
            sh("cp \"$1\" \"$2.gem\"; exit 1", &["{fasta}", "{output_stem}"]).with_success_codes(&[1]);
        config.tools.aligner = sh(
            "cat \"$1\" \"$2\" > \"$3_map.index.txt\" && cp \"$2\" \"$3_filt_wline_no.map\"",
            &["{gem_index}", "{fastq}", "{base_name}"],
        );
        config.tools.index_merge = sh("cat \"$@\"", &["{inputs}"]);
        config.tools.index_filter = sh("sort \"$1\" > \"$2\"", &["{input}", "{output}"]);
        config.tools.index_apply = sh(
            "cp \"$2\" \"$(basename \"$2\" .map)_corrected.map\"",
            &["{corrected_index}", "{filtered_map}", "{tolerance}"],
        );
        config.tools.pileup = sh("cp \"$1\" \"$1.mpileup\"", &["{corrected_map}", "{fasta}"]);
        config.processing.scratch_dir = Some(scratch.path().to_path_buf());
        config
    }

    async fn setup() -> (ChunkStages, Storage, TempDir, ChunkRef, ChunkRef) {
        let scratch = TempDir::new().unwrap();
        let storage = Storage::in_memory("bucket");
        storage
            .put(&storage.key("in/ref.fa"), Bytes::from_static(b">chr1\nACGT\n"))
            .await
            .unwrap();
        storage
            .put(
                &storage.key("in/reads.tsv"),
                Bytes::from_static(b"chr1\t7\tA\nchr1\t3\tC\nchr1\t7\tG\n"),
            )
            .await
            .unwrap();

        let config = scripted_config(&scratch);
        let chunks = Arc::new(StoreChunkSource::new(storage.clone()));
        let stages = ChunkStages::new(&config, storage.clone(), chunks, Metrics::new());

        let fasta = ChunkRef {
            id: 0,
            source_locator: "s3://bucket/in/ref.fa".to_string(),
            byte_range: None,
        };
        let fastq = ChunkRef {
            id: 1,
            source_locator: "s3://bucket/in/reads.tsv".to_string(),
            byte_range: None,
        };
        (stages, storage, scratch, fasta, fastq)
    }

    #[tokio::test]
    async fn test_stage_chain_produces_pileup_and_sidecar() {
        let (stages, storage, _scratch, fasta, fastq) = setup().await;

        stages.build_index(&fasta).await.unwrap();
        assert!(storage.exists(&storage.key("gem/fa0.gem")).await.unwrap());

        stages.align_and_filter(&fasta, &fastq).await.unwrap();
        stages.correct_index(1, &[0]).await.unwrap();
        let report = stages.pileup(&fasta, 1).await.unwrap();
        assert!(!report.outcome.is_skipped());

        let layout = stages.layout();
        let pileup = storage.get(&layout.resolve(&StageKey::pileup(0, 1))).await.unwrap();
        assert_eq!(&pileup[..], b"chr1\t7\tA\nchr1\t3\tC\nchr1\t7\tG\n");

        let sidecar = storage
            .get(&layout.resolve(&StageKey::pileup_key_counts(0, 1)))
            .await
            .unwrap();
        assert_eq!(&sidecar[..], b"3\t1\n7\t2\n");
    }

    #[tokio::test]
    async fn test_indexer_success_code_one() {
        let (stages, _storage, _scratch, fasta, _fastq) = setup().await;
        let report = stages.build_index(&fasta).await.unwrap();
        assert!(!report.outcome.is_skipped());
        assert!(stages.build_index(&fasta).await.unwrap().outcome.is_skipped());
    }

    #[tokio::test]
    async fn test_align_partial_output_recomputes() {
        let (stages, storage, _scratch, fasta, fastq) = setup().await;
        stages.build_index(&fasta).await.unwrap();

        // Only one of the two align artifacts exists
        let filtered = stages.layout().resolve(&StageKey::filtered_map(0, 1));
        storage.put(&filtered, Bytes::from_static(b"stale")).await.unwrap();

        let report = stages.align_and_filter(&fasta, &fastq).await.unwrap();
        assert!(!report.outcome.is_skipped());
        assert_ne!(&storage.get(&filtered).await.unwrap()[..], b"stale");
    }

    #[tokio::test]
    async fn test_missing_index_fails_align() {
        let (stages, _storage, _scratch, fasta, fastq) = setup().await;
        let err = stages.align_and_filter(&fasta, &fastq).await.unwrap_err();
        match err {
            PipelineError::MissingOutput { stage, key } => {
                assert_eq!(stage, Stage::IndexBuild.to_string());
                assert_eq!(key, stages.layout().resolve(&StageKey::gem_index(0)).to_string());
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_corrected_index_fails_pileup() {
        let (stages, _storage, _scratch, fasta, fastq) = setup().await;
        stages.build_index(&fasta).await.unwrap();
        stages.align_and_filter(&fasta, &fastq).await.unwrap();

        let err = stages.pileup(&fasta, 1).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::MissingOutput { ref stage, .. } if *stage == Stage::IndexCorrection.to_string()
        ));
    }

    #[tokio::test]
    async fn test_correct_index_merges_all_inputs() {
        let (stages, storage, _scratch, _fasta, _fastq) = setup().await;
        let layout = stages.layout().clone();
        storage
            .put(&layout.resolve(&StageKey::map_index(0, 4)), Bytes::from_static(b"b\n"))
            .await
            .unwrap();
        storage
            .put(&layout.resolve(&StageKey::map_index(1, 4)), Bytes::from_static(b"a\n"))
            .await
            .unwrap();

        stages.correct_index(4, &[1, 0]).await.unwrap();
        let merged = storage.get(&layout.resolve(&StageKey::corrected_index(4))).await.unwrap();
        assert_eq!(&merged[..], b"a\nb\n");
    }
}
