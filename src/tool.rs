//! External command-line tools.
//!
//! Every alignment, pileup and merge step is an opaque program with a fixed
//! argument contract. [`ExternalTool`] runs one with placeholder substitution,
//! optional stdin, and a configurable set of success exit codes.

use crate::config::ToolSpec;
use crate::error::{PipelineError, PipelineResult};
use crate::index::Stage;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::{Output, Stdio};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Bytes of stderr kept in a failure.
const STDERR_TAIL: usize = 2048;

/// Values for `{name}` placeholders in tool arguments.
#[derive(Debug, Clone, Default)]
pub struct ToolVars {
    vars: BTreeMap<String, Vec<String>>,
}

impl ToolVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: &str, value: impl ToString) -> Self {
        self.vars.insert(name.to_string(), vec![value.to_string()]);
        self
    }

    pub fn set_path(self, name: &str, path: &Path) -> Self {
        self.set(name, path.display())
    }

    /// Bind a list; a standalone `{name}` argument expands to one argument per value.
    pub fn set_list(mut self, name: &str, values: impl IntoIterator<Item = String>) -> Self {
        self.vars.insert(name.to_string(), values.into_iter().collect());
        self
    }

    /// Expand placeholders. Unknown placeholders are left as written.
    pub fn expand(&self, args: &[String]) -> Vec<String> {
        let mut out = Vec::with_capacity(args.len());
        for arg in args {
            let whole = arg
                .strip_prefix('{')
                .and_then(|a| a.strip_suffix('}'))
                .and_then(|name| self.vars.get(name));
            match whole {
                Some(values) => out.extend(values.iter().cloned()),
                None => {
                    let mut expanded = arg.clone();
                    for (name, values) in &self.vars {
                        let placeholder = format!("{{{}}}", name);
                        if expanded.contains(&placeholder) {
                            expanded = expanded.replace(&placeholder, &values.join(" "));
                        }
                    }
                    out.push(expanded);
                }
            }
        }
        out
    }
}

/// A configured external program.
#[derive(Debug, Clone)]
pub struct ExternalTool {
    name: String,
    spec: ToolSpec,
}

impl ExternalTool {
    pub fn new(name: impl Into<String>, spec: ToolSpec) -> Self {
        Self {
            name: name.into(),
            spec,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn command(&self, cwd: &Path, vars: &ToolVars) -> Command {
        let args = vars.expand(&self.spec.args);
        tracing::debug!("{}: {} {}", self.name, self.spec.program, args.join(" "));

        let mut cmd = Command::new(&self.spec.program);
        cmd.args(args).current_dir(cwd).kill_on_drop(true);
        cmd
    }

    fn failure(&self, stage: Stage, code: Option<i32>, stderr: &[u8]) -> PipelineError {
        let start = stderr.len().saturating_sub(STDERR_TAIL);
        PipelineError::ExternalToolFailure {
            tool: self.name.clone(),
            stage: stage.to_string(),
            code,
            stderr: String::from_utf8_lossy(&stderr[start..]).trim().to_string(),
        }
    }

    fn spawn_failure(&self, stage: Stage, err: std::io::Error) -> PipelineError {
        PipelineError::ExternalToolFailure {
            tool: self.name.clone(),
            stage: stage.to_string(),
            code: None,
            stderr: format!("failed to start '{}': {}", self.spec.program, err),
        }
    }

    fn check(&self, stage: Stage, output: &Output) -> PipelineResult<()> {
        match output.status.code() {
            Some(code) if self.spec.success_codes.contains(&code) => Ok(()),
            code => Err(self.failure(stage, code, &output.stderr)),
        }
    }

    /// Run in `cwd`, returning captured stdout.
    pub async fn run(&self, stage: Stage, cwd: &Path, vars: &ToolVars) -> PipelineResult<Bytes> {
        let output = self
            .command(cwd, vars)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| self.spawn_failure(stage, e))?;
        self.check(stage, &output)?;
        Ok(Bytes::from(output.stdout))
    }

    /// Run in `cwd` with stdout redirected to `stdout_path`, returning its size.
    pub async fn run_to_file(
        &self,
        stage: Stage,
        cwd: &Path,
        vars: &ToolVars,
        stdout_path: &Path,
    ) -> PipelineResult<u64> {
        let file = std::fs::File::create(stdout_path)?;
        let child = self
            .command(cwd, vars)
            .stdin(Stdio::null())
            .stdout(Stdio::from(file))
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.spawn_failure(stage, e))?;
        let output = child.wait_with_output().await?;
        self.check(stage, &output)?;
        Ok(tokio::fs::metadata(stdout_path).await?.len())
    }

    /// Feed `input` on stdin and return stdout.
    pub async fn pipe(
        &self,
        stage: Stage,
        cwd: &Path,
        vars: &ToolVars,
        input: Bytes,
    ) -> PipelineResult<Bytes> {
        let mut child = self
            .command(cwd, vars)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.spawn_failure(stage, e))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("child stdin not captured"))?;

        // Write concurrently with reading stdout so large payloads cannot deadlock
        let writer = tokio::spawn(async move {
            let result = stdin.write_all(&input).await;
            drop(stdin);
            result
        });

        let output = child.wait_with_output().await?;

        match writer.await {
            Ok(Ok(())) => {}
            // The tool may exit without draining stdin; its status decides
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(e) => return Err(std::io::Error::other(e).into()),
        }

        self.check(stage, &output)?;
        Ok(Bytes::from(output.stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sh(script: &str) -> ToolSpec {
        ToolSpec::new("sh", &["-c", script, "sh", "{inputs}"])
    }

    #[test]
    fn test_expand_placeholders() {
        let vars = ToolVars::new()
            .set("threads", 4)
            .set("name", "sample")
            .set_list("inputs", vec!["a".to_string(), "b".to_string()]);
        let args: Vec<String> = ["--threads", "{threads}", "{name}_map.txt", "{inputs}", "{missing}"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        assert_eq!(
            vars.expand(&args),
            vec!["--threads", "4", "sample_map.txt", "a", "b", "{missing}"]
        );
    }

    #[test]
    fn test_empty_list_expands_to_nothing() {
        let vars = ToolVars::new().set_list("inputs", Vec::new());
        assert!(vars.expand(&["{inputs}".to_string()]).is_empty());
    }

    #[tokio::test]
    async fn test_run_captures_stdout() {
        let dir = TempDir::new().unwrap();
        let tool = ExternalTool::new("echo", sh("echo \"$@\""));
        let vars = ToolVars::new().set_list("inputs", vec!["x".to_string(), "y".to_string()]);
        let out = tool.run(Stage::Reduce, dir.path(), &vars).await.unwrap();
        assert_eq!(&out[..], b"x y\n");
    }

    #[tokio::test]
    async fn test_custom_success_code() {
        let dir = TempDir::new().unwrap();
        let vars = ToolVars::new().set_list("inputs", Vec::new());

        let tool = ExternalTool::new("indexer", sh("exit 1").with_success_codes(&[1]));
        assert!(tool.run(Stage::IndexBuild, dir.path(), &vars).await.is_ok());

        let tool = ExternalTool::new("indexer", sh("exit 0").with_success_codes(&[1]));
        let err = tool.run(Stage::IndexBuild, dir.path(), &vars).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::ExternalToolFailure { code: Some(0), .. }
        ));
    }

    #[tokio::test]
    async fn test_failure_carries_stderr() {
        let dir = TempDir::new().unwrap();
        let tool = ExternalTool::new("aligner", sh("echo boom >&2; exit 3"));
        let vars = ToolVars::new().set_list("inputs", Vec::new());
        match tool.run(Stage::AlignFilter, dir.path(), &vars).await {
            Err(PipelineError::ExternalToolFailure {
                tool,
                stage,
                code,
                stderr,
            }) => {
                assert_eq!(tool, "aligner");
                assert_eq!(stage, "align-filter");
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_program() {
        let dir = TempDir::new().unwrap();
        let tool = ExternalTool::new("nope", ToolSpec::new("/nonexistent/tool", &[]));
        let err = tool
            .run(Stage::Pileup, dir.path(), &ToolVars::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ExternalToolFailure { code: None, .. }));
    }

    #[tokio::test]
    async fn test_run_to_file_and_cwd() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("in.txt"), b"abc").unwrap();
        let tool = ExternalTool::new("cat", sh("cat in.txt"));
        let vars = ToolVars::new().set_list("inputs", Vec::new());
        let dest = dir.path().join("out.txt");
        let size = tool
            .run_to_file(Stage::IndexCorrection, dir.path(), &vars, &dest)
            .await
            .unwrap();
        assert_eq!(size, 3);
        assert_eq!(std::fs::read(&dest).unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_pipe_large_payload() {
        let dir = TempDir::new().unwrap();
        let tool = ExternalTool::new("cat", ToolSpec::new("cat", &[]));
        let payload = Bytes::from(vec![b'x'; 4 * 1024 * 1024]);
        let out = tool
            .pipe(Stage::Reduce, dir.path(), &ToolVars::new(), payload.clone())
            .await
            .unwrap();
        assert_eq!(out, payload);
    }
}
