//! Transformers and control signals
//!
//! A transformer maps a node's input (before the agent runs) or output
//! (after) and may redirect the workflow instead of returning content.
//!
//! ## Command Exit Codes
//! - 0: stdout is the new content
//! - 1: skip execution, keeping the input unchanged
//! - 2: halt the workflow, stderr is the final output
//! - Other: transformer error

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::NodeResult;
use crate::error::WorkflowError;

const DEFAULT_TRANSFORMER_TIMEOUT: Duration = Duration::from_secs(60);

/// What a transformer hands back to the executor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transform {
    /// Continue with this content
    Content(String),
    /// Do not run the agent; this content is the node's result
    Skip(String),
    /// Stop the workflow; this content is the final output
    Halt(String),
    /// Jump to `node` with `content` as its input
    Goto { node: String, content: String },
}

impl Transform {
    /// Skip the agent call. Fails on `None` content.
    pub fn skip_execution(content: Option<&str>) -> Result<Self, WorkflowError> {
        content
            .map(|c| Transform::Skip(c.to_string()))
            .ok_or(WorkflowError::NullControlContent("skip_execution"))
    }

    /// Stop the workflow. Fails on `None` content.
    pub fn halt_workflow(content: Option<&str>) -> Result<Self, WorkflowError> {
        content
            .map(|c| Transform::Halt(c.to_string()))
            .ok_or(WorkflowError::NullControlContent("halt_workflow"))
    }

    /// Jump to another node. Fails on `None` content.
    pub fn goto_node(node: impl Into<String>, content: Option<&str>) -> Result<Self, WorkflowError> {
        let content = content.ok_or(WorkflowError::NullControlContent("goto_node"))?;
        Ok(Transform::Goto {
            node: node.into(),
            content: content.to_string(),
        })
    }

    /// Short name for logs and events
    pub fn signal(&self) -> &'static str {
        match self {
            Transform::Content(_) => "content",
            Transform::Skip(_) => "skip_execution",
            Transform::Halt(_) => "halt_workflow",
            Transform::Goto { .. } => "goto_node",
        }
    }
}

/// Snapshot handed to a transformer
#[derive(Debug, Clone, Serialize)]
pub struct NodeContext {
    pub node: String,
    pub original_prompt: String,
    /// Input (before) or result (after) content
    content: Option<String>,
    error: Option<String>,
    /// Results of this node's dependencies, by name
    pub dependencies: BTreeMap<String, NodeResult>,
    /// Every result recorded so far in this run
    pub all_results: BTreeMap<String, NodeResult>,
}

impl NodeContext {
    pub(crate) fn new(
        node: &str,
        original_prompt: &str,
        content: Option<String>,
        error: Option<String>,
        dependencies: BTreeMap<String, NodeResult>,
        all_results: BTreeMap<String, NodeResult>,
    ) -> Self {
        Self {
            node: node.to_string(),
            original_prompt: original_prompt.to_string(),
            content,
            error,
            dependencies,
            all_results,
        }
    }

    pub fn content(&self) -> Option<&str> {
        self.content.as_deref()
    }

    /// Error of the stage this context describes; check before redirecting
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// The single dependency's result, when there is exactly one
    pub fn previous(&self) -> Option<&NodeResult> {
        match self.dependencies.len() {
            1 => self.dependencies.values().next(),
            _ => None,
        }
    }

    pub fn dependency(&self, node: &str) -> Option<&NodeResult> {
        self.dependencies.get(node)
    }

    pub fn result(&self, node: &str) -> Option<&NodeResult> {
        self.all_results.get(node)
    }
}

/// Maps node content or redirects the workflow
#[async_trait]
pub trait Transformer: Send + Sync {
    async fn transform(&self, context: &NodeContext) -> anyhow::Result<Transform>;
}

type TransformFn = dyn Fn(&NodeContext) -> Result<Transform, WorkflowError> + Send + Sync;

/// In-process transformer backed by a closure
pub struct FnTransformer {
    f: Box<TransformFn>,
}

impl FnTransformer {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&NodeContext) -> Result<Transform, WorkflowError> + Send + Sync + 'static,
    {
        Self { f: Box::new(f) }
    }
}

#[async_trait]
impl Transformer for FnTransformer {
    async fn transform(&self, context: &NodeContext) -> anyhow::Result<Transform> {
        Ok((self.f)(context)?)
    }
}

/// Transformer that runs an external program with the context as JSON on stdin
#[derive(Debug, Clone)]
pub struct CommandTransformer {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    timeout: Duration,
}

impl CommandTransformer {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            timeout: DEFAULT_TRANSFORMER_TIMEOUT,
        }
    }

    /// Run through `sh -c`
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh").with_args(["-c".to_string(), script.into()])
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Transformer for CommandTransformer {
    async fn transform(&self, context: &NodeContext) -> anyhow::Result<Transform> {
        let payload = serde_json::to_vec(context)?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env("WORKFLOW_NODE", &context.node)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn transformer '{}'", self.program))?;
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(&payload).await;
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| anyhow!("transformer '{}' timed out after {:?}", self.program, self.timeout))??;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!(node = %context.node, code = ?output.status.code(), "Transformer command finished");

        match output.status.code() {
            Some(0) => Ok(Transform::Content(stdout.trim_end_matches('\n').to_string())),
            Some(1) => Ok(Transform::skip_execution(context.content())?),
            Some(2) => Ok(Transform::halt_workflow(Some(stderr.trim()))?),
            code => Err(anyhow!(
                "transformer '{}' exited with {:?}: {}",
                self.program,
                code,
                stderr.trim()
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn ctx(content: Option<&str>) -> NodeContext {
        NodeContext::new(
            "review",
            "build it",
            content.map(String::from),
            None,
            BTreeMap::new(),
            BTreeMap::new(),
        )
    }

    // === Control Signal Tests ===

    #[test]
    fn test_null_content_raises() {
        assert!(matches!(
            Transform::skip_execution(None),
            Err(WorkflowError::NullControlContent("skip_execution"))
        ));
        assert!(matches!(
            Transform::halt_workflow(None),
            Err(WorkflowError::NullControlContent("halt_workflow"))
        ));
        assert!(matches!(
            Transform::goto_node("plan", None),
            Err(WorkflowError::NullControlContent("goto_node"))
        ));
    }

    #[test]
    fn test_signals_carry_content() {
        assert_eq!(
            Transform::goto_node("plan", Some("retry")).unwrap(),
            Transform::Goto {
                node: "plan".into(),
                content: "retry".into()
            }
        );
        assert_eq!(Transform::skip_execution(Some("cached")).unwrap().signal(), "skip_execution");
    }

    #[test]
    fn test_previous_only_for_single_dependency() {
        let mut deps = BTreeMap::new();
        deps.insert("plan".to_string(), NodeResult::completed("plan", "p"));
        let single = NodeContext::new("build", "x", None, None, deps.clone(), BTreeMap::new());
        assert_eq!(single.previous().and_then(|r| r.content.as_deref()), Some("p"));

        deps.insert("spec".to_string(), NodeResult::completed("spec", "s"));
        let many = NodeContext::new("build", "x", None, None, deps, BTreeMap::new());
        assert!(many.previous().is_none());
        assert!(many.dependency("spec").is_some());
    }

    // === Fn Transformer Tests ===

    #[tokio::test]
    async fn test_fn_transformer_propagates_null_content() {
        let t = FnTransformer::new(|ctx| Transform::goto_node("plan", ctx.content()));
        let err = t.transform(&ctx(None)).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WorkflowError>(),
            Some(WorkflowError::NullControlContent(_))
        ));
    }

    // === Command Transformer Tests ===

    #[tokio::test]
    async fn test_command_exit_zero_is_content() {
        let t = CommandTransformer::shell("cat > /dev/null; echo rewritten");
        assert_eq!(
            t.transform(&ctx(Some("input"))).await.unwrap(),
            Transform::Content("rewritten".into())
        );
    }

    #[tokio::test]
    async fn test_command_exit_one_skips_with_input() {
        let t = CommandTransformer::shell("cat > /dev/null; exit 1");
        assert_eq!(
            t.transform(&ctx(Some("input"))).await.unwrap(),
            Transform::Skip("input".into())
        );
    }

    #[tokio::test]
    async fn test_command_exit_two_halts_with_stderr() {
        let t = CommandTransformer::shell("cat > /dev/null; echo 'stop here' >&2; exit 2");
        assert_eq!(
            t.transform(&ctx(Some("input"))).await.unwrap(),
            Transform::Halt("stop here".into())
        );
    }

    #[tokio::test]
    async fn test_command_other_exit_is_error() {
        let t = CommandTransformer::shell("exit 7");
        assert!(t.transform(&ctx(Some("input"))).await.is_err());
    }

    #[tokio::test]
    async fn test_command_reads_context_json() {
        let mut script = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            script,
            r#"input=$(cat); case "$input" in *'"original_prompt":"build it"'*) echo seen;; *) exit 3;; esac"#
        )
        .unwrap();

        let t = CommandTransformer::new("sh").with_args([script.path().to_string_lossy()]);
        assert_eq!(
            t.transform(&ctx(Some("input"))).await.unwrap(),
            Transform::Content("seen".into())
        );
    }
}
