//! Out-of-process hooks
//!
//! ## Exit Code Protocol
//! - 0: stdout is empty (Continue) or a JSON `HookResult`
//! - 2: Halt, stderr is the message
//! - Other: warn and continue

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::warn;

use super::{Hook, HookContext, HookResult};

const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(60);

/// Hook that runs an external program with the context as JSON on stdin
#[derive(Debug, Clone)]
pub struct CommandHook {
    name: String,
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    timeout: Duration,
}

impl CommandHook {
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            timeout: DEFAULT_HOOK_TIMEOUT,
        }
    }

    /// Run through `sh -c`
    pub fn shell(name: impl Into<String>, script: impl Into<String>) -> Self {
        Self::new(name, "sh").with_args(["-c".to_string(), script.into()])
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
impl Hook for CommandHook {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, context: &HookContext) -> anyhow::Result<HookResult> {
        let payload = serde_json::to_vec(context)?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env("HOOK_EVENT", context.event.as_str())
            .env("HOOK_AGENT", &context.agent)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn hook command '{}'", self.program))?;

        if let Some(mut stdin) = child.stdin.take() {
            // a hook that ignores stdin may close it early
            let _ = stdin.write_all(&payload).await;
        }

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                warn!(hook = %self.name, timeout = ?self.timeout, "Hook command timed out");
                return Ok(HookResult::Continue);
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        match output.status.code() {
            Some(0) => {
                let stdout = stdout.trim();
                if stdout.is_empty() {
                    Ok(HookResult::Continue)
                } else {
                    serde_json::from_str(stdout)
                        .with_context(|| format!("hook '{}' printed invalid result", self.name))
                }
            }
            Some(2) => Ok(HookResult::Halt(stderr.trim().to_string())),
            code => {
                warn!(hook = %self.name, ?code, stderr = %stderr.trim(), "Hook command failed");
                Ok(HookResult::Continue)
            }
        }
    }
}
