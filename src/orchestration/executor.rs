//! External execution of work.
//!
//! The coordinator hands every phase execution to an `Executor`. The call may
//! be slow and may fail; it must honour the timeout carried by the request and
//! stop promptly when the cancellation token fires.
//!
//! `ProcessExecutor` runs a headless CLI agent as a child process and parses
//! its JSON result. The agent runs in its own process group; cancellation and
//! timeouts kill the whole group before returning, so neither the agent nor
//! anything it spawned outlives its execution.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::ids::{CycleId, ProjectId, WorkerId};
use crate::core::item::WorkItemId;
use crate::error::{Error, Result};
use crate::workflow::CyclePhase;

/// Default timeout for one execution attempt (5 minutes).
pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(300);

/// Default timeout for heavyweight initialization runs (15 minutes).
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(900);

/// Placeholder in argument templates replaced by the prompt. Templates
/// without it receive the prompt on stdin.
pub const PROMPT_PLACEHOLDER: &str = "{prompt}";

/// Everything an executor needs for one attempt.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub project_id: ProjectId,
    pub item_id: WorkItemId,
    pub cycle_id: Option<CycleId>,
    pub phase: Option<CyclePhase>,
    pub worker_id: Option<WorkerId>,
    pub directive: String,
    /// Phase instructions, prior artifacts and human guidance.
    pub working_context: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// Result of an execution that ran to completion. Transport failures
/// (spawn errors, timeouts, cancellation) are `Err` instead.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub output: String,
    pub usage: TokenUsage,
    pub error: Option<String>,
}

impl ExecutionOutcome {
    pub fn success(output: &str, usage: TokenUsage) -> Self {
        Self {
            success: true,
            output: output.to_string(),
            usage,
            error: None,
        }
    }

    pub fn failure(error: &str, usage: TokenUsage) -> Self {
        Self {
            success: false,
            output: String::new(),
            usage,
            error: Some(error.to_string()),
        }
    }
}

#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, request: ExecutionRequest, cancel: CancellationToken) -> Result<ExecutionOutcome>;
}

/// Runs a headless CLI agent per execution.
///
/// The default argument template is `-p --output-format json` with the
/// prompt written to stdin, which keeps large contexts off the command line.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    binary: PathBuf,
    args: Vec<String>,
    working_dir: PathBuf,
}

impl ProcessExecutor {
    /// Locate `command` on `PATH`.
    pub fn new(command: &str) -> Result<Self> {
        let binary = which::which(command).map_err(|_| Error::ExecutorNotFound(command.to_string()))?;
        Ok(Self::with_binary(binary))
    }

    pub fn with_binary(binary: PathBuf) -> Self {
        Self {
            binary,
            args: vec!["-p".to_string(), "--output-format".to_string(), "json".to_string()],
            working_dir: PathBuf::from("."),
        }
    }

    /// Replace the argument template. `{prompt}` is substituted per call;
    /// without it the prompt goes to stdin.
    pub fn with_args(mut self, args: &[&str]) -> Self {
        self.args = args.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn with_working_dir(mut self, dir: &Path) -> Self {
        self.working_dir = dir.to_path_buf();
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn prompt_on_stdin(&self) -> bool {
        !self.args.iter().any(|a| a.contains(PROMPT_PLACEHOLDER))
    }

    fn render_args(&self, prompt: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.replace(PROMPT_PLACEHOLDER, prompt))
            .collect()
    }

    /// Parse the agent's JSON result.
    pub fn parse_json_response(json_str: &str) -> Result<ExecutionOutcome> {
        let raw: RawResponse = serde_json::from_str(json_str.trim())?;
        let usage = raw
            .usage
            .map(|u| TokenUsage::new(u.input_tokens, u.output_tokens))
            .unwrap_or_default();

        let failed = raw.is_error.unwrap_or(false) || raw.subtype.as_deref().is_some_and(|s| s != "success");
        if failed || (raw.result.is_none() && raw.error.is_some()) {
            let message = raw
                .error
                .or(raw.result)
                .unwrap_or_else(|| "Unknown response format".to_string());
            return Ok(ExecutionOutcome::failure(&message, usage));
        }

        match raw.result {
            Some(output) => Ok(ExecutionOutcome::success(&output, usage)),
            None => Ok(ExecutionOutcome::failure("Unknown response format", usage)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawResponse {
    subtype: Option<String>,
    is_error: Option<bool>,
    result: Option<String>,
    error: Option<String>,
    usage: Option<RawUsage>,
}

#[derive(Debug, Deserialize)]
struct RawUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[async_trait]
impl Executor for ProcessExecutor {
    async fn execute(&self, request: ExecutionRequest, cancel: CancellationToken) -> Result<ExecutionOutcome> {
        let prompt = format!("{}\n\n{}", request.working_context, request.directive);
        let on_stdin = self.prompt_on_stdin();
        let mut command = Command::new(&self.binary);
        command
            .args(self.render_args(&prompt))
            .current_dir(&self.working_dir)
            .stdin(if on_stdin { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        let mut child = command.spawn()?;
        let pid = child.id();

        tracing::debug!(
            item = %request.item_id.short(),
            pid = pid.unwrap_or_default(),
            "execution started"
        );

        let stdin = child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                if let Err(err) = stdin.write_all(prompt.as_bytes()).await {
                    tracing::debug!(error = %err, "agent closed stdin early");
                }
            })
        });
        let stdout = tokio::spawn(read_all(child.stdout.take()));
        let stderr = tokio::spawn(read_all(child.stderr.take()));
        let pipes = Pipes { stdin, stdout, stderr };

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = cancel.cancelled() => {
                terminate(&mut child, pid, &pipes).await?;
                tracing::info!(item = %request.item_id.short(), "execution cancelled, process group killed");
                return Err(Error::Cancelled);
            }
            _ = tokio::time::sleep(request.timeout) => {
                terminate(&mut child, pid, &pipes).await?;
                tracing::warn!(item = %request.item_id.short(), timeout = ?request.timeout, "execution timed out, process group killed");
                return Err(Error::Timeout(request.timeout));
            }
        };

        // The agent has exited; anything it left behind in its group goes too.
        kill_group(pid);
        let Pipes { stdin, stdout, stderr } = pipes;
        if let Some(stdin) = stdin {
            stdin.abort();
        }
        let stdout = stdout.await.map_err(|e| Error::TaskJoin(e.to_string()))?;
        let stderr = stderr.await.map_err(|e| Error::TaskJoin(e.to_string()))?;

        if let Ok(outcome) = Self::parse_json_response(&stdout) {
            return Ok(outcome);
        }

        if !status.success() {
            let message = if stderr.trim().is_empty() {
                format!("Execution failed with exit code {}", status.code().unwrap_or(-1))
            } else {
                stderr.trim().to_string()
            };
            return Ok(ExecutionOutcome::failure(&message, TokenUsage::default()));
        }

        Ok(ExecutionOutcome::success(stdout.trim(), TokenUsage::default()))
    }
}

/// Tasks feeding and draining the child's pipes.
struct Pipes {
    stdin: Option<JoinHandle<()>>,
    stdout: JoinHandle<String>,
    stderr: JoinHandle<String>,
}

impl Pipes {
    fn abort(&self) {
        if let Some(stdin) = &self.stdin {
            stdin.abort();
        }
        self.stdout.abort();
        self.stderr.abort();
    }
}

/// Kill the child with its process group, reap it and drop the pipe tasks.
async fn terminate(child: &mut Child, pid: Option<u32>, pipes: &Pipes) -> Result<()> {
    kill_group(pid);
    if let Err(err) = child.start_kill() {
        tracing::debug!(error = %err, "child already exited");
    }
    child.wait().await?;
    pipes.abort();
    Ok(())
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid else {
        return;
    };
    // ESRCH just means the group is already empty.
    if let Err(err) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        tracing::trace!(pid, error = %err, "process group not signalled");
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        // A read error leaves whatever was captured so far.
        let _ = reader.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}
