use std::collections::BTreeMap;
use std::fmt;
use std::process::Stdio;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::scheduler::function_key;
use crate::worker::execution::JobExecution;
use crate::worker::session::Worker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Exit status zero.
    Completed,
    /// Non-zero exit with something on stderr.
    Exception,
    /// Non-zero exit with nothing on stderr, or the command could not run.
    Failed,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStatus::Completed => write!(f, "completed"),
            ExecutionStatus::Exception => write!(f, "exception"),
            ExecutionStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Result of running one command.
#[derive(Debug)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    pub output: Bytes,
    pub error: Option<String>,
}

/// Runs a shell command per function (matched case-insensitively), feeding the job payload on stdin.
///
/// stdout becomes the WORK_COMPLETE result. A non-zero exit is reported as
/// WORK_EXCEPTION carrying stderr, or WORK_FAIL when stderr is empty.
/// stdout containing NUL cannot travel in a frame and is reported as
/// WORK_EXCEPTION.
#[derive(Debug, Clone, Default)]
pub struct ShellExecutor {
    commands: BTreeMap<String, String>,
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_command(mut self, function: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.insert(function_key(&function.into()), command.into());
        self
    }

    pub fn functions(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }

    pub fn command_for(&self, function: &str) -> Option<&str> {
        self.commands.get(&function_key(function)).map(String::as_str)
    }

    /// Run `command` under `sh -c` with `payload` on stdin.
    pub async fn execute(&self, handle: &str, command: &str, payload: &[u8]) -> ExecutionResult {
        tracing::info!(handle = %handle, command, "Executing job");

        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match child {
            Ok(child) => child,
            Err(e) => return Self::process_output(handle, Err(e)),
        };

        // stdin is written while output is collected; the command may fill
        // its stdout pipe before reading all of its input.
        let stdin = child.stdin.take();
        let input = payload.to_vec();
        let feeder = tokio::spawn(async move {
            if let Some(mut stdin) = stdin {
                if let Err(e) = stdin.write_all(&input).await {
                    tracing::debug!(error = %e, "Command closed stdin early");
                }
            }
        });

        let result = child.wait_with_output().await;
        let _ = feeder.await;
        Self::process_output(handle, result)
    }

    fn process_output(
        handle: &str,
        result: std::result::Result<std::process::Output, std::io::Error>,
    ) -> ExecutionResult {
        match result {
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                let exit_code = output.status.code();

                let nul_at = output.stdout.iter().position(|b| *b == 0);
                let (status, error) = match (output.status.success(), nul_at) {
                    (true, None) => (ExecutionStatus::Completed, None),
                    (true, Some(pos)) => {
                        tracing::warn!(
                            handle = %handle,
                            len = output.stdout.len(),
                            nul_at = pos,
                            "Command output contains NUL, reporting an exception"
                        );
                        (
                            ExecutionStatus::Exception,
                            Some(format!(
                                "output of {} bytes contains NUL at byte {}",
                                output.stdout.len(),
                                pos
                            )),
                        )
                    }
                    (false, _) if stderr.is_empty() => (
                        ExecutionStatus::Failed,
                        Some(format!("Exit code: {:?}", exit_code)),
                    ),
                    (false, _) => (ExecutionStatus::Exception, Some(stderr)),
                };

                tracing::info!(
                    handle = %handle,
                    status = %status,
                    exit_code = ?exit_code,
                    "Command finished"
                );

                ExecutionResult {
                    status,
                    exit_code,
                    output: Bytes::from(output.stdout),
                    error,
                }
            }
            Err(e) => {
                tracing::error!(handle = %handle, error = %e, "Job execution failed");
                ExecutionResult {
                    status: ExecutionStatus::Failed,
                    exit_code: None,
                    output: Bytes::new(),
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Run an assigned job and send its terminal report.
    pub async fn run(&self, job: &mut JobExecution) -> Result<ExecutionStatus> {
        let Some(command) = self.command_for(job.function()) else {
            tracing::warn!(handle = %job.handle(), function = %job.function(), "No command for function");
            job.fail()?;
            return Ok(ExecutionStatus::Failed);
        };
        let result = self.execute(job.handle(), command, job.payload()).await;
        match result.status {
            ExecutionStatus::Completed => job.complete(result.output)?,
            ExecutionStatus::Exception => {
                let message = strip_nul(job.handle(), result.error.unwrap_or_default());
                job.exception(message)?
            }
            ExecutionStatus::Failed => job.fail()?,
        };
        Ok(result.status)
    }

    /// Register every configured function and work jobs until `shutdown`.
    pub async fn serve(&self, worker: &Worker, shutdown: CancellationToken) -> Result<()> {
        for function in self.functions() {
            worker.can_do(function)?;
        }
        loop {
            let mut job = tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Worker shutting down");
                    return Ok(());
                }
                job = worker.next_assignment() => job?,
            };
            self.run(&mut job).await?;
        }
    }
}

/// Frame arguments cannot carry NUL, so diagnostic text is cut at the
/// first one.
fn strip_nul(handle: &str, text: String) -> Bytes {
    let data = Bytes::from(text);
    match data.iter().position(|b| *b == 0) {
        Some(pos) => {
            tracing::warn!(handle = %handle, len = data.len(), nul_at = pos, "Truncating stderr at NUL");
            data.slice(..pos)
        }
        None => data,
    }
}
