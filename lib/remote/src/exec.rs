use std::{process::Stdio, sync::Arc, time::Duration};

use command::ssh_exec_args;
use nix::{
  sys::signal::{Signal, kill},
  unistd::Pid,
};
use stackhaul_client::entities::{
  host::Host, stackhaul_timestamp, update::Log,
};
use tokio::{
  io::{
    AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader,
  },
  process::{Child, Command},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
  AuditEntry, ExecuteError, Result, SessionPool,
};

/// Grace between SIGTERM and SIGKILL on timeout / cancel.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// ssh itself exits 255 on transport failure; anything else is
/// the remote command's exit code.
const SSH_TRANSPORT_EXIT: i32 = 255;

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
  pub exit_code: Option<i32>,
  pub stdout: String,
  pub stderr: String,
}

impl CommandOutput {
  pub fn success(&self) -> bool {
    self.exit_code == Some(0)
  }
}

pub fn output_into_log(
  stage: &str,
  command: String,
  start_ts: i64,
  output: &CommandOutput,
) -> Log {
  Log {
    stage: stage.to_string(),
    command,
    stdout: output.stdout.clone(),
    stderr: output.stderr.clone(),
    success: output.success(),
    start_ts,
    end_ts: stackhaul_timestamp(),
  }
}

/// Runs one command on one host with bounded time and bounded
/// output. Never interprets stdout, parsing is the caller's
/// responsibility.
#[derive(Clone)]
pub struct RemoteExecutor {
  pool: Arc<SessionPool>,
}

impl RemoteExecutor {
  pub fn new(pool: Arc<SessionPool>) -> RemoteExecutor {
    RemoteExecutor { pool }
  }

  pub fn pool(&self) -> &Arc<SessionPool> {
    &self.pool
  }

  /// Captured (non-streaming) execution. A transport failure is
  /// retried once with a fresh session, then propagated. Exit
  /// code != 0 is NOT an error here, callers decide.
  pub async fn run(
    &self,
    host: &Host,
    remote_command: &str,
    timeout: Duration,
    cancel: &CancellationToken,
  ) -> Result<CommandOutput> {
    match self
      .run_inner(host, remote_command, timeout, cancel, None)
      .await
    {
      Err(e) if e.retryable_transport() => {
        debug!(
          host = host.id,
          "transport error, retrying with fresh session | {e}"
        );
        self
          .run_inner(host, remote_command, timeout, cancel, None)
          .await
      }
      res => res,
    }
  }

  /// Line-oriented streaming execution for commands whose
  /// output is large or unbounded (transfer progress). Each
  /// stdout line is handed to `on_line` as it arrives; the full
  /// output is still returned.
  pub async fn run_streamed(
    &self,
    host: &Host,
    remote_command: &str,
    timeout: Duration,
    cancel: &CancellationToken,
    on_line: &mut (dyn FnMut(&str) + Send),
  ) -> Result<CommandOutput> {
    self
      .run_inner(
        host,
        remote_command,
        timeout,
        cancel,
        Some(on_line),
      )
      .await
  }

  /// Captured execution with bytes streamed into the remote
  /// command's stdin. Used to upload file contents without
  /// hitting the command length cap.
  pub async fn run_with_stdin(
    &self,
    host: &Host,
    remote_command: &str,
    stdin: &[u8],
    timeout: Duration,
    cancel: &CancellationToken,
  ) -> Result<CommandOutput> {
    let guard = self.pool.acquire(host, cancel).await?;
    let args = ssh_exec_args(&guard.target()?, remote_command)?;

    let mut child = Command::new("ssh")
      .args(&args)
      .stdin(Stdio::piped())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true)
      .spawn()
      .map_err(|e| {
        ExecuteError::transport(format!(
          "failed to spawn ssh | {e}"
        ))
      })?;

    {
      let mut handle =
        child.stdin.take().expect("stdin piped");
      handle.write_all(stdin).await.map_err(|e| {
        ExecuteError::transport(format!(
          "failed to write remote stdin | {e}"
        ))
      })?;
      // Dropping the handle closes the pipe, the remote `cat`
      // sees EOF.
    }

    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");
    let stdout_task = tokio::spawn(async move {
      let mut buf = String::new();
      let mut stdout = stdout;
      let _ = stdout.read_to_string(&mut buf).await;
      buf
    });
    let stderr_task = tokio::spawn(async move {
      let mut buf = String::new();
      let mut stderr = stderr;
      let _ = stderr.read_to_string(&mut buf).await;
      buf
    });

    let waited = {
      let wait = child.wait();
      tokio::pin!(wait);
      tokio::select! {
        status = &mut wait => WaitOutcome::Exited(
          status.map_err(|e| ExecuteError::transport(
            format!("failed to await ssh | {e}")
          ))?,
        ),
        _ = tokio::time::sleep(timeout) => {
          WaitOutcome::TimedOut
        }
        _ = cancel.cancelled() => WaitOutcome::Cancelled,
      }
    };
    let status = match waited {
      WaitOutcome::Exited(status) => status,
      WaitOutcome::TimedOut => {
        terminate(&mut child).await;
        let err = ExecuteError::Timeout {
          budget_secs: timeout.as_secs(),
          stdout: String::new(),
          stderr: String::new(),
        };
        self
          .audit(host, remote_command, false, Some(&err))
          .await;
        return Err(err);
      }
      WaitOutcome::Cancelled => {
        terminate(&mut child).await;
        let err = ExecuteError::Cancelled;
        self
          .audit(host, remote_command, false, Some(&err))
          .await;
        return Err(err);
      }
    };

    let exit_code = status.code();
    if exit_code == Some(SSH_TRANSPORT_EXIT) {
      let stderr = stderr_task.await.unwrap_or_default();
      let err = ExecuteError::transport(
        stderr.trim().to_string(),
      );
      self
        .audit(host, remote_command, false, Some(&err))
        .await;
      return Err(err);
    }
    let output = CommandOutput {
      exit_code,
      stdout: stdout_task.await.unwrap_or_default(),
      stderr: stderr_task.await.unwrap_or_default(),
    };
    self
      .audit(host, remote_command, output.success(), None)
      .await;
    Ok(output)
  }

  /// Like [run], but maps exit != 0 to `RemoteNonZero`.
  pub async fn run_expect_success(
    &self,
    host: &Host,
    remote_command: &str,
    command_kind: &str,
    timeout: Duration,
    cancel: &CancellationToken,
  ) -> Result<CommandOutput> {
    let output =
      self.run(host, remote_command, timeout, cancel).await?;
    if output.success() {
      Ok(output)
    } else {
      Err(ExecuteError::RemoteNonZero {
        code: output.exit_code.unwrap_or(-1),
        stderr: output.stderr,
        command_kind: command_kind.to_string(),
      })
    }
  }

  async fn run_inner(
    &self,
    host: &Host,
    remote_command: &str,
    timeout: Duration,
    cancel: &CancellationToken,
    mut on_line: Option<&mut (dyn FnMut(&str) + Send)>,
  ) -> Result<CommandOutput> {
    let guard = self.pool.acquire(host, cancel).await?;
    let args = ssh_exec_args(&guard.target()?, remote_command)?;

    let mut child = Command::new("ssh")
      .args(&args)
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true)
      .spawn()
      .map_err(|e| {
        ExecuteError::transport(format!(
          "failed to spawn ssh | {e}"
        ))
      })?;

    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");

    let stderr_task = tokio::spawn(async move {
      let mut buf = String::new();
      let mut stderr = stderr;
      let _ = stderr.read_to_string(&mut buf).await;
      buf
    });

    let mut stdout_buf = String::new();
    let mut lines = BufReader::new(stdout).lines();
    let sleep = tokio::time::sleep(timeout);
    tokio::pin!(sleep);

    let outcome = loop {
      tokio::select! {
        line = lines.next_line() => {
          match line {
            Ok(Some(line)) => {
              if let Some(on_line) = on_line.as_deref_mut() {
                on_line(&line);
              }
              stdout_buf.push_str(&line);
              stdout_buf.push('\n');
            }
            // Stdout closed, wait for exit below.
            Ok(None) => break Outcome::Eof,
            Err(e) => {
              debug!("error reading ssh stdout | {e}");
              break Outcome::Eof;
            }
          }
        }
        _ = &mut sleep => break Outcome::Timeout,
        _ = cancel.cancelled() => break Outcome::Cancelled,
      }
    };

    let outcome = match outcome {
      Outcome::Eof => {
        let waited = {
          let wait = child.wait();
          tokio::pin!(wait);
          tokio::select! {
            status = &mut wait => WaitOutcome::Exited(
              status.map_err(|e| {
                ExecuteError::transport(format!(
                  "failed to await ssh | {e}"
                ))
              })?,
            ),
            _ = &mut sleep => WaitOutcome::TimedOut,
            _ = cancel.cancelled() => WaitOutcome::Cancelled,
          }
        };
        match waited {
          WaitOutcome::Exited(status) => {
            Outcome::Exited(status.code())
          }
          WaitOutcome::TimedOut => Outcome::Timeout,
          WaitOutcome::Cancelled => Outcome::Cancelled,
        }
      }
      other => other,
    };

    let (output, error) = match outcome {
      Outcome::Exited(exit_code) => {
        let stderr = stderr_task.await.unwrap_or_default();
        if exit_code == Some(SSH_TRANSPORT_EXIT) {
          (
            None,
            Some(ExecuteError::transport(
              stderr.trim().to_string(),
            )),
          )
        } else {
          (
            Some(CommandOutput {
              exit_code,
              stdout: stdout_buf,
              stderr,
            }),
            None,
          )
        }
      }
      Outcome::Timeout => {
        terminate(&mut child).await;
        let stderr = stderr_task.await.unwrap_or_default();
        (
          None,
          Some(ExecuteError::Timeout {
            budget_secs: timeout.as_secs(),
            stdout: stdout_buf,
            stderr,
          }),
        )
      }
      Outcome::Cancelled => {
        terminate(&mut child).await;
        (None, Some(ExecuteError::Cancelled))
      }
      Outcome::Eof => unreachable!(),
    };

    match (output, error) {
      (Some(output), None) => {
        self
          .audit(host, remote_command, output.success(), None)
          .await;
        Ok(output)
      }
      (_, Some(err)) => {
        self
          .audit(host, remote_command, false, Some(&err))
          .await;
        Err(err)
      }
      (None, None) => unreachable!(),
    }
  }

  async fn audit(
    &self,
    host: &Host,
    remote_command: &str,
    success: bool,
    error: Option<&ExecuteError>,
  ) {
    self
      .pool
      .audit()
      .record(AuditEntry::new(
        &host.id,
        &host.user,
        remote_command,
        success,
        error.map(|e| e.kind().to_string()),
      ))
      .await;
  }
}

enum Outcome {
  Eof,
  Exited(Option<i32>),
  Timeout,
  Cancelled,
}

enum WaitOutcome {
  Exited(std::process::ExitStatus),
  TimedOut,
  Cancelled,
}

/// SIGTERM, grace period, then SIGKILL.
async fn terminate(child: &mut Child) {
  if let Some(pid) = child.id() {
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
  }
  match tokio::time::timeout(KILL_GRACE, child.wait()).await {
    Ok(_) => {}
    Err(_) => {
      let _ = child.start_kill();
      let _ = child.wait().await;
    }
  }
}
