use serde::{Deserialize, Serialize};

use crate::entities::stackhaul_timestamp;

/// The result of one executed command, local or remote.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Log {
  /// A label for the step that produced the log, eg `Compose Up`.
  pub stage: String,
  /// The command that was run. For remote commands this is the
  /// remote command, not the wrapping ssh invocation.
  pub command: String,
  pub stdout: String,
  pub stderr: String,
  pub success: bool,
  pub start_ts: i64,
  pub end_ts: i64,
}

impl Log {
  pub fn simple(
    stage: impl Into<String>,
    msg: impl Into<String>,
  ) -> Log {
    let ts = stackhaul_timestamp();
    Log {
      stage: stage.into(),
      stdout: msg.into(),
      success: true,
      start_ts: ts,
      end_ts: ts,
      ..Default::default()
    }
  }

  pub fn error(
    stage: impl Into<String>,
    msg: impl Into<String>,
  ) -> Log {
    let ts = stackhaul_timestamp();
    Log {
      stage: stage.into(),
      stderr: msg.into(),
      success: false,
      start_ts: ts,
      end_ts: ts,
      ..Default::default()
    }
  }

  /// Stdout and stderr merged, for error contexts.
  pub fn combined(&self) -> String {
    match (self.stdout.is_empty(), self.stderr.is_empty()) {
      (true, true) => String::new(),
      (false, true) => self.stdout.clone(),
      (true, false) => self.stderr.clone(),
      (false, false) => {
        format!("stdout: {}\n\nstderr: {}", self.stdout, self.stderr)
      }
    }
  }
}
