use stackhaul_client::entities::ErrorKind;

/// The single error taxonomy every remote operation surfaces.
/// Orchestrator phases convert these into migration context
/// entries; the kind drives retry and rollback policy.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecuteError {
  #[error(transparent)]
  InvalidInput(#[from] command::InvalidInput),

  #[error("host '{0}' not found in registry")]
  HostNotFound(String),

  #[error("ssh transport failed | {message}")]
  Transport { message: String },

  #[error("remote command exited {code} | {stderr}")]
  RemoteNonZero {
    code: i32,
    stderr: String,
    /// What kind of command failed, eg `compose_up`.
    command_kind: String,
  },

  #[error("remote command exceeded its {budget_secs}s budget")]
  Timeout {
    budget_secs: u64,
    /// Whatever was captured before the command was killed.
    stdout: String,
    stderr: String,
  },

  #[error("rate limited on host {host}")]
  RateLimited { host: String },

  #[error("integrity failure | {0}")]
  IntegrityFailure(String),

  #[error("blocked by safety gate | {0}")]
  SafetyBlocked(String),

  #[error("rollback failed | {0}")]
  RollbackFailed(String),

  #[error("cancelled")]
  Cancelled,
}

impl ExecuteError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      ExecuteError::InvalidInput(_) => ErrorKind::InvalidInput,
      ExecuteError::HostNotFound(_) => ErrorKind::HostNotFound,
      ExecuteError::Transport { .. } => ErrorKind::TransportError,
      ExecuteError::RemoteNonZero { .. } => {
        ErrorKind::RemoteNonZero
      }
      ExecuteError::Timeout { .. } => ErrorKind::Timeout,
      ExecuteError::RateLimited { .. } => ErrorKind::RateLimited,
      ExecuteError::IntegrityFailure(_) => {
        ErrorKind::IntegrityFailure
      }
      ExecuteError::SafetyBlocked(_) => ErrorKind::SafetyBlocked,
      ExecuteError::RollbackFailed(_) => {
        ErrorKind::RollbackFailed
      }
      ExecuteError::Cancelled => ErrorKind::Cancelled,
    }
  }

  /// Whether a single fresh-session retry is appropriate.
  pub fn retryable_transport(&self) -> bool {
    matches!(self, ExecuteError::Transport { .. })
  }

  pub fn transport(message: impl Into<String>) -> ExecuteError {
    ExecuteError::Transport { message: message.into() }
  }
}
