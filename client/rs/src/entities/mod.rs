use async_timing_util::unix_timestamp_ms;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};

/// Backup records and deletion-manifest entries.
pub mod backup;
/// [core config][config::core] and [cli config][config::cli]
pub mod config;
/// [Host] registry entries.
pub mod host;
/// Content census and post-transfer reconciliation.
pub mod inventory;
/// Subtypes of [LogConfig][logger::LogConfig].
pub mod logger;
/// Subtypes of [MigrationContext][migration::MigrationContext].
pub mod migration;
/// Compose files, volume specs, stack list items.
pub mod stack;
/// Transfer results and statistics.
pub mod transfer;
/// Command execution logs.
pub mod update;

/// Unix timestamp in milliseconds.
pub fn stackhaul_timestamp() -> i64 {
  unix_timestamp_ms() as i64
}

pub fn all_logs_success(logs: &[update::Log]) -> bool {
  for log in logs {
    if !log.success {
      return false;
    }
  }
  true
}

pub fn optional_string(string: impl Into<String>) -> Option<String> {
  let string = string.into();
  if string.is_empty() { None } else { Some(string) }
}

/// Represents an empty json object: `{}`
#[derive(
  Debug, Clone, Default, PartialEq, Serialize, Deserialize,
)]
pub struct NoData {}

/// The error taxonomy surfaced by every operation.
/// Phase results and the CLI exit-code mapping key off these.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  Display,
  AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
  /// A validator rejected a user supplied value. Never retried.
  InvalidInput,
  /// Requested host id absent from the registry. Never retried.
  HostNotFound,
  /// SSH transport failed. Retried once with a fresh session.
  TransportError,
  /// Command ran but returned non-zero. Caller decides.
  RemoteNonZero,
  /// Remote command exceeded its budget.
  Timeout,
  /// Per-host quota exhausted.
  RateLimited,
  /// Inventory reconciliation or critical checksum mismatch.
  IntegrityFailure,
  /// Destructive path rejected by the safety gate. Fatal.
  SafetyBlocked,
  /// The restore path itself failed. Terminal.
  RollbackFailed,
  /// Cancellation signal observed.
  Cancelled,
}
