use serde::{Deserialize, Serialize};
use strum::Display;

/// What kind of recovery artifact was captured.
#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BackupKind {
  #[default]
  DirectoryTar,
  ZfsSnapshot,
}

/// Record of a pre-migration backup on the target host. This is
/// the single reference rollback acts on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackupInfo {
  pub kind: BackupKind,
  pub host_id: String,
  /// The path (directory backup) or dataset (zfs backup) that
  /// was protected.
  pub protected: String,
  /// Tar path or `dataset@snapshot`. None when the protected
  /// path did not exist yet, so there is nothing to restore.
  pub artifact: Option<String>,
  pub size_bytes: u64,
  /// Compact UTC timestamp baked into the artifact name.
  pub timestamp: String,
  pub reason: String,
  pub stack: String,
  /// Set by the safety gate before any restore-side deletion
  /// is performed.
  #[serde(default)]
  pub validated: bool,
  /// Unix ms creation time.
  pub created_at: i64,
}

impl BackupInfo {
  /// Whether a rollback can actually restore anything.
  pub fn restorable(&self) -> bool {
    self.artifact.is_some()
  }
}

/// One entry of the in-memory deletion manifest. Appended, with
/// its validation outcome, before the remote command is issued.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeletionRecord {
  pub path: String,
  /// `rm -f`, `rm -rf`, `zfs destroy`, ...
  pub operation: String,
  pub reason: String,
  pub validated: bool,
  pub validation_reason: String,
  pub timestamp: i64,
}
