use serde::{Deserialize, Serialize};
use strum::Display;

/// How bytes moved between the hosts.
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
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TransferType {
  #[default]
  Rsync,
  Zfs,
  /// Dry run or nothing to move.
  None,
}

/// Byte statistics parsed from `rsync --stats` output or zfs
/// properties after the fact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransferStats {
  pub files_transferred: u64,
  pub total_bytes: u64,
  /// Eg `12.34 MB/sec`, as reported by the tool.
  pub rate: String,
  pub speedup: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransferResult {
  pub transfer_type: TransferType,
  pub success: bool,
  pub dry_run: bool,
  pub stats: TransferStats,
  /// `dataset@snapshot` used for the send, zfs only.
  pub snapshot: Option<String>,
  /// Intermediate archive, only when the archive fallback ran.
  pub archive_path: Option<String>,
}

impl TransferResult {
  /// Synthetic success for dry runs, no remote state touched.
  pub fn dry_run(transfer_type: TransferType) -> TransferResult {
    TransferResult {
      transfer_type,
      success: true,
      dry_run: true,
      ..Default::default()
    }
  }
}
