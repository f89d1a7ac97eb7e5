use std::{collections::BTreeMap, time::Duration};

use command::quote;
use remote::{ExecuteError, RemoteExecutor};
use stackhaul_client::entities::{
  host::Host,
  migration::MigrateFlags,
  transfer::{TransferResult, TransferType},
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::safety::SafetyGate;

mod rsync;
mod zfs;

pub use rsync::parse_rsync_stats;

/// Everything one data-moving call needs.
pub struct TransferRequest<'a> {
  pub source: &'a Host,
  pub target: &'a Host,
  /// Absolute paths on the source host.
  pub source_paths: &'a [String],
  /// Source absolute path -> target absolute path.
  pub path_mappings: &'a BTreeMap<String, String>,
  pub stack: &'a str,
  pub flags: MigrateFlags,
  /// `--delete` on rsync. Never set on the first data copy.
  pub delete: bool,
}

/// Shared dependencies of both transfer implementations.
pub struct TransferEngine<'a> {
  pub executor: &'a RemoteExecutor,
  pub safety: &'a SafetyGate,
  pub cancel: &'a CancellationToken,
  pub rsync_timeout: Duration,
  pub archive_timeout: Duration,
  pub short_timeout: Duration,
}

/// How bytes will move. Selection is a pure function of the two
/// host descriptors plus a live probe on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMethod {
  Rsync,
  Zfs,
}

impl TransferMethod {
  pub fn transfer_type(&self) -> TransferType {
    match self {
      TransferMethod::Rsync => TransferType::Rsync,
      TransferMethod::Zfs => TransferType::Zfs,
    }
  }
}

impl TransferEngine<'_> {
  /// Zfs iff both hosts declare the capability AND both carry a
  /// dataset AND the live probe succeeds on both. Anything else
  /// falls back to rsync.
  pub async fn select_method(
    &self,
    source: &Host,
    target: &Host,
  ) -> TransferMethod {
    let capable = source.zfs_capable
      && target.zfs_capable
      && source.zfs_dataset().is_some()
      && target.zfs_dataset().is_some();
    if !capable {
      return TransferMethod::Rsync;
    }
    if self.probe_zfs(source).await && self.probe_zfs(target).await
    {
      info!(
        source = source.id,
        target = target.id,
        "both ends zfs capable, selecting zfs send/receive"
      );
      TransferMethod::Zfs
    } else {
      info!(
        source = source.id,
        target = target.id,
        "zfs probe failed, falling back to rsync"
      );
      TransferMethod::Rsync
    }
  }

  /// Live check: the zfs binary exists and the declared dataset
  /// is listable.
  async fn probe_zfs(&self, host: &Host) -> bool {
    let Some(dataset) = host.zfs_dataset() else {
      return false;
    };
    if command::validate_dataset(dataset).is_err() {
      return false;
    }
    let probe = format!(
      "command -v zfs >/dev/null 2>&1 && zfs list -H -o name {} >/dev/null 2>&1 && echo OK",
      quote(dataset)
    );
    matches!(
      self
        .executor
        .run(host, &probe, self.short_timeout, self.cancel)
        .await,
      Ok(output) if output.stdout.trim() == "OK"
    )
  }

  /// The single transfer entry point. Dry runs return synthetic
  /// success without touching either end.
  pub async fn transfer(
    &self,
    method: TransferMethod,
    req: &TransferRequest<'_>,
  ) -> Result<TransferResult, ExecuteError> {
    if req.flags.dry_run {
      return Ok(TransferResult::dry_run(
        method.transfer_type(),
      ));
    }
    match method {
      TransferMethod::Rsync => self.rsync_transfer(req).await,
      TransferMethod::Zfs => self.zfs_transfer(req).await,
    }
  }
}
