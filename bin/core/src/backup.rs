use std::time::Duration;

use chrono::Utc;
use command::{quote, validate_dataset, validate_path};
use remote::{ExecuteError, RemoteExecutor};
use stackhaul_client::entities::{
  backup::{BackupInfo, BackupKind},
  host::Host,
  stackhaul_timestamp,
  update::Log,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::safety::SafetyGate;

/// Captures the pre-migration state of a target and restores it
/// on failure. Every destructive path goes through the gate.
pub struct BackupEngine<'a> {
  pub executor: &'a RemoteExecutor,
  pub safety: &'a SafetyGate,
  pub cancel: &'a CancellationToken,
  pub backup_timeout: Duration,
  pub short_timeout: Duration,
}

impl BackupEngine<'_> {
  /// Capture the target's current state: a zfs snapshot when
  /// the host is zfs backed, a directory tar otherwise.
  pub async fn capture(
    &self,
    host: &Host,
    protected_path: &str,
    stack: &str,
    reason: &str,
  ) -> Result<BackupInfo, ExecuteError> {
    match host.zfs_dataset() {
      Some(dataset) if host.zfs_capable => {
        self
          .backup_zfs_dataset(host, dataset, stack, reason)
          .await
      }
      _ => {
        self
          .backup_directory(host, protected_path, stack, reason)
          .await
      }
    }
  }

  /// Tar.gz of the current target path, written under /tmp on
  /// the target host. A missing source path yields a no-op
  /// record with no artifact.
  pub async fn backup_directory(
    &self,
    host: &Host,
    source_path: &str,
    stack: &str,
    reason: &str,
  ) -> Result<BackupInfo, ExecuteError> {
    validate_path(source_path)?;
    let timestamp =
      Utc::now().format("%Y%m%d_%H%M%S").to_string();
    let backup_path =
      format!("/tmp/backup_{stack}_{timestamp}.tar.gz");

    let exists = self
      .executor
      .run(
        host,
        &format!(
          "test -d {} && echo EXISTS || echo NOT_FOUND",
          quote(source_path)
        ),
        self.short_timeout,
        self.cancel,
      )
      .await?;
    if exists.stdout.contains("NOT_FOUND") {
      info!(
        path = source_path,
        host = host.id,
        "target path does not exist, backup skipped"
      );
      return Ok(BackupInfo {
        kind: BackupKind::DirectoryTar,
        host_id: host.id.clone(),
        protected: source_path.to_string(),
        artifact: None,
        size_bytes: 0,
        timestamp,
        reason: reason.to_string(),
        stack: stack.to_string(),
        validated: false,
        created_at: stackhaul_timestamp(),
      });
    }

    let parent = parent_of(source_path);
    let basename = source_path
      .trim_end_matches('/')
      .rsplit('/')
      .next()
      .unwrap_or(source_path);
    self
      .executor
      .run_expect_success(
        host,
        &format!(
          "cd {} && tar czf {} {} 2>/dev/null",
          quote(&parent),
          quote(&backup_path),
          quote(basename)
        ),
        "backup_tar",
        self.backup_timeout,
        self.cancel,
      )
      .await?;

    let size = self
      .executor
      .run(
        host,
        &format!(
          "stat -c%s {} 2>/dev/null || echo 0",
          quote(&backup_path)
        ),
        self.short_timeout,
        self.cancel,
      )
      .await?;
    let size_bytes =
      size.stdout.trim().parse::<u64>().unwrap_or(0);

    info!(
      backup = backup_path,
      size_bytes,
      host = host.id,
      "directory backup created"
    );

    Ok(BackupInfo {
      kind: BackupKind::DirectoryTar,
      host_id: host.id.clone(),
      protected: source_path.to_string(),
      artifact: Some(backup_path),
      size_bytes,
      timestamp,
      reason: reason.to_string(),
      stack: stack.to_string(),
      validated: false,
      created_at: stackhaul_timestamp(),
    })
  }

  /// `backup_<stack>_<ts>` snapshot on the target dataset.
  pub async fn backup_zfs_dataset(
    &self,
    host: &Host,
    dataset: &str,
    stack: &str,
    reason: &str,
  ) -> Result<BackupInfo, ExecuteError> {
    validate_dataset(dataset)?;
    let timestamp =
      Utc::now().format("%Y%m%d_%H%M%S").to_string();
    let full_snapshot =
      format!("{dataset}@backup_{stack}_{timestamp}");

    self
      .executor
      .run_expect_success(
        host,
        &format!("zfs snapshot {}", quote(&full_snapshot)),
        "backup_snapshot",
        self.short_timeout,
        self.cancel,
      )
      .await?;

    let size = self
      .executor
      .run(
        host,
        &format!(
          "zfs list -H -p -o used {} 2>/dev/null || echo 0",
          quote(&full_snapshot)
        ),
        self.short_timeout,
        self.cancel,
      )
      .await?;
    let size_bytes = parse_zfs_size(size.stdout.trim());

    info!(
      snapshot = full_snapshot,
      size_bytes,
      host = host.id,
      "zfs backup snapshot created"
    );

    Ok(BackupInfo {
      kind: BackupKind::ZfsSnapshot,
      host_id: host.id.clone(),
      protected: dataset.to_string(),
      artifact: Some(full_snapshot),
      size_bytes,
      timestamp,
      reason: reason.to_string(),
      stack: stack.to_string(),
      validated: false,
      created_at: stackhaul_timestamp(),
    })
  }

  /// Restore the target to the backed up state. Only invoked
  /// when the safety gate approves; the gate marks the record
  /// validated before any deletion happens.
  pub async fn restore(
    &self,
    host: &Host,
    backup: &mut BackupInfo,
  ) -> Result<(), ExecuteError> {
    match backup.kind {
      BackupKind::DirectoryTar => {
        self.restore_directory(host, backup).await
      }
      BackupKind::ZfsSnapshot => {
        self.restore_zfs(host, backup).await
      }
    }
  }

  async fn restore_directory(
    &self,
    host: &Host,
    backup: &mut BackupInfo,
  ) -> Result<(), ExecuteError> {
    let target = backup.protected.clone();
    let Some(artifact) = backup.artifact.clone() else {
      // Nothing existed before the migration, nothing to
      // restore.
      info!(
        path = target,
        "backup had no artifact, restore is a no-op"
      );
      return Ok(());
    };
    self.safety.approve_restore(backup, &target)?;

    let parent = parent_of(&target);
    self
      .executor
      .run_expect_success(
        host,
        &format!(
          "rm -rf {} && cd {} && tar xzf {}",
          quote(&target),
          quote(&parent),
          quote(&artifact)
        ),
        "restore_tar",
        self.backup_timeout,
        self.cancel,
      )
      .await
      .map_err(|e| {
        ExecuteError::RollbackFailed(e.to_string())
      })?;

    info!(
      backup = artifact,
      target,
      host = host.id,
      "directory restored from backup"
    );
    Ok(())
  }

  async fn restore_zfs(
    &self,
    host: &Host,
    backup: &mut BackupInfo,
  ) -> Result<(), ExecuteError> {
    let Some(snapshot) = backup.artifact.clone() else {
      return Err(ExecuteError::RollbackFailed(
        "zfs backup record has no snapshot".to_string(),
      ));
    };
    self.safety.approve_zfs_rollback(backup, &snapshot)?;

    self
      .executor
      .run_expect_success(
        host,
        &format!("zfs rollback {}", quote(&snapshot)),
        "restore_rollback",
        self.backup_timeout,
        self.cancel,
      )
      .await
      .map_err(|e| {
        ExecuteError::RollbackFailed(e.to_string())
      })?;

    info!(
      snapshot,
      host = host.id,
      "zfs dataset rolled back to backup snapshot"
    );
    Ok(())
  }

  /// Delete a backup artifact: tar archive (`rm -f`) or zfs
  /// snapshot (`zfs destroy`), both gated.
  pub async fn cleanup_artifact(
    &self,
    host: &Host,
    artifact: &str,
    reason: &str,
  ) -> Result<Log, ExecuteError> {
    let start_ts = stackhaul_timestamp();
    let command = if artifact.contains('@') {
      self.safety.approve_snapshot(artifact, false, reason)?;
      format!("zfs destroy {}", quote(artifact))
    } else {
      self.safety.approve_path(artifact, "rm -f", reason)?;
      validate_path(artifact)?;
      format!("rm -f {}", quote(artifact))
    };
    let output = self
      .executor
      .run_expect_success(
        host,
        &command,
        "backup_cleanup",
        self.short_timeout,
        self.cancel,
      )
      .await?;
    Ok(remote::output_into_log(
      "Cleanup Backup",
      command,
      start_ts,
      &output,
    ))
  }
}

fn parent_of(path: &str) -> String {
  let trimmed = path.trim_end_matches('/');
  match trimmed.rfind('/') {
    Some(0) | None => "/".to_string(),
    Some(idx) => trimmed[..idx].to_string(),
  }
}

/// Sizes from `zfs list -o used`: plain bytes with `-p`, or
/// human units (`1.2G`, `512M`, `4K`) from older zfs.
pub fn parse_zfs_size(value: &str) -> u64 {
  let value = value.trim();
  if let Ok(bytes) = value.parse::<u64>() {
    return bytes;
  }
  let (number, unit) = match value
    .char_indices()
    .find(|(_, c)| c.is_ascii_alphabetic())
  {
    Some((idx, _)) => value.split_at(idx),
    None => return 0,
  };
  let Ok(number) = number.parse::<f64>() else {
    return 0;
  };
  let multiplier: u64 = match unit
    .chars()
    .next()
    .map(|c| c.to_ascii_uppercase())
  {
    Some('B') => 1,
    Some('K') => 1 << 10,
    Some('M') => 1 << 20,
    Some('G') => 1 << 30,
    Some('T') => 1 << 40,
    _ => return 0,
  };
  (number * multiplier as f64) as u64
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_exact_and_human_sizes() {
    assert_eq!(parse_zfs_size("536870912"), 536_870_912);
    assert_eq!(parse_zfs_size("4K"), 4096);
    assert_eq!(parse_zfs_size("512M"), 512 * (1 << 20));
    assert_eq!(
      parse_zfs_size("1.2G"),
      (1.2 * (1u64 << 30) as f64) as u64
    );
    assert_eq!(parse_zfs_size("0"), 0);
    assert_eq!(parse_zfs_size("-"), 0);
    assert_eq!(parse_zfs_size("garbage"), 0);
  }

  #[test]
  fn parent_of_handles_root_children() {
    assert_eq!(
      parent_of("/opt/docker-appdata/blog"),
      "/opt/docker-appdata"
    );
    assert_eq!(parent_of("/opt"), "/");
  }
}
