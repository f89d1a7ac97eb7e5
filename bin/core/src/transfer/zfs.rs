use std::collections::BTreeMap;

use chrono::Utc;
use command::{quote, validate_dataset};
use remote::ExecuteError;
use stackhaul_client::entities::{
  host::Host,
  transfer::{TransferResult, TransferStats, TransferType},
};
use tracing::{info, warn};

use crate::transfer::{TransferEngine, TransferRequest};

/// Referenced-size drift tolerated between source snapshot and
/// received dataset (compression settings differ across pools).
const REFERENCED_VARIANCE_PCT: f64 = 5.0;

impl TransferEngine<'_> {
  pub(super) async fn zfs_transfer(
    &self,
    req: &TransferRequest<'_>,
  ) -> Result<TransferResult, ExecuteError> {
    let source_dataset =
      req.source.zfs_dataset().ok_or_else(|| {
        command::InvalidInput::new("zfs_dataset", &req.source.id)
      })?;
    let target_dataset =
      req.target.zfs_dataset().ok_or_else(|| {
        command::InvalidInput::new("zfs_dataset", &req.target.id)
      })?;
    validate_dataset(source_dataset)?;
    validate_dataset(target_dataset)?;

    let snapshot_name = format!(
      "migrate_{}",
      Utc::now().format("%Y%m%d_%H%M%S")
    );
    let full_snapshot =
      format!("{source_dataset}@{snapshot_name}");

    // Non-recursive by default. Child datasets only travel on
    // explicit opt-in.
    let snapshot_flags =
      if req.flags.recursive { "-r " } else { "" };
    self
      .executor
      .run_expect_success(
        req.source,
        &format!(
          "zfs snapshot {snapshot_flags}{}",
          quote(&full_snapshot)
        ),
        "zfs_snapshot",
        self.short_timeout,
        self.cancel,
      )
      .await?;
    info!(snapshot = full_snapshot, "created source snapshot");

    if let Err(e) = self
      .send_receive(req, &full_snapshot, target_dataset)
      .await
    {
      // Best effort cleanup of the stranded snapshot.
      if let Err(cleanup) = self
        .destroy_snapshot(
          req.source,
          &full_snapshot,
          req.flags.recursive,
          "failed zfs transfer cleanup",
        )
        .await
      {
        warn!(
          snapshot = full_snapshot,
          "failed to clean up snapshot after transfer error | {cleanup}"
        );
      }
      return Err(e);
    }

    let stats = self
      .verify_received(req, &full_snapshot, target_dataset)
      .await?;

    self
      .destroy_snapshot(
        req.source,
        &full_snapshot,
        req.flags.recursive,
        "transfer snapshot cleanup after success",
      )
      .await?;

    Ok(TransferResult {
      transfer_type: TransferType::Zfs,
      success: true,
      dry_run: false,
      stats,
      snapshot: Some(full_snapshot),
      archive_path: None,
    })
  }

  /// `zfs send | ssh | zfs recv`, running on the source host.
  async fn send_receive(
    &self,
    req: &TransferRequest<'_>,
    full_snapshot: &str,
    target_dataset: &str,
  ) -> Result<(), ExecuteError> {
    let send_flags =
      if req.flags.recursive { "-R " } else { "" };
    // -F destroys diverging target data. Never the default.
    let recv_flags =
      if req.flags.force_receive { "-F " } else { "" };
    if req.flags.force_receive {
      warn!(
        target_dataset,
        "force receive enabled, diverging target data will be destroyed"
      );
    }

    let destination = command::SshTarget {
      user: &req.target.user,
      hostname: &req.target.hostname,
      port: req.target.port,
      identity_file: None,
      control_path: None,
    }
    .destination()?;
    let mut inner_ssh = String::from(
      "ssh -o StrictHostKeyChecking=yes -o BatchMode=yes",
    );
    if req.target.port != 22 {
      command::validate_port(req.target.port)?;
      inner_ssh.push_str(&format!(" -p {}", req.target.port));
    }
    if let Some(identity) = req
      .target
      .identity_file
      .as_deref()
      .and_then(|p| p.to_str())
    {
      command::validate_path(identity)?;
      inner_ssh.push_str(&format!(" -i {identity}"));
    }

    let recv =
      format!("zfs recv {recv_flags}{}", quote(target_dataset));
    let command = format!(
      "zfs send {send_flags}{} | {inner_ssh} {destination} {}",
      quote(full_snapshot),
      quote(&recv),
    );

    info!(
      snapshot = full_snapshot,
      target_dataset,
      source = req.source.id,
      target = req.target.id,
      "starting zfs send/receive"
    );

    let output = self
      .executor
      .run_streamed(
        req.source,
        &command,
        self.rsync_timeout,
        self.cancel,
        &mut |_| {},
      )
      .await?;
    if !output.success() {
      return Err(ExecuteError::RemoteNonZero {
        code: output.exit_code.unwrap_or(-1),
        stderr: output.stderr,
        command_kind: "zfs_send_receive".to_string(),
      });
    }
    Ok(())
  }

  /// The received dataset must exist, be listable, and carry a
  /// referenced size within tolerance of the source snapshot.
  async fn verify_received(
    &self,
    req: &TransferRequest<'_>,
    full_snapshot: &str,
    target_dataset: &str,
  ) -> Result<TransferStats, ExecuteError> {
    let exists = self
      .executor
      .run(
        req.target,
        &format!(
          "zfs list -H -o name {} >/dev/null 2>&1 && echo EXISTS || echo NOT_FOUND",
          quote(target_dataset)
        ),
        self.short_timeout,
        self.cancel,
      )
      .await?;
    if exists.stdout.contains("NOT_FOUND") {
      return Err(ExecuteError::IntegrityFailure(format!(
        "target dataset {target_dataset} not found after receive"
      )));
    }

    let source_props = self
      .dataset_properties(req.source, full_snapshot)
      .await?;
    let target_props = self
      .dataset_properties(req.target, target_dataset)
      .await?;

    let source_ref =
      source_props.get("referenced").copied().unwrap_or(0);
    let target_ref =
      target_props.get("referenced").copied().unwrap_or(0);

    if source_ref > 0 {
      let drift = (target_ref as f64 - source_ref as f64).abs()
        / source_ref as f64
        * 100.0;
      if drift > REFERENCED_VARIANCE_PCT {
        return Err(ExecuteError::IntegrityFailure(format!(
          "received dataset referenced size {target_ref} deviates {drift:.1}% from source {source_ref}"
        )));
      }
    }

    Ok(TransferStats {
      files_transferred: 0,
      total_bytes: target_ref,
      rate: String::new(),
      speedup: 1.0,
    })
  }

  async fn dataset_properties(
    &self,
    host: &Host,
    name: &str,
  ) -> Result<BTreeMap<String, u64>, ExecuteError> {
    let output = self
      .executor
      .run(
        host,
        &format!(
          "zfs get -H -p used,referenced,compressratio {} 2>/dev/null",
          quote(name)
        ),
        self.short_timeout,
        self.cancel,
      )
      .await?;
    Ok(parse_zfs_properties(&output.stdout))
  }

  /// Destroy a snapshot, gated. Recursive destroy additionally
  /// requires the caller to have opted into recursion.
  pub(super) async fn destroy_snapshot(
    &self,
    host: &Host,
    full_snapshot: &str,
    recursive: bool,
    reason: &str,
  ) -> Result<(), ExecuteError> {
    self
      .safety
      .approve_snapshot(full_snapshot, recursive, reason)?;
    let flags = if recursive { "-r " } else { "" };
    self
      .executor
      .run_expect_success(
        host,
        &format!(
          "zfs destroy {flags}{}",
          quote(full_snapshot)
        ),
        "zfs_destroy",
        self.short_timeout,
        self.cancel,
      )
      .await?;
    Ok(())
  }
}

/// Parse `zfs get -H -p` tab separated output into numeric
/// properties. Non numeric values (compressratio) are skipped.
pub fn parse_zfs_properties(
  output: &str,
) -> BTreeMap<String, u64> {
  let mut props = BTreeMap::new();
  for line in output.lines() {
    let fields: Vec<&str> = line.split('\t').collect();
    let [_, property, value, ..] = fields.as_slice() else {
      continue;
    };
    if let Ok(value) = value.trim().parse::<u64>() {
      props.insert(property.trim().to_string(), value);
    }
  }
  props
}

#[cfg(test)]
mod tests {
  use super::*;

  const ZFS_GET_OUTPUT: &str = "\
pool/appdata@migrate_20250101_120000\tused\t8192\t-
pool/appdata@migrate_20250101_120000\treferenced\t536870912\t-
pool/appdata@migrate_20250101_120000\tcompressratio\t1.85\t-
";

  #[test]
  fn parses_numeric_properties() {
    let props = parse_zfs_properties(ZFS_GET_OUTPUT);
    assert_eq!(props.get("used"), Some(&8192));
    assert_eq!(props.get("referenced"), Some(&536_870_912));
    // compressratio is not an integer, skipped.
    assert!(!props.contains_key("compressratio"));
  }

  #[test]
  fn tolerates_garbage_lines() {
    let props = parse_zfs_properties(
      "cannot open 'pool/appdata': dataset does not exist\n",
    );
    assert!(props.is_empty());
  }
}
