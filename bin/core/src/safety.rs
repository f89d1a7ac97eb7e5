use std::sync::Mutex;

use remote::ExecuteError;
use stackhaul_client::entities::{
  backup::DeletionRecord, stackhaul_timestamp,
};
use tracing::{error, info};

/// Paths that are never deleted, nor anything under them.
pub const FORBIDDEN_PATHS: &[&str] = &[
  "/", "/bin", "/boot", "/dev", "/etc", "/lib", "/proc", "/root",
  "/sbin", "/sys", "/usr", "/var/log", "/var/lib", "/home",
  "/mnt", "/opt",
];

/// Roots under which deletion is always acceptable. Checked
/// before the forbidden list so `/opt/migration_temp` survives
/// the `/opt` entry.
pub const SAFE_DELETE_ROOTS: &[&str] =
  &["/tmp", "/var/tmp", "/opt/migration_temp"];

/// Outside the safe roots, only these artifact extensions...
pub const ALLOWED_DELETE_EXTENSIONS: &[&str] =
  &[".tar.gz", ".tar", ".zip", ".tmp", ".temp", ".migration"];

/// ...and these exact filenames may be deleted.
pub const ALLOWED_DELETE_FILENAMES: &[&str] =
  &["docker-compose.yml", "docker-compose.yaml"];

/// Zfs snapshot deletion requires one of these name prefixes.
pub const SNAPSHOT_DELETE_PREFIXES: &[&str] =
  &["migrate_", "migration_", "backup_", "temp_"];

/// Minimum snapshot name length. Migration snapshots carry
/// timestamps, anything shorter is probably not ours.
const MIN_SNAPSHOT_NAME_LEN: usize = 10;

/// Lexical normalization of a remote path: collapse `//` and
/// `/./`, strip the trailing slash. No filesystem access, the
/// path lives on another machine.
fn normalize(path: &str) -> String {
  let mut out = String::with_capacity(path.len());
  for segment in path.split('/') {
    if segment.is_empty() || segment == "." {
      continue;
    }
    out.push('/');
    out.push_str(segment);
  }
  if out.is_empty() { "/".to_string() } else { out }
}

/// Pure validator for deletion paths. Returns the reason either
/// way; never touches the remote side.
pub fn validate_deletion_path(
  path: &str,
) -> Result<String, String> {
  if path.contains("..") {
    return Err(format!(
      "path '{path}' contains parent directory traversal"
    ));
  }
  if !path.starts_with('/') {
    return Err(format!("path '{path}' is not absolute"));
  }

  let resolved = normalize(path);

  for safe in SAFE_DELETE_ROOTS {
    if resolved.starts_with(&format!("{safe}/")) {
      return Ok(format!("path validated: {resolved}"));
    }
  }

  // Compose files are removable wherever stacks keep them,
  // including appdata trees under otherwise protected roots.
  let filename =
    resolved.rsplit('/').next().unwrap_or_default();
  if ALLOWED_DELETE_FILENAMES.contains(&filename) {
    return Ok(format!("compose file allowed: {resolved}"));
  }

  for forbidden in FORBIDDEN_PATHS {
    let under = if *forbidden == "/" {
      resolved == "/"
    } else {
      resolved == *forbidden
        || resolved.starts_with(&format!("{forbidden}/"))
    };
    if under {
      return Err(format!(
        "path '{resolved}' is in forbidden directory '{forbidden}'"
      ));
    }
  }

  if ALLOWED_DELETE_EXTENSIONS
    .iter()
    .any(|ext| resolved.ends_with(ext))
  {
    return Ok(format!("file type allowed: {resolved}"));
  }

  Err(format!(
    "path '{resolved}' is not in a safe deletion area"
  ))
}

/// Pure validator for the restore-side `rm -rf`. The target is
/// the directory the backup protected, so deleting it is only
/// legitimate when a restorable artifact for exactly that path
/// is in hand.
pub fn validate_restore_target(
  target: &str,
  protected: &str,
  artifact: Option<&str>,
) -> Result<String, String> {
  if target.contains("..") {
    return Err(format!(
      "restore target '{target}' contains parent directory traversal"
    ));
  }
  if !target.starts_with('/') {
    return Err(format!(
      "restore target '{target}' is not absolute"
    ));
  }
  let resolved = normalize(target);
  if resolved != normalize(protected) {
    return Err(format!(
      "restore target '{resolved}' does not match the protected path '{protected}'"
    ));
  }
  let Some(artifact) = artifact else {
    return Err(
      "backup has no artifact, nothing legitimizes deletion"
        .to_string(),
    );
  };
  // The target must not be (or contain) a protected system
  // root. Living under one is fine, that is where appdata is.
  for forbidden in FORBIDDEN_PATHS {
    if resolved == *forbidden
      || (*forbidden != "/"
        && forbidden.starts_with(&format!("{resolved}/")))
    {
      return Err(format!(
        "restore target '{resolved}' overlaps forbidden path '{forbidden}'"
      ));
    }
  }
  if resolved.split('/').filter(|s| !s.is_empty()).count() < 2 {
    return Err(format!(
      "restore target '{resolved}' is too close to the filesystem root"
    ));
  }
  Ok(format!(
    "restore of '{resolved}' from '{artifact}' validated"
  ))
}

/// Pure validator for `zfs destroy` of a snapshot.
pub fn validate_snapshot_deletion(
  snapshot: &str,
) -> Result<String, String> {
  let Some((_dataset, name)) = snapshot.split_once('@') else {
    return Err(
      "invalid snapshot format, must contain '@'".to_string(),
    );
  };
  if !SNAPSHOT_DELETE_PREFIXES
    .iter()
    .any(|prefix| name.starts_with(prefix))
  {
    return Err(format!(
      "snapshot '{name}' does not appear to be migration related"
    ));
  }
  if name.len() < MIN_SNAPSHOT_NAME_LEN {
    return Err(format!(
      "snapshot name '{name}' is too short to be migration related"
    ));
  }
  Ok(format!("zfs snapshot deletion validated: {snapshot}"))
}

/// The safety gate: every destructive remote command consults
/// it first, and every attempt lands on the append-only
/// deletion manifest with its validation outcome, before the
/// command is even issued.
#[derive(Default)]
pub struct SafetyGate {
  manifest: Mutex<Vec<DeletionRecord>>,
}

impl SafetyGate {
  pub fn new() -> SafetyGate {
    Default::default()
  }

  fn append(
    &self,
    path: &str,
    operation: &str,
    reason: &str,
    validated: bool,
    validation_reason: &str,
  ) {
    let record = DeletionRecord {
      path: path.to_string(),
      operation: operation.to_string(),
      reason: reason.to_string(),
      validated,
      validation_reason: validation_reason.to_string(),
      timestamp: stackhaul_timestamp(),
    };
    info!(
      path = record.path,
      operation = record.operation,
      safe = record.validated,
      "added deletion to manifest"
    );
    self
      .manifest
      .lock()
      .unwrap_or_else(|p| p.into_inner())
      .push(record);
  }

  /// Gate a filesystem deletion. `SafetyBlocked` is terminal,
  /// no retries, no fallback.
  pub fn approve_path(
    &self,
    path: &str,
    operation: &str,
    reason: &str,
  ) -> Result<(), ExecuteError> {
    match validate_deletion_path(path) {
      Ok(validation_reason) => {
        self
          .append(path, operation, reason, true, &validation_reason);
        Ok(())
      }
      Err(validation_reason) => {
        self.append(
          path,
          operation,
          reason,
          false,
          &validation_reason,
        );
        error!(
          path,
          reason = validation_reason,
          "deletion blocked by safety gate"
        );
        Err(ExecuteError::SafetyBlocked(validation_reason))
      }
    }
  }

  /// Gate a `zfs destroy` of a snapshot.
  pub fn approve_snapshot(
    &self,
    snapshot: &str,
    recursive: bool,
    reason: &str,
  ) -> Result<(), ExecuteError> {
    let operation = if recursive {
      "zfs destroy -r"
    } else {
      "zfs destroy"
    };
    match validate_snapshot_deletion(snapshot) {
      Ok(validation_reason) => {
        self.append(
          snapshot,
          operation,
          reason,
          true,
          &validation_reason,
        );
        Ok(())
      }
      Err(validation_reason) => {
        self.append(
          snapshot,
          operation,
          reason,
          false,
          &validation_reason,
        );
        error!(
          snapshot,
          reason = validation_reason,
          "snapshot deletion blocked by safety gate"
        );
        Err(ExecuteError::SafetyBlocked(validation_reason))
      }
    }
  }

  /// Gate a `zfs rollback` to a backup snapshot. Rollback
  /// destroys everything written after the snapshot, so it gets
  /// the same name validation as snapshot deletion. Marks the
  /// backup record validated on success.
  pub fn approve_zfs_rollback(
    &self,
    backup: &mut stackhaul_client::entities::backup::BackupInfo,
    snapshot: &str,
  ) -> Result<(), ExecuteError> {
    match validate_snapshot_deletion(snapshot) {
      Ok(validation_reason) => {
        backup.validated = true;
        self.append(
          snapshot,
          "zfs rollback",
          "rollback to pre-migration backup",
          true,
          &validation_reason,
        );
        Ok(())
      }
      Err(validation_reason) => {
        self.append(
          snapshot,
          "zfs rollback",
          "rollback to pre-migration backup",
          false,
          &validation_reason,
        );
        error!(
          snapshot,
          reason = validation_reason,
          "zfs rollback blocked by safety gate"
        );
        Err(ExecuteError::SafetyBlocked(validation_reason))
      }
    }
  }

  /// Gate the restore-side `rm -rf` of the protected path.
  /// Marks the backup record validated on success.
  pub fn approve_restore(
    &self,
    backup: &mut stackhaul_client::entities::backup::BackupInfo,
    target: &str,
  ) -> Result<(), ExecuteError> {
    match validate_restore_target(
      target,
      &backup.protected,
      backup.artifact.as_deref(),
    ) {
      Ok(validation_reason) => {
        backup.validated = true;
        self.append(
          target,
          "rm -rf (restore)",
          "rollback to pre-migration backup",
          true,
          &validation_reason,
        );
        Ok(())
      }
      Err(validation_reason) => {
        self.append(
          target,
          "rm -rf (restore)",
          "rollback to pre-migration backup",
          false,
          &validation_reason,
        );
        error!(
          target,
          reason = validation_reason,
          "restore blocked by safety gate"
        );
        Err(ExecuteError::SafetyBlocked(validation_reason))
      }
    }
  }

  pub fn manifest(&self) -> Vec<DeletionRecord> {
    self
      .manifest
      .lock()
      .unwrap_or_else(|p| p.into_inner())
      .clone()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn forbidden_paths_and_children_are_rejected() {
    for path in [
      "/",
      "/etc",
      "/etc/passwd",
      "/var/lib/docker",
      "/usr/local/bin",
      "/home/user/data",
      "/opt/appdata",
    ] {
      assert!(
        validate_deletion_path(path).is_err(),
        "expected rejection: {path}"
      );
    }
  }

  #[test]
  fn safe_roots_are_allowed() {
    for path in [
      "/tmp/backup_blog_20250101_000000.tar.gz",
      "/var/tmp/scratch",
      "/opt/migration_temp/blog",
    ] {
      assert!(
        validate_deletion_path(path).is_ok(),
        "expected allowed: {path}"
      );
    }
  }

  #[test]
  fn traversal_is_rejected_before_anything_else() {
    assert!(validate_deletion_path("/tmp/../etc").is_err());
    assert!(
      validate_deletion_path("/tmp/a/../../etc/passwd").is_err()
    );
  }

  #[test]
  fn artifact_extensions_allowed_outside_safe_roots() {
    assert!(
      validate_deletion_path("/srv/backups/old.tar.gz").is_ok()
    );
    assert!(
      validate_deletion_path("/srv/upload.migration").is_ok()
    );
    assert!(validate_deletion_path("/srv/backups/old").is_err());
  }

  #[test]
  fn compose_files_allowed_by_name() {
    assert!(
      validate_deletion_path(
        "/srv/stacks/blog/docker-compose.yml"
      )
      .is_ok()
    );
    // Also inside appdata trees under protected roots.
    assert!(
      validate_deletion_path(
        "/opt/docker-appdata/blog/docker-compose.yaml"
      )
      .is_ok()
    );
    assert!(
      validate_deletion_path("/srv/stacks/blog/compose.yml")
        .is_err()
    );
  }

  #[test]
  fn restore_target_must_match_protected_path() {
    assert!(
      validate_restore_target(
        "/opt/docker-appdata/blog",
        "/opt/docker-appdata/blog",
        Some("/tmp/backup_blog_20250101_000000.tar.gz"),
      )
      .is_ok()
    );
    assert!(
      validate_restore_target(
        "/opt/docker-appdata/other",
        "/opt/docker-appdata/blog",
        Some("/tmp/backup_blog_20250101_000000.tar.gz"),
      )
      .is_err()
    );
    assert!(
      validate_restore_target(
        "/opt/docker-appdata/blog",
        "/opt/docker-appdata/blog",
        None,
      )
      .is_err()
    );
    // Never a bare system root, backup or not.
    assert!(
      validate_restore_target(
        "/etc",
        "/etc",
        Some("/tmp/backup_etc.tar.gz")
      )
      .is_err()
    );
    assert!(
      validate_restore_target(
        "/opt",
        "/opt",
        Some("/tmp/backup_opt.tar.gz")
      )
      .is_err()
    );
  }

  #[test]
  fn prefix_collisions_do_not_leak() {
    // '/etcetera' is not under '/etc'.
    assert!(
      validate_deletion_path("/etcetera/file.tar.gz").is_ok()
    );
  }

  #[test]
  fn snapshot_deletion_requires_prefix_and_length() {
    assert!(
      validate_snapshot_deletion(
        "pool/appdata@migrate_20250101_000000"
      )
      .is_ok()
    );
    assert!(
      validate_snapshot_deletion(
        "pool/appdata@backup_blog_20250101_000000"
      )
      .is_ok()
    );
    assert!(
      validate_snapshot_deletion("pool/appdata@daily").is_err()
    );
    assert!(
      validate_snapshot_deletion("pool/appdata@temp_1").is_err()
    );
    assert!(
      validate_snapshot_deletion("pool/appdata").is_err()
    );
  }

  #[test]
  fn blocked_attempts_land_on_the_manifest_unvalidated() {
    let gate = SafetyGate::new();
    let res = gate.approve_path("/etc", "rm -rf", "cleanup");
    assert!(matches!(
      res,
      Err(ExecuteError::SafetyBlocked(_))
    ));
    let manifest = gate.manifest();
    assert_eq!(manifest.len(), 1);
    assert_eq!(manifest[0].path, "/etc");
    assert!(!manifest[0].validated);
  }

  #[test]
  fn approved_attempts_are_recorded_validated_first() {
    let gate = SafetyGate::new();
    gate
      .approve_path(
        "/tmp/backup_blog_1.tar.gz",
        "rm -f",
        "finalize",
      )
      .unwrap();
    let manifest = gate.manifest();
    assert_eq!(manifest.len(), 1);
    assert!(manifest[0].validated);
  }
}
