use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use stackhaul_client::entities::stackhaul_timestamp;
use tokio::io::AsyncWriteExt;

/// One line of the audit log. The raw command text is never
/// recorded, only its hash and length.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
  pub timestamp: i64,
  pub host_id: String,
  pub user: String,
  /// First 16 hex chars of the sha256 of the command.
  pub command_hash: String,
  pub command_length: usize,
  pub success: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

impl AuditEntry {
  pub fn new(
    host_id: impl Into<String>,
    user: impl Into<String>,
    command: &str,
    success: bool,
    error: Option<String>,
  ) -> AuditEntry {
    AuditEntry {
      timestamp: stackhaul_timestamp(),
      host_id: host_id.into(),
      user: user.into(),
      command_hash: hash_command(command),
      command_length: command.len(),
      success,
      error,
    }
  }
}

/// sha256, first 16 hex chars.
pub fn hash_command(command: &str) -> String {
  let digest = Sha256::digest(command.as_bytes());
  let mut hash = hex::encode(digest);
  hash.truncate(16);
  hash
}

/// Append-only JSON lines log of every remote command
/// execution. Write failures are logged, never propagated, so
/// audit IO cannot take down an operation.
pub struct AuditLog {
  path: PathBuf,
  lock: tokio::sync::Mutex<()>,
}

impl AuditLog {
  pub fn new(path: PathBuf) -> AuditLog {
    AuditLog { path, lock: Default::default() }
  }

  pub async fn record(&self, entry: AuditEntry) {
    let Ok(mut line) = serde_json::to_string(&entry) else {
      return;
    };
    line.push('\n');
    let _guard = self.lock.lock().await;
    let res = async {
      let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&self.path)
        .await?;
      file.write_all(line.as_bytes()).await
    }
    .await;
    if let Err(e) = res {
      tracing::warn!(
        "failed to append audit log at {:?} | {e:?}",
        self.path
      );
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn hash_is_16_hex_chars_and_stable() {
    let hash = hash_command("docker compose -p blog ps");
    assert_eq!(hash.len(), 16);
    assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(
      hash,
      hash_command("docker compose -p blog ps")
    );
    assert_ne!(hash, hash_command("docker compose -p blog up"));
  }

  #[test]
  fn entries_never_serialize_the_raw_command() {
    let entry = AuditEntry::new(
      "nas",
      "deploy",
      "docker compose -p blog up -d",
      true,
      None,
    );
    let line = serde_json::to_string(&entry).unwrap();
    assert!(!line.contains("compose"));
    assert!(line.contains(&entry.command_hash));
    assert!(line.contains("\"command_length\":28"));
  }
}
