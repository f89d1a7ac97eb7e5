use std::time::Duration;

use command::{quote, validate_path};
use remote::{ExecuteError, RemoteExecutor};
use serde::Serialize;
use stackhaul_client::entities::host::Host;
use tokio_util::sync::CancellationToken;

/// Disk space margin over the measured data size.
pub const DISK_SAFETY_MARGIN: f64 = 1.2;

/// Binaries the migration pipeline needs on both ends.
pub const REQUIRED_TOOLS: &[&str] = &["docker", "tar", "rsync"];

#[derive(Debug, Clone, Default, Serialize)]
pub struct PreflightReport {
  pub required_bytes: u64,
  pub available_bytes: u64,
  pub disk_ok: bool,
  pub missing_tools: Vec<String>,
  pub source_docker_ok: bool,
  pub target_docker_ok: bool,
}

impl PreflightReport {
  pub fn passed(&self) -> bool {
    self.disk_ok
      && self.missing_tools.is_empty()
      && self.source_docker_ok
      && self.target_docker_ok
  }
}

pub struct Preflight<'a> {
  pub executor: &'a RemoteExecutor,
  pub cancel: &'a CancellationToken,
  pub timeout: Duration,
}

impl Preflight<'_> {
  /// Disk space (with margin), required tools on the target,
  /// docker reachability on both ends.
  pub async fn run(
    &self,
    source: &Host,
    target: &Host,
    data_size_bytes: u64,
  ) -> Result<PreflightReport, ExecuteError> {
    let required_bytes =
      (data_size_bytes as f64 * DISK_SAFETY_MARGIN) as u64;
    let available_bytes = self
      .available_bytes(target, &target.appdata_path)
      .await?;

    let mut missing_tools = Vec::new();
    for tool in REQUIRED_TOOLS {
      if !self.tool_present(target, tool).await? {
        missing_tools.push(tool.to_string());
      }
    }
    // Rsync speaks to rsync, the source end needs it too.
    if !self.tool_present(source, "rsync").await? {
      missing_tools.push("rsync (source)".to_string());
    }

    let source_docker_ok = self.docker_ok(source).await;
    let target_docker_ok = self.docker_ok(target).await;

    Ok(PreflightReport {
      required_bytes,
      available_bytes,
      disk_ok: available_bytes >= required_bytes,
      missing_tools,
      source_docker_ok,
      target_docker_ok,
    })
  }

  async fn available_bytes(
    &self,
    host: &Host,
    path: &str,
  ) -> Result<u64, ExecuteError> {
    validate_path(path.trim_end_matches('/'))?;
    // The appdata dir may not exist yet on a fresh target,
    // fall back to the filesystem root.
    let command = format!(
      "df -Pk {} 2>/dev/null || df -Pk /",
      quote(path.trim_end_matches('/'))
    );
    let output = self
      .executor
      .run(host, &command, self.timeout, self.cancel)
      .await?;
    Ok(parse_df_available(&output.stdout).unwrap_or(0))
  }

  async fn tool_present(
    &self,
    host: &Host,
    tool: &str,
  ) -> Result<bool, ExecuteError> {
    let output = self
      .executor
      .run(
        host,
        &format!(
          "command -v {} >/dev/null 2>&1 && echo ok || echo missing",
          quote(tool)
        ),
        self.timeout,
        self.cancel,
      )
      .await?;
    Ok(output.stdout.trim() == "ok")
  }

  async fn docker_ok(&self, host: &Host) -> bool {
    matches!(
      self
        .executor
        .run(
          host,
          "docker info --format '{{.ServerVersion}}' >/dev/null 2>&1 && echo ok",
          self.timeout,
          self.cancel,
        )
        .await,
      Ok(output) if output.stdout.trim() == "ok"
    )
  }
}

/// `df -Pk` POSIX output: the available column of the last
/// line, in 1K blocks.
pub fn parse_df_available(stdout: &str) -> Option<u64> {
  let line = stdout
    .lines()
    .filter(|l| !l.trim().is_empty())
    .next_back()?;
  let fields: Vec<&str> = line.split_whitespace().collect();
  // Filesystem 1024-blocks Used Available Capacity Mounted-on
  let available_kb = fields.get(3)?.parse::<u64>().ok()?;
  Some(available_kb * 1024)
}

#[cfg(test)]
mod tests {
  use super::*;

  const DF_OUTPUT: &str = "\
Filesystem     1024-blocks      Used Available Capacity Mounted on
/dev/sda1        959786032 224092584 686854576      25% /
";

  #[test]
  fn parses_df_available_column() {
    assert_eq!(
      parse_df_available(DF_OUTPUT),
      Some(686_854_576 * 1024)
    );
  }

  #[test]
  fn df_garbage_is_none() {
    assert_eq!(parse_df_available(""), None);
    assert_eq!(parse_df_available("df: no such file\n"), None);
  }

  #[test]
  fn report_requires_margin() {
    let report = PreflightReport {
      required_bytes: (100.0 * DISK_SAFETY_MARGIN) as u64,
      available_bytes: 110,
      disk_ok: 110 >= (100.0 * DISK_SAFETY_MARGIN) as u64,
      missing_tools: vec![],
      source_docker_ok: true,
      target_docker_ok: true,
    };
    // 110 < 120: under the 20% margin even though the raw data
    // would fit.
    assert!(!report.passed());
  }
}
