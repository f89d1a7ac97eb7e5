use command::{quote, validate_path};
use remote::ExecuteError;
use stackhaul_client::entities::{
  host::Host,
  transfer::{TransferResult, TransferStats, TransferType},
};
use tracing::{debug, info};

use crate::transfer::{TransferEngine, TransferRequest};

/// Hardened rsync container for sources the ssh user cannot
/// read directly. Only DAC_OVERRIDE + CHOWN, data mounted
/// read-only.
const RSYNC_IMAGE: &str = "instrumentisto/rsync-ssh:latest";

impl TransferEngine<'_> {
  pub(super) async fn rsync_transfer(
    &self,
    req: &TransferRequest<'_>,
  ) -> Result<TransferResult, ExecuteError> {
    let zstd = self.rsync_supports_zstd(req.source).await;
    let mut stats = TransferStats::default();
    let mut archive_path = None;

    for source_path in req.source_paths {
      let target_path = req
        .path_mappings
        .get(source_path)
        .ok_or_else(|| {
          command::InvalidInput::new(
            "path_mapping",
            source_path.clone(),
          )
        })?;
      validate_path(source_path)?;
      validate_path(target_path)?;

      // Rsync creates the last component, the parent must
      // exist on the target.
      if let Some(parent) = parent_dir(target_path) {
        self
          .executor
          .run_expect_success(
            req.target,
            &format!("mkdir -p {}", quote(&parent)),
            "mkdir",
            self.short_timeout,
            self.cancel,
          )
          .await?;
      }

      if req.flags.archive {
        let archive = self
          .archive_transfer(req, source_path, target_path)
          .await?;
        archive_path = Some(archive);
        continue;
      }

      let privileged = self
        .needs_privileged_read(req.source, source_path)
        .await;
      let command = build_rsync_command(
        req.target,
        source_path,
        target_path,
        zstd,
        privileged,
        req.delete,
      )?;

      info!(
        source = format!("{}:{source_path}", req.source.id),
        target = format!("{}:{target_path}", req.target.id),
        privileged,
        "starting rsync transfer"
      );

      let output = self
        .executor
        .run_streamed(
          req.source,
          &command,
          self.rsync_timeout,
          self.cancel,
          &mut |line| debug!(target: "rsync", "{line}"),
        )
        .await?;
      if !output.success() {
        return Err(ExecuteError::RemoteNonZero {
          code: output.exit_code.unwrap_or(-1),
          stderr: output.stderr,
          command_kind: "rsync".to_string(),
        });
      }
      merge_stats(&mut stats, parse_rsync_stats(&output.stdout));
    }

    Ok(TransferResult {
      transfer_type: TransferType::Rsync,
      success: true,
      dry_run: false,
      stats,
      snapshot: None,
      archive_path,
    })
  }

  async fn rsync_supports_zstd(&self, host: &Host) -> bool {
    matches!(
      self
        .executor
        .run(
          host,
          "rsync --version 2>/dev/null | grep -qi zstd && echo yes || echo no",
          self.short_timeout,
          self.cancel,
        )
        .await,
      Ok(output) if output.stdout.trim() == "yes"
    )
  }

  /// Whether any file under the path is unreadable by the ssh
  /// user, which routes the copy through the hardened
  /// containerized rsync.
  async fn needs_privileged_read(
    &self,
    host: &Host,
    path: &str,
  ) -> bool {
    matches!(
      self
        .executor
        .run(
          host,
          &format!(
            "find {} ! -readable -print -quit 2>/dev/null",
            quote(path)
          ),
          self.short_timeout,
          self.cancel,
        )
        .await,
      Ok(output) if !output.stdout.trim().is_empty()
    )
  }

  /// Tar-over-rsync fallback, explicit opt-in only: pack on the
  /// source, copy the archive, unpack on the target, remove the
  /// archive on both ends (through the safety gate).
  async fn archive_transfer(
    &self,
    req: &TransferRequest<'_>,
    source_path: &str,
    target_path: &str,
  ) -> Result<String, ExecuteError> {
    let archive = format!(
      "/tmp/{}_migration_{:08x}.tar.gz",
      req.stack,
      rand::random::<u32>()
    );
    let source_parent = parent_dir(source_path)
      .unwrap_or_else(|| "/".to_string());
    let basename = base_name(source_path);

    self
      .executor
      .run_expect_success(
        req.source,
        &format!(
          "tar czf {} -C {} {}",
          quote(&archive),
          quote(&source_parent),
          quote(basename)
        ),
        "tar_pack",
        self.archive_timeout,
        self.cancel,
      )
      .await?;

    let copy = build_rsync_file_command(
      req.target, &archive, &archive,
    )?;
    let output = self
      .executor
      .run_streamed(
        req.source,
        &copy,
        self.rsync_timeout,
        self.cancel,
        &mut |line| debug!(target: "rsync", "{line}"),
      )
      .await?;
    if !output.success() {
      return Err(ExecuteError::RemoteNonZero {
        code: output.exit_code.unwrap_or(-1),
        stderr: output.stderr,
        command_kind: "rsync_archive".to_string(),
      });
    }

    let target_parent = parent_dir(target_path)
      .unwrap_or_else(|| "/".to_string());
    let mut unpack = format!(
      "mkdir -p {parent} && tar xzf {archive} -C {parent}",
      parent = quote(&target_parent),
      archive = quote(&archive),
    );
    let target_basename = base_name(target_path);
    if basename != target_basename {
      unpack.push_str(&format!(
        " && mv {}/{} {}",
        quote(&target_parent),
        quote(basename),
        quote(target_path)
      ));
    }
    self
      .executor
      .run_expect_success(
        req.target,
        &unpack,
        "tar_unpack",
        self.archive_timeout,
        self.cancel,
      )
      .await?;

    // Remove the intermediate archives on both ends.
    self.safety.approve_path(
      &archive,
      "rm -f",
      "migration archive cleanup",
    )?;
    for host in [req.source, req.target] {
      self
        .executor
        .run_expect_success(
          host,
          &format!("rm -f {}", quote(&archive)),
          "archive_cleanup",
          self.short_timeout,
          self.cancel,
        )
        .await?;
    }

    Ok(archive)
  }
}

fn parent_dir(path: &str) -> Option<String> {
  let trimmed = path.trim_end_matches('/');
  let idx = trimmed.rfind('/')?;
  if idx == 0 {
    Some("/".to_string())
  } else {
    Some(trimmed[..idx].to_string())
  }
}

fn base_name(path: &str) -> &str {
  path.trim_end_matches('/').rsplit('/').next().unwrap_or(path)
}

/// Destination address and the `-e` ssh command rsync uses to
/// reach it from the source host. The target's identity file is
/// expected at the same path on the source.
fn rsync_destination(
  target: &Host,
) -> Result<(String, String, Option<&str>), ExecuteError> {
  let destination = command::SshTarget {
    user: &target.user,
    hostname: &target.hostname,
    port: target.port,
    identity_file: None,
    control_path: None,
  }
  .destination()?;

  let mut inner_ssh = String::from(
    "ssh -o StrictHostKeyChecking=yes -o BatchMode=yes",
  );
  if target.port != 22 {
    command::validate_port(target.port)?;
    inner_ssh.push_str(&format!(" -p {}", target.port));
  }
  let identity = target
    .identity_file
    .as_deref()
    .and_then(|p| p.to_str())
    .map(validate_path)
    .transpose()?;
  if let Some(identity) = identity {
    inner_ssh.push_str(&format!(" -i {identity}"));
  }

  Ok((destination, inner_ssh, identity))
}

/// The rsync invocation that runs ON the source host, talking
/// over ssh to the target. Direct directory transfer, no
/// intermediate archive. Trailing slashes copy contents into
/// the computed target directory.
fn build_rsync_command(
  target: &Host,
  source_path: &str,
  target_path: &str,
  zstd: bool,
  privileged: bool,
  delete: bool,
) -> Result<String, ExecuteError> {
  validate_path(source_path)?;
  validate_path(target_path)?;
  let (destination, inner_ssh, identity) =
    rsync_destination(target)?;

  let mut flags =
    String::from("-a -P --stats -z --compress-level=6");
  if zstd {
    flags.push_str(" --compress-choice=zstd");
  }
  if delete {
    flags.push_str(" --delete");
  }

  let rsync = format!(
    "rsync {flags} -e {} {}/ {destination}:{}/",
    quote(&inner_ssh),
    quote(source_path),
    quote(target_path),
  );

  if privileged {
    let mut command = format!(
      "docker run --rm --cap-drop ALL --cap-add DAC_OVERRIDE --cap-add CHOWN -v {src}:{src}:ro",
      src = quote(source_path),
    );
    if let Some(identity) = identity {
      command
        .push_str(&format!(" -v {identity}:{identity}:ro"));
    }
    command.push_str(&format!(" {RSYNC_IMAGE} {rsync}"));
    Ok(command)
  } else {
    Ok(rsync)
  }
}

/// Single regular file copy, for the archive fallback. No
/// trailing slashes: rsync refuses `file/` on a non-directory.
/// No compression either, the archive is already gzipped.
fn build_rsync_file_command(
  target: &Host,
  source_file: &str,
  target_file: &str,
) -> Result<String, ExecuteError> {
  validate_path(source_file)?;
  validate_path(target_file)?;
  let (destination, inner_ssh, _) = rsync_destination(target)?;
  Ok(format!(
    "rsync -a -P --stats -e {} {} {destination}:{}",
    quote(&inner_ssh),
    quote(source_file),
    quote(target_file),
  ))
}

fn merge_stats(into: &mut TransferStats, stats: TransferStats) {
  into.files_transferred += stats.files_transferred;
  into.total_bytes += stats.total_bytes;
  if !stats.rate.is_empty() {
    into.rate = stats.rate;
  }
  if stats.speedup > 0.0 {
    into.speedup = stats.speedup;
  }
}

/// Parse `rsync --stats` summary output. Pinned against both
/// the 3.1 wording (`Number of files transferred`) and the 3.2
/// wording (`Number of regular files transferred`).
pub fn parse_rsync_stats(output: &str) -> TransferStats {
  let mut stats = TransferStats::default();
  for line in output.lines() {
    let line = line.trim();
    if let Some(rest) =
      line.strip_prefix("Number of regular files transferred:")
    {
      stats.files_transferred = parse_grouped_int(rest);
    } else if let Some(rest) =
      line.strip_prefix("Number of files transferred:")
    {
      stats.files_transferred = parse_grouped_int(rest);
    } else if let Some(rest) =
      line.strip_prefix("Total transferred file size:")
    {
      stats.total_bytes = parse_grouped_int(rest);
    } else if line.starts_with("sent ")
      && line.contains("bytes/sec")
    {
      // sent 1,632 bytes  received 35 bytes  1,111.33 bytes/sec
      if let Some(rate) = line
        .rsplit("  ")
        .next()
        .and_then(|r| r.strip_suffix("bytes/sec"))
      {
        stats.rate =
          format!("{} bytes/sec", rate.trim());
      }
    } else if let Some(idx) = line.find("speedup is ") {
      let rest = &line[idx + "speedup is ".len()..];
      stats.speedup = rest
        .trim()
        .parse()
        .unwrap_or_default();
    }
  }
  stats
}

/// `" 1,234 bytes"` style numbers.
fn parse_grouped_int(value: &str) -> u64 {
  let digits: String = value
    .chars()
    .take_while(|c| {
      c.is_ascii_digit() || *c == ',' || c.is_whitespace()
    })
    .filter(|c| c.is_ascii_digit())
    .collect();
  digits.parse().unwrap_or(0)
}

#[cfg(test)]
mod tests {
  use super::*;

  /// rsync 3.2.x `--stats` fixture.
  const RSYNC_32_STATS: &str = "\
Number of files: 1,235 (reg: 1,234, dir: 1)
Number of created files: 1,234 (reg: 1,234)
Number of deleted files: 0
Number of regular files transferred: 1,234
Total file size: 536,870,912 bytes
Total transferred file size: 536,870,912 bytes
Literal data: 536,870,912 bytes
Matched data: 0 bytes
File list size: 65,535
File list generation time: 0.001 seconds
File list transfer time: 0.000 seconds
Total bytes sent: 537,001,216
Total bytes received: 23,456

sent 537,001,216 bytes  received 23,456 bytes  41,309,590.15 bytes/sec
total size is 536,870,912  speedup is 1.00
";

  /// rsync 3.1.x wording.
  const RSYNC_31_STATS: &str = "\
Number of files: 42
Number of files transferred: 40
Total file size: 1048576 bytes
Total transferred file size: 1048576 bytes

sent 1050000 bytes  received 800 bytes  700533.33 bytes/sec
total size is 1048576  speedup is 1.00
";

  #[test]
  fn parses_rsync_32_stats() {
    let stats = parse_rsync_stats(RSYNC_32_STATS);
    assert_eq!(stats.files_transferred, 1234);
    assert_eq!(stats.total_bytes, 536_870_912);
    assert_eq!(stats.rate, "41,309,590.15 bytes/sec");
    assert_eq!(stats.speedup, 1.0);
  }

  #[test]
  fn parses_rsync_31_stats() {
    let stats = parse_rsync_stats(RSYNC_31_STATS);
    assert_eq!(stats.files_transferred, 40);
    assert_eq!(stats.total_bytes, 1_048_576);
    assert_eq!(stats.rate, "700533.33 bytes/sec");
  }

  #[test]
  fn empty_output_parses_to_zeroes() {
    let stats = parse_rsync_stats("");
    assert_eq!(stats.files_transferred, 0);
    assert_eq!(stats.total_bytes, 0);
    assert!(stats.rate.is_empty());
  }

  fn target_host() -> Host {
    Host {
      id: "tgtA".into(),
      hostname: "tgt.lan".into(),
      user: "deploy".into(),
      port: 22,
      ..Default::default()
    }
  }

  #[test]
  fn direct_rsync_command_shape() {
    let command = build_rsync_command(
      &target_host(),
      "/opt/appdata/blog",
      "/opt/appdata/blog",
      true,
      false,
      false,
    )
    .unwrap();
    assert!(command.starts_with("rsync -a -P --stats -z"));
    assert!(command.contains("--compress-choice=zstd"));
    assert!(!command.contains("--delete"));
    assert!(command.ends_with(
      "/opt/appdata/blog/ deploy@tgt.lan:/opt/appdata/blog/"
    ));
  }

  #[test]
  fn privileged_variant_runs_in_container() {
    let command = build_rsync_command(
      &target_host(),
      "/opt/appdata/blog",
      "/opt/appdata/blog",
      false,
      true,
      false,
    )
    .unwrap();
    assert!(command.starts_with("docker run --rm --cap-drop ALL"));
    assert!(command.contains("--cap-add DAC_OVERRIDE"));
    assert!(command.contains("--cap-add CHOWN"));
    assert!(
      command.contains("-v /opt/appdata/blog:/opt/appdata/blog:ro")
    );
  }

  #[test]
  fn archive_copy_is_file_to_file() {
    let archive = "/tmp/blog_migration_0a1b2c3d.tar.gz";
    let command = build_rsync_file_command(
      &target_host(),
      archive,
      archive,
    )
    .unwrap();
    // A trailing slash on a regular-file source makes rsync
    // fail with "Not a directory".
    assert!(!command.contains(&format!("{archive}/")));
    assert!(command.ends_with(&format!(
      "{archive} deploy@tgt.lan:{archive}"
    )));
    // Already gzipped, recompressing would only burn cpu.
    assert!(!command.contains("-z"));
  }

  #[test]
  fn parent_dir_handles_roots() {
    assert_eq!(
      parent_dir("/opt/appdata/blog"),
      Some("/opt/appdata".to_string())
    );
    assert_eq!(parent_dir("/opt"), Some("/".to_string()));
    assert_eq!(parent_dir("/"), None);
  }
}
