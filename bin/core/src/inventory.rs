use std::{collections::BTreeMap, time::Duration};

use command::{quote, validate_path};
use remote::{ExecuteError, RemoteExecutor};
use stackhaul_client::entities::{
  host::Host,
  inventory::{
    ChecksumAlgorithm, CriticalFileCheck, Inventory,
    PathInventory, Reconciliation,
  },
};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Find predicate matching the critical pattern set: database
/// files and canonical config files.
const CRITICAL_FIND_PREDICATE: &str = r"\( -name '*.db' -o -name '*.sqlite*' -o -name 'config.*' -o -name '*.conf' \)";

/// Content census and post-copy reconciliation over remote
/// paths. Four queries per path plus critical-file checksums.
pub struct InventoryScanner<'a> {
  pub executor: &'a RemoteExecutor,
  pub cancel: &'a CancellationToken,
  pub timeout: Duration,
}

impl InventoryScanner<'_> {
  async fn query(
    &self,
    host: &Host,
    command: &str,
  ) -> Result<String, ExecuteError> {
    let output = self
      .executor
      .run(host, command, self.timeout, self.cancel)
      .await?;
    // The census commands suppress stderr and report zero
    // counts for unreadable paths, matching `2>/dev/null`.
    Ok(output.stdout)
  }

  /// Which checksum binary the host carries. Sha256 preferred,
  /// md5 fallback. Recorded on the inventory so reconciliation
  /// recomputes with the same algorithm.
  pub async fn detect_checksum_algorithm(
    &self,
    host: &Host,
  ) -> Result<ChecksumAlgorithm, ExecuteError> {
    let stdout = self
      .query(
        host,
        "command -v sha256sum >/dev/null 2>&1 && echo sha256 || echo md5",
      )
      .await?;
    if stdout.trim() == "sha256" {
      Ok(ChecksumAlgorithm::Sha256)
    } else {
      Ok(ChecksumAlgorithm::Md5)
    }
  }

  async fn census_path(
    &self,
    host: &Host,
    path: &str,
    algorithm: ChecksumAlgorithm,
  ) -> Result<PathInventory, ExecuteError> {
    validate_path(path)?;
    let q = quote(path);

    let file_count = parse_count(
      &self
        .query(
          host,
          &format!("find {q} -type f 2>/dev/null | wc -l"),
        )
        .await?,
    );
    let dir_count = parse_count(
      &self
        .query(
          host,
          &format!("find {q} -type d 2>/dev/null | wc -l"),
        )
        .await?,
    );
    let total_size = parse_count(
      &self
        .query(
          host,
          &format!("du -sb {q} 2>/dev/null | cut -f1"),
        )
        .await?,
    );
    let file_list = self
      .query(
        host,
        &format!(
          "find {q} -type f -printf '%P\\n' 2>/dev/null | sort"
        ),
      )
      .await?
      .lines()
      .filter(|l| !l.is_empty())
      .map(str::to_string)
      .collect();

    let checksums = self
      .query(
        host,
        &format!(
          "find {q} -type f {CRITICAL_FIND_PREDICATE} -exec {} {{}} + 2>/dev/null",
          algorithm.binary()
        ),
      )
      .await?;
    let critical_files = parse_checksum_lines(&checksums, path);

    Ok(PathInventory {
      path: path.to_string(),
      file_count,
      dir_count,
      total_size,
      file_list,
      critical_files,
    })
  }

  /// Census a set of absolute paths on a host.
  pub async fn census(
    &self,
    host: &Host,
    paths: &[String],
  ) -> Result<Inventory, ExecuteError> {
    let algorithm =
      self.detect_checksum_algorithm(host).await?;
    let mut path_inventories = Vec::with_capacity(paths.len());
    for path in paths {
      path_inventories
        .push(self.census_path(host, path, algorithm).await?);
    }
    let inventory =
      Inventory::aggregate(path_inventories, algorithm);
    info!(
      host = host.id,
      files = inventory.total_files,
      dirs = inventory.total_dirs,
      bytes = inventory.total_size,
      critical = inventory.critical_files.len(),
      "created inventory"
    );
    Ok(inventory)
  }

  /// Re-run the census against the mapped target paths and
  /// compare with the source inventory.
  pub async fn reconcile(
    &self,
    host: &Host,
    source: &Inventory,
    path_mappings: &BTreeMap<String, String>,
  ) -> Result<Reconciliation, ExecuteError> {
    let mut recon = Reconciliation {
      files_expected: source.total_files,
      dirs_expected: source.total_dirs,
      size_expected: source.total_size,
      ..Default::default()
    };

    for source_path in &source.paths {
      let Some(target_path) =
        path_mappings.get(&source_path.path)
      else {
        recon.missing_files.extend(
          source_path.file_list.iter().cloned(),
        );
        recon.issues.push(format!(
          "no target mapping for {}",
          source_path.path
        ));
        continue;
      };

      let target = self
        .census_path(host, target_path, source.checksum_algorithm)
        .await?;
      recon.files_found += target.file_count;
      recon.dirs_found += target.dir_count;
      recon.size_found += target.total_size;

      let target_set: std::collections::BTreeSet<&String> =
        target.file_list.iter().collect();
      for file in &source_path.file_list {
        if !target_set.contains(file) {
          recon.missing_files.push(file.clone());
        }
      }

      for (rel, source_checksum) in &source_path.critical_files
      {
        let target_checksum = self
          .checksum_file(
            host,
            &format!("{target_path}/{rel}"),
            source.checksum_algorithm,
          )
          .await?;
        recon.critical_files.insert(
          rel.clone(),
          CriticalFileCheck {
            verified: target_checksum.as_deref()
              == Some(source_checksum.as_str()),
            source_checksum: source_checksum.clone(),
            target_checksum,
          },
        );
      }
    }

    if source.total_files > 0 {
      recon.file_match_pct = recon.files_found as f64
        / source.total_files as f64
        * 100.0;
    }
    if source.total_size > 0 {
      recon.size_match_pct = recon.size_found as f64
        / source.total_size as f64
        * 100.0;
    }

    if recon.files_found != recon.files_expected {
      recon.issues.push(format!(
        "file count mismatch: {:+} files ({:.1}% match)",
        recon.files_found as i64 - recon.files_expected as i64,
        recon.file_match_pct
      ));
    }
    if !recon.missing_files.is_empty() {
      recon.issues.push(format!(
        "{} files missing from target",
        recon.missing_files.len()
      ));
    }
    let failed_critical = recon
      .critical_files
      .values()
      .filter(|c| !c.verified)
      .count();
    if failed_critical > 0 {
      recon.issues.push(format!(
        "{failed_critical} critical files failed verification"
      ));
    }

    info!(
      host = host.id,
      passed = recon.passed(),
      files_match = format!("{:.1}%", recon.file_match_pct),
      size_match = format!("{:.1}%", recon.size_match_pct),
      issues = recon.issues.len(),
      "reconciled inventory"
    );

    Ok(recon)
  }

  async fn checksum_file(
    &self,
    host: &Host,
    path: &str,
    algorithm: ChecksumAlgorithm,
  ) -> Result<Option<String>, ExecuteError> {
    // The relative part comes from remote `find` output and may
    // carry characters the path validator refuses (spaces).
    // Quoting is the protection here.
    let stdout = self
      .query(
        host,
        &format!(
          "{} {} 2>/dev/null | cut -d' ' -f1",
          algorithm.binary(),
          quote(path)
        ),
      )
      .await?;
    let checksum = stdout.trim();
    if checksum.is_empty() {
      Ok(None)
    } else {
      Ok(Some(checksum.to_string()))
    }
  }
}

fn parse_count(stdout: &str) -> u64 {
  stdout.trim().parse().unwrap_or(0)
}

/// `<hash>  <absolute path>` lines, stored relative to the
/// scanned path.
fn parse_checksum_lines(
  output: &str,
  base_path: &str,
) -> BTreeMap<String, String> {
  let prefix = format!("{base_path}/");
  let mut map = BTreeMap::new();
  for line in output.lines() {
    let mut parts = line.trim().splitn(2, char::is_whitespace);
    let (Some(checksum), Some(path)) =
      (parts.next(), parts.next())
    else {
      continue;
    };
    if checksum.is_empty() {
      continue;
    }
    let rel = path
      .trim()
      .strip_prefix(&prefix)
      .unwrap_or(path.trim());
    map.insert(rel.to_string(), checksum.to_string());
  }
  map
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_counts_defaulting_to_zero() {
    assert_eq!(parse_count(" 1234\n"), 1234);
    assert_eq!(parse_count(""), 0);
    assert_eq!(parse_count("du: cannot access"), 0);
  }

  #[test]
  fn checksum_lines_become_relative_paths() {
    let output = "\
d41d8cd98f00b204e9800998ecf8427e  /opt/appdata/blog/app.db
0cc175b9c0f1b6a831c399e269772661  /opt/appdata/blog/config.production.json
";
    let map =
      parse_checksum_lines(output, "/opt/appdata/blog");
    assert_eq!(
      map.get("app.db").map(String::as_str),
      Some("d41d8cd98f00b204e9800998ecf8427e")
    );
    assert_eq!(
      map
        .get("config.production.json")
        .map(String::as_str),
      Some("0cc175b9c0f1b6a831c399e269772661")
    );
  }

  #[test]
  fn malformed_checksum_lines_are_skipped() {
    let map = parse_checksum_lines(
      "garbage\n\nonlyhash\n",
      "/opt/appdata/blog",
    );
    assert!(map.is_empty());
  }
}
