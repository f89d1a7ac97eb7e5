use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::entities::stackhaul_timestamp;

/// Checksum algorithm used for critical files. The source census
/// records which one was available so reconciliation recomputes
/// with the same algorithm.
#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
  #[default]
  Sha256,
  Md5,
}

impl ChecksumAlgorithm {
  pub fn binary(&self) -> &'static str {
    match self {
      ChecksumAlgorithm::Sha256 => "sha256sum",
      ChecksumAlgorithm::Md5 => "md5sum",
    }
  }
}

/// Census of a single scanned path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PathInventory {
  /// The absolute path that was scanned.
  pub path: String,
  /// Regular files under the path.
  pub file_count: u64,
  /// Directories under the path (the path itself included,
  /// matching `find -type d`).
  pub dir_count: u64,
  /// Apparent size in bytes (`du -sb`).
  pub total_size: u64,
  /// Sorted file paths relative to the scanned path.
  pub file_list: Vec<String>,
  /// Relative path -> checksum for critical files.
  pub critical_files: BTreeMap<String, String>,
}

/// Aggregated census over a set of paths at a moment in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Inventory {
  pub total_files: u64,
  pub total_dirs: u64,
  pub total_size: u64,
  pub paths: Vec<PathInventory>,
  /// Merged critical file map across all paths.
  pub critical_files: BTreeMap<String, String>,
  pub checksum_algorithm: ChecksumAlgorithm,
  /// Wall clock of the scan, unix ms.
  pub timestamp: i64,
}

impl Inventory {
  /// Aggregate per-path records. Totals are always the sum over
  /// the entries.
  pub fn aggregate(
    paths: Vec<PathInventory>,
    checksum_algorithm: ChecksumAlgorithm,
  ) -> Inventory {
    let mut inventory = Inventory {
      checksum_algorithm,
      timestamp: stackhaul_timestamp(),
      ..Default::default()
    };
    for path in paths {
      inventory.total_files += path.file_count;
      inventory.total_dirs += path.dir_count;
      inventory.total_size += path.total_size;
      inventory
        .critical_files
        .extend(path.critical_files.clone());
      inventory.paths.push(path);
    }
    inventory
  }

  /// Union of all relative file lists.
  pub fn relative_file_set(&self) -> BTreeSet<String> {
    self
      .paths
      .iter()
      .flat_map(|p| p.file_list.iter().cloned())
      .collect()
  }
}

/// Verification result for one critical file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CriticalFileCheck {
  pub verified: bool,
  pub source_checksum: String,
  /// None when the file was unreadable / missing on target.
  pub target_checksum: Option<String>,
}

/// Post-transfer comparison of the target against the source
/// inventory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reconciliation {
  pub files_expected: u64,
  pub files_found: u64,
  pub dirs_expected: u64,
  pub dirs_found: u64,
  pub size_expected: u64,
  pub size_found: u64,
  /// Source relative paths absent on the target.
  pub missing_files: Vec<String>,
  pub critical_files: BTreeMap<String, CriticalFileCheck>,
  pub file_match_pct: f64,
  pub size_match_pct: f64,
  /// Human readable issue summaries, empty when passing.
  pub issues: Vec<String>,
}

/// Fraction of size drift tolerated for filesystem overhead.
pub const SIZE_VARIANCE_TOLERANCE: f64 = 0.01;

impl Reconciliation {
  /// Passes iff no files are missing, size is within 1%, and
  /// every critical file verified. A file-count difference with
  /// zero missing files is permitted (the target may gain
  /// filesystem metadata files).
  pub fn passed(&self) -> bool {
    if !self.missing_files.is_empty() {
      return false;
    }
    if self.size_expected > 0 {
      let variance = (self.size_found as f64
        - self.size_expected as f64)
        .abs()
        / self.size_expected as f64;
      if variance > SIZE_VARIANCE_TOLERANCE {
        return false;
      }
    }
    self.critical_files.values().all(|check| check.verified)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn path_inventory(
    path: &str,
    files: u64,
    dirs: u64,
    size: u64,
  ) -> PathInventory {
    PathInventory {
      path: path.into(),
      file_count: files,
      dir_count: dirs,
      total_size: size,
      ..Default::default()
    }
  }

  #[test]
  fn totals_are_sum_of_entries() {
    let inventory = Inventory::aggregate(
      vec![
        path_inventory("/opt/appdata/blog", 100, 10, 1_000),
        path_inventory("/opt/appdata/blog-redis", 20, 2, 500),
      ],
      ChecksumAlgorithm::Sha256,
    );
    assert_eq!(inventory.total_files, 120);
    assert_eq!(inventory.total_dirs, 12);
    assert_eq!(inventory.total_size, 1_500);
    assert_eq!(
      inventory.total_files,
      inventory.paths.iter().map(|p| p.file_count).sum::<u64>()
    );
  }

  #[test]
  fn extra_target_files_still_pass() {
    let recon = Reconciliation {
      files_expected: 100,
      files_found: 103,
      size_expected: 1_000_000,
      size_found: 1_004_000,
      ..Default::default()
    };
    assert!(recon.passed());
  }

  #[test]
  fn size_drift_beyond_tolerance_fails() {
    let recon = Reconciliation {
      files_expected: 100,
      files_found: 100,
      size_expected: 1_000_000,
      size_found: 500_000,
      ..Default::default()
    };
    assert!(!recon.passed());
  }

  #[test]
  fn missing_files_fail() {
    let recon = Reconciliation {
      files_expected: 2,
      files_found: 1,
      size_expected: 10,
      size_found: 10,
      missing_files: vec!["db/app.db".into()],
      ..Default::default()
    };
    assert!(!recon.passed());
  }

  #[test]
  fn unverified_critical_file_fails() {
    let mut critical_files = BTreeMap::new();
    critical_files.insert(
      "config.yml".to_string(),
      CriticalFileCheck {
        verified: false,
        source_checksum: "abc".into(),
        target_checksum: Some("def".into()),
      },
    );
    let recon = Reconciliation {
      files_expected: 1,
      files_found: 1,
      size_expected: 10,
      size_found: 10,
      critical_files,
      ..Default::default()
    };
    assert!(!recon.passed());
  }
}
