//! # Stackhaul Config
//!
//! Parses Core and CLI config files. Supports merging multiple
//! TOML files into a final configuration object, with later
//! paths overriding earlier ones.

use std::path::{Path, PathBuf};

use colored::Colorize;
use indexmap::IndexSet;
use serde::de::DeserializeOwned;

mod error;
mod merge;

pub use error::Error;
pub use merge::merge_objects;

pub type Result<T> = ::core::result::Result<T, Error>;

/// Set the configuration for loading config files.
pub struct ConfigLoader<'outer, 'inner> {
  /// Paths to either files or directories to include in the
  /// final configuration.
  ///
  /// Paths coming later in the array (higher index) override
  /// configuration in earlier paths.
  pub paths: &'outer [&'inner Path],
  /// Wildcard patterns to match file names in given
  /// directories. Empty means every `.toml` file matches.
  pub match_wildcards: &'outer [&'inner str],
  /// Whether to merge nested config objects. Otherwise the
  /// object is replaced at the top level key by the highest
  /// priority file in which it is specified.
  pub merge_nested: bool,
  /// Whether to extend arrays across files. Otherwise the
  /// array is replaced.
  pub extend_array: bool,
  /// Print the matched files on load.
  pub debug_print: bool,
}

impl ConfigLoader<'_, '_> {
  pub fn load<T: DeserializeOwned>(self) -> Result<T> {
    let ConfigLoader {
      paths,
      match_wildcards,
      merge_nested,
      extend_array,
      debug_print,
    } = self;

    let mut wildcards = Vec::with_capacity(match_wildcards.len());
    for &wc in match_wildcards {
      match wildcard::Wildcard::new(wc.as_bytes()) {
        Ok(wc) => wildcards.push(wc),
        Err(e) => {
          eprintln!(
            "{}: Keyword '{}' is invalid wildcard | {e:?}",
            "ERROR".red(),
            wc.bold(),
          );
        }
      }
    }

    let mut all_files = IndexSet::<PathBuf>::new();
    for &path in paths {
      let Ok(metadata) = std::fs::metadata(path) else {
        continue;
      };
      if metadata.is_dir() {
        let mut files = collect_config_files(path, &wildcards);
        files.sort();
        all_files.extend(files);
      } else if metadata.is_file() {
        let path = path.to_path_buf();
        // If the same path comes up again later on, it is
        // removed and reinserted to keep the higher priority.
        all_files.shift_remove(&path);
        all_files.insert(path);
      }
    }

    if debug_print {
      println!(
        "{}: {}: {all_files:?}",
        "DEBUG".cyan(),
        "Found Files".dimmed()
      );
    }

    let mut target = serde_json::Map::new();
    for path in &all_files {
      let contents = std::fs::read_to_string(path).map_err(
        |e| Error::ReadFile { path: path.clone(), e },
      )?;
      let parsed: toml::Value = toml::from_str(&contents)
        .map_err(|e| Error::ParseToml {
          path: path.clone(),
          e: Box::new(e),
        })?;
      let serde_json::Value::Object(source) =
        serde_json::to_value(parsed)
          .map_err(|e| Error::SerializeJson { e })?
      else {
        return Err(Error::ValueIsNotObject);
      };
      target = merge_objects(
        target,
        source,
        merge_nested,
        extend_array,
      )?;
    }

    serde_json::from_value(serde_json::Value::Object(target))
      .map_err(|e| Error::ParseFinalJson { e })
  }
}

fn collect_config_files(
  dir: &Path,
  wildcards: &[wildcard::Wildcard],
) -> Vec<PathBuf> {
  let mut files = Vec::new();
  let Ok(dir) = dir.canonicalize() else {
    return files;
  };
  let Ok(read_dir) = std::fs::read_dir(&dir) else {
    return files;
  };
  for entry in read_dir.flatten() {
    let path = entry.path();
    if !path.is_file() {
      continue;
    }
    let file_name = entry.file_name();
    let Some(file_name) = file_name.to_str() else {
      continue;
    };
    let matched = if wildcards.is_empty() {
      file_name.ends_with(".toml")
    } else {
      wildcards
        .iter()
        .any(|wc| wc.is_match(file_name.as_bytes()))
    };
    if matched && let Ok(path) = path.canonicalize() {
      files.push(path);
    }
  }
  files
}
