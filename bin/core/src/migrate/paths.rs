use std::collections::BTreeMap;

use stackhaul_client::entities::host::Host;

/// Compute the source -> target path mapping for the data copy.
///
/// Rule: if the source path contains `/<stack>` as a segment,
/// the suffix after it is reattached under
/// `<target_appdata>/<stack>/`. A suffix starting with `-`
/// (a sibling directory like `…/stack-redis`) is reattached as
/// `<target_appdata>/<stack><suffix>`. Anything else lands by
/// basename directly under `<target_appdata>/`.
pub fn map_paths(
  target: &Host,
  stack: &str,
  source_paths: &[String],
) -> BTreeMap<String, String> {
  let appdata = target.appdata_path.trim_end_matches('/');
  let mut mappings = BTreeMap::new();
  for source in source_paths {
    let target_path = map_path(appdata, stack, source);
    mappings.insert(source.clone(), target_path);
  }
  mappings
}

fn map_path(appdata: &str, stack: &str, source: &str) -> String {
  if let Some(suffix) = stack_suffix(stack, source) {
    let suffix = suffix.trim_start_matches('/');
    if suffix.starts_with('-') && suffix != "-" {
      // Preserve sibling naming like blog-redis.
      return format!("{appdata}/{stack}{suffix}");
    }
    if !suffix.is_empty() {
      return format!("{appdata}/{stack}/{suffix}");
    }
    return format!("{appdata}/{stack}");
  }
  let basename = source
    .trim_end_matches('/')
    .rsplit('/')
    .next()
    .unwrap_or(source);
  format!("{appdata}/{basename}")
}

/// The part of `source` after `/<stack>`, when `/<stack>`
/// appears as a full segment or a sibling prefix (followed by
/// `/`, `-`, or the end). `/blogging` does not match `/blog`.
fn stack_suffix<'a>(
  stack: &str,
  source: &'a str,
) -> Option<&'a str> {
  let marker = format!("/{stack}");
  let mut search_from = 0;
  while let Some(idx) = source[search_from..].find(&marker) {
    let idx = search_from + idx;
    let after = idx + marker.len();
    match source.as_bytes().get(after) {
      None => return Some(""),
      Some(b'/') | Some(b'-') => return Some(&source[after..]),
      _ => search_from = after,
    }
  }
  None
}

#[cfg(test)]
mod tests {
  use super::*;

  fn target() -> Host {
    Host {
      id: "tgtA".into(),
      appdata_path: "/mnt/tank/appdata".into(),
      ..Default::default()
    }
  }

  #[test]
  fn stack_dir_maps_under_target_appdata() {
    let mappings = map_paths(
      &target(),
      "blog",
      &["/opt/appdata/blog".to_string()],
    );
    assert_eq!(
      mappings["/opt/appdata/blog"],
      "/mnt/tank/appdata/blog"
    );
  }

  #[test]
  fn nested_paths_keep_their_suffix() {
    let mappings = map_paths(
      &target(),
      "blog",
      &["/opt/appdata/blog/media/uploads".to_string()],
    );
    assert_eq!(
      mappings["/opt/appdata/blog/media/uploads"],
      "/mnt/tank/appdata/blog/media/uploads"
    );
  }

  #[test]
  fn sibling_directories_stay_siblings() {
    let mappings = map_paths(
      &target(),
      "blog",
      &["/opt/appdata/blog-redis".to_string()],
    );
    assert_eq!(
      mappings["/opt/appdata/blog-redis"],
      "/mnt/tank/appdata/blog-redis"
    );
  }

  #[test]
  fn unrelated_paths_map_by_basename() {
    let mappings = map_paths(
      &target(),
      "blog",
      &["/srv/shared/media".to_string()],
    );
    assert_eq!(
      mappings["/srv/shared/media"],
      "/mnt/tank/appdata/media"
    );
  }

  #[test]
  fn partial_name_overlap_is_not_a_marker() {
    let mappings = map_paths(
      &target(),
      "blog",
      &["/opt/appdata/blogging".to_string()],
    );
    assert_eq!(
      mappings["/opt/appdata/blogging"],
      "/mnt/tank/appdata/blogging"
    );
  }
}
