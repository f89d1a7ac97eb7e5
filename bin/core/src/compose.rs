use std::collections::BTreeMap;

use anyhow::{Context, anyhow};
use indexmap::IndexSet;
use stackhaul_client::entities::stack::{
  APPDATA_PATH_TOKEN, ComposeFile, ComposePort, VolumeSpec,
};

/// Parse and minimally validate compose text: it must be a
/// mapping with at least one service.
pub fn parse_compose(
  contents: &str,
) -> anyhow::Result<ComposeFile> {
  let compose =
    serde_yaml_ng::from_str::<ComposeFile>(contents)
      .context("failed to parse compose contents")?;
  if compose.services.is_empty() {
    return Err(anyhow!("compose file defines no services"));
  }
  Ok(compose)
}

/// All service volume entries parsed into [VolumeSpec], with
/// `${APPDATA_PATH}` expanded against the source host. Deduped,
/// order preserving.
pub fn service_volume_specs(
  compose: &ComposeFile,
  appdata_path: &str,
) -> Vec<VolumeSpec> {
  let mut seen = IndexSet::new();
  for service in compose.services.values() {
    for volume in &service.volumes {
      if let Some(spec) = volume.as_spec() {
        seen.insert(VolumeSpec::parse(
          &spec,
          Some(appdata_path),
        ));
      }
    }
  }
  seen.into_iter().collect()
}

/// One host port publication found in the compose file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
  pub service: String,
  pub host_ip: Option<String>,
  pub host_port: u16,
  pub container_port: u16,
  pub protocol: String,
}

/// Extract every host port published by the compose file.
/// Container-only entries (`- 8080`) publish no fixed host
/// port and are skipped, as are port ranges.
pub fn extract_host_ports(compose: &ComposeFile) -> Vec<HostPort> {
  let mut ports = Vec::new();
  for (service, config) in &compose.services {
    for port in &config.ports {
      match port {
        ComposePort::Number(_) => {}
        ComposePort::Spec(spec) => {
          if let Some(port) = parse_port_spec(service, spec) {
            ports.push(port);
          }
        }
        ComposePort::Long {
          target,
          published,
          protocol,
          host_ip,
        } => {
          let Some(host_port) =
            published.as_ref().and_then(|p| p.as_u16())
          else {
            continue;
          };
          let Ok(container_port) = u16::try_from(*target)
          else {
            continue;
          };
          ports.push(HostPort {
            service: service.clone(),
            host_ip: host_ip.clone(),
            host_port,
            container_port,
            protocol: protocol
              .clone()
              .unwrap_or_else(|| "tcp".to_string()),
          });
        }
      }
    }
  }
  ports
}

/// Short syntax: `[ip:]host:container[/protocol]`.
fn parse_port_spec(
  service: &str,
  spec: &str,
) -> Option<HostPort> {
  let (base, protocol) = match spec.split_once('/') {
    Some((base, protocol)) => (base, protocol.to_string()),
    None => (spec, "tcp".to_string()),
  };
  let segments: Vec<&str> = base.split(':').collect();
  let (host_ip, host_port, container_port) = match
    segments.as_slice()
  {
    [host, container] => (None, *host, *container),
    [ip, host, container] => {
      (Some(ip.to_string()), *host, *container)
    }
    // `- 8080` (no fixed host port) or unsupported shapes.
    _ => return None,
  };
  // Ranges like 8000-8010 are left alone.
  let host_port = host_port.parse().ok()?;
  let container_port = container_port.parse().ok()?;
  Some(HostPort {
    service: service.to_string(),
    host_ip,
    host_port,
    container_port,
    protocol,
  })
}

/// Rewrite compose text for the target host, in one pass:
/// 1. substitute `${APPDATA_PATH}` with the target's appdata,
/// 2. rewrite each known source path to its mapped target path
///    (longest first so nested paths cannot clobber parents),
/// 3. remap conflicting host ports, preserving protocol and
///    container port, in both short and long port syntax.
pub fn rewrite_for_target(
  contents: &str,
  target_appdata: &str,
  path_mappings: &BTreeMap<String, String>,
  port_remaps: &[(u16, u16, u16)],
) -> String {
  let mut updated =
    contents.replace(APPDATA_PATH_TOKEN, target_appdata);

  let mut mappings: Vec<(&String, &String)> =
    path_mappings.iter().collect();
  mappings.sort_by_key(|(old, _)| std::cmp::Reverse(old.len()));
  for (old, new) in mappings {
    if old != new && updated.contains(old.as_str()) {
      updated = updated.replace(old.as_str(), new.as_str());
    }
  }

  for &(from, to, container) in port_remaps {
    updated = replace_port_mapping(&updated, from, to, container);
    updated = replace_published_port(&updated, from, to);
  }

  updated
}

/// Rewrite long-syntax `published:` values. The container port
/// lives on the adjacent `target:` line, so matching is by
/// published value alone; the conflict resolver emits exactly
/// one adjustment per conflicting host port.
fn replace_published_port(
  contents: &str,
  from: u16,
  to: u16,
) -> String {
  let from = from.to_string();
  let mut out = String::with_capacity(contents.len());
  for line in contents.split_inclusive('\n') {
    let trimmed = line.trim_start();
    let mut body = trimmed;
    // The key may open a list item: `- published: 8443`.
    if let Some(rest) = body.strip_prefix("- ") {
      body = rest;
    }
    let Some(rest) = body.strip_prefix("published:") else {
      out.push_str(line);
      continue;
    };
    let value = rest.trim();
    let bare = value.trim_matches(['"', '\'']);
    if bare != from {
      out.push_str(line);
      continue;
    }
    let indent = &line[..line.len() - trimmed.len()];
    let dash = if body.len() < trimmed.len() { "- " } else { "" };
    let replacement = if value.starts_with('"') {
      format!("\"{to}\"")
    } else if value.starts_with('\'') {
      format!("'{to}'")
    } else {
      to.to_string()
    };
    out.push_str(indent);
    out.push_str(dash);
    out.push_str("published: ");
    out.push_str(&replacement);
    if line.ends_with('\n') {
      out.push('\n');
    }
  }
  out
}

/// Replace `from:container` with `to:container` wherever it
/// appears as a full port mapping token (not inside a longer
/// number).
fn replace_port_mapping(
  contents: &str,
  from: u16,
  to: u16,
  container: u16,
) -> String {
  let needle = format!("{from}:{container}");
  let replacement = format!("{to}:{container}");
  let mut out = String::with_capacity(contents.len());
  let mut rest = contents;
  while let Some(idx) = rest.find(&needle) {
    let before = &rest[..idx];
    let after = &rest[idx + needle.len()..];
    let prev_digit = before
      .chars()
      .next_back()
      .map(|c| c.is_ascii_digit())
      .unwrap_or(false);
    let next_digit = after
      .chars()
      .next()
      .map(|c| c.is_ascii_digit())
      .unwrap_or(false);
    out.push_str(before);
    if prev_digit || next_digit {
      out.push_str(&needle);
    } else {
      out.push_str(&replacement);
    }
    rest = after;
  }
  out.push_str(rest);
  out
}

#[cfg(test)]
mod tests {
  use stackhaul_client::entities::stack::VolumeSpec;

  use super::*;

  const COMPOSE: &str = r#"
services:
  blog:
    image: ghost:5
    container_name: blog
    restart: unless-stopped
    ports:
      - "8080:80"
      - "127.0.0.1:2368:2368"
      - target: 443
        published: "8443"
        protocol: tcp
    volumes:
      - ${APPDATA_PATH}/blog:/var/lib/ghost/content
  redis:
    image: redis:7
    ports:
      - "6379:6379/tcp"
    volumes:
      - ${APPDATA_PATH}/blog-redis:/data
      - cache:/cache
volumes:
  cache:
"#;

  #[test]
  fn parses_services_and_volumes() {
    let compose = parse_compose(COMPOSE).unwrap();
    assert_eq!(compose.services.len(), 2);
    assert!(compose.volumes.contains_key("cache"));
    let specs =
      service_volume_specs(&compose, "/opt/docker-appdata");
    assert_eq!(
      specs,
      vec![
        VolumeSpec::Bind {
          source: "/opt/docker-appdata/blog".into(),
          destination: "/var/lib/ghost/content".into(),
          mode: None,
        },
        VolumeSpec::Bind {
          source: "/opt/docker-appdata/blog-redis".into(),
          destination: "/data".into(),
          mode: None,
        },
        VolumeSpec::Named {
          name: "cache".into(),
          destination: "/cache".into(),
          mode: None,
        },
      ]
    );
  }

  #[test]
  fn rejects_compose_without_services() {
    assert!(parse_compose("volumes:\n  cache:\n").is_err());
    assert!(parse_compose("not yaml: [").is_err());
  }

  #[test]
  fn extracts_host_ports_in_every_syntax() {
    let compose = parse_compose(COMPOSE).unwrap();
    let ports = extract_host_ports(&compose);
    assert_eq!(ports.len(), 4);
    assert!(ports.contains(&HostPort {
      service: "blog".into(),
      host_ip: None,
      host_port: 8080,
      container_port: 80,
      protocol: "tcp".into(),
    }));
    assert!(ports.contains(&HostPort {
      service: "blog".into(),
      host_ip: Some("127.0.0.1".into()),
      host_port: 2368,
      container_port: 2368,
      protocol: "tcp".into(),
    }));
    assert!(ports.contains(&HostPort {
      service: "blog".into(),
      host_ip: None,
      host_port: 8443,
      container_port: 443,
      protocol: "tcp".into(),
    }));
    assert!(ports.contains(&HostPort {
      service: "redis".into(),
      host_ip: None,
      host_port: 6379,
      container_port: 6379,
      protocol: "tcp".into(),
    }));
  }

  #[test]
  fn rewrite_leaves_no_appdata_token() {
    let rewritten = rewrite_for_target(
      COMPOSE,
      "/mnt/tank/appdata",
      &BTreeMap::new(),
      &[],
    );
    assert!(!rewritten.contains("${APPDATA_PATH}"));
    assert!(
      rewritten.contains("/mnt/tank/appdata/blog-redis:/data")
    );
  }

  #[test]
  fn rewrite_maps_literal_paths_longest_first() {
    let contents = "\
      - /opt/appdata/blog:/data\n\
      - /opt/appdata/blog-redis:/redis\n";
    let mut mappings = BTreeMap::new();
    mappings.insert(
      "/opt/appdata/blog".to_string(),
      "/mnt/tank/appdata/blog".to_string(),
    );
    mappings.insert(
      "/opt/appdata/blog-redis".to_string(),
      "/mnt/tank/appdata/blog-redis".to_string(),
    );
    let rewritten = rewrite_for_target(
      contents,
      "/mnt/tank/appdata",
      &mappings,
      &[],
    );
    assert!(
      rewritten.contains("/mnt/tank/appdata/blog:/data")
    );
    assert!(
      rewritten
        .contains("/mnt/tank/appdata/blog-redis:/redis")
    );
  }

  #[test]
  fn port_remap_preserves_container_port() {
    let rewritten = rewrite_for_target(
      COMPOSE,
      "/opt/docker-appdata",
      &BTreeMap::new(),
      &[(8080, 8081, 80)],
    );
    assert!(rewritten.contains("\"8081:80\""));
    assert!(!rewritten.contains("\"8080:80\""));
    // Other mappings untouched.
    assert!(rewritten.contains("6379:6379"));
  }

  #[test]
  fn port_remap_does_not_touch_longer_numbers() {
    let contents = "- \"18080:80\"\n- \"8080:80\"\n";
    let out = replace_port_mapping(contents, 8080, 8081, 80);
    assert_eq!(out, "- \"18080:80\"\n- \"8081:80\"\n");
  }

  #[test]
  fn port_remap_rewrites_long_syntax_published() {
    let rewritten = rewrite_for_target(
      COMPOSE,
      "/opt/docker-appdata",
      &BTreeMap::new(),
      &[(8443, 8444, 443)],
    );
    assert!(rewritten.contains("published: \"8444\""));
    assert!(!rewritten.contains("8443"));
    // The container port line is untouched.
    assert!(rewritten.contains("target: 443"));
  }

  #[test]
  fn published_rewrite_handles_list_item_and_bare_numbers() {
    let contents = "\
    ports:
      - published: 9090
        target: 90
      - target: 91
        published: '9191'
";
    let out = replace_published_port(
      &replace_published_port(contents, 9090, 9091),
      9191,
      9292,
    );
    assert!(out.contains("- published: 9091\n"));
    assert!(out.contains("published: '9292'\n"));
    assert!(out.contains("target: 90"));
    assert!(out.contains("target: 91"));
  }

  #[test]
  fn published_rewrite_skips_other_values() {
    let contents = "        published: 18443\n";
    assert_eq!(
      replace_published_port(contents, 8443, 8444),
      contents
    );
  }
}
