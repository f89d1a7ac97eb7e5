use std::sync::OnceLock;

use regex::Regex;

use crate::{InvalidInput, Result};

/// Shell metacharacters that never appear in an interpolated
/// value outside the quoting escape hatch.
pub const DENY_SET: &[char] = &[
  ';', '&', '|', '`', '$', '(', ')', '<', '>', '*', '?', '[', '~',
];

/// Docker subcommands operations are allowed to issue.
pub const ALLOWED_DOCKER_COMMANDS: &[&str] = &[
  "ps", "logs", "start", "stop", "restart", "stats", "compose",
  "pull", "build", "inspect", "images", "exec", "run", "rm",
  "kill", "pause", "unpause", "volume",
];

/// Compose subcommands operations are allowed to issue.
pub const ALLOWED_COMPOSE_SUBCOMMANDS: &[&str] = &[
  "up", "down", "ps", "logs", "build", "pull", "restart", "stop",
  "start", "exec", "run", "pause", "unpause", "config",
];

/// Stack names that shadow docker tooling are refused.
pub const RESERVED_STACK_NAMES: &[&str] =
  &["docker", "compose", "system", "network", "volume", "config"];

fn hostname_regex() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| {
    Regex::new(
      r"^(?:[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?\.)*[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?$",
    )
    .expect("invalid hostname regex")
  })
}

fn username_regex() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| {
    Regex::new(r"^[a-zA-Z][a-zA-Z0-9_-]{0,31}$")
      .expect("invalid username regex")
  })
}

fn path_regex() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| {
    Regex::new(r"^[a-zA-Z0-9/_.\-]+$")
      .expect("invalid path regex")
  })
}

fn stack_name_regex() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| {
    Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_-]{0,62}$")
      .expect("invalid stack name regex")
  })
}

fn env_var_key_regex() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| {
    Regex::new(r"^[A-Z][A-Z0-9_]{0,63}$")
      .expect("invalid env var key regex")
  })
}

/// The first denied character in a value, if any.
pub fn find_denied_char(value: &str) -> Option<char> {
  value.chars().find(|c| DENY_SET.contains(c))
}

/// RFC-1123 label chain, dotted IPv4, or an IPv6 address.
/// Returns the input unchanged.
pub fn validate_hostname(hostname: &str) -> Result<&str> {
  if hostname.is_empty() || hostname.len() > 253 {
    return Err(InvalidInput::new("hostname", hostname));
  }
  // Trailing dot FQDNs are not accepted by the builders.
  if hostname.ends_with('.') {
    return Err(InvalidInput::new("hostname", hostname));
  }
  // An all-numeric dotted quad must be a real IPv4 address,
  // it cannot fall back to domain validation.
  let labels: Vec<&str> = hostname.split('.').collect();
  if labels.len() == 4
    && labels.iter().all(|l| {
      !l.is_empty() && l.chars().all(|c| c.is_ascii_digit())
    })
  {
    return if is_ipv4(hostname) {
      Ok(hostname)
    } else {
      Err(InvalidInput::new("hostname", hostname))
    };
  }
  if is_ipv6(hostname) {
    return Ok(hostname);
  }
  if hostname_regex().is_match(hostname) {
    return Ok(hostname);
  }
  Err(InvalidInput::new("hostname", hostname))
}

fn is_ipv4(value: &str) -> bool {
  let octets: Vec<&str> = value.split('.').collect();
  octets.len() == 4
    && octets.iter().all(|o| {
      !o.is_empty()
        && o.len() <= 3
        && o.chars().all(|c| c.is_ascii_digit())
        && o.parse::<u16>().map(|n| n <= 255).unwrap_or(false)
    })
}

fn is_ipv6(value: &str) -> bool {
  value.contains(':') && value.parse::<std::net::Ipv6Addr>().is_ok()
}

pub fn validate_username(username: &str) -> Result<&str> {
  if username_regex().is_match(username) {
    Ok(username)
  } else {
    Err(InvalidInput::new("username", username))
  }
}

pub fn validate_port(port: u16) -> Result<u16> {
  if port == 0 {
    Err(InvalidInput::new("port", port.to_string()))
  } else {
    Ok(port)
  }
}

/// Absolute paths only, restricted charset, no parent traversal
/// anywhere in the raw input.
pub fn validate_path(path: &str) -> Result<&str> {
  if !path.starts_with('/') {
    return Err(InvalidInput::new("path", path));
  }
  if !path_regex().is_match(path) {
    return Err(InvalidInput::new("path", path));
  }
  if path.split('/').any(|segment| segment == "..")
    || path.contains("..")
  {
    return Err(InvalidInput::new("path", path));
  }
  Ok(path)
}

pub fn validate_stack_name(name: &str) -> Result<&str> {
  if !stack_name_regex().is_match(name) {
    return Err(InvalidInput::new("stack_name", name));
  }
  if RESERVED_STACK_NAMES
    .contains(&name.to_ascii_lowercase().as_str())
  {
    return Err(InvalidInput::new("stack_name", name));
  }
  Ok(name)
}

pub fn validate_env_var(
  key: &str,
  value: &str,
) -> Result<(String, String)> {
  if !env_var_key_regex().is_match(key) {
    return Err(InvalidInput::new("env_var_key", key));
  }
  if find_denied_char(value).is_some() {
    return Err(InvalidInput::new("env_var_value", value));
  }
  Ok((key.to_string(), value.to_string()))
}

pub fn validate_docker_command(subcommand: &str) -> Result<&str> {
  if ALLOWED_DOCKER_COMMANDS.contains(&subcommand) {
    Ok(subcommand)
  } else {
    Err(InvalidInput::new("docker_command", subcommand))
  }
}

pub fn validate_compose_subcommand(
  subcommand: &str,
) -> Result<&str> {
  if ALLOWED_COMPOSE_SUBCOMMANDS.contains(&subcommand) {
    Ok(subcommand)
  } else {
    Err(InvalidInput::new("compose_subcommand", subcommand))
  }
}

/// Dataset names for zfs operations: `pool/child` segments of
/// the same charset as paths, no leading slash.
pub fn validate_dataset(dataset: &str) -> Result<&str> {
  if dataset.is_empty()
    || dataset.starts_with('/')
    || dataset.contains("..")
  {
    return Err(InvalidInput::new("dataset", dataset));
  }
  let valid = dataset.chars().all(|c| {
    c.is_ascii_alphanumeric()
      || matches!(c, '/' | '_' | '.' | '-' | ':')
  });
  if valid {
    Ok(dataset)
  } else {
    Err(InvalidInput::new("dataset", dataset))
  }
}

/// Snapshot names: `name` part of `dataset@name`.
pub fn validate_snapshot_name(name: &str) -> Result<&str> {
  if name.is_empty() {
    return Err(InvalidInput::new("snapshot", name));
  }
  let valid = name.chars().all(|c| {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')
  });
  if valid {
    Ok(name)
  } else {
    Err(InvalidInput::new("snapshot", name))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn accepts_valid_hostnames() {
    for host in [
      "nas",
      "nas-01.lan",
      "fleet.example.com",
      "10.0.0.12",
      "fe80::1",
    ] {
      assert!(
        validate_hostname(host).is_ok(),
        "expected valid: {host}"
      );
    }
  }

  #[test]
  fn rejects_bad_hostnames() {
    for host in [
      "",
      "host name",
      "host;rm -rf /",
      "-leading.dash",
      "999.1.1.1",
      "a.".repeat(200).as_str(),
    ] {
      assert!(
        validate_hostname(host).is_err(),
        "expected invalid: {host}"
      );
    }
  }

  #[test]
  fn rejects_port_zero() {
    assert!(validate_port(0).is_err());
    assert_eq!(validate_port(22), Ok(22));
    assert_eq!(validate_port(65535), Ok(65535));
  }

  #[test]
  fn rejects_traversal_and_denied_path_chars() {
    for path in [
      "relative/path",
      "/opt/../etc",
      "/opt/appdata/..",
      "/opt/app;data",
      "/opt/app data",
      "/opt/$(whoami)",
      "/opt/app*",
    ] {
      let err = validate_path(path).unwrap_err();
      assert_eq!(err.field, "path", "path: {path}");
    }
    assert!(validate_path("/opt/appdata/blog-redis.v2").is_ok());
  }

  #[test]
  fn rejects_reserved_stack_names() {
    for name in ["docker", "compose", "system", "Volume"] {
      assert!(validate_stack_name(name).is_err(), "{name}");
    }
    assert!(validate_stack_name("blog").is_ok());
    assert!(validate_stack_name("blog-2_test").is_ok());
    assert!(validate_stack_name("-blog").is_err());
    assert!(validate_stack_name(&"a".repeat(64)).is_err());
  }

  #[test]
  fn env_values_with_metacharacters_are_rejected() {
    assert!(validate_env_var("APPDATA_PATH", "/opt/app").is_ok());
    assert!(
      validate_env_var("APPDATA_PATH", "$(curl evil)").is_err()
    );
    assert!(validate_env_var("lower", "x").is_err());
  }

  #[test]
  fn subcommand_allow_lists() {
    assert!(validate_docker_command("ps").is_ok());
    assert!(validate_docker_command("login").is_err());
    assert!(validate_compose_subcommand("up").is_ok());
    assert!(validate_compose_subcommand("convert").is_err());
  }

  #[test]
  fn every_denied_char_is_found() {
    for c in DENY_SET {
      let value = format!("value{c}more");
      assert_eq!(find_denied_char(&value), Some(*c));
    }
    assert_eq!(find_denied_char("plain-value_1.2"), None);
  }
}
