use std::path::Path;

use crate::{
  InvalidInput, MAX_COMMAND_LENGTH, Result,
  validate::{
    validate_hostname, validate_path, validate_port,
    validate_username,
  },
};

/// Validated coordinates of one remote endpoint.
#[derive(Debug, Clone)]
pub struct SshTarget<'a> {
  pub user: &'a str,
  pub hostname: &'a str,
  pub port: u16,
  pub identity_file: Option<&'a Path>,
  /// Multiplexing control socket for the `(user, host, port)`.
  pub control_path: Option<&'a Path>,
}

impl SshTarget<'_> {
  /// `user@hostname`, with IPv6 addresses bracketed.
  pub fn destination(&self) -> Result<String> {
    let user = validate_username(self.user)?;
    let hostname = validate_hostname(self.hostname)?;
    if hostname.contains(':') {
      Ok(format!("{user}@[{hostname}]"))
    } else {
      Ok(format!("{user}@{hostname}"))
    }
  }
}

/// The ssh client options every stackhaul connection carries.
/// Fail-closed auth (publickey only, no prompts), bounded
/// connect, keepalive, and per-host connection multiplexing.
pub fn ssh_base_args(target: &SshTarget) -> Result<Vec<String>> {
  validate_port(target.port)?;
  let mut args = vec![
    "-o".to_string(),
    "StrictHostKeyChecking=yes".to_string(),
    "-o".to_string(),
    "BatchMode=yes".to_string(),
    "-o".to_string(),
    "PasswordAuthentication=no".to_string(),
    "-o".to_string(),
    "PreferredAuthentications=publickey".to_string(),
    "-o".to_string(),
    "ConnectTimeout=10".to_string(),
    "-o".to_string(),
    "ServerAliveInterval=60".to_string(),
    "-p".to_string(),
    target.port.to_string(),
  ];
  if let Some(control_path) = target.control_path {
    let control_path = control_path
      .to_str()
      .ok_or_else(|| {
        InvalidInput::new("control_path", "<non-utf8>")
      })
      .and_then(validate_path)?;
    args.push("-o".to_string());
    args.push("ControlMaster=auto".to_string());
    args.push("-o".to_string());
    args.push(format!("ControlPath={control_path}"));
  }
  if let Some(identity_file) = target.identity_file {
    let identity_file = identity_file
      .to_str()
      .ok_or_else(|| {
        InvalidInput::new("identity_file", "<non-utf8>")
      })
      .and_then(validate_path)?;
    args.push("-i".to_string());
    args.push(identity_file.to_string());
  }
  Ok(args)
}

/// Full argv (minus the leading `ssh`) to run one already-built
/// remote command on the target. The command travels as a
/// single argument after `--`, never re-parsed locally.
pub fn ssh_exec_args(
  target: &SshTarget,
  remote_command: &str,
) -> Result<Vec<String>> {
  if remote_command.len() > MAX_COMMAND_LENGTH {
    return Err(InvalidInput::new(
      "command_length",
      format!("{} bytes", remote_command.len()),
    ));
  }
  let mut args = ssh_base_args(target)?;
  args.push(target.destination()?);
  args.push("--".to_string());
  args.push(remote_command.to_string());
  Ok(args)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn target(hostname: &str) -> SshTarget<'_> {
    SshTarget {
      user: "deploy",
      hostname,
      port: 22,
      identity_file: None,
      control_path: None,
    }
  }

  #[test]
  fn base_args_carry_hardened_options() {
    let args = ssh_base_args(&target("nas.lan")).unwrap();
    let joined = args.join(" ");
    for opt in [
      "StrictHostKeyChecking=yes",
      "BatchMode=yes",
      "PasswordAuthentication=no",
      "PreferredAuthentications=publickey",
      "ConnectTimeout=10",
      "ServerAliveInterval=60",
    ] {
      assert!(joined.contains(opt), "missing {opt}");
    }
  }

  #[test]
  fn ipv6_destination_is_bracketed() {
    assert_eq!(
      target("fe80::1").destination().unwrap(),
      "deploy@[fe80::1]"
    );
    assert_eq!(
      target("10.0.0.12").destination().unwrap(),
      "deploy@10.0.0.12"
    );
  }

  #[test]
  fn invalid_host_produces_no_command() {
    let res = ssh_exec_args(&target("nas;reboot"), "uptime");
    assert_eq!(res.unwrap_err().field, "hostname");
  }

  #[test]
  fn oversized_commands_are_rejected() {
    let command = "a".repeat(MAX_COMMAND_LENGTH + 1);
    let res = ssh_exec_args(&target("nas.lan"), &command);
    assert_eq!(res.unwrap_err().field, "command_length");
  }

  #[test]
  fn control_path_enables_multiplexing() {
    let control = std::path::PathBuf::from(
      "/tmp/stackhaul-ssh/deploy-nas.lan-22.sock",
    );
    let mut t = target("nas.lan");
    t.control_path = Some(&control);
    let args = ssh_base_args(&t).unwrap();
    let joined = args.join(" ");
    assert!(joined.contains("ControlMaster=auto"));
    assert!(joined.contains(
      "ControlPath=/tmp/stackhaul-ssh/deploy-nas.lan-22.sock"
    ));
  }
}
