use crate::{
  InvalidInput, Result, enforce_command_length,
  quote::{quote, reject_metacharacters},
  validate::{
    validate_compose_subcommand, validate_docker_command,
    validate_path, validate_stack_name,
  },
};

/// Build a `docker <subcommand> ...` command string. The
/// subcommand must be on the allow-list. Flag arguments are
/// scanned for metacharacters, value arguments are quoted.
pub fn docker_command(
  subcommand: &str,
  args: &[&str],
) -> Result<String> {
  let subcommand = validate_docker_command(subcommand)?;
  let mut command = format!("docker {subcommand}");
  push_args(&mut command, args)?;
  enforce_command_length(&command)?;
  Ok(command)
}

/// Build a `docker compose -p <project> <subcommand> ...`
/// command string against a validated project name.
pub fn docker_compose(
  project: &str,
  subcommand: &str,
  args: &[&str],
) -> Result<String> {
  let project = validate_stack_name(project)?;
  let subcommand = validate_compose_subcommand(subcommand)?;
  let mut command =
    format!("docker compose -p {project} {subcommand}");
  push_args(&mut command, args)?;
  enforce_command_length(&command)?;
  Ok(command)
}

/// `cd <dir> && <command>`, for compose operations that must
/// run from the stack directory. The inner command must itself
/// come out of a builder.
pub fn remote_cd_then_exec(
  dir: &str,
  command: &str,
) -> Result<String> {
  let dir = validate_path(dir)?;
  let command =
    format!("cd {} && {command}", quote(dir));
  enforce_command_length(&command)?;
  Ok(command)
}

fn push_args(command: &mut String, args: &[&str]) -> Result<()> {
  for arg in args {
    if arg.is_empty() {
      return Err(InvalidInput::new("argument", *arg));
    }
    if let Some(flag) = arg.strip_prefix('-') {
      // Flags travel unquoted so the remote tool parses them,
      // which means they must be clean.
      reject_metacharacters("argument", flag)?;
      command.push(' ');
      command.push_str(arg);
    } else {
      command.push(' ');
      command.push_str(&quote(arg));
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::validate::DENY_SET;

  #[test]
  fn builds_compose_commands() {
    let command =
      docker_compose("blog", "up", &["-d", "--pull", "always"])
        .unwrap();
    assert_eq!(
      command,
      "docker compose -p blog up -d --pull always"
    );
  }

  #[test]
  fn reserved_project_names_build_nothing() {
    assert!(docker_compose("system", "up", &[]).is_err());
  }

  #[test]
  fn disallowed_subcommands_build_nothing() {
    assert!(docker_compose("blog", "convert", &[]).is_err());
    assert!(docker_command("login", &[]).is_err());
  }

  #[test]
  fn value_arguments_are_quoted() {
    let command = docker_command(
      "volume",
      &["inspect", "media volume", "--format", "{{.Mountpoint}}"],
    );
    // `{{.Mountpoint}}` is not on the deny-set but the spaced
    // name must be quoted.
    assert!(
      command.unwrap().contains("'media volume'"),
    );
  }

  #[test]
  fn injection_attempts_stay_inside_quotes() {
    let command = docker_command(
      "inspect",
      &["container; rm -rf /"],
    )
    .unwrap();
    // Deny-set characters only appear inside the quoted value.
    let quoted_start = command.find('\'').unwrap();
    for (i, c) in command.char_indices() {
      if DENY_SET.contains(&c) {
        assert!(i > quoted_start, "unquoted '{c}' in {command}");
      }
    }
  }

  #[test]
  fn metacharacter_flags_build_nothing() {
    assert!(
      docker_command("ps", &["--filter; reboot"]).is_err()
    );
  }

  #[test]
  fn cd_then_exec_quotes_the_directory() {
    let command = remote_cd_then_exec(
      "/opt/appdata/blog",
      "docker compose -p blog ps",
    )
    .unwrap();
    assert_eq!(
      command,
      "cd /opt/appdata/blog && docker compose -p blog ps"
    );
    assert!(remote_cd_then_exec("/opt/../etc", "ls").is_err());
  }
}
