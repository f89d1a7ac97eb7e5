use std::time::Duration;

use anyhow::Context;
use command::{
  docker_command, docker_compose, quote, remote_cd_then_exec,
  validate_path, validate_stack_name,
};
use remote::{ExecuteError, RemoteExecutor, output_into_log};
use stackhaul_client::entities::{
  host::Host,
  stack::{
    COMPOSE_FILE_NAMES, DockerComposeLsItem, StackListItem,
  },
  stackhaul_timestamp,
  update::Log,
};
use tokio_util::sync::CancellationToken;

use stackhaul_client::api::execute::StackAction;

/// Compose stack lifecycle operations against one host. Reused
/// by the api resolvers and by the migration pipeline.
pub struct StackOps<'a> {
  pub executor: &'a RemoteExecutor,
  pub cancel: &'a CancellationToken,
  pub docker_timeout: Duration,
  pub short_timeout: Duration,
}

pub fn stack_dir(host: &Host, stack: &str) -> String {
  format!("{}/{stack}", host.appdata_path.trim_end_matches('/'))
}

impl StackOps<'_> {
  /// The stack's compose file on the host, probing the
  /// supported file names.
  pub async fn detect_compose_file(
    &self,
    host: &Host,
    stack: &str,
  ) -> Result<String, ExecuteError> {
    validate_stack_name(stack)?;
    let dir = stack_dir(host, stack);
    validate_path(&dir)?;
    for name in COMPOSE_FILE_NAMES {
      let path = format!("{dir}/{name}");
      let output = self
        .executor
        .run(
          host,
          &format!(
            "test -f {} && echo EXISTS || echo MISSING",
            quote(&path)
          ),
          self.short_timeout,
          self.cancel,
        )
        .await?;
      if output.stdout.contains("EXISTS") {
        return Ok(path);
      }
    }
    Err(
      command::InvalidInput::new("stack", stack.to_string())
        .into(),
    )
  }

  /// Read the compose file contents off the host.
  pub async fn get_compose(
    &self,
    host: &Host,
    stack: &str,
  ) -> Result<(String, String), ExecuteError> {
    let path = self.detect_compose_file(host, stack).await?;
    let output = self
      .executor
      .run_expect_success(
        host,
        &format!("cat {}", quote(&path)),
        "read_compose",
        self.short_timeout,
        self.cancel,
      )
      .await?;
    Ok((path, output.stdout))
  }

  /// Projects known to the compose runtime, merged with
  /// compose directories found under `appdata_path`.
  pub async fn list_stacks(
    &self,
    host: &Host,
  ) -> anyhow::Result<Vec<StackListItem>> {
    let output = self
      .executor
      .run_expect_success(
        host,
        "docker compose ls --all --format json",
        "compose_ls",
        self.docker_timeout,
        self.cancel,
      )
      .await?;
    let mut stacks = serde_json::from_str::<
      Vec<DockerComposeLsItem>,
    >(&output.stdout)
    .with_context(|| output.stdout.clone())
    .context(
      "failed to parse 'docker compose ls' response to json",
    )?
    .into_iter()
    .filter(|item| !item.name.is_empty())
    .map(|item| StackListItem {
      name: item.name,
      status: item.status,
      compose_files: item
        .config_files
        .split(',')
        .filter(|f| !f.is_empty())
        .map(str::to_string)
        .collect(),
      on_disk: false,
    })
    .collect::<Vec<_>>();

    // Compose files on disk that the runtime has never seen
    // still count as stacks.
    let appdata = host.appdata_path.trim_end_matches('/');
    if validate_path(appdata).is_ok() {
      let on_disk = self
        .executor
        .run(
          host,
          &format!(
            "find {} -mindepth 2 -maxdepth 2 -name 'docker-compose.y*ml' 2>/dev/null",
            quote(appdata)
          ),
          self.short_timeout,
          self.cancel,
        )
        .await?;
      for path in
        on_disk.stdout.lines().filter(|l| !l.is_empty())
      {
        let Some(name) = path
          .strip_prefix(&format!("{appdata}/"))
          .and_then(|rest| rest.split('/').next())
        else {
          continue;
        };
        match stacks.iter_mut().find(|s| s.name == name) {
          Some(stack) => stack.on_disk = true,
          None => stacks.push(StackListItem {
            name: name.to_string(),
            status: None,
            compose_files: vec![path.to_string()],
            on_disk: true,
          }),
        }
      }
    }

    Ok(stacks)
  }

  /// `docker compose up -d --pull always` from the stack dir.
  pub async fn deploy(
    &self,
    host: &Host,
    stack: &str,
    pull: bool,
  ) -> Result<Log, ExecuteError> {
    validate_stack_name(stack)?;
    let dir = stack_dir(host, stack);
    let args: &[&str] = if pull {
      &["-d", "--pull", "always"]
    } else {
      &["-d"]
    };
    let up = docker_compose(stack, "up", args)?;
    let command = remote_cd_then_exec(&dir, &up)?;
    let start_ts = stackhaul_timestamp();
    let output = self
      .executor
      .run(host, &command, self.docker_timeout, self.cancel)
      .await?;
    Ok(output_into_log(
      "Compose Up",
      command,
      start_ts,
      &output,
    ))
  }

  /// One compose lifecycle action. `up` needs the stack dir,
  /// everything else addresses the project by name.
  pub async fn compose_action(
    &self,
    host: &Host,
    stack: &str,
    action: StackAction,
  ) -> Result<Log, ExecuteError> {
    validate_stack_name(stack)?;
    let command = match action {
      StackAction::Up => {
        let up = docker_compose(stack, "up", &["-d"])?;
        remote_cd_then_exec(&stack_dir(host, stack), &up)?
      }
      StackAction::Down => {
        // No volume removal, data outlives the containers.
        docker_compose(stack, "down", &[])?
      }
      StackAction::Restart => {
        docker_compose(stack, "restart", &[])?
      }
      StackAction::Start => {
        docker_compose(stack, "start", &[])?
      }
      StackAction::Stop => docker_compose(stack, "stop", &[])?,
      StackAction::Pause => {
        docker_compose(stack, "pause", &[])?
      }
      StackAction::Unpause => {
        docker_compose(stack, "unpause", &[])?
      }
    };
    let start_ts = stackhaul_timestamp();
    let output = self
      .executor
      .run(host, &command, self.docker_timeout, self.cancel)
      .await?;
    Ok(output_into_log(
      &format!("Compose {action}"),
      command,
      start_ts,
      &output,
    ))
  }

  /// Tail the project's logs.
  pub async fn stack_log(
    &self,
    host: &Host,
    stack: &str,
    tail: u64,
  ) -> Result<Log, ExecuteError> {
    validate_stack_name(stack)?;
    let tail = tail.clamp(1, 5000).to_string();
    let command = docker_compose(
      stack,
      "logs",
      &["--tail", tail.as_str()],
    )?;
    let start_ts = stackhaul_timestamp();
    let output = self
      .executor
      .run(host, &command, self.docker_timeout, self.cancel)
      .await?;
    Ok(output_into_log(
      "Stack Log",
      command,
      start_ts,
      &output,
    ))
  }

  /// Container names of the project still known to the docker
  /// daemon (running or not, matching `docker ps` filters).
  pub async fn project_containers(
    &self,
    host: &Host,
    stack: &str,
    all: bool,
  ) -> Result<Vec<String>, ExecuteError> {
    validate_stack_name(stack)?;
    let filter =
      format!("label=com.docker.compose.project={stack}");
    let mut args = vec![
      "--filter",
      filter.as_str(),
      "--format",
      "{{.Names}}",
    ];
    if all {
      args.insert(0, "-a");
    }
    let command = docker_command("ps", &args)?;
    let output = self
      .executor
      .run_expect_success(
        host,
        &command,
        "docker_ps",
        self.docker_timeout,
        self.cancel,
      )
      .await?;
    Ok(
      output
        .stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect(),
    )
  }

  /// Mountpoint of a named volume via `docker volume inspect`.
  pub async fn volume_mountpoint(
    &self,
    host: &Host,
    volume: &str,
  ) -> Result<Option<String>, ExecuteError> {
    let command = docker_command(
      "volume",
      &["inspect", volume, "--format", "{{.Mountpoint}}"],
    )?;
    let output = self
      .executor
      .run(host, &command, self.docker_timeout, self.cancel)
      .await?;
    if !output.success() {
      return Ok(None);
    }
    let mountpoint = output.stdout.trim();
    if mountpoint.is_empty() {
      Ok(None)
    } else {
      Ok(Some(mountpoint.to_string()))
    }
  }
}
