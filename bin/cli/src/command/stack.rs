use std::str::FromStr;

use anyhow::Context;
use colored::Colorize;
use stackhaul_client::api::{execute::*, read::*};

use crate::command::{stackhaul_client, table};

pub async fn hosts() -> anyhow::Result<i32> {
  let hosts = stackhaul_client().await?.list_hosts().await?;
  let mut table =
    table(&["Id", "Address", "Appdata", "Zfs"]);
  for host in hosts {
    table.add_row([
      host.id.clone(),
      format!("{}:{}", host.destination(), host.port),
      host.appdata_path.clone(),
      if host.zfs_capable {
        host.zfs_dataset.clone().unwrap_or_default()
      } else {
        "-".to_string()
      },
    ]);
  }
  println!("{table}");
  Ok(0)
}

pub async fn stacks(host: &str) -> anyhow::Result<i32> {
  let stacks = stackhaul_client()
    .await?
    .list_stacks(ListStacks { host: host.to_string() })
    .await?;
  let mut table =
    table(&["Name", "Status", "On Disk", "Compose Files"]);
  for stack in stacks {
    table.add_row([
      stack.name.clone(),
      stack
        .status
        .clone()
        .unwrap_or_else(|| "-".to_string()),
      if stack.on_disk { "yes" } else { "no" }.to_string(),
      stack.compose_files.join(", "),
    ]);
  }
  println!("{table}");
  Ok(0)
}

pub async fn compose(
  host: &str,
  stack: &str,
) -> anyhow::Result<i32> {
  let res = stackhaul_client()
    .await?
    .get_compose(GetCompose {
      host: host.to_string(),
      stack: stack.to_string(),
    })
    .await?;
  println!("{}", format!("# {}", res.path).dimmed());
  println!("{}", res.contents);
  Ok(0)
}

pub async fn deploy(
  host: &str,
  stack: &str,
  pull: bool,
) -> anyhow::Result<i32> {
  let log = stackhaul_client()
    .await?
    .deploy_stack(DeployStack {
      host: host.to_string(),
      stack: stack.to_string(),
      pull,
    })
    .await?;
  print_log(&log);
  Ok(if log.success { 0 } else { 3 })
}

pub async fn manage(
  host: &str,
  stack: &str,
  action: &str,
) -> anyhow::Result<i32> {
  let action = StackAction::from_str(action).with_context(
    || format!("unknown stack action '{action}'"),
  )?;
  let log = stackhaul_client()
    .await?
    .manage_stack(ManageStack {
      host: host.to_string(),
      stack: stack.to_string(),
      action,
    })
    .await?;
  print_log(&log);
  Ok(if log.success { 0 } else { 3 })
}

fn print_log(log: &stackhaul_client::entities::update::Log) {
  if log.success {
    println!("{}: {}", log.stage.green(), "ok".bold());
  } else {
    println!("{}: {}", log.stage.red(), "failed".bold());
  }
  if !log.stdout.is_empty() {
    println!("{}", log.stdout.trim_end());
  }
  if !log.stderr.is_empty() {
    eprintln!("{}", log.stderr.trim_end());
  }
}
