#[macro_use]
extern crate tracing;

use anyhow::Context;
use colored::Colorize;
use stackhaul_client::entities::{
  config::cli::Command, migration::MigrateFlags,
};

mod command;
mod config;

async fn app() -> anyhow::Result<i32> {
  dotenvy::dotenv().ok();
  logger::init(&config::cli_config().cli_logging)?;
  let args = config::cli_args();

  match &args.command {
    Command::Config {} => {
      println!(
        "CLI Config {}",
        serde_json::to_string_pretty(config::cli_config())
          .context("failed to serialize config")?
      );
      Ok(0)
    }
    Command::Hosts {} => command::stack::hosts().await,
    Command::Stacks { host } => {
      command::stack::stacks(host).await
    }
    Command::Compose { host, stack } => {
      command::stack::compose(host, stack).await
    }
    Command::Deploy { host, stack, pull } => {
      command::stack::deploy(host, stack, *pull).await
    }
    Command::Manage { host, stack, action } => {
      command::stack::manage(host, stack, action).await
    }
    Command::Migrate {
      source,
      target,
      stack,
      dry_run,
      skip_stop_source,
      remove_source,
      force_receive,
      recursive,
      archive,
    } => {
      let flags = MigrateFlags {
        dry_run: *dry_run,
        skip_stop_source: *skip_stop_source,
        remove_source: *remove_source,
        force_receive: *force_receive,
        recursive: *recursive,
        archive: *archive,
      };
      command::migrate::migrate(source, target, stack, flags)
        .await
    }
    Command::Migration { id } => {
      command::migrate::show(id).await
    }
    Command::Cancel { id } => command::migrate::cancel(id).await,
  }
}

#[tokio::main]
async fn main() {
  let code = match app().await {
    Ok(code) => code,
    Err(e) => {
      error!("{e:#}");
      eprintln!("{}: {e:#}", "ERROR".red());
      // Validation / usage errors.
      3
    }
  };
  std::process::exit(code);
}
