#[macro_use]
extern crate tracing;

use std::{net::SocketAddr, str::FromStr};

use anyhow::Context;

use crate::{config::core_config, state::State};

mod api;
mod backup;
mod compose;
mod config;
mod inventory;
mod migrate;
mod safety;
mod stacks;
mod state;
mod transfer;

async fn app() -> anyhow::Result<()> {
  dotenvy::dotenv().ok();
  let config = core_config();
  logger::init(&config.logging)?;

  info!(
    "Stackhaul Core version: v{}",
    env!("CARGO_PKG_VERSION")
  );

  if config.pretty_startup_config {
    info!("{:#?}", config.sanitized());
  } else {
    info!("{:?}", config.sanitized());
  }

  if config.hosts.is_empty() {
    warn!(
      "no hosts configured, add [hosts.<id>] tables to the config file"
    );
  }

  let state = State::load();
  remote::spawn_pool_tasks(state.pool.clone());

  let app = api::router(state).into_make_service();

  let addr = format!("{}:{}", config.bind_ip, config.port);
  let socket_addr = SocketAddr::from_str(&addr)
    .context("failed to parse listen address")?;

  info!("Stackhaul Core starting on http://{socket_addr}");
  axum_server::bind(socket_addr)
    .serve(app)
    .await
    .context("failed to start http server")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let mut term_signal = tokio::signal::unix::signal(
    tokio::signal::unix::SignalKind::terminate(),
  )?;
  tokio::select! {
    res = tokio::spawn(app()) => res?,
    _ = term_signal.recv() => Ok(()),
  }
}
