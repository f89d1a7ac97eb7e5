use std::{sync::Arc, time::Duration};

use anyhow::{Context, anyhow};
use axum::{Extension, Router, routing::post};
use resolver_api::Resolve;
use serror::Json;
use stackhaul_client::{
  api::read::*,
  entities::{
    NoData, backup::DeletionRecord, host::Host,
    migration::MigrationContext, stack::StackListItem,
    update::Log,
  },
};
use tokio_util::sync::CancellationToken;

use crate::{
  config::core_config, stacks::StackOps, state::State,
};

use super::Args;

pub fn router() -> Router {
  Router::new().route("/", post(handler))
}

async fn handler(
  Extension(state): Extension<Arc<State>>,
  Json(request): Json<ReadRequest>,
) -> serror::Result<axum::Json<serde_json::Value>> {
  let args = Args { state };
  let res = match request {
    ReadRequest::GetVersion(req) => {
      serde_json::to_value(req.resolve(&args).await?)
    }
    ReadRequest::GetHealth(req) => {
      serde_json::to_value(req.resolve(&args).await?)
    }
    ReadRequest::ListHosts(req) => {
      serde_json::to_value(req.resolve(&args).await?)
    }
    ReadRequest::ListStacks(req) => {
      serde_json::to_value(req.resolve(&args).await?)
    }
    ReadRequest::GetCompose(req) => {
      serde_json::to_value(req.resolve(&args).await?)
    }
    ReadRequest::GetStackLog(req) => {
      serde_json::to_value(req.resolve(&args).await?)
    }
    ReadRequest::GetMigration(req) => {
      serde_json::to_value(req.resolve(&args).await?)
    }
    ReadRequest::ListMigrations(req) => {
      serde_json::to_value(req.resolve(&args).await?)
    }
    ReadRequest::GetDeletionManifest(req) => {
      serde_json::to_value(req.resolve(&args).await?)
    }
  }
  .context("failed to serialize response")?;
  Ok(axum::Json(res))
}

fn stack_ops<'a>(
  args: &'a Args,
  cancel: &'a CancellationToken,
) -> StackOps<'a> {
  let timeouts = &core_config().timeouts;
  StackOps {
    executor: &args.state.executor,
    cancel,
    docker_timeout: Duration::from_secs(timeouts.docker_secs),
    short_timeout: Duration::from_secs(timeouts.short_secs),
  }
}

impl Resolve<Args> for GetVersion {
  #[instrument(name = "GetVersion", level = "debug", skip_all)]
  async fn resolve(
    self,
    _: &Args,
  ) -> serror::Result<GetVersionResponse> {
    Ok(GetVersionResponse {
      version: env!("CARGO_PKG_VERSION").to_string(),
    })
  }
}

impl Resolve<Args> for GetHealth {
  #[instrument(name = "GetHealth", level = "debug", skip_all)]
  async fn resolve(self, _: &Args) -> serror::Result<NoData> {
    Ok(NoData {})
  }
}

impl Resolve<Args> for ListHosts {
  #[instrument(name = "ListHosts", level = "debug", skip_all)]
  async fn resolve(
    self,
    args: &Args,
  ) -> serror::Result<Vec<Host>> {
    Ok(args.state.hosts.iter().cloned().collect())
  }
}

impl Resolve<Args> for ListStacks {
  #[instrument(name = "ListStacks", level = "debug", skip(args))]
  async fn resolve(
    self,
    args: &Args,
  ) -> serror::Result<Vec<StackListItem>> {
    let host = args
      .state
      .host(&self.host)
      .map_err(anyhow::Error::from)?;
    let cancel = CancellationToken::new();
    let stacks = stack_ops(args, &cancel)
      .list_stacks(&host)
      .await?;
    Ok(stacks)
  }
}

impl Resolve<Args> for GetCompose {
  #[instrument(name = "GetCompose", level = "debug", skip(args))]
  async fn resolve(
    self,
    args: &Args,
  ) -> serror::Result<GetComposeResponse> {
    let host = args
      .state
      .host(&self.host)
      .map_err(anyhow::Error::from)?;
    let cancel = CancellationToken::new();
    let (path, contents) = stack_ops(args, &cancel)
      .get_compose(&host, &self.stack)
      .await
      .map_err(anyhow::Error::from)?;
    Ok(GetComposeResponse { path, contents })
  }
}

impl Resolve<Args> for GetStackLog {
  #[instrument(name = "GetStackLog", level = "debug", skip(args))]
  async fn resolve(self, args: &Args) -> serror::Result<Log> {
    let host = args
      .state
      .host(&self.host)
      .map_err(anyhow::Error::from)?;
    let cancel = CancellationToken::new();
    let log = stack_ops(args, &cancel)
      .stack_log(&host, &self.stack, self.tail)
      .await
      .map_err(anyhow::Error::from)?;
    Ok(log)
  }
}

impl Resolve<Args> for GetMigration {
  #[instrument(name = "GetMigration", level = "debug", skip(args))]
  async fn resolve(
    self,
    args: &Args,
  ) -> serror::Result<MigrationContext> {
    let entry =
      args.state.migrations.get(&self.id).ok_or_else(|| {
        anyhow!("no migration with id {}", self.id)
      })?;
    let context = entry
      .context
      .lock()
      .unwrap_or_else(|p| p.into_inner())
      .clone();
    Ok(context)
  }
}

impl Resolve<Args> for ListMigrations {
  #[instrument(name = "ListMigrations", level = "debug", skip_all)]
  async fn resolve(
    self,
    args: &Args,
  ) -> serror::Result<Vec<MigrationListItem>> {
    let mut items: Vec<MigrationListItem> = args
      .state
      .migrations
      .iter()
      .map(|entry| {
        let ctx = entry
          .context
          .lock()
          .unwrap_or_else(|p| p.into_inner());
        MigrationListItem {
          id: ctx.id.clone(),
          stack: ctx.stack.clone(),
          source: ctx.source.clone(),
          target: ctx.target.clone(),
          state: ctx.state,
          start_ts: ctx.start_ts,
        }
      })
      .collect();
    items.sort_by_key(|item| std::cmp::Reverse(item.start_ts));
    Ok(items)
  }
}

impl Resolve<Args> for GetDeletionManifest {
  #[instrument(
    name = "GetDeletionManifest",
    level = "debug",
    skip_all
  )]
  async fn resolve(
    self,
    args: &Args,
  ) -> serror::Result<Vec<DeletionRecord>> {
    Ok(args.state.safety.manifest())
  }
}
