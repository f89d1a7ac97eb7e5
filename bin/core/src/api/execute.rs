use std::{
  sync::{Arc, atomic::AtomicBool},
  time::Duration,
};

use anyhow::{Context, anyhow};
use axum::{Extension, Router, routing::post};
use resolver_api::Resolve;
use serror::Json;
use stackhaul_client::{
  api::execute::*,
  entities::{
    migration::{
      MigrationContext, MigrationResult, MigrationState,
    },
    update::Log,
  },
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
  backup::BackupEngine,
  config::core_config,
  migrate::Migrator,
  stacks::StackOps,
  state::{MigrationEntry, State},
};

use super::Args;

pub fn router() -> Router {
  Router::new().route("/", post(handler))
}

async fn handler(
  Extension(state): Extension<Arc<State>>,
  Json(request): Json<ExecuteRequest>,
) -> serror::Result<axum::Json<serde_json::Value>> {
  let args = Args { state };
  let res = match request {
    ExecuteRequest::MigrateStack(req) => {
      serde_json::to_value(req.resolve(&args).await?)
    }
    ExecuteRequest::CancelMigration(req) => {
      serde_json::to_value(req.resolve(&args).await?)
    }
    ExecuteRequest::DeployStack(req) => {
      serde_json::to_value(req.resolve(&args).await?)
    }
    ExecuteRequest::ManageStack(req) => {
      serde_json::to_value(req.resolve(&args).await?)
    }
    ExecuteRequest::CleanupBackup(req) => {
      serde_json::to_value(req.resolve(&args).await?)
    }
  }
  .context("failed to serialize response")?;
  Ok(axum::Json(res))
}

impl Resolve<Args> for MigrateStack {
  #[instrument(
    name = "MigrateStack",
    skip_all,
    fields(
      source = &self.source,
      target = &self.target,
      stack = &self.stack,
    )
  )]
  async fn resolve(
    self,
    args: &Args,
  ) -> serror::Result<MigrationResult> {
    let MigrateStack { source, target, stack, flags } = self;
    let state = args.state.clone();

    // Re-invoking against a terminated-success context is a
    // no-op returning the same migration id.
    for entry in state.migrations.iter() {
      let ctx = entry
        .context
        .lock()
        .unwrap_or_else(|p| p.into_inner());
      if ctx.state == MigrationState::Success
        && ctx.source == source
        && ctx.target == target
        && ctx.stack == stack
      {
        return Ok(MigrationResult::from_context(&ctx));
      }
    }

    let source_host =
      state.host(&source).map_err(anyhow::Error::from)?;
    let target_host =
      state.host(&target).map_err(anyhow::Error::from)?;

    let id = Uuid::new_v4().to_string();
    let context = MigrationContext::new(
      id.clone(),
      stack.clone(),
      source,
      target,
      flags,
    );
    let entry = Arc::new(MigrationEntry {
      context: Arc::new(std::sync::Mutex::new(context)),
      cancel: CancellationToken::new(),
      rolling_back: Arc::new(AtomicBool::new(false)),
    });
    state.migrations.insert(id.clone(), entry.clone());

    let migrator = Migrator::new(
      state,
      entry,
      source_host,
      target_host,
      stack,
      flags,
    );
    // Spawned so a panic in the pipeline cannot take the api
    // worker down with it.
    let result = tokio::spawn(migrator.run())
      .await
      .context("failure in spawned migration task")?;
    Ok(result)
  }
}

impl Resolve<Args> for CancelMigration {
  #[instrument(name = "CancelMigration", skip(args))]
  async fn resolve(
    self,
    args: &Args,
  ) -> serror::Result<CancelMigrationResponse> {
    let entry =
      args.state.migrations.get(&self.id).ok_or_else(|| {
        anyhow!("no migration with id {}", self.id)
      })?;
    // Cancelling during rollback is refused: the restore runs
    // to completion.
    if entry
      .rolling_back
      .load(std::sync::atomic::Ordering::SeqCst)
    {
      return Ok(CancelMigrationResponse { cancelled: false });
    }
    let terminal = entry
      .context
      .lock()
      .unwrap_or_else(|p| p.into_inner())
      .state
      .terminal();
    if terminal {
      return Ok(CancelMigrationResponse { cancelled: false });
    }
    entry.cancel.cancel();
    Ok(CancelMigrationResponse { cancelled: true })
  }
}

impl Resolve<Args> for DeployStack {
  #[instrument(name = "DeployStack", skip(args))]
  async fn resolve(self, args: &Args) -> serror::Result<Log> {
    let host = args
      .state
      .host(&self.host)
      .map_err(anyhow::Error::from)?;
    let cancel = CancellationToken::new();
    let timeouts = &core_config().timeouts;
    let ops = StackOps {
      executor: &args.state.executor,
      cancel: &cancel,
      docker_timeout: Duration::from_secs(timeouts.docker_secs),
      short_timeout: Duration::from_secs(timeouts.short_secs),
    };
    let log = ops
      .deploy(&host, &self.stack, self.pull)
      .await
      .map_err(anyhow::Error::from)?;
    Ok(log)
  }
}

impl Resolve<Args> for ManageStack {
  #[instrument(name = "ManageStack", skip(args))]
  async fn resolve(self, args: &Args) -> serror::Result<Log> {
    let host = args
      .state
      .host(&self.host)
      .map_err(anyhow::Error::from)?;
    let cancel = CancellationToken::new();
    let timeouts = &core_config().timeouts;
    let ops = StackOps {
      executor: &args.state.executor,
      cancel: &cancel,
      docker_timeout: Duration::from_secs(timeouts.docker_secs),
      short_timeout: Duration::from_secs(timeouts.short_secs),
    };
    let log = ops
      .compose_action(&host, &self.stack, self.action)
      .await
      .map_err(anyhow::Error::from)?;
    Ok(log)
  }
}

impl Resolve<Args> for CleanupBackup {
  #[instrument(name = "CleanupBackup", skip(args))]
  async fn resolve(self, args: &Args) -> serror::Result<Log> {
    let host = args
      .state
      .host(&self.host)
      .map_err(anyhow::Error::from)?;
    let cancel = CancellationToken::new();
    let timeouts = &core_config().timeouts;
    let engine = BackupEngine {
      executor: &args.state.executor,
      safety: &args.state.safety,
      cancel: &cancel,
      backup_timeout: Duration::from_secs(timeouts.backup_secs),
      short_timeout: Duration::from_secs(timeouts.short_secs),
    };
    let log = engine
      .cleanup_artifact(&host, &self.backup, "operator cleanup")
      .await
      .map_err(anyhow::Error::from)?;
    Ok(log)
  }
}
