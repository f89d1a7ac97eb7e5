//! # Stackhaul Client
//!
//! Entities and typed API for the stackhaul core, plus an http
//! client for talking to it.

use anyhow::Context;
use serde::{Serialize, de::DeserializeOwned};

use crate::{
  api::{execute::*, read::*},
  entities::{
    NoData,
    backup::DeletionRecord,
    host::Host,
    migration::{MigrationContext, MigrationResult},
    stack::StackListItem,
    update::Log,
  },
};

pub mod api;
pub mod entities;

#[derive(Clone)]
pub struct StackhaulClient {
  address: String,
  http: reqwest::Client,
}

impl StackhaulClient {
  pub fn new(address: impl Into<String>) -> StackhaulClient {
    let address: String = address.into();
    StackhaulClient {
      address: address.trim_end_matches('/').to_string(),
      http: Default::default(),
    }
  }

  pub async fn with_healthcheck(
    self,
  ) -> anyhow::Result<StackhaulClient> {
    self.get_health().await?;
    Ok(self)
  }

  async fn request<Res: DeserializeOwned>(
    &self,
    endpoint: &str,
    body: &impl Serialize,
  ) -> anyhow::Result<Res> {
    let res = self
      .http
      .post(format!("{}{endpoint}", self.address))
      .json(body)
      .send()
      .await
      .with_context(|| {
        format!("failed to reach core at {}", self.address)
      })?;
    let status = res.status();
    if status.is_success() {
      res
        .json()
        .await
        .context("failed to parse core response body")
    } else {
      let text = res.text().await.unwrap_or_default();
      Err(anyhow::anyhow!("{status} | {text}"))
    }
  }

  async fn read<Res: DeserializeOwned>(
    &self,
    request: ReadRequest,
  ) -> anyhow::Result<Res> {
    self.request("/read", &request).await
  }

  async fn execute<Res: DeserializeOwned>(
    &self,
    request: ExecuteRequest,
  ) -> anyhow::Result<Res> {
    self.request("/execute", &request).await
  }

  // == READ ==

  pub async fn get_version(
    &self,
  ) -> anyhow::Result<GetVersionResponse> {
    self.read(ReadRequest::GetVersion(GetVersion {})).await
  }

  pub async fn get_health(&self) -> anyhow::Result<NoData> {
    self.read(ReadRequest::GetHealth(GetHealth {})).await
  }

  pub async fn list_hosts(&self) -> anyhow::Result<Vec<Host>> {
    self.read(ReadRequest::ListHosts(ListHosts {})).await
  }

  pub async fn list_stacks(
    &self,
    request: ListStacks,
  ) -> anyhow::Result<Vec<StackListItem>> {
    self.read(ReadRequest::ListStacks(request)).await
  }

  pub async fn get_compose(
    &self,
    request: GetCompose,
  ) -> anyhow::Result<GetComposeResponse> {
    self.read(ReadRequest::GetCompose(request)).await
  }

  pub async fn get_stack_log(
    &self,
    request: GetStackLog,
  ) -> anyhow::Result<Log> {
    self.read(ReadRequest::GetStackLog(request)).await
  }

  pub async fn get_migration(
    &self,
    request: GetMigration,
  ) -> anyhow::Result<MigrationContext> {
    self.read(ReadRequest::GetMigration(request)).await
  }

  pub async fn list_migrations(
    &self,
  ) -> anyhow::Result<Vec<MigrationListItem>> {
    self
      .read(ReadRequest::ListMigrations(ListMigrations {}))
      .await
  }

  pub async fn get_deletion_manifest(
    &self,
  ) -> anyhow::Result<Vec<DeletionRecord>> {
    self
      .read(ReadRequest::GetDeletionManifest(
        GetDeletionManifest {},
      ))
      .await
  }

  // == EXECUTE ==

  pub async fn migrate_stack(
    &self,
    request: MigrateStack,
  ) -> anyhow::Result<MigrationResult> {
    self.execute(ExecuteRequest::MigrateStack(request)).await
  }

  pub async fn cancel_migration(
    &self,
    request: CancelMigration,
  ) -> anyhow::Result<CancelMigrationResponse> {
    self
      .execute(ExecuteRequest::CancelMigration(request))
      .await
  }

  pub async fn deploy_stack(
    &self,
    request: DeployStack,
  ) -> anyhow::Result<Log> {
    self.execute(ExecuteRequest::DeployStack(request)).await
  }

  pub async fn manage_stack(
    &self,
    request: ManageStack,
  ) -> anyhow::Result<Log> {
    self.execute(ExecuteRequest::ManageStack(request)).await
  }

  pub async fn cleanup_backup(
    &self,
    request: CleanupBackup,
  ) -> anyhow::Result<Log> {
    self.execute(ExecuteRequest::CleanupBackup(request)).await
  }
}
