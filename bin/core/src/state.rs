use std::sync::{Arc, atomic::AtomicBool};

use dashmap::DashMap;
use remote::{
  AuditLog, ExecuteError, RemoteExecutor, SessionPool,
};
use stackhaul_client::entities::{
  host::{Host, HostRegistry},
  migration::MigrationContext,
};
use tokio_util::sync::CancellationToken;

use crate::{config::core_config, safety::SafetyGate};

/// One tracked migration: the live context plus its
/// cancellation signal. `rolling_back` makes cancellation a
/// no-op while the restore runs.
pub struct MigrationEntry {
  pub context: Arc<std::sync::Mutex<MigrationContext>>,
  pub cancel: CancellationToken,
  pub rolling_back: Arc<AtomicBool>,
}

/// Process-wide dependencies, passed explicitly into the api
/// resolvers and the orchestrator.
pub struct State {
  pub hosts: HostRegistry,
  pub pool: Arc<SessionPool>,
  pub executor: RemoteExecutor,
  pub safety: Arc<SafetyGate>,
  pub migrations: DashMap<String, Arc<MigrationEntry>>,
}

impl State {
  pub fn load() -> Arc<State> {
    let config = core_config();
    let hosts = HostRegistry::new(config.hosts.clone());
    let audit = AuditLog::new(config.audit_log.clone());
    let pool =
      Arc::new(SessionPool::new(config.ssh.clone(), audit));
    let executor = RemoteExecutor::new(pool.clone());
    Arc::new(State {
      hosts,
      pool,
      executor,
      safety: Arc::new(SafetyGate::new()),
      migrations: Default::default(),
    })
  }

  pub fn host(&self, id: &str) -> Result<Host, ExecuteError> {
    self
      .hosts
      .get(id)
      .cloned()
      .ok_or_else(|| ExecuteError::HostNotFound(id.to_string()))
  }
}
