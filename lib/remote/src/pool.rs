use std::{
  ops::Deref,
  sync::{
    Arc, Mutex,
    atomic::{AtomicU64, AtomicUsize, Ordering},
  },
  time::{Duration, Instant},
};

use dashmap::DashMap;
use serde::Serialize;
use stackhaul_client::entities::{
  config::core::SshConfig, host::Host,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
  AuditLog, ExecuteError, RateLimiter, Result, Session,
};

const ACQUIRE_POLL: Duration = Duration::from_millis(200);

#[derive(Default)]
struct HostPool {
  inner: Mutex<HostPoolInner>,
  /// Sessions currently handed out, for observability.
  in_use: AtomicUsize,
}

#[derive(Default)]
struct HostPoolInner {
  sessions: Vec<Arc<Session>>,
  /// Reserved slots for connections being established. Counted
  /// against the concurrency cap so the pool never exceeds it
  /// under any interleaving.
  connecting: usize,
}

#[derive(Default)]
pub struct PoolStats {
  pub created: AtomicU64,
  pub reused: AtomicU64,
  pub closed: AtomicU64,
  pub errors: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStatsSnapshot {
  pub created: u64,
  pub reused: u64,
  pub closed: u64,
  pub errors: u64,
}

/// Bounded pool of multiplexed ssh sessions, keyed by
/// `(user, host, port)`. The rate limiter and the audit log are
/// dependencies of the pool, not of the orchestrator.
pub struct SessionPool {
  config: SshConfig,
  audit: AuditLog,
  rate: RateLimiter,
  pools: DashMap<String, Arc<HostPool>>,
  next_id: AtomicU64,
  pub stats: PoolStats,
}

impl SessionPool {
  pub fn new(config: SshConfig, audit: AuditLog) -> SessionPool {
    let rate = RateLimiter::new(
      config.requests_per_minute,
      config.requests_per_hour,
    );
    SessionPool {
      config,
      audit,
      rate,
      pools: Default::default(),
      next_id: AtomicU64::new(1),
      stats: Default::default(),
    }
  }

  pub fn audit(&self) -> &AuditLog {
    &self.audit
  }

  pub fn stats_snapshot(&self) -> PoolStatsSnapshot {
    PoolStatsSnapshot {
      created: self.stats.created.load(Ordering::Relaxed),
      reused: self.stats.reused.load(Ordering::Relaxed),
      closed: self.stats.closed.load(Ordering::Relaxed),
      errors: self.stats.errors.load(Ordering::Relaxed),
    }
  }

  fn host_pool(&self, key: &str) -> Arc<HostPool> {
    self
      .pools
      .entry(key.to_string())
      .or_default()
      .clone()
  }

  /// Block (cooperatively) until an idle alive session is
  /// available or a new one can be created below the cap. On
  /// cap saturation past the configured wait, fails with
  /// `RateLimited`.
  pub async fn acquire(
    self: &Arc<Self>,
    host: &Host,
    cancel: &CancellationToken,
  ) -> Result<SessionGuard> {
    let key = host.pool_key();
    self.rate.admit(&key)?;
    let host_pool = self.host_pool(&key);
    let deadline = Instant::now()
      + Duration::from_secs(self.config.acquire_wait_secs);

    loop {
      enum Plan {
        Reuse(Arc<Session>),
        Connect,
        Wait,
      }

      let plan = {
        let mut inner = host_pool
          .inner
          .lock()
          .unwrap_or_else(|p| p.into_inner());

        // Drop expired or dead idle sessions first.
        let (keep, expired): (Vec<_>, Vec<_>) =
          std::mem::take(&mut inner.sessions)
            .into_iter()
            .partition(|s| {
              s.is_in_use() || !self.session_expired(s)
            });
        inner.sessions = keep;
        for session in expired {
          self.stats.closed.fetch_add(1, Ordering::Relaxed);
          tokio::spawn(async move { session.close().await });
        }

        let reusable = inner
          .sessions
          .iter()
          .find(|s| !s.is_in_use() && !s.master_exited())
          .cloned();
        match reusable {
          Some(session) if session.try_reserve() => {
            Plan::Reuse(session)
          }
          _ => {
            let live = inner.sessions.len() + inner.connecting;
            if live < self.config.max_concurrent_per_host {
              inner.connecting += 1;
              Plan::Connect
            } else {
              Plan::Wait
            }
          }
        }
      };

      match plan {
        Plan::Reuse(session) => {
          session.touch();
          host_pool.in_use.fetch_add(1, Ordering::AcqRel);
          self.stats.reused.fetch_add(1, Ordering::Relaxed);
          debug!(
            host = key,
            session = session.id,
            uses = session.use_count(),
            "reusing pooled session"
          );
          return Ok(SessionGuard {
            session,
            host_pool,
          });
        }
        Plan::Connect => {
          let id = self.next_id.fetch_add(1, Ordering::Relaxed);
          let connected =
            Session::connect(id, host, &self.config.control_dir)
              .await;
          let mut inner = host_pool
            .inner
            .lock()
            .unwrap_or_else(|p| p.into_inner());
          inner.connecting -= 1;
          match connected {
            Ok(session) => {
              let session = Arc::new(session);
              // Fresh session, reservation cannot fail.
              session.try_reserve();
              session.touch();
              inner.sessions.push(session.clone());
              drop(inner);
              host_pool.in_use.fetch_add(1, Ordering::AcqRel);
              self
                .stats
                .created
                .fetch_add(1, Ordering::Relaxed);
              debug!(
                host = key,
                session = session.id,
                "created ssh session"
              );
              return Ok(SessionGuard {
                session,
                host_pool,
              });
            }
            Err(e) => {
              drop(inner);
              self
                .stats
                .errors
                .fetch_add(1, Ordering::Relaxed);
              return Err(e);
            }
          }
        }
        Plan::Wait => {
          if Instant::now() >= deadline {
            return Err(ExecuteError::RateLimited {
              host: key,
            });
          }
          tokio::select! {
            _ = cancel.cancelled() => {
              return Err(ExecuteError::Cancelled);
            }
            _ = tokio::time::sleep(ACQUIRE_POLL) => {}
          }
        }
      }
    }
  }

  fn session_expired(&self, session: &Session) -> bool {
    session.master_exited()
      || session.idle_for()
        > Duration::from_secs(self.config.max_idle_secs)
      || session.lifetime()
        > Duration::from_secs(self.config.max_lifetime_secs)
  }

  /// Close idle-expired / lifetime-expired sessions.
  ///
  /// The dashmap iteration guard must not be held across an
  /// await, so expired sessions are collected first and closed
  /// after.
  pub async fn reap(&self) {
    let mut expired = Vec::new();
    for entry in self.pools.iter() {
      let mut inner = entry
        .inner
        .lock()
        .unwrap_or_else(|p| p.into_inner());
      let (keep, dead): (Vec<_>, Vec<_>) =
        std::mem::take(&mut inner.sessions)
          .into_iter()
          .partition(|s| {
            s.is_in_use() || !self.session_expired(s)
          });
      inner.sessions = keep;
      expired.extend(
        dead.into_iter().map(|s| (entry.key().clone(), s)),
      );
    }
    for (host, session) in expired {
      debug!(
        host,
        session = session.id,
        "reaping expired session"
      );
      self.stats.closed.fetch_add(1, Ordering::Relaxed);
      session.close().await;
    }
  }

  /// Probe idle sessions over their control sockets and drop
  /// the dead ones.
  pub async fn keepalive(&self) {
    let mut idle = Vec::new();
    for entry in self.pools.iter() {
      let inner = entry
        .inner
        .lock()
        .unwrap_or_else(|p| p.into_inner());
      idle.extend(
        inner
          .sessions
          .iter()
          .filter(|s| !s.is_in_use())
          .cloned()
          .map(|s| (entry.key().clone(), s)),
      );
    }
    for (host, session) in idle {
      if session.check_alive().await {
        continue;
      }
      warn!(
        host,
        session = session.id,
        "session failed keepalive, closing"
      );
      if let Some(host_pool) = self.pools.get(&host) {
        let mut inner = host_pool
          .inner
          .lock()
          .unwrap_or_else(|p| p.into_inner());
        inner.sessions.retain(|s| s.id != session.id);
      }
      self.stats.closed.fetch_add(1, Ordering::Relaxed);
      session.close().await;
    }
  }

  /// Close everything. Used on shutdown.
  pub async fn close_all(&self) {
    let mut sessions = Vec::new();
    for entry in self.pools.iter() {
      let mut inner = entry
        .inner
        .lock()
        .unwrap_or_else(|p| p.into_inner());
      sessions.append(&mut inner.sessions);
    }
    for session in sessions {
      session.close().await;
    }
  }
}

/// Spawn the background reaper + keepalive loops.
pub fn spawn_pool_tasks(pool: Arc<SessionPool>) {
  {
    let pool = pool.clone();
    tokio::spawn(async move {
      let mut interval =
        tokio::time::interval(Duration::from_secs(60));
      interval.set_missed_tick_behavior(
        tokio::time::MissedTickBehavior::Delay,
      );
      loop {
        interval.tick().await;
        pool.reap().await;
      }
    });
  }
  tokio::spawn(async move {
    let mut interval =
      tokio::time::interval(Duration::from_secs(60));
    interval.set_missed_tick_behavior(
      tokio::time::MissedTickBehavior::Delay,
    );
    loop {
      interval.tick().await;
      pool.keepalive().await;
    }
  });
}

/// An acquired session. Released back to the pool on drop.
pub struct SessionGuard {
  session: Arc<Session>,
  host_pool: Arc<HostPool>,
}

impl Deref for SessionGuard {
  type Target = Session;

  fn deref(&self) -> &Session {
    &self.session
  }
}

impl Drop for SessionGuard {
  fn drop(&mut self) {
    self.session.release();
    self.host_pool.in_use.fetch_sub(1, Ordering::AcqRel);
  }
}
