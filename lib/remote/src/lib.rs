//! # Stackhaul Remote
//!
//! The SSH side of the control plane: a bounded pool of
//! multiplexed sessions per host, a rate limiter, an append-only
//! audit log, and the executor that runs one command on one host
//! with bounded time and bounded output.

mod audit;
mod error;
mod exec;
mod pool;
mod rate;
mod session;

pub use audit::{AuditEntry, AuditLog, hash_command};
pub use error::ExecuteError;
pub use exec::{
  CommandOutput, RemoteExecutor, output_into_log,
};
pub use pool::{
  PoolStats, PoolStatsSnapshot, SessionGuard, SessionPool,
  spawn_pool_tasks,
};
pub use rate::RateLimiter;
pub use session::Session;

pub type Result<T> = std::result::Result<T, ExecuteError>;
