use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};

use crate::entities::{
  ErrorKind,
  backup::BackupInfo,
  inventory::{Inventory, Reconciliation},
  stackhaul_timestamp,
  transfer::TransferResult,
  update::Log,
};

/// The ordered migration pipeline. Later phases only run after
/// the previous phase's verified success.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize,
  Display,
  AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MigrationPhase {
  ValidateHosts,
  RetrieveCompose,
  ParseCompose,
  Preflight,
  NetworkProbe,
  RiskAssessment,
  StopSourceStack,
  MapPaths,
  BackupTarget,
  TransferData,
  ResolvePorts,
  RewriteCompose,
  DeployTarget,
  Verify,
  RemoveSource,
  Finalize,
}

impl MigrationPhase {
  /// Pipeline order.
  pub fn all() -> &'static [MigrationPhase] {
    use MigrationPhase::*;
    &[
      ValidateHosts,
      RetrieveCompose,
      ParseCompose,
      Preflight,
      NetworkProbe,
      RiskAssessment,
      StopSourceStack,
      MapPaths,
      BackupTarget,
      TransferData,
      ResolvePorts,
      RewriteCompose,
      DeployTarget,
      Verify,
      RemoveSource,
      Finalize,
    ]
  }

  /// Phases at or after this one can have mutated the target,
  /// so failure triggers rollback.
  pub fn rollback_applies(&self) -> bool {
    use MigrationPhase::*;
    matches!(
      self,
      TransferData
        | ResolvePorts
        | RewriteCompose
        | DeployTarget
        | Verify
        | RemoveSource
    )
  }
}

#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PhaseStatus {
  #[default]
  Pending,
  Running,
  Success,
  /// Completed with warnings, pipeline continued.
  Warned,
  Failed,
  Skipped,
  Cancelled,
}

impl PhaseStatus {
  pub fn passed(&self) -> bool {
    matches!(
      self,
      PhaseStatus::Success
        | PhaseStatus::Warned
        | PhaseStatus::Skipped
    )
  }
}

/// Structured result of one phase, recorded on the context as
/// the phase completes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseResult {
  pub phase: Option<MigrationPhase>,
  pub status: PhaseStatus,
  pub message: String,
  pub error: Option<String>,
  pub error_kind: Option<ErrorKind>,
  /// Phase specific payload, eg port adjustments or estimates.
  #[serde(default)]
  pub data: serde_json::Value,
  #[serde(default)]
  pub logs: Vec<Log>,
  pub start_ts: i64,
  pub end_ts: i64,
}

/// Where a terminated migration ended up. Exactly one of the
/// three non-running states is final.
#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MigrationState {
  #[default]
  InProgress,
  Success,
  FailedRolledBack,
  FailedRollbackFailed,
}

impl MigrationState {
  pub fn terminal(&self) -> bool {
    !matches!(self, MigrationState::InProgress)
  }
}

/// Caller controlled knobs for one migration.
#[derive(
  Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize,
)]
pub struct MigrateFlags {
  /// Walk the pipeline without mutating any remote state.
  #[serde(default)]
  pub dry_run: bool,
  /// Require the source stack to already be stopped instead of
  /// stopping it. Fails if containers are still running.
  #[serde(default)]
  pub skip_stop_source: bool,
  /// Remove the compose file on the source after success. Data
  /// is always retained.
  #[serde(default)]
  pub remove_source: bool,
  /// Pass `-F` to `zfs recv`. Destroys diverging target data,
  /// so never the default.
  #[serde(default)]
  pub force_receive: bool,
  /// Recursive zfs send (child datasets included).
  #[serde(default)]
  pub recursive: bool,
  /// Route the copy through a tar archive instead of direct
  /// rsync. Mostly useful when the ssh user cannot read all
  /// source files in place.
  #[serde(default)]
  pub archive: bool,
}

/// One remapped host port, recorded under `port_adjustments`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortAdjustment {
  pub service: String,
  pub container_port: u16,
  pub protocol: String,
  pub from: u16,
  pub to: u16,
}

#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RiskLevel {
  #[default]
  Low,
  Medium,
  High,
  Critical,
}

/// Advisory pre-migration risk assessment (phase 6).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
  /// 0 - 100, additive over factors.
  pub score: u8,
  pub level: RiskLevel,
  pub factors: Vec<String>,
  pub recommendations: Vec<String>,
  pub data_size_bytes: u64,
  pub estimated_downtime_secs: f64,
  /// Number of database-looking critical files detected.
  pub database_files: usize,
}

/// Phase 5 network probe output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkProbe {
  pub source_rtt_ms: f64,
  pub target_rtt_ms: f64,
  /// Measured source -> target throughput, bytes / sec, from
  /// the 1 MiB probe.
  pub throughput_bytes_per_sec: f64,
  /// Estimated transfer seconds at the measured rate.
  pub estimate_measured_secs: f64,
  /// Estimated transfer seconds at 100 Mbit.
  pub estimate_100mbit_secs: f64,
  /// Estimated transfer seconds at 1 Gbit.
  pub estimate_gbit_secs: f64,
}

/// The single source of truth for one migration: ordered phase
/// results, accumulated warnings / errors, and the references
/// rollback decisions are made from. Owned by one orchestrator
/// instance, never shared between migrations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrationContext {
  pub id: String,
  pub stack: String,
  pub source: String,
  pub target: String,
  pub flags: MigrateFlags,
  /// Ordered phase names for this pipeline.
  pub pipeline: Vec<MigrationPhase>,
  pub current: Option<MigrationPhase>,
  pub state: MigrationState,
  pub cancelled: bool,
  /// One entry per executed phase, in order.
  pub phases: Vec<PhaseResult>,
  pub warnings: Vec<String>,
  pub errors: Vec<String>,
  pub risk: Option<RiskAssessment>,
  pub network: Option<NetworkProbe>,
  pub source_inventory: Option<Inventory>,
  pub reconciliation: Option<Reconciliation>,
  pub transfer: Option<TransferResult>,
  pub backup: Option<BackupInfo>,
  pub port_adjustments: Vec<PortAdjustment>,
  /// Source absolute path -> target absolute path.
  pub path_mappings: BTreeMap<String, String>,
  pub start_ts: i64,
  pub end_ts: Option<i64>,
}

impl MigrationContext {
  pub fn new(
    id: String,
    stack: String,
    source: String,
    target: String,
    flags: MigrateFlags,
  ) -> MigrationContext {
    MigrationContext {
      id,
      stack,
      source,
      target,
      flags,
      pipeline: MigrationPhase::all().to_vec(),
      start_ts: stackhaul_timestamp(),
      ..Default::default()
    }
  }

  /// Result of an already executed phase, for idempotent
  /// re-invocation.
  pub fn phase_result(
    &self,
    phase: MigrationPhase,
  ) -> Option<&PhaseResult> {
    self.phases.iter().find(|r| r.phase == Some(phase))
  }

  pub fn record(&mut self, result: PhaseResult) {
    if let Some(error) = &result.error {
      self.errors.push(format!(
        "{}: {error}",
        result
          .phase
          .map(|p| p.to_string())
          .unwrap_or_else(|| "unknown".to_string())
      ));
    }
    self.phases.push(result);
  }

  pub fn warn(&mut self, warning: impl Into<String>) {
    self.warnings.push(warning.into());
  }

  pub fn finish(&mut self, state: MigrationState) {
    self.state = state;
    self.current = None;
    self.end_ts = Some(stackhaul_timestamp());
  }

  /// The failing phase name and the most actionable error, for
  /// the operator-facing summary.
  pub fn failure_summary(&self) -> Option<(String, String)> {
    self
      .phases
      .iter()
      .rev()
      .find(|r| r.status == PhaseStatus::Failed)
      .map(|r| {
        (
          r.phase
            .map(|p| p.to_string())
            .unwrap_or_else(|| "unknown".to_string()),
          r.error.clone().unwrap_or_else(|| r.message.clone()),
        )
      })
  }
}

/// The operation-surface response for `MigrateStack`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrationResult {
  pub success: bool,
  pub migration_id: String,
  pub state: MigrationState,
  pub cancelled: bool,
  /// Phase name -> status, in pipeline order.
  pub phases: Vec<(MigrationPhase, PhaseStatus)>,
  pub warnings: Vec<String>,
  pub errors: Vec<String>,
  pub stats: Option<TransferResult>,
  pub risk: Option<RiskAssessment>,
  /// Reference usable for manual recovery when rollback failed.
  pub backup_ref: Option<String>,
  /// The failing phase, when not successful.
  pub failed_phase: Option<String>,
  /// Error taxonomy kind of the failing phase.
  pub error_kind: Option<ErrorKind>,
  pub message: String,
}

impl MigrationResult {
  pub fn from_context(context: &MigrationContext) -> Self {
    let (failed_phase, message) = match context.failure_summary()
    {
      Some((phase, error)) => (Some(phase), error),
      None => (None, "Migration complete".to_string()),
    };
    let error_kind = context
      .phases
      .iter()
      .rev()
      .find(|r| r.status == PhaseStatus::Failed)
      .and_then(|r| r.error_kind);
    MigrationResult {
      success: context.state == MigrationState::Success,
      migration_id: context.id.clone(),
      state: context.state,
      cancelled: context.cancelled,
      phases: context
        .phases
        .iter()
        .filter_map(|r| r.phase.map(|p| (p, r.status)))
        .collect(),
      warnings: context.warnings.clone(),
      errors: context.errors.clone(),
      stats: context.transfer.clone(),
      risk: context.risk.clone(),
      backup_ref: context
        .backup
        .as_ref()
        .and_then(|b| b.artifact.clone()),
      failed_phase,
      error_kind,
      message,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn pipeline_matches_enum_order() {
    let context = MigrationContext::new(
      "m1".into(),
      "blog".into(),
      "src".into(),
      "tgt".into(),
      MigrateFlags::default(),
    );
    assert_eq!(context.pipeline.len(), 16);
    assert_eq!(
      context.pipeline.first(),
      Some(&MigrationPhase::ValidateHosts)
    );
    assert_eq!(
      context.pipeline.last(),
      Some(&MigrationPhase::Finalize)
    );
  }

  #[test]
  fn rollback_applies_only_past_backup() {
    assert!(!MigrationPhase::BackupTarget.rollback_applies());
    assert!(!MigrationPhase::StopSourceStack.rollback_applies());
    assert!(MigrationPhase::TransferData.rollback_applies());
    assert!(MigrationPhase::Verify.rollback_applies());
  }

  #[test]
  fn failure_summary_finds_last_failed_phase() {
    let mut context = MigrationContext::new(
      "m1".into(),
      "blog".into(),
      "src".into(),
      "tgt".into(),
      MigrateFlags::default(),
    );
    context.record(PhaseResult {
      phase: Some(MigrationPhase::ValidateHosts),
      status: PhaseStatus::Success,
      ..Default::default()
    });
    context.record(PhaseResult {
      phase: Some(MigrationPhase::Verify),
      status: PhaseStatus::Failed,
      error: Some("critical checksum mismatch".into()),
      ..Default::default()
    });
    let (phase, error) = context.failure_summary().unwrap();
    assert_eq!(phase, "verify");
    assert_eq!(error, "critical checksum mismatch");
  }
}
