use std::{
  collections::BTreeMap,
  sync::{Arc, atomic::Ordering},
  time::Duration,
};

use command::{quote, validate_stack_name};
use remote::ExecuteError;
use serde_json::json;
use stackhaul_client::entities::{
  host::Host,
  migration::{
    MigrateFlags, MigrationContext, MigrationPhase,
    MigrationResult, MigrationState, PhaseResult, PhaseStatus,
  },
  stack::{ComposeFile, VolumeSpec},
  stackhaul_timestamp,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
  backup::BackupEngine,
  compose,
  config::core_config,
  inventory::InventoryScanner,
  stacks::{StackOps, stack_dir},
  state::{MigrationEntry, State},
  transfer::{TransferEngine, TransferRequest},
};

pub mod netprobe;
pub mod paths;
pub mod ports;
pub mod preflight;
pub mod risk;

/// Wait after source stop before syncing disks.
const POST_STOP_SETTLE: Duration = Duration::from_secs(10);

/// How long to wait for source containers to disappear.
const STOP_POLL_BUDGET: Duration = Duration::from_secs(60);

/// How long to poll for target containers after deploy.
const DEPLOY_POLL_BUDGET: Duration = Duration::from_secs(10);

/// Drives one migration through the ordered phase pipeline,
/// recording every transition on the context. Owns the context
/// for the lifetime of the run; rollback decisions are made
/// exclusively from what is recorded there.
pub struct Migrator {
  state: Arc<State>,
  entry: Arc<MigrationEntry>,
  source: Host,
  target: Host,
  stack: String,
  flags: MigrateFlags,

  // Working data discovered along the pipeline.
  compose_path: String,
  compose_text: String,
  compose: Option<ComposeFile>,
  volume_specs: Vec<VolumeSpec>,
  source_paths: Vec<String>,
}

impl Migrator {
  pub fn new(
    state: Arc<State>,
    entry: Arc<MigrationEntry>,
    source: Host,
    target: Host,
    stack: String,
    flags: MigrateFlags,
  ) -> Migrator {
    Migrator {
      state,
      entry,
      source,
      target,
      stack,
      flags,
      compose_path: String::new(),
      compose_text: String::new(),
      compose: None,
      volume_specs: Vec::new(),
      source_paths: Vec::new(),
    }
  }

  fn with_ctx<R>(
    &self,
    f: impl FnOnce(&mut MigrationContext) -> R,
  ) -> R {
    let mut ctx = self
      .entry
      .context
      .lock()
      .unwrap_or_else(|p| p.into_inner());
    f(&mut ctx)
  }

  fn stack_ops(&self) -> StackOps<'_> {
    let timeouts = &core_config().timeouts;
    StackOps {
      executor: &self.state.executor,
      cancel: &self.entry.cancel,
      docker_timeout: Duration::from_secs(timeouts.docker_secs),
      short_timeout: Duration::from_secs(timeouts.short_secs),
    }
  }

  fn scanner(&self) -> InventoryScanner<'_> {
    InventoryScanner {
      executor: &self.state.executor,
      cancel: &self.entry.cancel,
      timeout: Duration::from_secs(
        core_config().timeouts.short_secs,
      ),
    }
  }

  /// Begin a phase. Returns false when a previous invocation
  /// already completed it (idempotent re-entry), or fails fast
  /// on a pending cancellation.
  fn begin(
    &self,
    phase: MigrationPhase,
  ) -> Result<bool, ExecuteError> {
    if self.entry.cancel.is_cancelled() {
      return Err(ExecuteError::Cancelled);
    }
    Ok(self.with_ctx(|ctx| {
      if ctx
        .phase_result(phase)
        .map(|r| r.status.passed())
        .unwrap_or(false)
      {
        return false;
      }
      ctx.current = Some(phase);
      true
    }))
  }

  fn record(
    &self,
    phase: MigrationPhase,
    status: PhaseStatus,
    start_ts: i64,
    message: impl Into<String>,
    data: serde_json::Value,
    error: Option<&ExecuteError>,
  ) {
    let message = message.into();
    info!(
      migration = self.with_ctx(|ctx| ctx.id.clone()),
      phase = phase.to_string(),
      status = status.to_string(),
      "{message}"
    );
    self.with_ctx(|ctx| {
      ctx.record(PhaseResult {
        phase: Some(phase),
        status,
        message,
        error: error.map(|e| e.to_string()),
        error_kind: error.map(|e| e.kind()),
        data,
        logs: Vec::new(),
        start_ts,
        end_ts: stackhaul_timestamp(),
      });
    });
  }

  fn ok(
    &self,
    phase: MigrationPhase,
    start_ts: i64,
    message: impl Into<String>,
    data: serde_json::Value,
  ) {
    self.record(
      phase,
      PhaseStatus::Success,
      start_ts,
      message,
      data,
      None,
    );
  }

  /// Run the migration to a terminal state.
  pub async fn run(mut self) -> MigrationResult {
    let outcome = self.pipeline().await;
    match outcome {
      Ok(()) => {}
      Err((phase, err)) => {
        let cancelled =
          matches!(err, ExecuteError::Cancelled);
        let status = if cancelled {
          PhaseStatus::Cancelled
        } else {
          PhaseStatus::Failed
        };
        self.record(
          phase,
          status,
          stackhaul_timestamp(),
          format!("phase {phase} did not complete"),
          serde_json::Value::Null,
          Some(&err),
        );
        if cancelled {
          self.with_ctx(|ctx| ctx.cancelled = true);
        }
        // SafetyBlocked never rolls back: by construction no
        // destructive operation has happened.
        let rollback = phase.rollback_applies()
          && !self.flags.dry_run
          && !matches!(err, ExecuteError::SafetyBlocked(_));
        if rollback {
          self.rollback().await;
        } else {
          self.with_ctx(|ctx| {
            ctx.finish(MigrationState::FailedRolledBack)
          });
        }
      }
    }
    self.with_ctx(|ctx| MigrationResult::from_context(ctx))
  }

  async fn pipeline(
    &mut self,
  ) -> Result<(), (MigrationPhase, ExecuteError)> {
    use MigrationPhase::*;
    self.validate_hosts().await.map_err(|e| (ValidateHosts, e))?;
    self
      .retrieve_compose()
      .await
      .map_err(|e| (RetrieveCompose, e))?;
    self.parse_compose().await.map_err(|e| (ParseCompose, e))?;
    self.preflight().await.map_err(|e| (Preflight, e))?;
    self.network_probe().await.map_err(|e| (NetworkProbe, e))?;
    self
      .risk_assessment()
      .await
      .map_err(|e| (RiskAssessment, e))?;
    self
      .stop_source_stack()
      .await
      .map_err(|e| (StopSourceStack, e))?;
    self.map_paths().await.map_err(|e| (MapPaths, e))?;
    self.backup_target().await.map_err(|e| (BackupTarget, e))?;
    self.transfer_data().await.map_err(|e| (TransferData, e))?;
    self.resolve_ports().await.map_err(|e| (ResolvePorts, e))?;
    self
      .rewrite_compose()
      .await
      .map_err(|e| (RewriteCompose, e))?;
    self.deploy_target().await.map_err(|e| (DeployTarget, e))?;
    self.verify().await.map_err(|e| (Verify, e))?;
    self.remove_source().await.map_err(|e| (RemoveSource, e))?;
    self.finalize().await.map_err(|e| (Finalize, e))?;
    Ok(())
  }

  // == P1 ==

  async fn validate_hosts(&mut self) -> Result<(), ExecuteError> {
    let phase = MigrationPhase::ValidateHosts;
    if !self.begin(phase)? {
      return Ok(());
    }
    let start_ts = stackhaul_timestamp();
    validate_stack_name(&self.stack)?;
    if self.source.id == self.target.id {
      return Err(
        command::InvalidInput::new(
          "target",
          self.target.id.clone(),
        )
        .into(),
      );
    }
    self.ok(
      phase,
      start_ts,
      format!(
        "migrating '{}' from {} to {}",
        self.stack, self.source.id, self.target.id
      ),
      serde_json::Value::Null,
    );
    Ok(())
  }

  // == P2 ==

  async fn retrieve_compose(
    &mut self,
  ) -> Result<(), ExecuteError> {
    let phase = MigrationPhase::RetrieveCompose;
    if !self.begin(phase)? {
      return Ok(());
    }
    let start_ts = stackhaul_timestamp();
    let (path, contents) = self
      .stack_ops()
      .get_compose(&self.source, &self.stack)
      .await?;
    self.compose_path = path.clone();
    self.compose_text = contents;
    self.ok(
      phase,
      start_ts,
      format!("retrieved compose file {path}"),
      json!({ "path": path }),
    );
    Ok(())
  }

  // == P3 ==

  async fn parse_compose(&mut self) -> Result<(), ExecuteError> {
    let phase = MigrationPhase::ParseCompose;
    if !self.begin(phase)? {
      return Ok(());
    }
    let start_ts = stackhaul_timestamp();
    let compose = compose::parse_compose(&self.compose_text)
      .map_err(|e| {
        ExecuteError::InvalidInput(command::InvalidInput::new(
          "compose",
          format!("{e:#}"),
        ))
      })?;
    self.volume_specs = compose::service_volume_specs(
      &compose,
      &self.source.appdata_path,
    );

    // Bind mounts are copied from their host paths. Named
    // volumes are resolved to their docker-managed location.
    let mut source_paths: Vec<String> = self
      .volume_specs
      .iter()
      .filter_map(|spec| spec.bind_source())
      .map(str::to_string)
      .collect();
    for spec in &self.volume_specs {
      let VolumeSpec::Named { name, .. } = spec else {
        continue;
      };
      if name.is_empty() {
        continue;
      }
      // Compose prefixes project volumes, try both names.
      let prefixed = format!("{}_{name}", self.stack);
      let ops = self.stack_ops();
      let mountpoint = match ops
        .volume_mountpoint(&self.source, &prefixed)
        .await?
      {
        Some(mountpoint) => Some(mountpoint),
        None => {
          ops.volume_mountpoint(&self.source, name).await?
        }
      };
      match mountpoint {
        Some(mountpoint) => source_paths.push(mountpoint),
        None => self.with_ctx(|ctx| {
          ctx.warn(format!(
            "named volume '{name}' has no mountpoint on the source yet, skipping its data"
          ))
        }),
      }
    }
    source_paths.dedup();
    self.source_paths = source_paths;

    let services: Vec<&String> =
      compose.services.keys().collect();
    self.ok(
      phase,
      start_ts,
      format!(
        "parsed compose: {} services, {} volume entries",
        services.len(),
        self.volume_specs.len()
      ),
      json!({
        "services": services,
        "volumes": &self.volume_specs,
        "source_paths": &self.source_paths,
      }),
    );
    self.compose = Some(compose);
    Ok(())
  }

  // == P4 ==

  async fn preflight(&mut self) -> Result<(), ExecuteError> {
    let phase = MigrationPhase::Preflight;
    if !self.begin(phase)? {
      return Ok(());
    }
    let start_ts = stackhaul_timestamp();

    // The census runs here so the capacity check, the risk
    // assessment, and the post-copy reconciliation all see the
    // same inventory.
    let inventory = self
      .scanner()
      .census(&self.source, &self.source_paths)
      .await?;
    let data_size = inventory.total_size;
    self.with_ctx(|ctx| {
      ctx.source_inventory = Some(inventory)
    });

    let report = preflight::Preflight {
      executor: &self.state.executor,
      cancel: &self.entry.cancel,
      timeout: Duration::from_secs(
        core_config().timeouts.short_secs,
      ),
    }
    .run(&self.source, &self.target, data_size)
    .await?;

    let data = serde_json::to_value(&report)
      .unwrap_or(serde_json::Value::Null);
    if report.passed() {
      self.ok(
        phase,
        start_ts,
        format!(
          "preflight ok: {} bytes required, {} available",
          report.required_bytes, report.available_bytes
        ),
        data,
      );
      return Ok(());
    }

    let mut problems = Vec::new();
    if !report.disk_ok {
      problems.push(format!(
        "insufficient disk space on target: {} bytes required (20% margin), {} available",
        report.required_bytes, report.available_bytes
      ));
    }
    if !report.missing_tools.is_empty() {
      problems.push(format!(
        "missing tools on target: {}",
        report.missing_tools.join(", ")
      ));
    }
    if !report.source_docker_ok || !report.target_docker_ok {
      problems
        .push("docker server not reachable".to_string());
    }
    let summary = problems.join("; ");

    if self.flags.dry_run {
      // Dry runs report the problems instead of failing.
      self.record(
        phase,
        PhaseStatus::Warned,
        start_ts,
        summary.clone(),
        data,
        None,
      );
      self.with_ctx(|ctx| ctx.warn(summary));
      return Ok(());
    }
    Err(ExecuteError::InvalidInput(
      command::InvalidInput::new("preflight", summary),
    ))
  }

  // == P5 ==

  async fn network_probe(&mut self) -> Result<(), ExecuteError> {
    let phase = MigrationPhase::NetworkProbe;
    if !self.begin(phase)? {
      return Ok(());
    }
    let start_ts = stackhaul_timestamp();
    let data_size = self.with_ctx(|ctx| {
      ctx
        .source_inventory
        .as_ref()
        .map(|i| i.total_size)
        .unwrap_or(0)
    });
    let probe = netprobe::NetProbe {
      executor: &self.state.executor,
      cancel: &self.entry.cancel,
      timeout: Duration::from_secs(
        core_config().timeouts.short_secs,
      ),
    }
    .run(&self.source, &self.target, data_size)
    .await;

    // Warn-only: probe failures never stop a migration.
    match probe {
      Ok(probe) => {
        let data = serde_json::to_value(&probe)
          .unwrap_or(serde_json::Value::Null);
        self.ok(
          phase,
          start_ts,
          format!(
            "network probe: {:.1} ms / {:.1} ms rtt, {:.0} bytes/sec",
            probe.source_rtt_ms,
            probe.target_rtt_ms,
            probe.throughput_bytes_per_sec
          ),
          data,
        );
        self.with_ctx(|ctx| ctx.network = Some(probe));
      }
      Err(ExecuteError::Cancelled) => {
        return Err(ExecuteError::Cancelled);
      }
      Err(e) => {
        self.record(
          phase,
          PhaseStatus::Warned,
          start_ts,
          "network probe failed",
          serde_json::Value::Null,
          Some(&e),
        );
        self.with_ctx(|ctx| {
          ctx.warn(format!("network probe failed | {e}"))
        });
      }
    }
    Ok(())
  }

  // == P6 ==

  async fn risk_assessment(
    &mut self,
  ) -> Result<(), ExecuteError> {
    let phase = MigrationPhase::RiskAssessment;
    if !self.begin(phase)? {
      return Ok(());
    }
    let start_ts = stackhaul_timestamp();
    let assessment = self.with_ctx(|ctx| {
      let downtime = ctx
        .network
        .as_ref()
        .map(|n| {
          if n.estimate_measured_secs > 0.0 {
            n.estimate_measured_secs
          } else {
            n.estimate_100mbit_secs
          }
        })
        .unwrap_or(0.0);
      let empty = Default::default();
      let inventory =
        ctx.source_inventory.as_ref().unwrap_or(&empty);
      risk::assess(
        inventory,
        self.compose.as_ref().expect("compose parsed in P3"),
        downtime,
      )
    });
    let data = serde_json::to_value(&assessment)
      .unwrap_or(serde_json::Value::Null);
    self.ok(
      phase,
      start_ts,
      format!(
        "risk score {} ({})",
        assessment.score, assessment.level
      ),
      data,
    );
    self.with_ctx(|ctx| ctx.risk = Some(assessment));
    Ok(())
  }

  // == P7 ==

  async fn stop_source_stack(
    &mut self,
  ) -> Result<(), ExecuteError> {
    let phase = MigrationPhase::StopSourceStack;
    if !self.begin(phase)? {
      return Ok(());
    }
    let start_ts = stackhaul_timestamp();
    if self.flags.dry_run {
      self.record(
        phase,
        PhaseStatus::Skipped,
        start_ts,
        "dry run, source stack left running",
        serde_json::Value::Null,
        None,
      );
      return Ok(());
    }

    let ops = self.stack_ops();
    if self.flags.skip_stop_source {
      let running = ops
        .project_containers(&self.source, &self.stack, false)
        .await?;
      if !running.is_empty() {
        return Err(
          command::InvalidInput::new(
            "skip_stop_source",
            format!(
              "source stack still has running containers: {}",
              running.join(", ")
            ),
          )
          .into(),
        );
      }
      self.ok(
        phase,
        start_ts,
        "source stack verified stopped",
        serde_json::Value::Null,
      );
      return Ok(());
    }

    let log = ops
      .compose_action(
        &self.source,
        &self.stack,
        stackhaul_client::api::execute::StackAction::Down,
      )
      .await?;
    if !log.success {
      return Err(ExecuteError::RemoteNonZero {
        code: -1,
        stderr: log.stderr,
        command_kind: "compose_down".to_string(),
      });
    }

    // Block until the project reports no containers.
    let deadline =
      std::time::Instant::now() + STOP_POLL_BUDGET;
    loop {
      let running = ops
        .project_containers(&self.source, &self.stack, false)
        .await?;
      if running.is_empty() {
        break;
      }
      if std::time::Instant::now() > deadline {
        return Err(ExecuteError::Timeout {
          budget_secs: STOP_POLL_BUDGET.as_secs(),
          stdout: running.join("\n"),
          stderr: String::new(),
        });
      }
      tokio::time::sleep(Duration::from_secs(2)).await;
    }

    // Give page cache a moment, then force it out.
    tokio::time::sleep(POST_STOP_SETTLE).await;
    self
      .state
      .executor
      .run_expect_success(
        &self.source,
        "sync",
        "sync",
        Duration::from_secs(core_config().timeouts.short_secs),
        &self.entry.cancel,
      )
      .await?;

    self.ok(
      phase,
      start_ts,
      "source stack stopped and disks synced",
      serde_json::Value::Null,
    );
    Ok(())
  }

  // == P8 ==

  async fn map_paths(&mut self) -> Result<(), ExecuteError> {
    let phase = MigrationPhase::MapPaths;
    if !self.begin(phase)? {
      return Ok(());
    }
    let start_ts = stackhaul_timestamp();

    let mut mappings = BTreeMap::new();
    // Bind mounts follow the stack-relative mapping rule.
    let bind_sources: Vec<String> = self
      .volume_specs
      .iter()
      .filter_map(|s| s.bind_source())
      .map(str::to_string)
      .collect();
    mappings.extend(paths::map_paths(
      &self.target,
      &self.stack,
      &bind_sources,
    ));
    // Docker-managed volume locations keep their layout, the
    // target daemon adopts the data when the volume is created.
    for path in &self.source_paths {
      mappings
        .entry(path.clone())
        .or_insert_with(|| path.clone());
    }

    let data = serde_json::to_value(&mappings)
      .unwrap_or(serde_json::Value::Null);
    self.ok(
      phase,
      start_ts,
      format!("computed {} path mappings", mappings.len()),
      data,
    );
    self.with_ctx(|ctx| ctx.path_mappings = mappings);
    Ok(())
  }

  // == P9 ==

  async fn backup_target(&mut self) -> Result<(), ExecuteError> {
    let phase = MigrationPhase::BackupTarget;
    if !self.begin(phase)? {
      return Ok(());
    }
    let start_ts = stackhaul_timestamp();
    if self.flags.dry_run {
      self.record(
        phase,
        PhaseStatus::Skipped,
        start_ts,
        "dry run, backup simulated",
        json!({ "simulated": true }),
        None,
      );
      return Ok(());
    }

    let timeouts = &core_config().timeouts;
    let engine = BackupEngine {
      executor: &self.state.executor,
      safety: &self.state.safety,
      cancel: &self.entry.cancel,
      backup_timeout: Duration::from_secs(timeouts.backup_secs),
      short_timeout: Duration::from_secs(timeouts.short_secs),
    };
    let protected = stack_dir(&self.target, &self.stack);
    match engine
      .capture(
        &self.target,
        &protected,
        &self.stack,
        "Pre-migration backup",
      )
      .await
    {
      Ok(backup) => {
        let data = serde_json::to_value(&backup)
          .unwrap_or(serde_json::Value::Null);
        self.ok(
          phase,
          start_ts,
          match &backup.artifact {
            Some(artifact) => {
              format!("backup captured: {artifact}")
            }
            None => {
              "target path empty, no backup needed".to_string()
            }
          },
          data,
        );
        self.with_ctx(|ctx| ctx.backup = Some(backup));
      }
      Err(ExecuteError::Cancelled) => {
        return Err(ExecuteError::Cancelled);
      }
      Err(e) => {
        // Warn-only, but from here on a failure past P9 cannot
        // be rolled back automatically.
        self.record(
          phase,
          PhaseStatus::Warned,
          start_ts,
          "backup failed, proceeding without rollback cover",
          serde_json::Value::Null,
          Some(&e),
        );
        self.with_ctx(|ctx| {
          ctx.warn(format!(
            "target backup failed, rollback will not be possible | {e}"
          ))
        });
      }
    }
    Ok(())
  }

  // == P10 ==

  async fn transfer_data(&mut self) -> Result<(), ExecuteError> {
    let phase = MigrationPhase::TransferData;
    if !self.begin(phase)? {
      return Ok(());
    }
    let start_ts = stackhaul_timestamp();
    let timeouts = &core_config().timeouts;
    let engine = TransferEngine {
      executor: &self.state.executor,
      safety: &self.state.safety,
      cancel: &self.entry.cancel,
      rsync_timeout: Duration::from_secs(timeouts.rsync_secs),
      archive_timeout: Duration::from_secs(
        timeouts.archive_secs,
      ),
      short_timeout: Duration::from_secs(timeouts.short_secs),
    };
    let method =
      engine.select_method(&self.source, &self.target).await;
    let path_mappings =
      self.with_ctx(|ctx| ctx.path_mappings.clone());
    let result = engine
      .transfer(
        method,
        &TransferRequest {
          source: &self.source,
          target: &self.target,
          source_paths: &self.source_paths,
          path_mappings: &path_mappings,
          stack: &self.stack,
          flags: self.flags,
          delete: false,
        },
      )
      .await?;

    let data = serde_json::to_value(&result)
      .unwrap_or(serde_json::Value::Null);
    self.ok(
      phase,
      start_ts,
      format!(
        "transferred {} files / {} bytes via {}",
        result.stats.files_transferred,
        result.stats.total_bytes,
        result.transfer_type
      ),
      data,
    );
    self.with_ctx(|ctx| ctx.transfer = Some(result));
    Ok(())
  }

  // == P11 ==

  async fn resolve_ports(&mut self) -> Result<(), ExecuteError> {
    let phase = MigrationPhase::ResolvePorts;
    if !self.begin(phase)? {
      return Ok(());
    }
    let start_ts = stackhaul_timestamp();
    let compose =
      self.compose.as_ref().expect("compose parsed in P3");
    let desired = compose::extract_host_ports(compose);
    if desired.is_empty() {
      self.ok(
        phase,
        start_ts,
        "no host ports exposed, skipping port checks",
        json!({ "ports_checked": [] }),
      );
      return Ok(());
    }

    let resolver = ports::PortResolver {
      executor: &self.state.executor,
      cancel: &self.entry.cancel,
      timeout: Duration::from_secs(
        core_config().timeouts.short_secs,
      ),
    };
    let occupied =
      resolver.listening_ports(&self.target).await?;
    let adjustments = ports::resolve_conflicts(&desired, &occupied);

    let data = json!({
      "ports_checked": desired
        .iter()
        .map(|p| p.host_port)
        .collect::<Vec<_>>(),
      "port_adjustments": &adjustments,
      "dry_run_probe_only": self.flags.dry_run,
    });
    self.ok(
      phase,
      start_ts,
      if adjustments.is_empty() {
        "target host ports available".to_string()
      } else {
        format!(
          "remapped {} conflicting host ports",
          adjustments.len()
        )
      },
      data,
    );
    self.with_ctx(|ctx| ctx.port_adjustments = adjustments);
    Ok(())
  }

  // == P12 ==

  async fn rewrite_compose(
    &mut self,
  ) -> Result<(), ExecuteError> {
    let phase = MigrationPhase::RewriteCompose;
    if !self.begin(phase)? {
      return Ok(());
    }
    let start_ts = stackhaul_timestamp();
    let (path_mappings, port_remaps) = self.with_ctx(|ctx| {
      let remaps: Vec<(u16, u16, u16)> = ctx
        .port_adjustments
        .iter()
        .map(|a| (a.from, a.to, a.container_port))
        .collect();
      (ctx.path_mappings.clone(), remaps)
    });
    let rewritten = compose::rewrite_for_target(
      &self.compose_text,
      &self.target.appdata_path,
      &path_mappings,
      &port_remaps,
    );

    if self.flags.dry_run {
      self.record(
        phase,
        PhaseStatus::Skipped,
        start_ts,
        "dry run, rewritten compose not written to target",
        json!({ "rewritten_bytes": rewritten.len() }),
        None,
      );
      return Ok(());
    }

    let target_dir = stack_dir(&self.target, &self.stack);
    command::validate_path(&target_dir)?;
    let target_file = format!("{target_dir}/docker-compose.yml");
    self
      .state
      .executor
      .run_with_stdin(
        &self.target,
        &format!(
          "mkdir -p {} && cat > {}",
          quote(&target_dir),
          quote(&target_file)
        ),
        rewritten.as_bytes(),
        Duration::from_secs(core_config().timeouts.short_secs),
        &self.entry.cancel,
      )
      .await
      .and_then(|output| {
        if output.success() {
          Ok(())
        } else {
          Err(ExecuteError::RemoteNonZero {
            code: output.exit_code.unwrap_or(-1),
            stderr: output.stderr,
            command_kind: "write_compose".to_string(),
          })
        }
      })?;

    self.ok(
      phase,
      start_ts,
      format!("adjusted compose written to {target_file}"),
      json!({ "path": target_file }),
    );
    Ok(())
  }

  // == P13 ==

  async fn deploy_target(&mut self) -> Result<(), ExecuteError> {
    let phase = MigrationPhase::DeployTarget;
    if !self.begin(phase)? {
      return Ok(());
    }
    let start_ts = stackhaul_timestamp();
    if self.flags.dry_run {
      self.record(
        phase,
        PhaseStatus::Skipped,
        start_ts,
        "dry run, deploy skipped",
        serde_json::Value::Null,
        None,
      );
      return Ok(());
    }

    let ops = self.stack_ops();
    let log =
      ops.deploy(&self.target, &self.stack, true).await?;
    if !log.success {
      return Err(ExecuteError::RemoteNonZero {
        code: -1,
        stderr: log.stderr,
        command_kind: "compose_up".to_string(),
      });
    }

    let deadline =
      std::time::Instant::now() + DEPLOY_POLL_BUDGET;
    loop {
      let running = ops
        .project_containers(&self.target, &self.stack, false)
        .await?;
      if !running.is_empty() {
        self.ok(
          phase,
          start_ts,
          format!(
            "stack deployed, containers: {}",
            running.join(", ")
          ),
          json!({ "containers": running }),
        );
        return Ok(());
      }
      if std::time::Instant::now() > deadline {
        return Err(ExecuteError::RemoteNonZero {
          code: -1,
          stderr:
            "no containers appeared for the project after deploy"
              .to_string(),
          command_kind: "compose_up".to_string(),
        });
      }
      tokio::time::sleep(Duration::from_secs(1)).await;
    }
  }

  // == P14 ==

  async fn verify(&mut self) -> Result<(), ExecuteError> {
    let phase = MigrationPhase::Verify;
    if !self.begin(phase)? {
      return Ok(());
    }
    let start_ts = stackhaul_timestamp();
    if self.flags.dry_run {
      self.record(
        phase,
        PhaseStatus::Skipped,
        start_ts,
        "dry run, verification skipped",
        serde_json::Value::Null,
        None,
      );
      return Ok(());
    }

    // Data reconciliation against the source inventory.
    let (source_inventory, path_mappings) =
      self.with_ctx(|ctx| {
        (
          ctx.source_inventory.clone(),
          ctx.path_mappings.clone(),
        )
      });
    let Some(source_inventory) = source_inventory else {
      return Err(ExecuteError::IntegrityFailure(
        "no source inventory recorded".to_string(),
      ));
    };
    let recon = self
      .scanner()
      .reconcile(&self.target, &source_inventory, &path_mappings)
      .await?;
    let passed = recon.passed();
    let issues = recon.issues.clone();
    self.with_ctx(|ctx| ctx.reconciliation = Some(recon));
    if !passed {
      return Err(ExecuteError::IntegrityFailure(
        issues.join("; "),
      ));
    }

    // Container integration.
    let warnings = self.verify_integration().await?;
    for warning in &warnings {
      self.with_ctx(|ctx| ctx.warn(warning.clone()));
    }

    self.ok(
      phase,
      start_ts,
      "data reconciled and container integration verified",
      json!({ "warnings": warnings }),
    );
    Ok(())
  }

  async fn verify_integration(
    &self,
  ) -> Result<Vec<String>, ExecuteError> {
    let ops = self.stack_ops();
    let mut warnings = Vec::new();

    let running = ops
      .project_containers(&self.target, &self.stack, false)
      .await?;
    if running.is_empty() {
      return Err(ExecuteError::IntegrityFailure(
        "no running containers for the project on the target"
          .to_string(),
      ));
    }

    let expected_binds: Vec<&VolumeSpec> = self
      .volume_specs
      .iter()
      .filter(|s| s.bind_source().is_some())
      .collect();

    for container in &running {
      let inspect = self
        .state
        .executor
        .run_expect_success(
          &self.target,
          &command::docker_command(
            "inspect",
            &[container.as_str()],
          )?,
          "docker_inspect",
          Duration::from_secs(
            core_config().timeouts.docker_secs,
          ),
          &self.entry.cancel,
        )
        .await?;
      let parsed: serde_json::Value =
        serde_json::from_str(&inspect.stdout).map_err(|e| {
          ExecuteError::IntegrityFailure(format!(
            "unparseable docker inspect output | {e}"
          ))
        })?;
      let Some(info) = parsed.get(0) else {
        return Err(ExecuteError::IntegrityFailure(format!(
          "container {container} missing from inspect output"
        )));
      };

      let status = info
        .pointer("/State/Status")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");
      if status != "running" {
        return Err(ExecuteError::IntegrityFailure(format!(
          "container {container} is {status}, expected running"
        )));
      }
      if let Some(health) = info
        .pointer("/State/Health/Status")
        .and_then(|v| v.as_str())
        && health != "healthy"
        && health != "starting"
      {
        return Err(ExecuteError::IntegrityFailure(format!(
          "container {container} health is {health}"
        )));
      }

      let mounts: Vec<(String, String)> = info
        .pointer("/Mounts")
        .and_then(|v| v.as_array())
        .map(|mounts| {
          mounts
            .iter()
            .filter_map(|m| {
              Some((
                m.get("Source")?.as_str()?.to_string(),
                m.get("Destination")?.as_str()?.to_string(),
              ))
            })
            .collect()
        })
        .unwrap_or_default();

      for spec in &expected_binds {
        let destination = spec.destination();
        if destination.is_empty() {
          continue;
        }
        let found = mounts.iter().find(|(_, dst)| {
          dst == destination
        });
        match found {
          // The mount must exist and point into the target's
          // appdata (or an unchanged docker-managed path).
          Some((source, _)) => {
            if !source
              .starts_with(
                self.target.appdata_path.trim_end_matches('/'),
              )
              && !source.starts_with("/var/lib/docker")
            {
              return Err(ExecuteError::IntegrityFailure(
                format!(
                  "mount {destination} of {container} points at {source}, outside the target appdata"
                ),
              ));
            }
          }
          None => {
            // Mounts belong to specific services; only flag a
            // destination no container carries.
            if !self
              .mount_present_somewhere(
                &running,
                destination,
              )
              .await
            {
              return Err(ExecuteError::IntegrityFailure(
                format!(
                  "expected mount {destination} not present on any container"
                ),
              ));
            }
          }
        }
      }

      // Data visible from inside the container, warn-only.
      let access = format!(
        "{} || {}",
        command::docker_command(
          "exec",
          &[container.as_str(), "ls", "/data"],
        )?,
        command::docker_command(
          "exec",
          &[container.as_str(), "ls", "/"],
        )?,
      );
      let output = self
        .state
        .executor
        .run(
          &self.target,
          &access,
          Duration::from_secs(
            core_config().timeouts.docker_secs,
          ),
          &self.entry.cancel,
        )
        .await?;
      if !output.success() {
        warnings.push(format!(
          "could not list filesystem inside {container}"
        ));
      }
    }

    // Recent log lines that look like startup errors, warn-only.
    let log = ops.stack_log(&self.target, &self.stack, 50).await?;
    let error_lines = log
      .stdout
      .lines()
      .chain(log.stderr.lines())
      .filter(|l| {
        let l = l.to_lowercase();
        l.contains("error")
          || l.contains("fatal")
          || l.contains("panic")
      })
      .count();
    if error_lines > 0 {
      warnings.push(format!(
        "{error_lines} error-looking lines in recent stack logs"
      ));
    }

    Ok(warnings)
  }

  /// Whether any running container carries a mount with this
  /// destination. Cheap follow-up used before failing on a
  /// missing per-container mount.
  async fn mount_present_somewhere(
    &self,
    containers: &[String],
    destination: &str,
  ) -> bool {
    for container in containers {
      let Ok(command) = command::docker_command(
        "inspect",
        &[
          "--format",
          "{{range .Mounts}}{{.Destination}}\n{{end}}",
          container.as_str(),
        ],
      ) else {
        continue;
      };
      let Ok(output) = self
        .state
        .executor
        .run(
          &self.target,
          &command,
          Duration::from_secs(
            core_config().timeouts.docker_secs,
          ),
          &self.entry.cancel,
        )
        .await
      else {
        continue;
      };
      if output
        .stdout
        .lines()
        .any(|line| line.trim() == destination)
      {
        return true;
      }
    }
    false
  }

  // == P15 ==

  async fn remove_source(&mut self) -> Result<(), ExecuteError> {
    let phase = MigrationPhase::RemoveSource;
    if !self.begin(phase)? {
      return Ok(());
    }
    let start_ts = stackhaul_timestamp();
    if !self.flags.remove_source || self.flags.dry_run {
      self.record(
        phase,
        PhaseStatus::Skipped,
        start_ts,
        "source compose file retained",
        serde_json::Value::Null,
        None,
      );
      return Ok(());
    }

    // Only the compose file. Data retention is unconditional.
    let res: Result<(), ExecuteError> = async {
      self.state.safety.approve_path(
        &self.compose_path,
        "rm -f",
        "remove source compose file after successful migration",
      )?;
      command::validate_path(&self.compose_path)?;
      self
        .state
        .executor
        .run_expect_success(
          &self.source,
          &format!("rm -f {}", quote(&self.compose_path)),
          "remove_source_compose",
          Duration::from_secs(
            core_config().timeouts.short_secs,
          ),
          &self.entry.cancel,
        )
        .await?;
      Ok(())
    }
    .await;

    match res {
      Ok(()) => self.ok(
        phase,
        start_ts,
        format!("removed source compose file {}", self.compose_path),
        serde_json::Value::Null,
      ),
      Err(ExecuteError::Cancelled) => {
        return Err(ExecuteError::Cancelled);
      }
      Err(e) => {
        self.record(
          phase,
          PhaseStatus::Warned,
          start_ts,
          "failed to remove source compose file",
          serde_json::Value::Null,
          Some(&e),
        );
        self.with_ctx(|ctx| {
          ctx.warn(format!(
            "failed to remove source compose file | {e}"
          ))
        });
      }
    }
    Ok(())
  }

  // == P16 ==

  async fn finalize(&mut self) -> Result<(), ExecuteError> {
    let phase = MigrationPhase::Finalize;
    if !self.begin(phase)? {
      return Ok(());
    }
    let start_ts = stackhaul_timestamp();

    // Successful migrations do not need the directory tar any
    // more. Zfs backup snapshots are retained.
    let backup = self.with_ctx(|ctx| ctx.backup.clone());
    if !self.flags.dry_run
      && let Some(backup) = backup
      && backup.kind
        == stackhaul_client::entities::backup::BackupKind::DirectoryTar
      && let Some(artifact) = &backup.artifact
    {
      let timeouts = &core_config().timeouts;
      let engine = BackupEngine {
        executor: &self.state.executor,
        safety: &self.state.safety,
        cancel: &self.entry.cancel,
        backup_timeout: Duration::from_secs(
          timeouts.backup_secs,
        ),
        short_timeout: Duration::from_secs(timeouts.short_secs),
      };
      if let Err(e) = engine
        .cleanup_artifact(
          &self.target,
          artifact,
          "successful migration backup cleanup",
        )
        .await
      {
        self.with_ctx(|ctx| {
          ctx.warn(format!(
            "failed to remove backup archive {artifact} | {e}"
          ))
        });
      }
    }

    self.ok(
      phase,
      start_ts,
      "migration finalized",
      serde_json::Value::Null,
    );
    self
      .with_ctx(|ctx| ctx.finish(MigrationState::Success));
    info!(
      stack = self.stack,
      source = self.source.id,
      target = self.target.id,
      "migration complete"
    );
    Ok(())
  }

  /// Restore the target from the P9 backup. Runs to completion
  /// on a fresh cancellation token: cancelling a rollback is
  /// refused.
  async fn rollback(&mut self) {
    self.entry.rolling_back.store(true, Ordering::SeqCst);
    let rollback_cancel = CancellationToken::new();
    let backup = self.with_ctx(|ctx| ctx.backup.clone());

    let Some(mut backup) = backup else {
      warn!(
        stack = self.stack,
        "no backup captured, automatic rollback impossible"
      );
      self.with_ctx(|ctx| {
        ctx.errors.push(
          "rollback impossible: no backup was captured"
            .to_string(),
        );
        ctx.finish(MigrationState::FailedRollbackFailed);
      });
      return;
    };

    let timeouts = &core_config().timeouts;
    let engine = BackupEngine {
      executor: &self.state.executor,
      safety: &self.state.safety,
      cancel: &rollback_cancel,
      backup_timeout: Duration::from_secs(timeouts.backup_secs),
      short_timeout: Duration::from_secs(timeouts.short_secs),
    };
    match engine.restore(&self.target, &mut backup).await {
      Ok(()) => {
        info!(
          stack = self.stack,
          target = self.target.id,
          "rollback complete, target restored"
        );
        self.with_ctx(|ctx| {
          ctx.backup = Some(backup);
          ctx.finish(MigrationState::FailedRolledBack);
        });
      }
      Err(e) => {
        warn!(
          stack = self.stack,
          target = self.target.id,
          "rollback FAILED, backup artifact preserved | {e}"
        );
        self.with_ctx(|ctx| {
          ctx.errors.push(format!("rollback failed | {e}"));
          // The unrestored artifact stays for manual recovery.
          ctx.backup = Some(backup);
          ctx.finish(MigrationState::FailedRollbackFailed);
        });
      }
    }
  }
}
