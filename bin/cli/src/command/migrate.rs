use colored::Colorize;
use stackhaul_client::{
  api::execute::*,
  api::read::*,
  entities::{
    ErrorKind,
    migration::{
      MigrateFlags, MigrationResult, MigrationState,
    },
  },
};

use crate::command::{format_ts, stackhaul_client, table};

pub async fn migrate(
  source: &str,
  target: &str,
  stack: &str,
  flags: MigrateFlags,
) -> anyhow::Result<i32> {
  println!(
    "Migrating {} from {} to {}{}",
    stack.bold(),
    source.bold(),
    target.bold(),
    if flags.dry_run {
      " (dry run)".dimmed().to_string()
    } else {
      String::new()
    }
  );

  let result = stackhaul_client()
    .await?
    .migrate_stack(MigrateStack {
      source: source.to_string(),
      target: target.to_string(),
      stack: stack.to_string(),
      flags,
    })
    .await?;

  print_result(&result);
  Ok(exit_code(&result))
}

pub async fn show(id: &str) -> anyhow::Result<i32> {
  let context = stackhaul_client()
    .await?
    .get_migration(GetMigration { id: id.to_string() })
    .await?;
  println!(
    "Migration {} | {} -> {} | {}",
    context.id.bold(),
    context.source,
    context.target,
    state_label(context.state),
  );
  let mut table =
    table(&["Phase", "Status", "Message", "At"]);
  for result in &context.phases {
    table.add_row([
      result
        .phase
        .map(|p| p.to_string())
        .unwrap_or_default(),
      result.status.to_string(),
      result
        .error
        .clone()
        .unwrap_or_else(|| result.message.clone()),
      format_ts(result.end_ts),
    ]);
  }
  println!("{table}");
  for warning in &context.warnings {
    println!("{}: {warning}", "WARN".yellow());
  }
  Ok(0)
}

pub async fn cancel(id: &str) -> anyhow::Result<i32> {
  let res = stackhaul_client()
    .await?
    .cancel_migration(CancelMigration {
      id: id.to_string(),
    })
    .await?;
  if res.cancelled {
    println!("Cancellation requested for {id}");
  } else {
    println!(
      "Migration {id} is terminal or rolling back, not cancellable"
    );
  }
  Ok(0)
}

fn print_result(result: &MigrationResult) {
  let mut table = table(&["Phase", "Status"]);
  for (phase, status) in &result.phases {
    table.add_row([phase.to_string(), status.to_string()]);
  }
  println!("{table}");

  if let Some(stats) = &result.stats {
    println!(
      "Transfer: {} | {} files | {} bytes",
      stats.transfer_type,
      stats.stats.files_transferred,
      stats.stats.total_bytes,
    );
  }
  if let Some(risk) = &result.risk {
    println!("Risk: {} ({})", risk.score, risk.level);
  }
  for warning in &result.warnings {
    println!("{}: {warning}", "WARN".yellow());
  }
  for error in &result.errors {
    eprintln!("{}: {error}", "ERROR".red());
  }
  if let Some(backup_ref) = &result.backup_ref {
    println!("Backup: {backup_ref}");
  }

  println!(
    "{} | migration {}",
    state_label(result.state),
    result.migration_id,
  );
  if let Some(phase) = &result.failed_phase {
    eprintln!(
      "{}: failed in {phase} | {}",
      "ERROR".red(),
      result.message
    );
  }
}

fn state_label(state: MigrationState) -> String {
  match state {
    MigrationState::Success => "SUCCESS".green().to_string(),
    MigrationState::InProgress => {
      "IN PROGRESS".yellow().to_string()
    }
    MigrationState::FailedRolledBack => {
      "FAILED (rolled back)".red().to_string()
    }
    MigrationState::FailedRollbackFailed => {
      "FAILED (rollback failed)".red().bold().to_string()
    }
  }
}

/// 0 success, 1 recoverable failure (rollback succeeded),
/// 2 unrecoverable, 3 validation error, 4 cancelled.
fn exit_code(result: &MigrationResult) -> i32 {
  if result.cancelled
    && result.state != MigrationState::FailedRollbackFailed
  {
    return 4;
  }
  if matches!(
    result.error_kind,
    Some(ErrorKind::InvalidInput) | Some(ErrorKind::HostNotFound)
  ) {
    return 3;
  }
  match result.state {
    MigrationState::Success => 0,
    MigrationState::FailedRolledBack => 1,
    MigrationState::FailedRollbackFailed => 2,
    MigrationState::InProgress => 1,
  }
}
