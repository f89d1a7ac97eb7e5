use stackhaul_client::entities::{
  inventory::Inventory,
  migration::{RiskAssessment, RiskLevel},
  stack::ComposeFile,
};

const GIB: u64 = 1024 * 1024 * 1024;

/// Pure advisory risk assessment over what the earlier phases
/// learned: data size, downtime estimate, detected database
/// files, and compose complexity. Score is additive, capped at
/// 100, and never gates the pipeline.
pub fn assess(
  inventory: &Inventory,
  compose: &ComposeFile,
  estimated_downtime_secs: f64,
) -> RiskAssessment {
  let mut factors = Vec::new();
  let mut recommendations = Vec::new();
  let mut score = 0u32;

  let data_size_bytes = inventory.total_size;
  if data_size_bytes > 50 * GIB {
    factors.push(format!(
      "large dataset ({data_size_bytes} bytes), increased transfer time and failure risk"
    ));
    recommendations.push(
      "consider migrating during a maintenance window"
        .to_string(),
    );
    score += 30;
  } else if data_size_bytes > 10 * GIB {
    factors.push(format!(
      "moderate dataset ({data_size_bytes} bytes), plan for extended transfer time"
    ));
    score += 15;
  }

  if estimated_downtime_secs > 3600.0 {
    factors.push(format!(
      "extended downtime expected ({estimated_downtime_secs:.0}s)"
    ));
    recommendations.push(
      "schedule migration during a low-usage period"
        .to_string(),
    );
    score += 25;
  } else if estimated_downtime_secs > 600.0 {
    factors.push(format!(
      "moderate downtime expected ({estimated_downtime_secs:.0}s)"
    ));
    score += 10;
  }

  let database_files = inventory
    .critical_files
    .keys()
    .filter(|f| {
      let f = f.to_lowercase();
      f.ends_with(".db")
        || f.contains(".sqlite")
        || f.contains(".sql")
        || f.contains("database")
    })
    .count();
  if database_files > 0 {
    factors.push(format!(
      "{database_files} database files detected, corruption risk if not properly stopped"
    ));
    recommendations.push(
      "ensure all database connections are closed before migration"
        .to_string(),
    );
    score += 20;
  }
  if inventory.critical_files.len() > 20 {
    factors.push(format!(
      "many critical files ({}), increased verification surface",
      inventory.critical_files.len()
    ));
    score += 10;
  }

  let persistent_services = compose
    .services
    .values()
    .filter(|s| {
      matches!(
        s.restart.as_deref(),
        Some("always") | Some("unless-stopped")
      )
    })
    .count();
  if persistent_services > 0 {
    factors.push(format!(
      "{persistent_services} persistent services (restart policy) will not follow the stack automatically"
    ));
    score += 10;
  }
  if compose.services.len() > 5 {
    factors.push(format!(
      "complex stack ({} services)",
      compose.services.len()
    ));
    score += 5;
  }

  let score = score.min(100) as u8;
  let level = match score {
    70.. => RiskLevel::Critical,
    40..=69 => RiskLevel::High,
    20..=39 => RiskLevel::Medium,
    _ => RiskLevel::Low,
  };

  if recommendations.is_empty() {
    recommendations
      .push("standard migration procedure applies".to_string());
  }

  RiskAssessment {
    score,
    level,
    factors,
    recommendations,
    data_size_bytes,
    estimated_downtime_secs,
    database_files,
  }
}

#[cfg(test)]
mod tests {
  use stackhaul_client::entities::inventory::{
    ChecksumAlgorithm, PathInventory,
  };

  use crate::compose::parse_compose;

  use super::*;

  fn inventory(size: u64, critical: &[&str]) -> Inventory {
    let mut path = PathInventory {
      path: "/opt/appdata/blog".into(),
      file_count: 10,
      dir_count: 2,
      total_size: size,
      ..Default::default()
    };
    for name in critical {
      path
        .critical_files
        .insert(name.to_string(), "abc".to_string());
    }
    Inventory::aggregate(vec![path], ChecksumAlgorithm::Sha256)
  }

  const SIMPLE: &str = "\
services:
  blog:
    image: ghost:5
";

  #[test]
  fn small_stack_scores_low() {
    let risk = assess(
      &inventory(100 * 1024 * 1024, &[]),
      &parse_compose(SIMPLE).unwrap(),
      60.0,
    );
    assert_eq!(risk.score, 0);
    assert_eq!(risk.level, RiskLevel::Low);
    assert!(risk.factors.is_empty());
  }

  #[test]
  fn databases_and_size_raise_the_score() {
    let risk = assess(
      &inventory(60 * GIB, &["app.db", "config.yml"]),
      &parse_compose(SIMPLE).unwrap(),
      1200.0,
    );
    // large dataset 30 + moderate downtime 10 + db files 20.
    assert_eq!(risk.score, 60);
    assert_eq!(risk.level, RiskLevel::High);
    assert_eq!(risk.database_files, 1);
  }

  #[test]
  fn score_caps_at_100() {
    let critical: Vec<String> = (0..25)
      .map(|i| format!("db_{i}.sqlite3"))
      .collect();
    let critical: Vec<&str> =
      critical.iter().map(String::as_str).collect();
    let compose = "\
services:
  a:
    image: x
    restart: always
  b:
    image: x
    restart: always
  c:
    image: x
  d:
    image: x
  e:
    image: x
  f:
    image: x
";
    let risk = assess(
      &inventory(100 * GIB, &critical),
      &parse_compose(compose).unwrap(),
      7200.0,
    );
    assert!(risk.score <= 100);
    assert_eq!(risk.level, RiskLevel::Critical);
  }
}
