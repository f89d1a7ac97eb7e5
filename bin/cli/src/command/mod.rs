use anyhow::Context;
use comfy_table::{Attribute, Cell, Table};
use stackhaul_client::StackhaulClient;
use tokio::sync::OnceCell;

use crate::config::cli_config;

pub mod migrate;
pub mod stack;

pub async fn stackhaul_client()
-> anyhow::Result<&'static StackhaulClient> {
  static STACKHAUL_CLIENT: OnceCell<StackhaulClient> =
    OnceCell::const_new();
  STACKHAUL_CLIENT
    .get_or_try_init(|| async {
      let config = cli_config();
      StackhaulClient::new(&config.address)
        .with_healthcheck()
        .await
        .with_context(|| {
          format!(
            "could not reach stackhaul core at {}",
            config.address
          )
        })
    })
    .await
}

pub fn table(header: &[&str]) -> Table {
  let mut table = Table::new();
  table
    .load_preset(comfy_table::presets::UTF8_HORIZONTAL_ONLY)
    .set_header(
      header
        .iter()
        .map(|h| Cell::new(h).add_attribute(Attribute::Bold)),
    );
  table
}

pub fn format_ts(ts: i64) -> String {
  chrono::DateTime::from_timestamp_millis(ts)
    .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
    .unwrap_or_else(|| ts.to_string())
}
