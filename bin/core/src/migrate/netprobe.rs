use std::time::{Duration, Instant};

use remote::{ExecuteError, RemoteExecutor};
use stackhaul_client::entities::{
  host::Host, migration::NetworkProbe,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Bytes pushed source -> target for the throughput sample.
const PROBE_BYTES: u64 = 1024 * 1024;

/// Reference rates for the operator-facing estimates.
const RATE_100_MBIT: f64 = 12.5 * 1024.0 * 1024.0;
const RATE_GBIT: f64 = 125.0 * 1024.0 * 1024.0;

/// Protocol overhead folded into the time estimates.
const OVERHEAD_FACTOR: f64 = 1.1;

pub struct NetProbe<'a> {
  pub executor: &'a RemoteExecutor,
  pub cancel: &'a CancellationToken,
  pub timeout: Duration,
}

impl NetProbe<'_> {
  /// SSH round trips to both hosts and a 1 MiB streamed copy
  /// source -> target, translated into transfer estimates.
  /// Probe failures degrade to zeroed figures, this phase is
  /// warn-only.
  pub async fn run(
    &self,
    source: &Host,
    target: &Host,
    data_size_bytes: u64,
  ) -> Result<NetworkProbe, ExecuteError> {
    let source_rtt_ms = self.rtt_ms(source).await?;
    let target_rtt_ms = self.rtt_ms(target).await?;
    let throughput_bytes_per_sec =
      self.throughput(source, target).await?;

    let estimate = |rate: f64| {
      if rate > 0.0 && data_size_bytes > 0 {
        data_size_bytes as f64 / rate * OVERHEAD_FACTOR
      } else {
        0.0
      }
    };

    Ok(NetworkProbe {
      source_rtt_ms,
      target_rtt_ms,
      throughput_bytes_per_sec,
      estimate_measured_secs: estimate(
        throughput_bytes_per_sec,
      ),
      estimate_100mbit_secs: estimate(RATE_100_MBIT),
      estimate_gbit_secs: estimate(RATE_GBIT),
    })
  }

  /// Wall clock of a no-op command over the pooled session.
  async fn rtt_ms(
    &self,
    host: &Host,
  ) -> Result<f64, ExecuteError> {
    let start = Instant::now();
    self
      .executor
      .run(host, "true", self.timeout, self.cancel)
      .await?;
    Ok(start.elapsed().as_secs_f64() * 1000.0)
  }

  /// Push 1 MiB of zeroes from source to target over ssh and
  /// time it.
  async fn throughput(
    &self,
    source: &Host,
    target: &Host,
  ) -> Result<f64, ExecuteError> {
    let destination = command::SshTarget {
      user: &target.user,
      hostname: &target.hostname,
      port: target.port,
      identity_file: None,
      control_path: None,
    }
    .destination()?;
    let mut inner_ssh = String::from(
      "ssh -o StrictHostKeyChecking=yes -o BatchMode=yes",
    );
    if target.port != 22 {
      command::validate_port(target.port)?;
      inner_ssh.push_str(&format!(" -p {}", target.port));
    }
    if let Some(identity) = target
      .identity_file
      .as_deref()
      .and_then(|p| p.to_str())
    {
      command::validate_path(identity)?;
      inner_ssh.push_str(&format!(" -i {identity}"));
    }
    let command = format!(
      "dd if=/dev/zero bs=1024 count=1024 2>/dev/null | {inner_ssh} {destination} {}",
      command::quote("cat >/dev/null"),
    );

    let start = Instant::now();
    let output = self
      .executor
      .run(source, &command, self.timeout, self.cancel)
      .await?;
    let elapsed = start.elapsed().as_secs_f64();
    if !output.success() || elapsed <= 0.0 {
      debug!(
        source = source.id,
        target = target.id,
        "throughput probe failed | {}",
        output.stderr.trim()
      );
      return Ok(0.0);
    }
    Ok(PROBE_BYTES as f64 / elapsed)
  }
}
