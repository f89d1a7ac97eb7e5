use std::{collections::BTreeSet, time::Duration};

use remote::{ExecuteError, RemoteExecutor};
use stackhaul_client::entities::{
  host::Host, migration::PortAdjustment,
};
use tokio_util::sync::CancellationToken;

pub struct PortResolver<'a> {
  pub executor: &'a RemoteExecutor,
  pub cancel: &'a CancellationToken,
  pub timeout: Duration,
}

impl PortResolver<'_> {
  /// Ports with a listener on the target, from `ss` with a
  /// `netstat` fallback for older hosts.
  pub async fn listening_ports(
    &self,
    host: &Host,
  ) -> Result<BTreeSet<u16>, ExecuteError> {
    let output = self
      .executor
      .run(
        host,
        "ss -tulnH 2>/dev/null || netstat -tuln 2>/dev/null",
        self.timeout,
        self.cancel,
      )
      .await?;
    Ok(parse_listening_ports(&output.stdout))
  }
}

/// Both `ss -tulnH` and `netstat -tuln` print the local address
/// as `addr:port` tokens; harvest every parseable trailing port.
pub fn parse_listening_ports(output: &str) -> BTreeSet<u16> {
  let mut ports = BTreeSet::new();
  for line in output.lines() {
    // Skip netstat headers.
    if line.starts_with("Active ") || line.starts_with("Proto")
    {
      continue;
    }
    for token in line.split_whitespace() {
      let Some((_, port)) = token.rsplit_once(':') else {
        continue;
      };
      if let Ok(port) = port.parse::<u16>() {
        ports.insert(port);
      }
    }
  }
  ports
}

/// Remap each conflicting host port to the next free port
/// starting at `conflict + 1`, preserving protocol and
/// container port. Ports the compose file itself wants, and
/// ports already assigned by earlier remaps, count as taken.
pub fn resolve_conflicts(
  desired: &[crate::compose::HostPort],
  occupied: &BTreeSet<u16>,
) -> Vec<PortAdjustment> {
  let mut taken: BTreeSet<u16> = occupied.clone();
  taken.extend(desired.iter().map(|p| p.host_port));

  let mut adjustments = Vec::new();
  for port in desired {
    if !occupied.contains(&port.host_port) {
      continue;
    }
    let mut candidate = port.host_port.saturating_add(1);
    while candidate < u16::MAX && taken.contains(&candidate) {
      candidate += 1;
    }
    taken.insert(candidate);
    adjustments.push(PortAdjustment {
      service: port.service.clone(),
      container_port: port.container_port,
      protocol: port.protocol.clone(),
      from: port.host_port,
      to: candidate,
    });
  }
  adjustments
}

#[cfg(test)]
mod tests {
  use crate::compose::HostPort;

  use super::*;

  const SS_OUTPUT: &str = "\
tcp   LISTEN 0      4096         0.0.0.0:8080       0.0.0.0:*
tcp   LISTEN 0      511          0.0.0.0:80         0.0.0.0:*
tcp   LISTEN 0      4096            [::]:22            [::]:*
udp   UNCONN 0      0            0.0.0.0:5353       0.0.0.0:*
";

  const NETSTAT_OUTPUT: &str = "\
Active Internet connections (only servers)
Proto Recv-Q Send-Q Local Address           Foreign Address         State
tcp        0      0 0.0.0.0:8080            0.0.0.0:*               LISTEN
tcp6       0      0 :::22                   :::*                    LISTEN
";

  fn host_port(service: &str, port: u16) -> HostPort {
    HostPort {
      service: service.to_string(),
      host_ip: None,
      host_port: port,
      container_port: 80,
      protocol: "tcp".to_string(),
    }
  }

  #[test]
  fn parses_ss_output() {
    let ports = parse_listening_ports(SS_OUTPUT);
    assert!(ports.contains(&8080));
    assert!(ports.contains(&80));
    assert!(ports.contains(&22));
    assert!(ports.contains(&5353));
  }

  #[test]
  fn parses_netstat_output() {
    let ports = parse_listening_ports(NETSTAT_OUTPUT);
    assert!(ports.contains(&8080));
    assert!(ports.contains(&22));
  }

  #[test]
  fn free_ports_need_no_adjustment() {
    let occupied = BTreeSet::from([80, 443]);
    let adjustments = resolve_conflicts(
      &[host_port("blog", 8080)],
      &occupied,
    );
    assert!(adjustments.is_empty());
  }

  #[test]
  fn conflict_remaps_to_next_free() {
    let occupied = BTreeSet::from([8080]);
    let adjustments = resolve_conflicts(
      &[host_port("blog", 8080)],
      &occupied,
    );
    assert_eq!(adjustments.len(), 1);
    assert_eq!(adjustments[0].from, 8080);
    assert_eq!(adjustments[0].to, 8081);
    assert_eq!(adjustments[0].container_port, 80);
    assert_eq!(adjustments[0].protocol, "tcp");
  }

  #[test]
  fn cascading_conflicts_skip_taken_ports() {
    let occupied = BTreeSet::from([8080, 8081, 8082]);
    let adjustments = resolve_conflicts(
      &[host_port("blog", 8080)],
      &occupied,
    );
    assert_eq!(adjustments[0].to, 8083);
  }

  #[test]
  fn remaps_never_collide_with_other_desired_ports() {
    let occupied = BTreeSet::from([8080]);
    let adjustments = resolve_conflicts(
      &[host_port("blog", 8080), host_port("api", 8081)],
      &occupied,
    );
    // 8081 is wanted by the api service, the blog remap must
    // jump over it.
    assert_eq!(adjustments.len(), 1);
    assert_eq!(adjustments[0].to, 8082);
  }
}
