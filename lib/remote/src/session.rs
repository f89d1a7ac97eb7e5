use std::{
  path::{Path, PathBuf},
  process::Stdio,
  sync::{
    Mutex,
    atomic::{AtomicBool, AtomicU64, Ordering},
  },
  time::{Duration, Instant},
};

use command::{SshTarget, ssh_base_args};
use stackhaul_client::entities::host::Host;
use tokio::process::{Child, Command};

use crate::{ExecuteError, Result};

/// One multiplexed ssh connection to a host. The master process
/// holds the control socket open; commands run as short lived
/// `ssh -o ControlPath=...` children that reuse it.
pub struct Session {
  pub id: u64,
  pub host: Host,
  control_path: PathBuf,
  master: Mutex<Option<Child>>,
  pub created_at: Instant,
  last_used_at: Mutex<Instant>,
  in_use: AtomicBool,
  use_count: AtomicU64,
}

impl Session {
  /// Establish the master connection and wait for its control
  /// socket to accept checks.
  pub async fn connect(
    id: u64,
    host: &Host,
    control_dir: &Path,
  ) -> Result<Session> {
    tokio::fs::create_dir_all(control_dir).await.map_err(
      |e| {
        ExecuteError::transport(format!(
          "failed to create control dir {control_dir:?} | {e}"
        ))
      },
    )?;
    let control_path = control_dir.join(format!(
      "{}-{}-{}-{id}.sock",
      host.user, host.hostname, host.port
    ));

    let session = Session {
      id,
      host: host.clone(),
      control_path,
      master: Mutex::new(None),
      created_at: Instant::now(),
      last_used_at: Mutex::new(Instant::now()),
      in_use: AtomicBool::new(false),
      use_count: AtomicU64::new(0),
    };

    let mut args = session.base_args()?;
    args.push("-M".to_string());
    args.push("-N".to_string());
    args.push(session.target()?.destination()?);

    let child = Command::new("ssh")
      .args(&args)
      .stdin(Stdio::null())
      .stdout(Stdio::null())
      .stderr(Stdio::piped())
      .kill_on_drop(true)
      .spawn()
      .map_err(|e| {
        ExecuteError::transport(format!(
          "failed to spawn ssh master | {e}"
        ))
      })?;
    *session.master.lock().unwrap_or_else(|p| p.into_inner()) =
      Some(child);

    // The master takes a moment to authenticate and create the
    // socket. ConnectTimeout is 10s, poll a little longer.
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
      if session.check_alive().await {
        return Ok(session);
      }
      if session.master_exited() || Instant::now() > deadline {
        let stderr = session.take_master_stderr().await;
        session.close().await;
        return Err(ExecuteError::transport(format!(
          "ssh master for {} did not come up | {stderr}",
          host.pool_key()
        )));
      }
      tokio::time::sleep(Duration::from_millis(250)).await;
    }
  }

  pub fn target(&self) -> Result<SshTarget<'_>> {
    Ok(SshTarget {
      user: &self.host.user,
      hostname: &self.host.hostname,
      port: self.host.port,
      identity_file: self.host.identity_file.as_deref(),
      control_path: Some(&self.control_path),
    })
  }

  fn base_args(&self) -> Result<Vec<String>> {
    Ok(ssh_base_args(&self.target()?)?)
  }

  /// `ssh -O check`: asks the master to confirm liveness. This
  /// is the keepalive probe as well.
  pub async fn check_alive(&self) -> bool {
    let Ok(mut args) = self.base_args() else {
      return false;
    };
    args.push("-O".to_string());
    args.push("check".to_string());
    let Ok(target) = self.target() else {
      return false;
    };
    let Ok(destination) = target.destination() else {
      return false;
    };
    args.push(destination);
    matches!(
      Command::new("ssh")
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await,
      Ok(status) if status.success()
    )
  }

  /// Cheap local check: has the master process exited.
  pub fn master_exited(&self) -> bool {
    let mut master =
      self.master.lock().unwrap_or_else(|p| p.into_inner());
    match master.as_mut() {
      Some(child) => {
        matches!(child.try_wait(), Ok(Some(_)) | Err(_))
      }
      None => true,
    }
  }

  async fn take_master_stderr(&self) -> String {
    let child = self
      .master
      .lock()
      .unwrap_or_else(|p| p.into_inner())
      .take();
    let Some(mut child) = child else {
      return String::new();
    };
    let _ = child.start_kill();
    match child.wait_with_output().await {
      Ok(output) => {
        String::from_utf8_lossy(&output.stderr).trim().to_string()
      }
      Err(_) => String::new(),
    }
  }

  /// Ask the master to exit and reap the process.
  pub async fn close(&self) {
    if let Ok(mut args) = self.base_args()
      && let Ok(target) = self.target()
      && let Ok(destination) = target.destination()
    {
      args.push("-O".to_string());
      args.push("exit".to_string());
      args.push(destination);
      let _ = Command::new("ssh")
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    }
    let child = self
      .master
      .lock()
      .unwrap_or_else(|p| p.into_inner())
      .take();
    if let Some(mut child) = child {
      let _ = child.start_kill();
      let _ = child.wait().await;
    }
  }

  pub fn try_reserve(&self) -> bool {
    self
      .in_use
      .compare_exchange(
        false,
        true,
        Ordering::AcqRel,
        Ordering::Acquire,
      )
      .is_ok()
  }

  pub fn release(&self) {
    *self
      .last_used_at
      .lock()
      .unwrap_or_else(|p| p.into_inner()) = Instant::now();
    self.in_use.store(false, Ordering::Release);
  }

  pub fn is_in_use(&self) -> bool {
    self.in_use.load(Ordering::Acquire)
  }

  pub fn touch(&self) {
    self.use_count.fetch_add(1, Ordering::Relaxed);
    *self
      .last_used_at
      .lock()
      .unwrap_or_else(|p| p.into_inner()) = Instant::now();
  }

  pub fn idle_for(&self) -> Duration {
    self
      .last_used_at
      .lock()
      .unwrap_or_else(|p| p.into_inner())
      .elapsed()
  }

  pub fn lifetime(&self) -> Duration {
    self.created_at.elapsed()
  }

  pub fn use_count(&self) -> u64 {
    self.use_count.load(Ordering::Relaxed)
  }
}
