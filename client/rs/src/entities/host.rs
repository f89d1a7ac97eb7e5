use std::path::PathBuf;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A machine in the fleet, reachable over SSH and running a
/// Docker daemon. Read only at runtime; the registry is built
/// from the core config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
  /// Logical id, the key used by all operations.
  #[serde(default)]
  pub id: String,
  /// DNS name or IPv4 / IPv6 address.
  pub hostname: String,
  /// SSH user.
  pub user: String,
  /// SSH port. default: 22
  #[serde(default = "default_ssh_port")]
  pub port: u16,
  /// Private key passed to ssh via `-i`.
  #[serde(default)]
  pub identity_file: Option<PathBuf>,
  /// Base directory under which stacks keep persistent data.
  #[serde(default = "default_appdata_path")]
  pub appdata_path: String,
  /// Both ends must be zfs capable (and probe clean) for
  /// zfs send / receive transfer to be selected.
  #[serde(default)]
  pub zfs_capable: bool,
  /// The dataset backing `appdata_path`, eg `pool/appdata`.
  #[serde(default)]
  pub zfs_dataset: Option<String>,
}

fn default_ssh_port() -> u16 {
  22
}

fn default_appdata_path() -> String {
  String::from("/opt/docker-appdata")
}

impl Default for Host {
  fn default() -> Self {
    Host {
      id: String::new(),
      hostname: String::new(),
      user: String::new(),
      port: default_ssh_port(),
      identity_file: None,
      appdata_path: default_appdata_path(),
      zfs_capable: false,
      zfs_dataset: None,
    }
  }
}

impl Host {
  /// `user@hostname`, the ssh destination argument.
  pub fn destination(&self) -> String {
    format!("{}@{}", self.user, self.hostname)
  }

  /// `user@hostname:port`, the session pool key.
  pub fn pool_key(&self) -> String {
    format!("{}@{}:{}", self.user, self.hostname, self.port)
  }

  pub fn zfs_dataset(&self) -> Option<&str> {
    self
      .zfs_dataset
      .as_deref()
      .filter(|dataset| !dataset.is_empty())
  }
}

/// All hosts in the fleet, keyed by logical id.
/// Built once from config at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostRegistry(pub IndexMap<String, Host>);

impl HostRegistry {
  pub fn new(hosts: IndexMap<String, Host>) -> HostRegistry {
    let hosts = hosts
      .into_iter()
      .map(|(id, mut host)| {
        host.id = id.clone();
        (id, host)
      })
      .collect();
    HostRegistry(hosts)
  }

  pub fn get(&self, id: &str) -> Option<&Host> {
    self.0.get(id)
  }

  pub fn iter(&self) -> impl Iterator<Item = &Host> {
    self.0.values()
  }
}
