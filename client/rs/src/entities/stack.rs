use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Token expanded against the owning host's `appdata_path`
/// when parsing volume specs out of compose text.
pub const APPDATA_PATH_TOKEN: &str = "${APPDATA_PATH}";

/// Compose file names probed on hosts, in order of preference.
pub const COMPOSE_FILE_NAMES: [&str; 2] =
  ["docker-compose.yml", "docker-compose.yaml"];

/// A compose project as reported by `docker compose ls` and / or
/// discovered under the host's appdata directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StackListItem {
  pub name: String,
  /// Eg. `running(2)`. None if the project is not known to
  /// the compose runtime (found on disk only).
  pub status: Option<String>,
  pub compose_files: Vec<String>,
  /// Whether a compose file was found under `appdata_path`.
  pub on_disk: bool,
}

/// Deserialization target for `docker compose ls --format json`.
///
/// Incoming from docker like:
/// [{"Name":"project","Status":"running(1)","ConfigFiles":"/opt/appdata/project/docker-compose.yml"}]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerComposeLsItem {
  #[serde(default, alias = "Name")]
  pub name: String,
  #[serde(alias = "Status")]
  pub status: Option<String>,
  /// Comma separated list of paths
  #[serde(default, alias = "ConfigFiles")]
  pub config_files: String,
}

/// The subset of the compose model the control plane inspects:
/// services with their mounts, ports, and restart / health config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComposeFile {
  #[serde(default)]
  pub name: Option<String>,
  #[serde(default)]
  pub services: IndexMap<String, ComposeService>,
  /// Top level named volume declarations. Values are passed
  /// through untouched (driver config etc).
  #[serde(default)]
  pub volumes: IndexMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComposeService {
  pub image: Option<String>,
  pub container_name: Option<String>,
  pub restart: Option<String>,
  #[serde(default)]
  pub ports: Vec<ComposePort>,
  #[serde(default)]
  pub volumes: Vec<ComposeVolume>,
  pub healthcheck: Option<serde_json::Value>,
  pub deploy: Option<ComposeServiceDeploy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposeServiceDeploy {
  pub replicas: Option<u16>,
}

/// Short or long syntax port publication.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ComposePort {
  /// `- 8080`
  Number(u32),
  /// `- "8080:80"`, `- "127.0.0.1:8080:80/udp"`
  Spec(String),
  /// Long syntax mapping.
  Long {
    target: u32,
    #[serde(default)]
    published: Option<PublishedPort>,
    #[serde(default)]
    protocol: Option<String>,
    #[serde(default)]
    host_ip: Option<String>,
  },
}

/// `published` may come through as number or string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PublishedPort {
  Number(u32),
  String(String),
}

impl PublishedPort {
  pub fn as_u16(&self) -> Option<u16> {
    match self {
      PublishedPort::Number(n) => u16::try_from(*n).ok(),
      PublishedPort::String(s) => s.parse().ok(),
    }
  }
}

/// Short or long syntax service volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ComposeVolume {
  /// `- /opt/appdata/blog:/data` or `- media:/media:ro`
  Spec(String),
  /// Long syntax mapping.
  Long {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    read_only: Option<bool>,
  },
}

impl ComposeVolume {
  /// Normalize to the short spec string, when possible.
  pub fn as_spec(&self) -> Option<String> {
    match self {
      ComposeVolume::Spec(spec) => Some(spec.clone()),
      ComposeVolume::Long {
        source: Some(source),
        target: Some(target),
        read_only,
        ..
      } => {
        if read_only.unwrap_or_default() {
          Some(format!("{source}:{target}:ro"))
        } else {
          Some(format!("{source}:{target}"))
        }
      }
      ComposeVolume::Long { .. } => None,
    }
  }
}

/// A parsed service volume entry. Bind mounts carry the absolute
/// host source path (after `${APPDATA_PATH}` expansion), named
/// volumes only the volume name. The filesystem location of a
/// named volume is discovered later via `docker volume inspect`.
#[derive(
  Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VolumeSpec {
  Bind {
    source: String,
    destination: String,
    #[serde(default)]
    mode: Option<String>,
  },
  Named {
    name: String,
    destination: String,
    #[serde(default)]
    mode: Option<String>,
  },
}

impl VolumeSpec {
  /// Parse a short-syntax volume spec. `${APPDATA_PATH}` in the
  /// source is expanded against the host's appdata path before
  /// the bind / named decision is made.
  pub fn parse(spec: &str, appdata_path: Option<&str>) -> VolumeSpec {
    let expanded = match appdata_path {
      Some(appdata) if spec.contains(APPDATA_PATH_TOKEN) => {
        spec.replace(APPDATA_PATH_TOKEN, appdata)
      }
      _ => spec.to_string(),
    };

    // At most [source, destination, mode]. Extra colons stay in
    // the mode (eg SELinux labels like `ro,z`).
    let mut parts = expanded.splitn(3, ':');
    let first = parts.next().unwrap_or_default().to_string();
    let Some(destination) = parts.next() else {
      // Anonymous / single-token volume.
      return VolumeSpec::Named {
        name: first,
        destination: String::new(),
        mode: None,
      };
    };
    let destination = destination.to_string();
    let mode = parts.next().map(str::to_string);

    if first.starts_with('/')
      || first.starts_with("./")
      || first.starts_with('~')
    {
      VolumeSpec::Bind { source: first, destination, mode }
    } else {
      VolumeSpec::Named { name: first, destination, mode }
    }
  }

  /// Render back to short syntax. `parse(render(v)) == v`.
  pub fn render(&self) -> String {
    let (first, destination, mode) = match self {
      VolumeSpec::Bind { source, destination, mode } => {
        (source, destination, mode)
      }
      VolumeSpec::Named { name, destination, mode } => {
        (name, destination, mode)
      }
    };
    match (destination.is_empty(), mode) {
      (true, _) => first.clone(),
      (false, None) => format!("{first}:{destination}"),
      (false, Some(mode)) => {
        format!("{first}:{destination}:{mode}")
      }
    }
  }

  pub fn destination(&self) -> &str {
    match self {
      VolumeSpec::Bind { destination, .. }
      | VolumeSpec::Named { destination, .. } => destination,
    }
  }

  /// The absolute host path for bind mounts, None for named.
  pub fn bind_source(&self) -> Option<&str> {
    match self {
      VolumeSpec::Bind { source, .. } => Some(source),
      VolumeSpec::Named { .. } => None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_bind_mount_with_mode() {
    let spec =
      VolumeSpec::parse("/opt/appdata/blog:/data:ro", None);
    assert_eq!(
      spec,
      VolumeSpec::Bind {
        source: "/opt/appdata/blog".into(),
        destination: "/data".into(),
        mode: Some("ro".into()),
      }
    );
  }

  #[test]
  fn parses_named_volume() {
    let spec = VolumeSpec::parse("media:/media", None);
    assert_eq!(
      spec,
      VolumeSpec::Named {
        name: "media".into(),
        destination: "/media".into(),
        mode: None,
      }
    );
  }

  #[test]
  fn expands_appdata_token() {
    let spec = VolumeSpec::parse(
      "${APPDATA_PATH}/blog:/data",
      Some("/mnt/tank/appdata"),
    );
    assert_eq!(
      spec.bind_source(),
      Some("/mnt/tank/appdata/blog")
    );
  }

  #[test]
  fn extra_colons_stay_in_mode() {
    let spec =
      VolumeSpec::parse("/srv/data:/data:ro,z", None);
    assert_eq!(
      spec,
      VolumeSpec::Bind {
        source: "/srv/data".into(),
        destination: "/data".into(),
        mode: Some("ro,z".into()),
      }
    );
  }

  #[test]
  fn render_parse_round_trip() {
    let specs = [
      VolumeSpec::Bind {
        source: "/opt/appdata/blog".into(),
        destination: "/data".into(),
        mode: None,
      },
      VolumeSpec::Bind {
        source: "/opt/appdata/blog-redis".into(),
        destination: "/var/lib/redis".into(),
        mode: Some("rw".into()),
      },
      VolumeSpec::Named {
        name: "media".into(),
        destination: "/media".into(),
        mode: Some("ro".into()),
      },
      VolumeSpec::Named {
        name: "scratch".into(),
        destination: String::new(),
        mode: None,
      },
    ];
    for spec in specs {
      assert_eq!(
        VolumeSpec::parse(&spec.render(), None),
        spec,
        "round trip failed for {spec:?}"
      );
    }
  }
}
