use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("failed to read config file at {path:?}")]
  ReadFile {
    path: PathBuf,
    #[source]
    e: std::io::Error,
  },
  #[error("failed to parse toml at {path:?}")]
  ParseToml {
    path: PathBuf,
    #[source]
    e: Box<toml::de::Error>,
  },
  #[error("failed to serialize config to json")]
  SerializeJson {
    #[source]
    e: serde_json::Error,
  },
  #[error("config root must be a table / object")]
  ValueIsNotObject,
  #[error(
    "field '{key}' is an object in one file but not another"
  )]
  ObjectFieldTypeMismatch {
    key: String,
    value: serde_json::Value,
  },
  #[error(
    "field '{key}' is an array in one file but not another"
  )]
  ArrayFieldTypeMismatch {
    key: String,
    value: serde_json::Value,
  },
  #[error("failed to parse merged config into target type")]
  ParseFinalJson {
    #[source]
    e: serde_json::Error,
  },
}
