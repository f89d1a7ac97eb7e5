//! # Stackhaul Command
//!
//! Builds the exact argv / command strings sent to remote hosts.
//! No user supplied string reaches a remote shell without first
//! passing a validator, and anything that fails a validator
//! produces no command at all.

use serde::Serialize;

mod docker;
mod quote;
mod ssh;
mod validate;

pub use docker::*;
pub use quote::*;
pub use ssh::*;
pub use validate::*;

/// A validator rejected a user supplied value. Carries the
/// field name and the offending value. Never retried.
#[derive(
  Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error,
)]
#[error("invalid {field}: '{value}'")]
pub struct InvalidInput {
  pub field: &'static str,
  pub value: String,
}

impl InvalidInput {
  pub fn new(
    field: &'static str,
    value: impl Into<String>,
  ) -> InvalidInput {
    InvalidInput { field, value: value.into() }
  }
}

pub type Result<T> = std::result::Result<T, InvalidInput>;

/// Hard cap on the total length of any command handed to ssh.
pub const MAX_COMMAND_LENGTH: usize = 4096;

/// Enforce [MAX_COMMAND_LENGTH] over a finished command string.
pub fn enforce_command_length(command: &str) -> Result<&str> {
  if command.len() > MAX_COMMAND_LENGTH {
    return Err(InvalidInput::new(
      "command_length",
      format!("{} bytes", command.len()),
    ));
  }
  Ok(command)
}
