//! Top-level error type and exit-code mapping.
//!
//! Errors are classified by recoverability:
//! - Transient mail errors are recovered per-message inside discovery.
//! - Permanent mail errors abort the pack and the run moves on.
//! - Config and store errors abort the command with a distinct exit code.

use thiserror::Error;

use crate::config::ConfigError;
use crate::mail::MailError;
use crate::store::StoreError;

/// Process exit codes for the CLI surface.
pub mod exit_code {
    pub const OK: i32 = 0;
    pub const CONFIG: i32 = 1;
    pub const MAIL: i32 = 2;
    pub const STORE: i32 = 3;
    pub const USAGE: i32 = 64;
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Mail(#[from] MailError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Invalid usage: {0}")]
    Usage(String),
}

impl AgentError {
    /// Map this error to the documented process exit code.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => exit_code::CONFIG,
            Self::Mail(_) => exit_code::MAIL,
            Self::Store(_) => exit_code::STORE,
            Self::Usage(_) => exit_code::USAGE,
        }
    }
}
