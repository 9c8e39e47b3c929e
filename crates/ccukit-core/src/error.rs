// ── Core error types ──
//
// User-facing errors from ccukit-core. Consumers never see raw codec or
// HTTP failures; the `From<ccukit_rpc::Error>` impl translates wire-layer
// errors into domain-appropriate variants at the crate boundary.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CcuError {
    // ── Lookup errors ────────────────────────────────────────────────
    #[error("Unknown interface: {0}")]
    UnknownInterface(String),

    #[error("Unknown system variable: {0}")]
    UnknownVariable(String),

    #[error("Unknown program: {0}")]
    UnknownProgram(String),

    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    // ── Subscription errors ──────────────────────────────────────────
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    // ── Write-path errors ────────────────────────────────────────────
    #[error("Write superseded by a newer value for the same datapoint")]
    Superseded,

    #[error("Queued write timed out after {0:?}")]
    QueueTimeout(Duration),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    // ── Controller errors ────────────────────────────────────────────
    #[error("Controller fault {code}: {message}")]
    Fault { code: i64, message: String },

    #[error("Interface unreachable: {0}")]
    Transport(String),

    // ── Scripting collaborator ───────────────────────────────────────
    #[error("Script execution failed: {0}")]
    ScriptFailed(String),

    // ── Persistence ──────────────────────────────────────────────────
    #[error("Persistence error at {path}: {message}")]
    Persist { path: PathBuf, message: String },

    // ── Configuration ────────────────────────────────────────────────
    #[error("Configuration error: {0}")]
    Config(String),

    // ── Lifecycle ────────────────────────────────────────────────────
    #[error("Session is shutting down")]
    Shutdown,
}

// ── Conversion from wire-layer errors ─────────────────────────────────

impl From<ccukit_rpc::Error> for CcuError {
    fn from(err: ccukit_rpc::Error) -> Self {
        match err {
            ccukit_rpc::Error::Fault { code, message } => CcuError::Fault { code, message },
            ccukit_rpc::Error::Timeout(d) => CcuError::Timeout(d),
            ccukit_rpc::Error::InvalidUrl(msg) => CcuError::Config(format!("invalid url: {msg}")),
            ccukit_rpc::Error::Shutdown => CcuError::Shutdown,
            other => CcuError::Transport(other.to_string()),
        }
    }
}

impl CcuError {
    /// True when the underlying interface client should be torn down and
    /// rebuilt before the next call.
    pub fn is_transport(&self) -> bool {
        matches!(self, CcuError::Transport(_) | CcuError::Timeout(_))
    }
}
