//! Core library for the NCB Edge provisioning stack.
//!
//! Gets an unconfigured gateway device onto the customer's Wi-Fi and
//! reachable to its upstream server, over two independent side-channels:
//! a Bluetooth RFCOMM provisioning protocol and a self-hosted hotspot
//! with a captive portal. The [`wifi::WifiManager`] is the single writer
//! of wireless state; everything else funnels into it.

pub mod bluetooth;
pub mod crypto;
pub mod identity;
pub mod settings;
pub mod shell;
pub mod supervisor;
pub mod upstream;
pub mod web;
pub mod wifi;

use thiserror::Error;

use crate::shell::CmdOutput;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("host tool failed (exit {code}): {stderr}")]
    HostTool { code: i32, stderr: String },

    #[error("unreachable: {0}")]
    Unreachable(String),

    #[error("crypto failure: {0}")]
    Crypto(String),

    #[error("protocol failure: {0}")]
    Protocol(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Wrap a non-zero exit from a host CLI, keeping the exit code and
    /// whatever the tool printed to stderr (stdout as a fallback, some
    /// tools report errors there).
    pub fn host_tool(out: &CmdOutput) -> Self {
        let stderr = if out.stderr.trim().is_empty() {
            out.stdout.trim().to_string()
        } else {
            out.stderr.trim().to_string()
        };
        Error::HostTool {
            code: out.exit_code,
            stderr,
        }
    }
}

/// A specialized `Result` type for this crate's operations.
pub type Result<T> = std::result::Result<T, Error>;
