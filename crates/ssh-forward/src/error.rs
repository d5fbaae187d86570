use std::time::Duration;

use crate::endpoint::Endpoint;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by sessions and forwarders.
///
/// Setup failures (`Authentication`, `Connect`, `ConnectTimeout`, `HostKeyRejected`,
/// `Bind`, `Listen`) are returned synchronously from the start functions. `Dial`
/// errors only ever reach the caller when they dial directly; inside a forwarder
/// they are logged and the single affected connection is dropped.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("authentication failed for {user}@{host}: {reason}")]
    Authentication {
        user: String,
        host: String,
        reason: String,
    },

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: russh::Error,
    },

    #[error("timed out connecting to {addr} after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    #[error("host key for {host} did not match the configured policy")]
    HostKeyRejected { host: String },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: Endpoint,
        #[source]
        source: std::io::Error,
    },

    #[error("remote listen on {addr} failed: {source}")]
    Listen {
        addr: Endpoint,
        #[source]
        source: russh::Error,
    },

    #[error("failed to dial {addr}: {source}")]
    Dial {
        addr: Endpoint,
        #[source]
        source: BoxError,
    },

    #[error("accepting on {addr} failed: {source}")]
    Accept {
        addr: Endpoint,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid endpoint {input:?}: {reason}")]
    InvalidEndpoint { input: String, reason: &'static str },
}

impl ForwardError {
    /// True for the errors that mean the forwarder never started.
    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            Self::Authentication { .. }
                | Self::Connect { .. }
                | Self::ConnectTimeout { .. }
                | Self::HostKeyRejected { .. }
                | Self::Bind { .. }
                | Self::Listen { .. }
        )
    }
}
