//! SSH-tunneled TCP port forwarding
//!
//! This crate opens an authenticated SSH session to a remote host and forwards
//! any number of independent TCP connections through it, in either direction:
//!
//! - local forwarding: listen on this machine, connect out from the remote host
//! - remote forwarding: listen on the remote host, connect out from this machine
//!
//! Every forwarder runs in the background until it is stopped through its
//! [`ForwarderHandle`] or the [`CancellationToken`] it was started with, and a
//! failure on one connection never affects the others.
//!
//! # Example
//!
//! ```ignore
//! let target = SshTarget::from_env("HAPROXY_SSH")?;
//! let cancel = CancellationToken::new();
//!
//! // 127.0.0.1:<any> here -> 127.0.0.1:9000 on the remote host
//! let handle = start_local_forward(
//!     &target,
//!     &Endpoint::localhost(0),
//!     &Endpoint::localhost(9000),
//!     cancel.clone(),
//! )
//! .await?;
//! println!("forwarding on {}", handle.bound_addr());
//!
//! cancel.cancel();
//! handle.wait().await;
//! ```

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize the tracing subscriber for standalone logging to the terminal.
///
/// Output goes to stderr with the level taken from `RUST_LOG` (default `info`).
/// Applications that already install a subscriber or a `log` logger should not
/// call this; `tracing` is built with its `log` feature, so events from this
/// crate reach a `log` logger when no subscriber is set.
///
/// ```ignore
/// // RUST_LOG=ssh_forward=debug shows every accepted connection
/// ssh_forward::init_tracing();
/// ```
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

pub mod config;
pub mod endpoint;
pub mod error;
pub mod forward;
pub mod readiness;
pub mod shell;
pub mod ssh;

pub use config::{ForwardOptions, HostKeyPolicy, KeySource, ShutdownMode, SshTarget};
pub use endpoint::Endpoint;
pub use error::ForwardError;
pub use forward::{
    forward_local_port, forward_remote_port, start_forward, start_local_forward,
    start_remote_forward, CancellationToken, Direction, ForwardSpec, Forwarder, ForwarderExit,
    ForwarderHandle,
};
pub use readiness::{check_listening, wait_until_listening};
pub use ssh::{CommandResult, RemoteListener, Session};
