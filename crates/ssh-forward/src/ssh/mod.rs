//! SSH transport
//!
//! A [`Session`] is one authenticated connection to a remote host. Over it we
//! can:
//! - dial a TCP endpoint from the remote side (`direct-tcpip` channels)
//! - listen on the remote side ([`RemoteListener`], `tcpip-forward`)
//! - run commands and upload files (session channels)

mod listener;
mod session;

#[cfg(test)]
pub(crate) mod test_server;

pub use listener::{RemoteListener, TunnelStream};
pub use session::{CommandResult, Session};
