//! Port forwarding over an SSH session
//!
//! Local and remote forwarding are the same accept loop with the roles swapped:
//!
//! - local: a [`TcpAcceptor`] on this machine, dialing through the session with a
//!   [`SessionDialer`]
//! - remote: a [`RemoteListener`] on the SSH server, dialing a local port with a
//!   [`TcpDialer`]
//!
//! Each accepted connection gets its own task, which dials the target and then
//! [`pump`]s bytes between the two streams. A failed dial only loses that one
//! connection.

use std::fmt;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::config::{ForwardOptions, ShutdownMode, SshTarget};
use crate::endpoint::Endpoint;
use crate::error::ForwardError;
use crate::ssh::{RemoteListener, Session};

pub mod lifecycle;
pub mod local;
pub mod pump;
pub mod remote;

use lifecycle::ConnectionGuard;

pub use lifecycle::{ForwarderExit, ForwarderHandle};
pub use local::{SessionDialer, TcpAcceptor};
pub use pump::{pump, PumpStats};
pub use remote::TcpDialer;
pub use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    /// Listen here, dial from the remote host
    Local,
    /// Listen on the remote host, dial from here
    Remote,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

/// What to forward: where to listen and where each connection goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardSpec {
    pub direction: Direction,
    pub bind: Endpoint,
    pub target: Endpoint,
}

impl ForwardSpec {
    pub fn local(bind: Endpoint, target: Endpoint) -> Self {
        Self {
            direction: Direction::Local,
            bind,
            target,
        }
    }

    pub fn remote(bind: Endpoint, target: Endpoint) -> Self {
        Self {
            direction: Direction::Remote,
            bind,
            target,
        }
    }
}

/// The listening side of a forwarder
#[async_trait]
pub trait Acceptor: Send + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Wait for the next connection, returning it with a description of the
    /// peer. Must be cancel-safe: the accept loop drops this future on stop.
    async fn accept(&mut self) -> Result<(Self::Stream, String), ForwardError>;

    fn local_addr(&self) -> Endpoint;

    /// Stop listening. Called once, when the accept loop ends.
    async fn close(&mut self);
}

/// Opens the far end of each forwarded connection
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    async fn dial(&self) -> Result<Self::Stream, ForwardError>;

    fn target(&self) -> &Endpoint;

    /// Resolves once no dial can succeed again, e.g. the transport under the
    /// dialer is gone. Never resolves by default.
    async fn closed(&self) {
        std::future::pending::<()>().await
    }
}

pub struct Forwarder<A, D> {
    spec: ForwardSpec,
    acceptor: A,
    dialer: Arc<D>,
    options: ForwardOptions,
    // Held by every connection task so draining connections outlive the handle
    session: Option<Arc<Session>>,
}

impl Forwarder<TcpAcceptor, SessionDialer> {
    /// Bind `bind` locally and forward each connection to `target` as seen from
    /// the remote host.
    pub async fn local(
        session: Arc<Session>,
        bind: &Endpoint,
        target: &Endpoint,
        options: ForwardOptions,
    ) -> Result<Self, ForwardError> {
        let acceptor = TcpAcceptor::bind(bind).await?;
        let dialer = SessionDialer::new(session.clone(), target.clone());
        let spec = ForwardSpec::local(bind.clone(), target.clone());

        Ok(Self::new(spec, acceptor, dialer, options).with_session(session))
    }
}

impl Forwarder<RemoteListener, TcpDialer> {
    /// Listen on `bind` on the remote host and forward each connection to
    /// `target` on this machine.
    pub async fn remote(
        session: Arc<Session>,
        bind: &Endpoint,
        target: &Endpoint,
        options: ForwardOptions,
    ) -> Result<Self, ForwardError> {
        let listener = session.listen(bind).await?;
        let dialer = TcpDialer::new(target.clone());
        let spec = ForwardSpec::remote(bind.clone(), target.clone());

        Ok(Self::new(spec, listener, dialer, options).with_session(session))
    }
}

impl<A: Acceptor, D: Dialer> Forwarder<A, D> {
    pub fn new(spec: ForwardSpec, acceptor: A, dialer: D, options: ForwardOptions) -> Self {
        Self {
            spec,
            acceptor,
            dialer: Arc::new(dialer),
            options,
            session: None,
        }
    }

    fn with_session(mut self, session: Arc<Session>) -> Self {
        self.session = Some(session);
        self
    }

    pub fn bound_addr(&self) -> Endpoint {
        self.acceptor.local_addr()
    }

    /// Start the accept loop in the background.
    ///
    /// It runs until `cancel` fires, [`ForwarderHandle::stop`] is called, the
    /// listener fails, or the dialer reports its transport closed.
    pub fn spawn(self, cancel: CancellationToken) -> ForwarderHandle {
        // Stopping through the handle must not cancel the caller's token
        let stop = cancel.child_token();
        let (exit_tx, exit_rx) = watch::channel(None);
        let active = Arc::new(AtomicUsize::new(0));
        let bound = self.acceptor.local_addr();

        let handle = ForwarderHandle::new(
            self.spec.clone(),
            bound.clone(),
            stop.clone(),
            exit_rx,
            active.clone(),
        );

        let span = tracing::info_span!(
            "forward",
            direction = %self.spec.direction,
            bind = %bound,
            target = %self.dialer.target(),
        );

        tokio::spawn(
            async move {
                let exit = self.run(stop, active).await;
                let _ = exit_tx.send(Some(exit));
            }
            .instrument(span),
        );

        handle
    }

    async fn run(mut self, stop: CancellationToken, active: Arc<AtomicUsize>) -> ForwarderExit {
        let mut connections = JoinSet::new();

        tracing::info!(
            "Forwarding {} -> {}",
            self.acceptor.local_addr(),
            self.dialer.target()
        );

        let exit = loop {
            tokio::select! {
                biased;

                _ = stop.cancelled() => break ForwarderExit::Cancelled,

                Some(_) = connections.join_next(), if !connections.is_empty() => {}

                _ = self.dialer.closed() => {
                    tracing::error!("Transport to {} closed", self.dialer.target());
                    break ForwarderExit::Failed("ssh transport closed".to_string());
                }

                accepted = self.acceptor.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_connection(&mut connections, stream, peer, &active),
                    Err(_) if stop.is_cancelled() => break ForwarderExit::Cancelled,
                    Err(e) => {
                        tracing::error!("Accept loop failed: {e}");
                        break ForwarderExit::Failed(e.to_string());
                    }
                },
            }
        };

        self.acceptor.close().await;

        match self.options.shutdown {
            ShutdownMode::Drain => {
                if !connections.is_empty() {
                    tracing::info!(
                        "Stopped accepting, {} connection(s) left to drain",
                        connections.len()
                    );
                }
                connections.detach_all();
            }
            ShutdownMode::Abort => {
                if !connections.is_empty() {
                    tracing::info!("Aborting {} connection(s)", connections.len());
                }
                connections.shutdown().await;
            }
        }

        tracing::info!("Forwarder stopped: {exit:?}");
        exit
    }

    fn spawn_connection(
        &self,
        connections: &mut JoinSet<()>,
        mut inbound: A::Stream,
        peer: String,
        active: &Arc<AtomicUsize>,
    ) {
        let guard = ConnectionGuard::new(active);
        let dialer = self.dialer.clone();
        let session = self.session.clone();
        let buffer_size = self.options.copy_buffer_size;
        let span = tracing::debug_span!("connection", peer = %peer);

        connections.spawn(
            async move {
                let _guard = guard;
                let _session = session;
                tracing::debug!("Accepted connection");

                match dialer.dial().await {
                    Ok(outbound) => {
                        let stats = pump(inbound, outbound, buffer_size).await;
                        tracing::debug!(
                            "Connection closed, {} bytes sent, {} bytes received",
                            stats.a_to_b,
                            stats.b_to_a
                        );
                    }
                    Err(e) => {
                        tracing::warn!("Dropping connection: {e}");
                        let _ = inbound.shutdown().await;
                    }
                }
            }
            .instrument(span),
        );
    }
}

/// Connect to `target` and start forwarding as described by `spec`.
///
/// Setup errors (connect, authentication, bind, remote listen) are returned here
/// and no background work is left behind.
pub async fn start_forward(
    target: &SshTarget,
    spec: &ForwardSpec,
    options: ForwardOptions,
    cancel: CancellationToken,
) -> Result<ForwarderHandle, ForwardError> {
    let session = Arc::new(Session::connect(target).await?);

    let handle = match spec.direction {
        Direction::Local => Forwarder::local(session, &spec.bind, &spec.target, options)
            .await?
            .spawn(cancel),
        Direction::Remote => Forwarder::remote(session, &spec.bind, &spec.target, options)
            .await?
            .spawn(cancel),
    };

    Ok(handle)
}

/// Forward connections on local `bind` to `to` on the remote side.
pub async fn start_local_forward(
    target: &SshTarget,
    bind: &Endpoint,
    to: &Endpoint,
    cancel: CancellationToken,
) -> Result<ForwarderHandle, ForwardError> {
    let spec = ForwardSpec::local(bind.clone(), to.clone());
    start_forward(target, &spec, ForwardOptions::default(), cancel).await
}

/// Forward connections on remote `bind` to `to` on this machine.
pub async fn start_remote_forward(
    target: &SshTarget,
    bind: &Endpoint,
    to: &Endpoint,
    cancel: CancellationToken,
) -> Result<ForwarderHandle, ForwardError> {
    let spec = ForwardSpec::remote(bind.clone(), to.clone());
    start_forward(target, &spec, ForwardOptions::default(), cancel).await
}

/// `127.0.0.1:local_port` here to `127.0.0.1:remote_port` on the remote host
pub async fn forward_local_port(
    target: &SshTarget,
    local_port: u16,
    remote_port: u16,
    cancel: CancellationToken,
) -> Result<ForwarderHandle, ForwardError> {
    start_local_forward(
        target,
        &Endpoint::localhost(local_port),
        &Endpoint::localhost(remote_port),
        cancel,
    )
    .await
}

/// `127.0.0.1:remote_port` on the remote host to `127.0.0.1:local_port` here
pub async fn forward_remote_port(
    target: &SshTarget,
    remote_port: u16,
    local_port: u16,
    cancel: CancellationToken,
) -> Result<ForwarderHandle, ForwardError> {
    start_remote_forward(
        target,
        &Endpoint::localhost(remote_port),
        &Endpoint::localhost(local_port),
        cancel,
    )
    .await
}
