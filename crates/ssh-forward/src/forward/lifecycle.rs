use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::endpoint::Endpoint;

use super::ForwardSpec;

/// Why a forwarder stopped accepting
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwarderExit {
    /// Stopped through the handle or the caller's token
    Cancelled,
    /// The listener failed (or the transport under it closed)
    Failed(String),
}

/// Handle to a running forwarder.
///
/// Dropping the handle does not stop the forwarder; use [`ForwarderHandle::stop`]
/// or cancel the token it was started with.
pub struct ForwarderHandle {
    spec: ForwardSpec,
    bound_addr: Endpoint,
    stop: CancellationToken,
    exit: watch::Receiver<Option<ForwarderExit>>,
    active: Arc<AtomicUsize>,
}

impl ForwarderHandle {
    pub(crate) fn new(
        spec: ForwardSpec,
        bound_addr: Endpoint,
        stop: CancellationToken,
        exit: watch::Receiver<Option<ForwarderExit>>,
        active: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            spec,
            bound_addr,
            stop,
            exit,
            active,
        }
    }

    pub fn spec(&self) -> &ForwardSpec {
        &self.spec
    }

    /// The address actually listened on. Differs from the requested bind
    /// address when port 0 was asked for.
    pub fn bound_addr(&self) -> &Endpoint {
        &self.bound_addr
    }

    /// Stop accepting new connections. Idempotent.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.exit.borrow().is_none()
    }

    /// `None` while the forwarder is still accepting
    pub fn exit(&self) -> Option<ForwarderExit> {
        self.exit.borrow().clone()
    }

    /// Wait for the accept loop to end and its listener to be closed
    pub async fn wait(&self) -> ForwarderExit {
        let mut exit = self.exit.clone();
        let reported = match exit.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        // None here means the accept task went away without reporting, i.e. it panicked
        reported.unwrap_or_else(|| {
            ForwarderExit::Failed("forwarder task ended unexpectedly".to_string())
        })
    }

    /// Connections currently being pumped, including draining ones after stop
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

/// Counts one live connection; decrements when dropped
pub(crate) struct ConnectionGuard {
    active: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    pub fn new(active: &Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self {
            active: active.clone(),
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}
