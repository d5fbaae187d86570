// Remote listeners: the server accepts TCP connections on our behalf and hands
// each one to us as a `forwarded-tcpip` channel. The russh handler only sees the
// channel, so it routes it through this table to whichever listener asked for
// that address.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use russh::client::Msg;
use russh::Channel;
use tokio::sync::mpsc;

use super::session::Session;
use crate::endpoint::Endpoint;
use crate::error::ForwardError;

pub type TunnelStream = russh::ChannelStream<Msg>;

pub(crate) struct ForwardedChannel {
    pub channel: Channel<Msg>,
    pub originator: String,
}

type RouteKey = (String, u32);

/// Shared between a [`Session`] and its russh handler
pub(crate) struct Routes<T = ForwardedChannel> {
    inner: Arc<Mutex<HashMap<RouteKey, mpsc::UnboundedSender<T>>>>,
}

impl<T> Clone for Routes<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for Routes<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<T> Routes<T> {
    pub fn insert(&self, address: &str, port: u32, tx: mpsc::UnboundedSender<T>) {
        if let Ok(mut routes) = self.inner.lock() {
            routes.insert((address.to_string(), port), tx);
        }
    }

    pub fn remove(&self, address: &str, port: u32) {
        if let Ok(mut routes) = self.inner.lock() {
            routes.remove(&(address.to_string(), port));
        }
    }

    /// Drops every sender, which wakes all pending `accept` calls with an error.
    pub fn clear(&self) {
        if let Ok(mut routes) = self.inner.lock() {
            routes.clear();
        }
    }

    /// Hand an item to its listener. Servers echo back the bind address from the
    /// request, but some normalise it (e.g. `localhost` -> `127.0.0.1`), so fall
    /// back to matching on the port alone. Gives the item back when nobody wants it.
    pub fn dispatch(&self, address: &str, port: u32, item: T) -> Result<(), T> {
        let Ok(routes) = self.inner.lock() else {
            return Err(item);
        };

        let tx = routes.get(&(address.to_string(), port)).or_else(|| {
            routes
                .iter()
                .find(|((_, bound_port), _)| *bound_port == port)
                .map(|(_, tx)| tx)
        });

        match tx {
            Some(tx) => tx.send(item).map_err(|e| e.0),
            None => Err(item),
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().map(|routes| routes.len()).unwrap_or(0)
    }
}

/// A listener bound on the remote host through `tcpip-forward`.
///
/// Each accepted connection is a channel multiplexed over the owning session.
/// Holds the session alive for as long as the listener exists.
pub struct RemoteListener {
    session: Arc<Session>,
    bound: Endpoint,
    incoming: mpsc::UnboundedReceiver<ForwardedChannel>,
    closed: bool,
}

impl RemoteListener {
    pub(crate) fn new(
        session: Arc<Session>,
        bound: Endpoint,
        incoming: mpsc::UnboundedReceiver<ForwardedChannel>,
    ) -> Self {
        Self {
            session,
            bound,
            incoming,
            closed: false,
        }
    }

    /// The remote address actually bound; differs from the request when port 0 was asked for
    pub fn local_addr(&self) -> &Endpoint {
        &self.bound
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Wait for the next remote connection. Returns the stream and the
    /// originator's `host:port`. Cancel-safe.
    pub async fn accept(&mut self) -> Result<(TunnelStream, String), ForwardError> {
        match self.incoming.recv().await {
            Some(forwarded) => Ok((forwarded.channel.into_stream(), forwarded.originator)),
            None => {
                let reason = if self.closed {
                    "remote listener closed"
                } else {
                    "ssh transport closed"
                };
                Err(ForwardError::Accept {
                    addr: self.bound.clone(),
                    source: std::io::Error::new(std::io::ErrorKind::ConnectionAborted, reason),
                })
            }
        }
    }

    /// Stop listening on the remote side. Safe to call more than once.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        self.session.routes().remove(self.bound.host(), u32::from(self.bound.port()));
        self.incoming.close();

        if let Err(e) = self.session.cancel_listen(&self.bound).await {
            tracing::debug!("cancel-tcpip-forward for {} failed: {e}", self.bound);
        }
        tracing::info!("Closed remote listener on {}", self.bound);
    }
}

impl Drop for RemoteListener {
    fn drop(&mut self) {
        if !self.closed {
            self.session
                .routes()
                .remove(self.bound.host(), u32::from(self.bound.port()));
        }
    }
}
