use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

use super::{Acceptor, Dialer};
use crate::endpoint::Endpoint;
use crate::error::ForwardError;
use crate::ssh::{Session, TunnelStream};

/// Local TCP listener, the accept side of a local forward
pub struct TcpAcceptor {
    listener: Option<TcpListener>,
    bound: Endpoint,
}

impl TcpAcceptor {
    pub async fn bind(addr: &Endpoint) -> Result<Self, ForwardError> {
        let listener = TcpListener::bind((addr.host(), addr.port()))
            .await
            .map_err(|source| ForwardError::Bind {
                addr: addr.clone(),
                source,
            })?;

        let bound = listener
            .local_addr()
            .map(Endpoint::from)
            .unwrap_or_else(|_| addr.clone());

        tracing::debug!("Bound local listener on {bound}");

        Ok(Self {
            listener: Some(listener),
            bound,
        })
    }
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    type Stream = TcpStream;

    async fn accept(&mut self) -> Result<(TcpStream, String), ForwardError> {
        let Some(listener) = self.listener.as_ref() else {
            return Err(ForwardError::Accept {
                addr: self.bound.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotConnected, "listener closed"),
            });
        };

        let (stream, peer) = listener
            .accept()
            .await
            .map_err(|source| ForwardError::Accept {
                addr: self.bound.clone(),
                source,
            })?;

        Ok((stream, peer.to_string()))
    }

    fn local_addr(&self) -> Endpoint {
        self.bound.clone()
    }

    async fn close(&mut self) {
        if self.listener.take().is_some() {
            tracing::info!("Closed local listener on {}", self.bound);
        }
    }
}

/// Opens a `direct-tcpip` channel to a fixed target for every connection
pub struct SessionDialer {
    session: Arc<Session>,
    target: Endpoint,
}

impl SessionDialer {
    pub fn new(session: Arc<Session>, target: Endpoint) -> Self {
        Self { session, target }
    }
}

#[async_trait]
impl Dialer for SessionDialer {
    type Stream = TunnelStream;

    async fn dial(&self) -> Result<TunnelStream, ForwardError> {
        self.session.dial(&self.target).await
    }

    fn target(&self) -> &Endpoint {
        &self.target
    }

    async fn closed(&self) {
        self.session.closed().await
    }
}
