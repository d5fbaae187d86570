use async_trait::async_trait;
use tokio::net::TcpStream;

use super::{Acceptor, Dialer};
use crate::endpoint::Endpoint;
use crate::error::ForwardError;
use crate::ssh::{RemoteListener, TunnelStream};

#[async_trait]
impl Acceptor for RemoteListener {
    type Stream = TunnelStream;

    async fn accept(&mut self) -> Result<(TunnelStream, String), ForwardError> {
        RemoteListener::accept(self).await
    }

    fn local_addr(&self) -> Endpoint {
        RemoteListener::local_addr(self).clone()
    }

    async fn close(&mut self) {
        RemoteListener::close(self).await
    }
}

/// Plain TCP connect to a fixed target, the dial side of a remote forward
pub struct TcpDialer {
    target: Endpoint,
}

impl TcpDialer {
    pub fn new(target: Endpoint) -> Self {
        Self { target }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    type Stream = TcpStream;

    async fn dial(&self) -> Result<TcpStream, ForwardError> {
        TcpStream::connect((self.target.host(), self.target.port()))
            .await
            .map_err(|e| ForwardError::Dial {
                addr: self.target.clone(),
                source: Box::new(e),
            })
    }

    fn target(&self) -> &Endpoint {
        &self.target
    }
}
