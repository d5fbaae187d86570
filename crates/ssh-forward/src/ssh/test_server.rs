//! In-process SSH server for unit tests
//!
//! Accepts the fixture key for user `vcap` only, and supports what a forwarder
//! and the command helpers need: `direct-tcpip`, `tcpip-forward` and `exec`
//! (through `sh -c`, with stdin). It uses the fixture key as its host key too.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use russh::keys::{PrivateKey, PublicKey};
use russh::server::{self, Auth, Msg, RunningServerHandle, Server as _, Session};
use russh::{Channel, ChannelId, CryptoVec, MethodKind, MethodSet};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{ChildStdin, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::{HostKeyPolicy, KeySource, SshTarget};

pub(crate) const USER: &str = "vcap";
pub(crate) const FIXTURE_KEY: &str = include_str!("../../testdata/id_ed25519");
pub(crate) const HOST_KEY_FINGERPRINT: &str = "SHA256:y0TlYojsjXtXjZHDbAWiFYbjAy9cdHWJKH4w7NZ8qT8";

pub(crate) struct TestServer {
    port: u16,
    running: RunningServerHandle,
}

impl TestServer {
    pub async fn start() -> Self {
        let key = PrivateKey::from_openssh(FIXTURE_KEY).unwrap();
        let authorized = Arc::new(key.public_key().clone());

        let config = Arc::new(server::Config {
            auth_rejection_time: Duration::from_millis(50),
            keys: vec![key],
            ..Default::default()
        });

        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut factory = Factory { authorized };
        let (running_tx, running_rx) = oneshot::channel();
        tokio::spawn(async move {
            let running = factory.run_on_socket(config, &listener);
            let _ = running_tx.send(running.handle());
            running.await
        });

        Self {
            port,
            running: running_rx.await.unwrap(),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Target for the authorized user, with the host key pinned
    pub fn target(&self) -> SshTarget {
        SshTarget::builder()
            .user(USER)
            .host("127.0.0.1")
            .port(self.port)
            .key(KeySource::paste(FIXTURE_KEY))
            .connect_timeout(Duration::from_secs(5))
            .host_key(HostKeyPolicy::Fingerprint {
                sha256: HOST_KEY_FINGERPRINT.to_string(),
            })
            .build()
    }

    /// Drop every client connection and stop accepting new ones
    pub fn kill(&self) {
        self.running.shutdown("server going away".to_string());
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.kill();
    }
}

struct Factory {
    authorized: Arc<PublicKey>,
}

impl server::Server for Factory {
    type Handler = Connection;

    fn new_client(&mut self, _: Option<std::net::SocketAddr>) -> Connection {
        Connection {
            authorized: self.authorized.clone(),
            forwards: HashMap::new(),
            stdin: HashMap::new(),
        }
    }
}

struct Connection {
    authorized: Arc<PublicKey>,
    forwards: HashMap<(String, u32), JoinHandle<()>>,
    stdin: HashMap<ChannelId, ChildStdin>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        for (_, task) in self.forwards.drain() {
            task.abort();
        }
    }
}

impl server::Handler for Connection {
    type Error = russh::Error;

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        if user == USER && public_key.key_data() == self.authorized.key_data() {
            return Ok(Auth::Accept);
        }

        let mut methods = MethodSet::empty();
        methods.push(MethodKind::PublicKey);
        Ok(Auth::Reject {
            proceed_with_methods: Some(methods),
            partial_success: false,
        })
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Ok(port) = u16::try_from(port_to_connect) else {
            return Ok(false);
        };

        match TcpStream::connect((host_to_connect, port)).await {
            Ok(mut backend) => {
                let mut tunnel = channel.into_stream();
                tokio::spawn(async move {
                    let _ = tokio::io::copy_bidirectional(&mut tunnel, &mut backend).await;
                    let _ = tunnel.shutdown().await;
                    let _ = backend.shutdown().await;
                });
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Ok(requested) = u16::try_from(*port) else {
            return Ok(false);
        };
        let Ok(listener) = TcpListener::bind((address, requested)).await else {
            return Ok(false);
        };
        let Ok(bound) = listener.local_addr() else {
            return Ok(false);
        };
        *port = u32::from(bound.port());

        let handle = session.handle();
        let connected = address.to_string();
        let connected_port = *port;

        let task = tokio::spawn(async move {
            while let Ok((mut inbound, peer)) = listener.accept().await {
                let handle = handle.clone();
                let connected = connected.clone();
                tokio::spawn(async move {
                    let Ok(channel) = handle
                        .channel_open_forwarded_tcpip(
                            connected,
                            connected_port,
                            peer.ip().to_string(),
                            u32::from(peer.port()),
                        )
                        .await
                    else {
                        return;
                    };
                    let mut tunnel = channel.into_stream();
                    let _ = tokio::io::copy_bidirectional(&mut inbound, &mut tunnel).await;
                    let _ = inbound.shutdown().await;
                    let _ = tunnel.shutdown().await;
                });
            }
        });

        self.forwards.insert((address.to_string(), *port), task);
        Ok(true)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        match self.forwards.remove(&(address.to_string(), port)) {
            Some(task) => {
                task.abort();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).into_owned();

        let mut child = match Command::new("sh")
            .arg("-c")
            .arg(&command)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(_) => {
                session.channel_failure(channel)?;
                return Ok(());
            }
        };

        if let Some(stdin) = child.stdin.take() {
            self.stdin.insert(channel, stdin);
        }
        session.channel_success(channel)?;

        let handle = session.handle();
        tokio::spawn(async move {
            let Ok(output) = child.wait_with_output().await else {
                let _ = handle.close(channel).await;
                return;
            };

            if !output.stdout.is_empty() {
                let _ = handle
                    .data(channel, CryptoVec::from_slice(&output.stdout))
                    .await;
            }
            if !output.stderr.is_empty() {
                let _ = handle
                    .extended_data(channel, 1, CryptoVec::from_slice(&output.stderr))
                    .await;
            }

            let code = output.status.code().unwrap_or(255);
            let _ = handle.exit_status_request(channel, code as u32).await;
            let _ = handle.eof(channel).await;
            let _ = handle.close(channel).await;
        });

        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(stdin) = self.stdin.get_mut(&channel) {
            let _ = stdin.write_all(data).await;
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.stdin.remove(&channel);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.stdin.remove(&channel);
        Ok(())
    }
}
