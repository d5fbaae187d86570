// One authenticated SSH connection, and the channels we open over it. Do not pool
// or share sessions here; callers decide that by holding an `Arc<Session>`.
// This is essentially a wrapper around the russh crate.

use std::sync::Arc;
use std::time::Duration;

use eyre::Result;
use russh::client::{self, Handle, Msg};
use russh::keys::{HashAlg, PrivateKey, PrivateKeyWithHashAlg};
use russh::{Channel, ChannelMsg, Disconnect};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::timeout;

use super::listener::{ForwardedChannel, RemoteListener, Routes, TunnelStream};
use crate::config::{HostKeyPolicy, SshTarget};
use crate::endpoint::{Endpoint, LOCALHOST};
use crate::error::ForwardError;
use crate::shell;

/// Result of executing a command on the remote system
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// russh handler: checks the host key and routes `forwarded-tcpip` channels
/// to their remote listeners.
pub(crate) struct Client {
    host: String,
    host_key: HostKeyPolicy,
    routes: Routes,
    closed: watch::Sender<bool>,
}

impl russh::client::Handler for Client {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        let accepted = self.host_key.verify(server_public_key);
        if !accepted {
            tracing::warn!(
                "Rejecting host key {} for {}",
                server_public_key.fingerprint(HashAlg::Sha256),
                self.host
            );
        }
        Ok(accepted)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        tracing::trace!(
            "forwarded-tcpip channel for {connected_address}:{connected_port} from {originator_address}:{originator_port}"
        );

        let forwarded = ForwardedChannel {
            channel,
            originator: format!("{originator_address}:{originator_port}"),
        };

        if let Err(rejected) = self
            .routes
            .dispatch(connected_address, connected_port, forwarded)
        {
            tracing::warn!(
                "No listener for forwarded connection to {connected_address}:{connected_port}, closing it"
            );
            let _ = rejected.channel.close().await;
        }

        Ok(())
    }
}

impl Drop for Client {
    // russh drops the handler when the transport goes away; waking every remote
    // listener lets their accept loops notice.
    fn drop(&mut self) {
        self.routes.clear();
        self.closed.send_replace(true);
    }
}

/// An authenticated SSH session
pub struct Session {
    handle: RwLock<Handle<Client>>,
    routes: Routes,
    closed: watch::Receiver<bool>,
    addr: String,
    user: String,
}

impl Session {
    /// Connect and authenticate with the target's private key.
    ///
    /// `connect_timeout` bounds the TCP connect, the handshake and authentication
    /// together.
    pub async fn connect(target: &SshTarget) -> Result<Self, ForwardError> {
        let addr = target.address();

        let key = target
            .key
            .load()
            .map_err(|e| ForwardError::Authentication {
                user: target.user.clone(),
                host: addr.clone(),
                reason: format!("failed to load private key: {e}"),
            })?;

        let routes = Routes::default();
        let (closed_tx, closed) = watch::channel(false);
        let handler = Client {
            host: addr.clone(),
            host_key: target.host_key.clone(),
            routes: routes.clone(),
            closed: closed_tx,
        };

        let config = Arc::new(client::Config {
            keepalive_interval: target.keepalive_interval,
            ..Default::default()
        });

        tracing::info!(
            "Connecting to {addr} as user {} using private key",
            target.user
        );

        let establish = async {
            let mut handle = client::connect(config, addr.as_str(), handler)
                .await
                .map_err(|source| match source {
                    russh::Error::UnknownKey => ForwardError::HostKeyRejected { host: addr.clone() },
                    source => ForwardError::Connect {
                        addr: addr.clone(),
                        source,
                    },
                })?;

            Self::authenticate(&mut handle, &target.user, &addr, key).await?;
            Ok::<_, ForwardError>(handle)
        };

        let handle = timeout(target.connect_timeout, establish)
            .await
            .map_err(|_| ForwardError::ConnectTimeout {
                addr: addr.clone(),
                timeout: target.connect_timeout,
            })??;

        tracing::info!("✓ Authenticated to {addr} as {}", target.user);

        Ok(Session {
            handle: RwLock::new(handle),
            routes,
            closed,
            addr,
            user: target.user.clone(),
        })
    }

    async fn authenticate(
        handle: &mut Handle<Client>,
        user: &str,
        addr: &str,
        key: PrivateKey,
    ) -> Result<(), ForwardError> {
        let transport = |source| ForwardError::Connect {
            addr: addr.to_string(),
            source,
        };

        // Ask the server which RSA signature hash it wants; ignored for non-RSA keys
        let best_hash = handle
            .best_supported_rsa_hash()
            .await
            .map_err(transport)?
            .flatten();
        let key_with_alg = PrivateKeyWithHashAlg::new(Arc::new(key), best_hash);

        let auth_res = handle
            .authenticate_publickey(user, key_with_alg)
            .await
            .map_err(transport)?;

        match auth_res {
            client::AuthResult::Success => Ok(()),
            client::AuthResult::Failure {
                remaining_methods,
                partial_success,
            } => {
                tracing::warn!(
                    "Server {addr} rejected key for {user} (remaining methods: {:?}, partial: {})",
                    remaining_methods,
                    partial_success
                );
                Err(ForwardError::Authentication {
                    user: user.to_string(),
                    host: addr.to_string(),
                    reason: "server rejected key".to_string(),
                })
            }
        }
    }

    /// `host:port` of the SSH server
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub(crate) fn routes(&self) -> &Routes {
        &self.routes
    }

    /// Open a TCP connection to `addr` as seen from the remote host.
    pub async fn dial(&self, addr: &Endpoint) -> Result<TunnelStream, ForwardError> {
        let channel = self
            .handle
            .read()
            .await
            .channel_open_direct_tcpip(addr.host(), u32::from(addr.port()), LOCALHOST, 0)
            .await
            .map_err(|e| ForwardError::Dial {
                addr: addr.clone(),
                source: Box::new(e),
            })?;

        Ok(channel.into_stream())
    }

    /// Ask the remote host to listen on `addr` and hand us its connections.
    ///
    /// Port 0 lets the server pick; the chosen port is on the returned
    /// listener's [`RemoteListener::local_addr`].
    pub async fn listen(self: &Arc<Self>, addr: &Endpoint) -> Result<RemoteListener, ForwardError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let requested = u32::from(addr.port());
        let mut pending = Some(tx);

        let mut handle = self.handle.write().await;

        // Register up front so a connection racing the reply is not dropped
        if requested != 0 {
            if let Some(tx) = pending.take() {
                self.routes.insert(addr.host(), requested, tx);
            }
        }

        let allocated = match handle.tcpip_forward(addr.host(), requested).await {
            Ok(port) => port,
            Err(source) => {
                self.routes.remove(addr.host(), requested);
                return Err(ForwardError::Listen {
                    addr: addr.clone(),
                    source,
                });
            }
        };
        drop(handle);

        let bound_port = if requested == 0 { allocated } else { requested };
        if let Some(tx) = pending {
            self.routes.insert(addr.host(), bound_port, tx);
        }

        let bound = addr.with_port(u16::try_from(bound_port).unwrap_or(addr.port()));
        tracing::info!("Listening on {bound} on remote machine {}", self.addr);

        Ok(RemoteListener::new(self.clone(), bound, rx))
    }

    pub(crate) async fn cancel_listen(&self, addr: &Endpoint) -> Result<(), russh::Error> {
        self.handle
            .write()
            .await
            .cancel_tcpip_forward(addr.host(), u32::from(addr.port()))
            .await
            .map(|_| ())
    }

    /// Run a command through `sh -c` and capture its output
    pub async fn run(&self, command: &str) -> Result<CommandResult> {
        let mut channel = self.handle.read().await.channel_open_session().await?;

        tracing::debug!("Running on {}: {command}", self.addr);
        channel
            .exec(true, shell::run_command(command).as_str())
            .await?;

        let result = Self::collect_output(&mut channel).await;
        let _ = channel.close().await;
        Ok(result)
    }

    /// Write `contents` to `path` on the remote host and chmod it to `mode` (e.g. "0644")
    pub async fn upload(&self, path: &str, contents: &[u8], mode: &str) -> Result<()> {
        let mut channel = self.handle.read().await.channel_open_session().await?;

        channel
            .exec(true, shell::upload_command(path, mode).as_str())
            .await?;
        channel.data(contents).await?;
        channel.eof().await?;

        let result = Self::collect_output(&mut channel).await;
        let _ = channel.close().await;

        if !result.success() {
            return Err(eyre::eyre!(
                "Failed to upload {} to {} (exit code {}): {}",
                path,
                self.addr,
                result.exit_code,
                result.stderr.trim()
            ));
        }

        tracing::debug!("Uploaded {} bytes to {}:{path}", contents.len(), self.addr);
        Ok(())
    }

    async fn collect_output(channel: &mut Channel<Msg>) -> CommandResult {
        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut exit_code: Option<i32> = None;
        let mut got_eof = false;

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => {
                    stdout.push_str(&String::from_utf8_lossy(&data));
                }
                ChannelMsg::ExtendedData { data, ext: 1 } => {
                    stderr.push_str(&String::from_utf8_lossy(&data));
                }
                // Exit status can arrive before the last data; only stop once both are in
                ChannelMsg::ExitStatus { exit_status } => {
                    exit_code = Some(exit_status as i32);
                    if got_eof {
                        break;
                    }
                }
                ChannelMsg::Eof => {
                    got_eof = true;
                    if exit_code.is_some() {
                        break;
                    }
                }
                ChannelMsg::Close => break,
                _ => {}
            }
        }

        CommandResult {
            stdout,
            stderr,
            exit_code: exit_code.unwrap_or(-1),
        }
    }

    /// Check that the connection still carries traffic by running `true`.
    pub async fn is_alive(&self) -> bool {
        const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(5);

        match timeout(KEEPALIVE_TIMEOUT, self.run("true")).await {
            Ok(Ok(result)) => result.success(),
            Ok(Err(e)) => {
                tracing::debug!("SSH keepalive to {} failed: {e}", self.addr);
                false
            }
            Err(_) => {
                tracing::debug!("SSH keepalive to {} timed out", self.addr);
                false
            }
        }
    }

    pub async fn is_closed(&self) -> bool {
        *self.closed.borrow() || self.handle.read().await.is_closed()
    }

    /// Resolves once the transport is gone, whether we disconnected or the
    /// server did.
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        // The sender only drops with the handler, which also means closed
        let _ = closed.wait_for(|closed| *closed).await;
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.handle
            .read()
            .await
            .disconnect(Disconnect::ByApplication, "", "en")
            .await?;
        Ok(())
    }
}
