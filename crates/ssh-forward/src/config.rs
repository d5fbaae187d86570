//! Connection and forwarding configuration
//!
//! Everything a session or forwarder needs is passed in explicitly through these
//! values; nothing is read from process-wide state except by [`SshTarget::from_env`].

use std::path::PathBuf;
use std::time::Duration;

use russh::keys::{HashAlg, PrivateKey, PublicKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use typed_builder::TypedBuilder;

pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_COPY_BUFFER_SIZE: usize = 8 * 1024;

/// Where the private key used for authentication comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum KeySource {
    /// Key material (OpenSSH or PEM) held in memory, as handed out by the deployment
    Paste { content: String },
    /// Path to a key file; a leading `~/` is expanded to the home directory
    Path { path: String },
}

impl KeySource {
    pub fn paste(content: impl Into<String>) -> Self {
        Self::Paste {
            content: content.into(),
        }
    }

    pub fn path(path: impl Into<String>) -> Self {
        Self::Path { path: path.into() }
    }

    /// Decode the private key. Encrypted keys are not supported.
    pub fn load(&self) -> Result<PrivateKey, russh::keys::Error> {
        match self {
            Self::Paste { content } => russh::keys::decode_secret_key(content, None),
            Self::Path { path } => russh::keys::load_secret_key(expand_home(path), None),
        }
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// How the server's host key is checked during the handshake
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum HostKeyPolicy {
    /// Trust any host key. Only suitable for freshly provisioned, single-use hosts.
    #[default]
    AcceptAny,
    /// Pin the SHA-256 fingerprint, with or without the `SHA256:` prefix
    Fingerprint { sha256: String },
    /// Pin the full public key in OpenSSH format (`ssh-ed25519 AAAA... comment`)
    PublicKey { openssh: String },
}

impl HostKeyPolicy {
    pub fn verify(&self, key: &PublicKey) -> bool {
        match self {
            Self::AcceptAny => true,
            Self::Fingerprint { sha256 } => {
                let actual = key.fingerprint(HashAlg::Sha256).to_string();
                let actual = actual.strip_prefix("SHA256:").unwrap_or(&actual);
                let expected = sha256.strip_prefix("SHA256:").unwrap_or(sha256);
                actual == expected
            }
            Self::PublicKey { openssh } => match PublicKey::from_openssh(openssh) {
                Ok(expected) => expected.key_data() == key.key_data(),
                Err(e) => {
                    tracing::warn!("Pinned host key could not be parsed: {e}");
                    false
                }
            },
        }
    }
}

/// The SSH endpoint and credentials for one transport session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
pub struct SshTarget {
    #[builder(setter(into))]
    pub user: String,

    #[builder(setter(into))]
    pub host: String,

    #[builder(default = DEFAULT_SSH_PORT)]
    #[serde(default = "default_port")]
    pub port: u16,

    pub key: KeySource,

    /// Covers TCP connect, handshake and authentication
    #[builder(default = DEFAULT_CONNECT_TIMEOUT)]
    #[serde(
        default = "default_connect_timeout",
        serialize_with = "serialize_duration",
        deserialize_with = "deserialize_duration"
    )]
    pub connect_timeout: Duration,

    #[builder(default)]
    #[serde(default)]
    pub host_key: HostKeyPolicy,

    #[builder(default, setter(strip_option))]
    #[serde(
        default,
        serialize_with = "serialize_opt_duration",
        deserialize_with = "deserialize_opt_duration"
    )]
    pub keepalive_interval: Option<Duration>,
}

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_connect_timeout() -> Duration {
    DEFAULT_CONNECT_TIMEOUT
}

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
}

fn serialize_opt_duration<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match duration {
        Some(duration) => serializer.serialize_some(&duration.as_secs_f64()),
        None => serializer.serialize_none(),
    }
}

fn deserialize_opt_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<f64>::deserialize(deserializer)?
        .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
        .transpose()
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("required env var {0} not found")]
    MissingVar(String),
    #[error("env var {name} is not a valid port: {value:?}")]
    InvalidPort { name: String, value: String },
}

impl SshTarget {
    /// `host:port` as handed to the TCP connect
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Build a target from `<PREFIX>_USER`, `<PREFIX>_HOST`, optional `<PREFIX>_PORT`,
    /// and either `<PREFIX>_PRIVATE_KEY` (key material) or `<PREFIX>_PRIVATE_KEY_PATH`.
    pub fn from_env(prefix: &str) -> Result<Self, ConfigError> {
        Self::from_lookup(prefix, |name| std::env::var(name).ok())
    }

    /// As [`SshTarget::from_env`], reading variables through `lookup`.
    /// Empty values count as missing.
    pub fn from_lookup(
        prefix: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let get = |suffix: &str| {
            let name = format!("{prefix}_{suffix}");
            let value = lookup(&name).filter(|v| !v.is_empty());
            (name, value)
        };
        let require = |suffix: &str| {
            let (name, value) = get(suffix);
            value.ok_or(ConfigError::MissingVar(name))
        };

        let user = require("USER")?;
        let host = require("HOST")?;

        let port = match get("PORT") {
            (_, None) => DEFAULT_SSH_PORT,
            (name, Some(value)) => value
                .parse()
                .map_err(|_| ConfigError::InvalidPort { name, value })?,
        };

        let key = match (get("PRIVATE_KEY"), get("PRIVATE_KEY_PATH")) {
            ((_, Some(content)), _) => KeySource::Paste { content },
            (_, (_, Some(path))) => KeySource::Path { path },
            ((name, None), _) => return Err(ConfigError::MissingVar(name)),
        };

        Ok(SshTarget::builder()
            .user(user)
            .host(host)
            .port(port)
            .key(key)
            .build())
    }
}

/// What happens to connections still being pumped when a forwarder is stopped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ShutdownMode {
    /// Stop accepting; in-flight connections run to their natural end
    #[default]
    Drain,
    /// Stop accepting and abort every in-flight connection
    Abort,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
pub struct ForwardOptions {
    #[builder(default)]
    #[serde(default)]
    pub shutdown: ShutdownMode,

    /// Per-direction copy buffer
    #[builder(default = DEFAULT_COPY_BUFFER_SIZE)]
    #[serde(default = "default_copy_buffer_size")]
    pub copy_buffer_size: usize,
}

fn default_copy_buffer_size() -> usize {
    DEFAULT_COPY_BUFFER_SIZE
}

impl Default for ForwardOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}
