use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ForwardError;

pub const LOCALHOST: &str = "127.0.0.1";

/// A `host:port` pair naming one side of a forward.
///
/// IPv6 literals are stored without brackets and displayed with them, so the
/// `Display` form always parses back to the same value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn localhost(port: u16) -> Self {
        Self::new(LOCALHOST, port)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Same host, different port. Used once a listener reports the port it
    /// actually bound.
    pub fn with_port(&self, port: u16) -> Self {
        Self::new(self.host.clone(), port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = ForwardError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| ForwardError::InvalidEndpoint {
            input: input.to_string(),
            reason,
        };

        let colon_pos = input.rfind(':').ok_or_else(|| invalid("missing port"))?;
        let host = &input[..colon_pos];
        let port = input[colon_pos + 1..]
            .parse::<u16>()
            .map_err(|_| invalid("port is not a number between 0 and 65535"))?;

        let host = match host.strip_prefix('[') {
            Some(rest) => rest
                .strip_suffix(']')
                .ok_or_else(|| invalid("unterminated IPv6 literal"))?,
            None if host.contains(':') => return Err(invalid("IPv6 literal must be bracketed")),
            None => host,
        };

        if host.is_empty() {
            return Err(invalid("missing host"));
        }

        Ok(Self::new(host, port))
    }
}

impl TryFrom<String> for Endpoint {
    type Error = ForwardError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Endpoint> for String {
    fn from(value: Endpoint) -> Self {
        value.to_string()
    }
}

impl From<std::net::SocketAddr> for Endpoint {
    fn from(addr: std::net::SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_host_and_port() {
        let endpoint: Endpoint = "10.244.0.12:9000".parse().unwrap();
        assert_eq!(endpoint.host(), "10.244.0.12");
        assert_eq!(endpoint.port(), 9000);
    }

    #[test]
    fn test_parse_hostname() {
        let endpoint: Endpoint = "haproxy.internal:443".parse().unwrap();
        assert_eq!(endpoint, Endpoint::new("haproxy.internal", 443));
    }

    #[test]
    fn test_parse_ipv6() {
        let endpoint: Endpoint = "[::1]:7000".parse().unwrap();
        assert_eq!(endpoint.host(), "::1");
        assert_eq!(endpoint.port(), 7000);
        assert_eq!(endpoint.to_string(), "[::1]:7000");
    }

    #[test]
    fn test_parse_wildcard_port() {
        let endpoint: Endpoint = "127.0.0.1:0".parse().unwrap();
        assert_eq!(endpoint.port(), 0);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        for input in ["localhost", "localhost:http", ":8080", "::1:80", "[::1:80", "host:70000"] {
            let result = input.parse::<Endpoint>();
            assert!(
                matches!(result, Err(ForwardError::InvalidEndpoint { .. })),
                "{input} should not parse"
            );
        }
    }

    #[test]
    fn test_serde_uses_display_form() {
        let endpoint = Endpoint::localhost(5000);
        let json = serde_json::to_string(&endpoint).unwrap();
        assert_eq!(json, "\"127.0.0.1:5000\"");

        let back: Endpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, endpoint);
    }

    #[test]
    fn test_with_port_keeps_host() {
        let endpoint = Endpoint::localhost(0).with_port(41234);
        assert_eq!(endpoint.to_string(), "127.0.0.1:41234");
    }
}
