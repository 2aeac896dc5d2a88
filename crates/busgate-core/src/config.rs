//! Centralized configuration for the busgate core.
//!
//! Transport tunables live as associated constants on [`TransportConfig`];
//! per-endpoint settings are carried by [`EndpointConfig`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Transport-level constants.
pub struct TransportConfig;

impl TransportConfig {
    /// Largest JSON payload a single frame may carry.
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB
    /// Bytes requested from the socket per read call.
    pub const READ_CHUNK_SIZE: usize = 8192;
    /// Upper bound for a single reactor wait when no timer is due sooner.
    pub const DEFAULT_POLL_WAIT: Duration = Duration::from_millis(500);
    /// Listen backlog used when none is configured.
    pub const DEFAULT_BACKLOG: u32 = 1;
}

/// Socket type of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketType {
    #[default]
    Stream,
    Datagram,
}

impl SocketType {
    /// `SOCK_*` value passed to the system.
    pub fn raw(&self) -> libc::c_int {
        match self {
            SocketType::Stream => libc::SOCK_STREAM,
            SocketType::Datagram => libc::SOCK_DGRAM,
        }
    }
}

/// Protocol family of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    /// Derived from the host lookup.
    #[default]
    Unspecified,
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    /// `AF_*` value passed to the system.
    pub fn raw(&self) -> libc::c_int {
        match self {
            AddressFamily::Unspecified => libc::AF_UNSPEC,
            AddressFamily::Ipv4 => libc::AF_INET,
            AddressFamily::Ipv6 => libc::AF_INET6,
        }
    }

    /// Whether an address of the given family is acceptable.
    pub fn admits(&self, addr: &std::net::SocketAddr) -> bool {
        match self {
            AddressFamily::Unspecified => true,
            AddressFamily::Ipv4 => addr.is_ipv4(),
            AddressFamily::Ipv6 => addr.is_ipv6(),
        }
    }
}

/// Connection parameters for a [`ConnectionEndpoint`](crate::ConnectionEndpoint).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Host name or address to connect to (clients only).
    #[serde(default)]
    pub host: String,
    /// Port number or service name.
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub socket_type: SocketType,
    #[serde(default)]
    pub family: AddressFamily,
    /// Protocol number; derived from the socket type when absent.
    #[serde(default)]
    pub protocol: Option<i32>,
    /// Servers only: bind to all interfaces instead of loopback.
    #[serde(default)]
    pub allow_non_local: bool,
    /// Servers only: passed to `listen()` as the backlog.
    #[serde(default = "default_backlog")]
    pub max_connections: u32,
    /// Servers only: refuse accepted connections beyond `max_connections`.
    #[serde(default)]
    pub enforce_connection_limit: bool,
}

fn default_backlog() -> u32 {
    TransportConfig::DEFAULT_BACKLOG
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            service: String::new(),
            socket_type: SocketType::default(),
            family: AddressFamily::default(),
            protocol: None,
            allow_non_local: false,
            max_connections: TransportConfig::DEFAULT_BACKLOG,
            enforce_connection_limit: false,
        }
    }
}

impl EndpointConfig {
    /// Configuration for a client connecting to `host:service`.
    pub fn client(host: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            service: service.into(),
            ..Self::default()
        }
    }

    /// Configuration for a server listening on `service`.
    pub fn server(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            ..Self::default()
        }
    }

    pub fn with_socket_type(mut self, socket_type: SocketType) -> Self {
        self.socket_type = socket_type;
        self
    }

    pub fn with_family(mut self, family: AddressFamily) -> Self {
        self.family = family;
        self
    }

    pub fn with_protocol(mut self, protocol: i32) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn with_allow_non_local(mut self, allow: bool) -> Self {
        self.allow_non_local = allow;
        self
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_connection_limit_enforced(mut self, enforce: bool) -> Self {
        self.enforce_connection_limit = enforce;
        self
    }

    /// Whether enough parameters are set to initiate a client connection.
    pub fn connectable(&self) -> bool {
        !self.host.is_empty()
    }

    /// Protocol number to use, derived from the socket type when not configured.
    pub fn effective_protocol(&self) -> i32 {
        match (self.protocol, self.socket_type) {
            (Some(protocol), _) if protocol != 0 => protocol,
            (_, SocketType::Stream) => libc::IPPROTO_TCP,
            (_, SocketType::Datagram) => libc::IPPROTO_UDP,
        }
    }

    /// `host:service` for log and error messages.
    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EndpointConfig::client("localhost", "8440");
        assert_eq!(config.socket_type, SocketType::Stream);
        assert_eq!(config.family, AddressFamily::Unspecified);
        assert!(!config.allow_non_local);
        assert!(!config.enforce_connection_limit);
        assert_eq!(config.max_connections, TransportConfig::DEFAULT_BACKLOG);
        assert!(config.connectable());
        assert!(!EndpointConfig::server("8440").connectable());
    }

    #[test]
    fn test_effective_protocol() {
        let stream = EndpointConfig::client("h", "1");
        assert_eq!(stream.effective_protocol(), libc::IPPROTO_TCP);

        let datagram = stream.clone().with_socket_type(SocketType::Datagram);
        assert_eq!(datagram.effective_protocol(), libc::IPPROTO_UDP);

        let explicit = datagram.with_protocol(libc::IPPROTO_TCP);
        assert_eq!(explicit.effective_protocol(), libc::IPPROTO_TCP);
    }

    #[test]
    fn test_deserialize_partial_config() {
        let config: EndpointConfig =
            serde_json::from_str(r#"{"service": "8440", "allow_non_local": true}"#).unwrap();
        assert_eq!(config.service, "8440");
        assert!(config.allow_non_local);
        assert_eq!(config.max_connections, TransportConfig::DEFAULT_BACKLOG);
        assert_eq!(config.socket_type, SocketType::Stream);
    }

    #[test]
    fn test_family_admits() {
        let v4: std::net::SocketAddr = "127.0.0.1:1".parse().unwrap();
        let v6: std::net::SocketAddr = "[::1]:1".parse().unwrap();
        assert!(AddressFamily::Unspecified.admits(&v4));
        assert!(AddressFamily::Ipv4.admits(&v4));
        assert!(!AddressFamily::Ipv4.admits(&v6));
        assert!(AddressFamily::Ipv6.admits(&v6));
    }
}
