//! Server URL parsing
//!
//! A session URL picks one of four grammars and expands into one or two
//! transport connection specs plus a reverse-connect flag:
//!
//! - `cs://host[:port]` — forward connect, single cluster
//! - `csrc://[host][:port]` — reverse connect (listen), single cluster
//! - `cdsrs://dshost[:dsport]/rshost[:rsport]` — forward, dual cluster
//! - `cdsrsrc://[dshost[:dsport]][/[rshost[:rsport]]]` — reverse, dual cluster
//!
//! Hosts in reverse grammars are accepted but ignored: listening is local.
//! A missing or zero port falls back to the scheme default.

use crate::error::{Error, Result};

/// Protocol name embedded in every handshake token.
pub const PROTOCOL_NAME: &str = "conclave";

/// Default port for the data-server group.
pub const DEFAULT_DATA_PORT: u16 = 11111;

/// Default port for the render-server group.
pub const DEFAULT_RENDER_PORT: u16 = 22221;

/// Handshake token carried by every connection spec:
/// `handshake=<protocol-name>.<protocol-version>`.
pub fn handshake_token() -> String {
    format!("handshake={}.{}", PROTOCOL_NAME, env!("CARGO_PKG_VERSION"))
}

/// One transport connection spec: where to dial (or listen) and the
/// handshake token the transport must exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSpec {
    pub host: String,
    pub port: u16,
    /// Reverse connect: open a listening socket and wait for the remote
    /// side to dial in.
    pub listen: bool,
    pub handshake: String,
}

impl ConnectionSpec {
    fn forward(host: &str, port: u16) -> Self {
        ConnectionSpec {
            host: host.to_string(),
            port,
            listen: false,
            handshake: handshake_token(),
        }
    }

    fn reverse(port: u16) -> Self {
        ConnectionSpec {
            host: "localhost".to_string(),
            port,
            listen: true,
            handshake: handshake_token(),
        }
    }

    /// Render the spec as the transport URL string:
    /// `tcp://host:port?handshake=...` for forward connects,
    /// `tcp://localhost:port?listen=true&nonblocking=true&handshake=...`
    /// for reverse connects.
    pub fn to_spec_string(&self) -> String {
        if self.listen {
            format!(
                "tcp://{}:{}?listen=true&nonblocking=true&{}",
                self.host, self.port, self.handshake
            )
        } else {
            format!("tcp://{}:{}?{}", self.host, self.port, self.handshake)
        }
    }
}

/// A parsed session URL: a data-server spec, an optional render-server
/// spec, and whether the connection is reverse (listening).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerUrl {
    pub data: ConnectionSpec,
    pub render: Option<ConnectionSpec>,
    pub reverse: bool,
}

impl ServerUrl {
    /// Parse a session URL. Unrecognized input is an error; the caller
    /// (Connect) fails fast without touching the transport.
    pub fn parse(url: &str) -> Result<ServerUrl> {
        if let Some(rest) = url.strip_prefix("cs://") {
            let (host, port) = split_host_port(rest, DEFAULT_DATA_PORT);
            if host.is_empty() {
                return Err(Error::UnrecognizedUrl(url.to_string()));
            }
            return Ok(ServerUrl {
                data: ConnectionSpec::forward(&host, port),
                render: None,
                reverse: false,
            });
        }

        if let Some(rest) = url.strip_prefix("csrc://") {
            let (_host, port) = split_host_port(rest, DEFAULT_DATA_PORT);
            return Ok(ServerUrl {
                data: ConnectionSpec::reverse(port),
                render: None,
                reverse: true,
            });
        }

        if let Some(rest) = url.strip_prefix("cdsrs://") {
            let (ds_part, rs_part) = rest
                .split_once('/')
                .ok_or_else(|| Error::UnrecognizedUrl(url.to_string()))?;
            let (ds_host, ds_port) = split_host_port(ds_part, DEFAULT_DATA_PORT);
            let (rs_host, rs_port) = split_host_port(rs_part, DEFAULT_RENDER_PORT);
            if ds_host.is_empty() || rs_host.is_empty() {
                return Err(Error::UnrecognizedUrl(url.to_string()));
            }
            return Ok(ServerUrl {
                data: ConnectionSpec::forward(&ds_host, ds_port),
                render: Some(ConnectionSpec::forward(&rs_host, rs_port)),
                reverse: false,
            });
        }

        if let Some(rest) = url.strip_prefix("cdsrsrc://") {
            // Hosts, if any, are ignored; only the ports matter. A tail
            // without a separator contributes nothing and both ports
            // default.
            let (ds_port, rs_port) = match rest.split_once('/') {
                Some((ds_part, rs_part)) => (
                    split_host_port(ds_part, DEFAULT_DATA_PORT).1,
                    split_host_port(rs_part, DEFAULT_RENDER_PORT).1,
                ),
                None => (DEFAULT_DATA_PORT, DEFAULT_RENDER_PORT),
            };
            return Ok(ServerUrl {
                data: ConnectionSpec::reverse(ds_port),
                render: Some(ConnectionSpec::reverse(rs_port)),
                reverse: true,
            });
        }

        Err(Error::UnrecognizedUrl(url.to_string()))
    }
}

/// Split `host[:port]`, substituting `default` for a missing, zero, or
/// unparseable port.
fn split_host_port(part: &str, default: u16) -> (String, u16) {
    let (host, port_str) = match part.split_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (part, None),
    };
    let port = port_str
        .and_then(|p| p.parse::<u16>().ok())
        .filter(|&p| p != 0)
        .unwrap_or(default);
    (host.to_string(), port)
}
