//! CONNECT request line parsing.
//!
//! Accepts exactly `CONNECT host:port HTTP/x.y`. CONNECT targets are always
//! authority-form, so a missing port is an error rather than a default.
//! Nothing here resolves DNS.

use std::fmt;
use std::net::Ipv6Addr;
use std::str::FromStr;

use thiserror::Error;

/// Reasons a request line is not a valid CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TargetError {
    #[error("request line is not valid UTF-8")]
    NotUtf8,
    #[error("method {0:?} is not CONNECT")]
    NotConnect(String),
    #[error("missing request target")]
    MissingAuthority,
    #[error("missing HTTP version")]
    MissingVersion,
    #[error("invalid HTTP version {0:?}")]
    InvalidVersion(String),
    #[error("unexpected trailing data {0:?}")]
    TrailingTokens(String),
    #[error("target {0:?} has no port")]
    MissingPort(String),
    #[error("invalid port {0:?}")]
    InvalidPort(String),
    #[error("invalid host {0:?}")]
    InvalidHost(String),
}

/// Upstream endpoint requested by a CONNECT line.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    host: String,
    port: u16,
}

impl Target {
    /// Build a target, validating host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, TargetError> {
        let host = host.into();
        if port == 0 {
            return Err(TargetError::InvalidPort(port.to_string()));
        }
        if host.contains(':') {
            if host.parse::<Ipv6Addr>().is_err() {
                return Err(TargetError::InvalidHost(host));
            }
        } else if !is_valid_hostname(&host) {
            return Err(TargetError::InvalidHost(host));
        }
        Ok(Self { host, port })
    }

    /// Host name or IP literal, without IPv6 brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Target {
    type Err = TargetError;

    /// Parse an authority (`host:port` or `[v6]:port`).
    fn from_str(authority: &str) -> Result<Self, Self::Err> {
        let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
            let Some((host, after)) = rest.split_once(']') else {
                return Err(TargetError::InvalidHost(authority.to_string()));
            };
            let Some(port) = after.strip_prefix(':') else {
                return Err(TargetError::MissingPort(authority.to_string()));
            };
            if host.parse::<Ipv6Addr>().is_err() {
                return Err(TargetError::InvalidHost(host.to_string()));
            }
            (host, port)
        } else {
            let Some((host, port)) = authority.rsplit_once(':') else {
                return Err(TargetError::MissingPort(authority.to_string()));
            };
            // An unbracketed IPv6 literal is ambiguous.
            if host.contains(':') {
                return Err(TargetError::InvalidHost(host.to_string()));
            }
            (host, port)
        };

        Target::new(host, parse_port(port)?)
    }
}

/// Parse one request line into its CONNECT target.
///
/// The line may still carry its `\r\n` or `\n` terminator.
pub fn parse_connect_line(line: &str) -> Result<Target, TargetError> {
    let line = line.strip_suffix('\n').unwrap_or(line);
    let line = line.strip_suffix('\r').unwrap_or(line);

    let mut parts = line.split(' ');
    let method = parts.next().unwrap_or_default();
    if method != "CONNECT" {
        return Err(TargetError::NotConnect(method.to_string()));
    }

    let authority = match parts.next() {
        Some(a) if !a.is_empty() => a,
        _ => return Err(TargetError::MissingAuthority),
    };

    let version = match parts.next() {
        Some(v) if !v.is_empty() => v,
        _ => return Err(TargetError::MissingVersion),
    };
    if !is_http_version(version) {
        return Err(TargetError::InvalidVersion(version.to_string()));
    }

    let trailing: Vec<&str> = parts.collect();
    if !trailing.is_empty() {
        return Err(TargetError::TrailingTokens(trailing.join(" ")));
    }

    authority.parse()
}

/// Same as [`parse_connect_line`] for raw bytes off the wire.
pub fn parse_connect_bytes(line: &[u8]) -> Result<Target, TargetError> {
    let line = std::str::from_utf8(line).map_err(|_| TargetError::NotUtf8)?;
    parse_connect_line(line)
}

fn parse_port(s: &str) -> Result<u16, TargetError> {
    if s.is_empty() {
        return Err(TargetError::MissingPort(s.to_string()));
    }
    // u16::from_str accepts a leading '+'
    if !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(TargetError::InvalidPort(s.to_string()));
    }
    match s.parse::<u16>() {
        Ok(0) | Err(_) => Err(TargetError::InvalidPort(s.to_string())),
        Ok(port) => Ok(port),
    }
}

fn is_http_version(v: &str) -> bool {
    match v.strip_prefix("HTTP/").map(str::as_bytes) {
        Some([major, b'.', minor]) => major.is_ascii_digit() && minor.is_ascii_digit(),
        _ => false,
    }
}

fn is_valid_hostname(host: &str) -> bool {
    !host.is_empty()
        && host.len() <= 253
        && host
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_'))
}
