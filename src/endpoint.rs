//! Addressable `(host, port[, user])` triples.

use crate::error::{Result, TunnelError};
use std::fmt;
use std::str::FromStr;

/// A dialable host and port, optionally carrying the login user.
///
/// The user is only meaningful for the SSH server endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            user: None,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }
}

/// Renders `host:port`, bracketing hosts that contain a colon (IPv6 literals).
impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Parses `host`, `host:port`, `user@host:port` or `[v6]:port`.
///
/// A missing port is left as 0.
impl FromStr for Endpoint {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| TunnelError::InvalidEndpoint {
            input: s.to_string(),
            reason: reason.to_string(),
        };

        let (user, rest) = match s.rfind('@') {
            Some(idx) => (Some(&s[..idx]), &s[idx + 1..]),
            None => (None, s),
        };
        if user.is_some_and(str::is_empty) {
            return Err(invalid("empty user"));
        }

        let (host, port) = if let Some(stripped) = rest.strip_prefix('[') {
            let close = stripped
                .find(']')
                .ok_or_else(|| invalid("missing closing bracket"))?;
            let host = &stripped[..close];
            let tail = &stripped[close + 1..];
            let port = match tail.strip_prefix(':') {
                Some(p) => Some(p),
                None if tail.is_empty() => None,
                None => return Err(invalid("unexpected text after bracketed host")),
            };
            (host, port)
        } else {
            match rest.matches(':').count() {
                0 => (rest, None),
                1 => {
                    let (h, p) = rest.split_once(':').unwrap_or((rest, ""));
                    (h, Some(p))
                }
                // Bare IPv6 literal without a port.
                _ => (rest, None),
            }
        };

        if host.is_empty() {
            return Err(invalid("empty host"));
        }

        let port = match port {
            Some(p) => p.parse::<u16>().map_err(|_| invalid("invalid port"))?,
            None => 0,
        };

        Ok(Self {
            host: host.to_string(),
            port,
            user: user.map(str::to_string),
        })
    }
}
