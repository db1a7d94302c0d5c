//! Subject key generation and handling.

use std::net::IpAddr;

/// Prefix under which block markers are stored.
const BLOCK_PREFIX: &str = "blocked:";

/// The kind of principal a subject key identifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubjectKind {
    /// Anonymous traffic, identified by source address
    Ip,
    /// Traffic presenting an API token
    Token,
}

impl SubjectKind {
    /// Namespace prefix used in the rendered key.
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectKind::Ip => "ip",
            SubjectKind::Token => "token",
        }
    }
}

/// A key that uniquely identifies a rate limited principal.
///
/// Keys are namespaced by kind (`ip:<address>` or `token:<value>`) so
/// that an address and a token with the same text never share a counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubjectKey {
    kind: SubjectKind,
    key: String,
}

impl SubjectKey {
    /// Create a key for anonymous traffic from a source address.
    pub fn ip(addr: IpAddr) -> Self {
        Self {
            kind: SubjectKind::Ip,
            key: format!("{}:{}", SubjectKind::Ip.as_str(), addr),
        }
    }

    /// Create a key for a presented API token.
    pub fn token(token: &str) -> Self {
        Self {
            kind: SubjectKind::Token,
            key: format!("{}:{}", SubjectKind::Token.as_str(), token),
        }
    }

    /// The kind of principal behind this key.
    pub fn kind(&self) -> SubjectKind {
        self.kind
    }

    /// The counter key, e.g. `ip:10.0.0.1`.
    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// The key under which this subject's block marker lives.
    pub fn block_key(&self) -> String {
        format!("{}{}", BLOCK_PREFIX, self.key)
    }
}

impl std::fmt::Display for SubjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key)
    }
}
