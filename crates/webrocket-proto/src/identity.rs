//! Sender identities.
//!
//! Every message a backend sends to the broker is prefixed with an identity
//! frame of the form `kind:vhost-path:vhost-token:uuid`. The kind picks the
//! socket semantics: `req` sockets are short-lived request/reply clients,
//! `dlr` sockets are long-lived workers receiving triggered events.

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

/// The two backend socket kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    /// Synchronous request/reply client.
    Req,
    /// Asynchronous worker (dealer).
    Dlr,
}

impl SocketKind {
    /// The wire name of the kind.
    pub fn as_str(self) -> &'static str {
        match self {
            SocketKind::Req => "req",
            SocketKind::Dlr => "dlr",
        }
    }
}

impl fmt::Display for SocketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SocketKind {
    type Err = InvalidIdentity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "req" => Ok(SocketKind::Req),
            "dlr" => Ok(SocketKind::Dlr),
            other => Err(InvalidIdentity::UnknownKind(other.to_string())),
        }
    }
}

/// Identity parse failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidIdentity {
    #[error("unknown socket kind: {0}")]
    UnknownKind(String),
    #[error("malformed identity")]
    Malformed,
}

/// A parsed backend identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Socket kind the sender announced.
    pub kind: SocketKind,
    /// Path of the vhost the sender claims to belong to.
    pub vhost: String,
    /// Access token presented for that vhost.
    pub token: String,
    /// Unique id of the sending socket.
    pub id: Uuid,
}

impl Identity {
    /// Build a fresh identity with a random socket id.
    pub fn new(kind: SocketKind, vhost: &str, token: &str) -> Identity {
        Identity {
            kind,
            vhost: vhost.to_string(),
            token: token.to_string(),
            id: Uuid::new_v4(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}:{}", self.kind, self.vhost, self.token, self.id)
    }
}

impl FromStr for Identity {
    type Err = InvalidIdentity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 4 {
            return Err(InvalidIdentity::Malformed);
        }
        let kind = parts[0].parse::<SocketKind>()?;
        let id = Uuid::parse_str(parts[3]).map_err(|_| InvalidIdentity::Malformed)?;
        if parts[1].is_empty() || parts[2].is_empty() {
            return Err(InvalidIdentity::Malformed);
        }
        Ok(Identity {
            kind,
            vhost: parts[1].to_string(),
            token: parts[2].to_string(),
            id,
        })
    }
}
