//! Shared socket plumbing for [`Client`](crate::Client) and
//! [`Worker`](crate::Worker).

use std::time::Duration;

use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use url::Url;
use webrocket_proto::{FrameCodec, Identity, SocketKind};

use crate::error::Error;

/// Default port of the broker's backend endpoint.
const DEFAULT_PORT: u16 = 8081;

/// A framed backend connection.
pub(crate) type Connection = Framed<TcpStream, FrameCodec>;

/// Address material shared by both socket kinds.
///
/// Parsed once from a `wr://<access-token>@<host>:<port>/<vhost-path>` URL.
#[derive(Debug, Clone)]
pub(crate) struct Socket {
    kind: SocketKind,
    host: String,
    port: u16,
    vhost: String,
    token: String,
}

impl Socket {
    pub fn new(kind: SocketKind, uri: &str) -> Result<Socket, Error> {
        let url = Url::parse(uri).map_err(|e| Error::InvalidUrl(e.to_string()))?;
        if url.scheme() != "wr" {
            return Err(Error::InvalidUrl(format!(
                "expected wr:// scheme, got {}://",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| Error::InvalidUrl("missing host".to_string()))?
            .to_string();
        let token = url.username().to_string();
        if token.is_empty() {
            return Err(Error::InvalidUrl("missing access token".to_string()));
        }
        let vhost = url.path().to_string();
        if vhost.len() < 2 {
            return Err(Error::InvalidUrl("missing vhost path".to_string()));
        }
        Ok(Socket {
            kind,
            host,
            port: url.port().unwrap_or(DEFAULT_PORT),
            vhost,
            token,
        })
    }

    /// A fresh identity for one connection attempt.
    pub fn identity(&self) -> Identity {
        Identity::new(self.kind, &self.vhost, &self.token)
    }

    /// Dial the backend endpoint, bounded by `timeout`.
    pub async fn connect(&self, timeout: Duration) -> Result<Connection, Error> {
        let addr = format!("{}:{}", self.host, self.port);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::Timeout)??;
        Ok(Framed::new(stream, FrameCodec::new()))
    }
}
