//! Synchronous request client.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use webrocket_proto::{Packet, ProtocolError, SocketKind, Status};

use crate::error::Error;
use crate::socket::Socket;

/// End-to-end timeout for a single request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// A REQ-style backend client.
///
/// Every operation opens a fresh connection, sends one identity-prefixed
/// request, reads one reply and closes. Synchronous operations keep backend
/// generated events consistent with channel state.
pub struct Client {
    socket: Socket,
    timeout: Duration,
}

impl Client {
    /// Configure a client for the given `wr://` URL.
    pub fn new(uri: &str) -> Result<Client, Error> {
        Ok(Client {
            socket: Socket::new(SocketKind::Req, uri)?,
            timeout: REQUEST_TIMEOUT,
        })
    }

    /// Open the named channel.
    ///
    /// Opening a channel that already exists is a no-op on the broker and
    /// still replies `OK`. A `presence-` or `private-` prefix selects the
    /// channel kind.
    pub async fn open_channel(&self, name: &str) -> Result<(), Error> {
        self.perform_request(vec!["OC".to_string(), name.to_string()])
            .await
            .map(|_| ())
    }

    /// Close the named channel. Errors with 454 when it does not exist.
    pub async fn close_channel(&self, name: &str) -> Result<(), Error> {
        self.perform_request(vec!["CC".to_string(), name.to_string()])
            .await
            .map(|_| ())
    }

    /// Broadcast an event with attached data on the given channel.
    pub async fn broadcast(
        &self,
        channel: &str,
        event: &str,
        data: Map<String, Value>,
    ) -> Result<(), Error> {
        let serialized = Value::Object(data).to_string();
        self.perform_request(vec![
            "BC".to_string(),
            channel.to_string(),
            event.to_string(),
            serialized,
        ])
        .await
        .map(|_| ())
    }

    /// Request a single-use access token for `uid`, valid for channels
    /// matching `pattern`.
    pub async fn request_single_access_token(
        &self,
        uid: &str,
        pattern: &str,
    ) -> Result<String, Error> {
        self.perform_request(vec![
            "AT".to_string(),
            uid.to_string(),
            pattern.to_string(),
        ])
        .await
    }

    async fn perform_request(&self, frames: Vec<String>) -> Result<String, Error> {
        let fut = async {
            let mut conn = self.socket.connect(self.timeout).await?;
            let packet = Packet::with_identity(self.socket.identity(), frames);
            conn.send(packet).await?;
            let reply = match conn.next().await {
                Some(reply) => reply?,
                None => return Err(Error::Protocol(ProtocolError::Eof)),
            };
            parse_response(reply)
        };
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| Error::Timeout)?
    }
}

/// Extract data from a reply, converting `ER` frames into errors.
fn parse_response(frames: Vec<String>) -> Result<String, Error> {
    match frames.first().map(String::as_str) {
        Some("OK") => Ok(String::new()),
        Some("ER") => {
            let code = frames
                .get(1)
                .and_then(|raw| raw.parse::<u16>().ok())
                .ok_or(Error::UnknownResponse)?;
            let status = Status::from_code(code).ok_or(Error::UnknownResponse)?;
            Err(Error::Status(status))
        }
        Some("AT") => match frames.get(1) {
            Some(token) if token.len() == 128 => Ok(token.clone()),
            _ => Err(Error::UnknownResponse),
        },
        _ => Err(Error::UnknownResponse),
    }
}
