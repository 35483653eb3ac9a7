//! Synchronous command dispatch.
//!
//! The first message on a backend connection decides everything: its
//! identity names the vhost and presents the access token, its first
//! payload frame is the command. `req` identities get exactly one reply and
//! the connection closes; `dlr` identities announcing `RD` are handed over
//! to the worker session loop.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use webrocket_proto::{FrameCodec, Identity, Packet, SocketKind, Status};

use crate::context::Context;
use crate::error::EngineError;
use crate::vhost::Vhost;

use super::{worker, REQUEST_TIMEOUT};

/// Serve one backend connection from its first message on.
pub async fn serve<S>(ctx: Arc<Context>, stream: S, addr: SocketAddr, cancel: CancellationToken)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut conn = Framed::new(stream, FrameCodec::new());

    let first = tokio::select! {
        _ = cancel.cancelled() => return,
        read = timeout(REQUEST_TIMEOUT, conn.next()) => read,
    };
    let frames = match first {
        Ok(Some(Ok(frames))) => frames,
        Ok(Some(Err(err))) => {
            reply_error(&mut conn, err.status()).await;
            return;
        }
        // Closed or idle without a full message; nothing to answer.
        Ok(None) | Err(_) => return,
    };
    let packet = match Packet::parse(frames) {
        Ok(packet) => packet,
        Err(err) => {
            reply_error(&mut conn, err.status()).await;
            return;
        }
    };
    let identity: Identity = match packet.identity.as_deref().map(str::parse) {
        Some(Ok(identity)) => identity,
        _ => {
            reply_error(&mut conn, Status::BadRequest).await;
            return;
        }
    };
    // Unknown vhosts answer 402 like bad tokens: credentials can only be
    // checked against an existing vhost, and the reply must not reveal
    // which part was wrong.
    let vhost = match ctx.vhost(&identity.vhost) {
        Ok(vhost) => vhost,
        Err(_) => {
            reply_error(&mut conn, Status::Unauthorized).await;
            return;
        }
    };
    if !vhost.authenticate(&identity.token) {
        debug!(%addr, vhost = %identity.vhost, "backend auth failed");
        reply_error(&mut conn, Status::Unauthorized).await;
        return;
    }

    match identity.kind {
        SocketKind::Req => {
            let reply = dispatch(&vhost, &packet.frames);
            let _ = timeout(REQUEST_TIMEOUT, conn.send(reply)).await;
        }
        SocketKind::Dlr => {
            if packet.frames[0] != "RD" {
                reply_error(&mut conn, Status::BadRequest).await;
                return;
            }
            worker::serve(vhost, conn, identity, cancel).await;
        }
    }
}

/// Execute one synchronous command and produce the reply packet.
fn dispatch(vhost: &Arc<Vhost>, frames: &[String]) -> Packet {
    match frames[0].as_str() {
        "OC" if frames.len() == 2 => match vhost.open_channel(&frames[1], None) {
            // Opening an existing channel is a no-op, not an error.
            Ok(_) | Err(EngineError::ChannelExists(_)) => ok(),
            Err(err) => error(err.status()),
        },
        "CC" if frames.len() == 2 => match vhost.delete_channel(&frames[1]) {
            Ok(()) => ok(),
            Err(err) => error(err.status()),
        },
        "BC" if frames.len() == 4 => {
            let data = match serde_json::from_str::<Value>(&frames[3]) {
                Ok(Value::Object(map)) => map,
                _ => return error(Status::BadRequest),
            };
            match vhost.broadcast(&frames[1], &frames[2], data, None) {
                Ok(()) => ok(),
                Err(err) => error(err.status()),
            }
        }
        "AT" if frames.len() == 3 => {
            match vhost.generate_single_access_token(&frames[1], &frames[2]) {
                Ok(token) => Packet::new(["AT".to_string(), token]),
                Err(err) => error(err.status()),
            }
        }
        _ => error(Status::BadRequest),
    }
}

fn ok() -> Packet {
    Packet::new(["OK"])
}

fn error(status: Status) -> Packet {
    Packet::new(["ER".to_string(), status.code().to_string()])
}

async fn reply_error<S>(conn: &mut Framed<S, FrameCodec>, status: Status)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let _ = timeout(REQUEST_TIMEOUT, conn.send(error(status))).await;
}
