//! Broker-side worker sessions.
//!
//! After a valid `RD` announcement the connection joins the vhost's lobby
//! and this loop owns it: outbound frames (triggers, heartbeats, the final
//! `QT`) are serialized through the worker's queue, inbound traffic only
//! refreshes the liveness clock or ends the session. A worker that stays
//! silent past twice the heartbeat interval is declared dead.

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use webrocket_proto::{FrameCodec, Identity, Packet};

use std::sync::Arc;

use crate::lobby::Worker;
use crate::vhost::Vhost;

use super::HEARTBEAT_INTERVAL;

/// Run one worker session until the connection or the vhost goes away.
pub async fn serve<S>(
    vhost: Arc<Vhost>,
    mut conn: Framed<S, FrameCodec>,
    identity: Identity,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Packet>(64);
    let worker = Arc::new(Worker::new(identity.id, identity.to_string(), tx));
    let killed = worker.cancel_token();
    vhost.lobby().add(Arc::clone(&worker));
    info!(vhost = %vhost.path(), worker = %worker.id(), "worker joined lobby");

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    let liveness = 2 * HEARTBEAT_INTERVAL;

    loop {
        tokio::select! {
            // Endpoint shutdown: tell the worker to move on.
            _ = cancel.cancelled() => {
                let _ = conn.send(Packet::new(["QT"])).await;
                break;
            }
            // Killed through the lobby (vhost deleted, write failure).
            _ = killed.cancelled() => {
                let _ = conn.send(Packet::new(["QT"])).await;
                break;
            }
            outbound = rx.recv() => match outbound {
                Some(packet) => {
                    if conn.send(packet).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = heartbeat.tick() => {
                if worker.expired(liveness) {
                    debug!(worker = %worker.id(), "worker heartbeat lapsed");
                    break;
                }
                if conn.send(Packet::new(["HB"])).await.is_err() {
                    break;
                }
            }
            inbound = conn.next() => match inbound {
                Some(Ok(frames)) => {
                    worker.touch();
                    match frames.first().map(String::as_str) {
                        Some("HB") => {}
                        Some("QT") => break,
                        // Anything else from a worker is ignored.
                        _ => {}
                    }
                }
                Some(Err(_)) | None => break,
            },
        }
    }

    vhost.lobby().remove(worker.id());
    info!(vhost = %vhost.path(), worker = %worker.id(), "worker left lobby");
}
