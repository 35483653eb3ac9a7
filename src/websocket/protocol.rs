//! The frontend JSON event protocol.
//!
//! Client events: `auth`, `subscribe`, `unsubscribe`, `broadcast`,
//! `trigger`, `close`. Replies are events too, named with a `__` prefix so
//! they can never collide with user events (user events come from channel
//! names and broadcasts, never from the broker itself).

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use webrocket_proto::{Event, Status};

use crate::channel::ChannelKind;
use crate::subscriber::Subscriber;
use crate::vhost::Vhost;

enum Flow {
    Continue,
    Close,
}

/// Serve one WebSocket session against its vhost.
pub async fn serve<S>(vhost: Arc<Vhost>, ws: WebSocketStream<S>, cancel: CancellationToken)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let subscriber = Arc::new(Subscriber::new(tx));
    let killed = subscriber.cancel_token();

    // Writer task: the only place that touches the sink, so a slow client
    // only ever blocks itself.
    let writer = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if sink.send(WsMessage::Text(payload)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    subscriber.send(&payload(
        "__connected",
        json!({ "sid": subscriber.sid() }),
    ));

    loop {
        let flow = tokio::select! {
            _ = cancel.cancelled() => Flow::Close,
            _ = killed.cancelled() => Flow::Close,
            incoming = stream.next() => match incoming {
                Some(Ok(WsMessage::Text(raw))) => handle_event(&vhost, &subscriber, &raw),
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => Flow::Close,
                Some(Ok(_)) => Flow::Continue,
            },
        };
        if matches!(flow, Flow::Close) {
            break;
        }
    }

    for name in subscriber.channels() {
        let _ = vhost.unsubscribe(&name, &subscriber);
    }
    drop(subscriber);
    let _ = writer.await;
}

/// Answer the handshake of a connection naming an unknown vhost, then
/// close it.
pub async fn reject_unknown_vhost<S>(ws: WebSocketStream<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, _) = ws.split();
    let _ = sink
        .send(WsMessage::Text(error_payload(Status::ChannelNotFound)))
        .await;
    let _ = sink.close().await;
}

fn handle_event(vhost: &Arc<Vhost>, subscriber: &Arc<Subscriber>, raw: &str) -> Flow {
    let event = match Event::from_json(raw) {
        Ok(event) => event,
        Err(_) => {
            subscriber.send(&error_payload(Status::BadRequest));
            return Flow::Continue;
        }
    };
    match event.name.as_str() {
        "auth" => auth(vhost, subscriber, &event.data),
        "subscribe" => subscribe(vhost, subscriber, &event.data),
        "unsubscribe" => unsubscribe(vhost, subscriber, &event.data),
        "broadcast" => broadcast(vhost, subscriber, &event.data),
        "trigger" => trigger(vhost, subscriber, &event.data),
        "close" => {
            subscriber.send(&payload("__closed", json!({})));
            return Flow::Close;
        }
        other => {
            debug!(event = %other, "unknown frontend event");
            subscriber.send(&error_payload(Status::BadRequest));
            Flow::Continue
        }
    }
}

/// `auth {token}` - consume a single-use token and attach its permission.
fn auth(vhost: &Arc<Vhost>, subscriber: &Arc<Subscriber>, data: &Map<String, Value>) -> Flow {
    let token = match data.get("token").and_then(Value::as_str) {
        Some(token) => token,
        None => {
            subscriber.send(&error_payload(Status::BadRequest));
            return Flow::Continue;
        }
    };
    match vhost.validate_single_access_token(token) {
        Some(permission) => {
            subscriber.authorize(permission);
            subscriber.send(&payload(
                "__authenticated",
                json!({ "uid": subscriber.uid() }),
            ));
        }
        None => {
            subscriber.send(&error_payload(Status::Unauthorized));
        }
    }
    Flow::Continue
}

/// `subscribe {channel, hidden?}` - join a channel.
fn subscribe(vhost: &Arc<Vhost>, subscriber: &Arc<Subscriber>, data: &Map<String, Value>) -> Flow {
    let name = match data.get("channel").and_then(Value::as_str) {
        Some(name) => name,
        None => {
            subscriber.send(&error_payload(Status::BadRequest));
            return Flow::Continue;
        }
    };
    let hidden = data.get("hidden").and_then(Value::as_bool).unwrap_or(false);
    match vhost.subscribe(name, subscriber, hidden) {
        Ok(channel) => {
            let mut reply = json!({ "channel": name });
            if channel.kind() == ChannelKind::Presence {
                reply["subscribers"] = Value::from(channel.presence_members());
            }
            subscriber.send(&payload("__subscribed", reply));
        }
        Err(err) => {
            subscriber.send(&error_payload(err.status()));
        }
    }
    Flow::Continue
}

/// `unsubscribe {channel}` - leave a channel.
fn unsubscribe(
    vhost: &Arc<Vhost>,
    subscriber: &Arc<Subscriber>,
    data: &Map<String, Value>,
) -> Flow {
    let name = match data.get("channel").and_then(Value::as_str) {
        Some(name) => name,
        None => {
            subscriber.send(&error_payload(Status::BadRequest));
            return Flow::Continue;
        }
    };
    match vhost.unsubscribe(name, subscriber) {
        Ok(()) => {
            subscriber.send(&payload("__unsubscribed", json!({ "channel": name })));
        }
        Err(err) => {
            subscriber.send(&error_payload(err.status()));
        }
    }
    Flow::Continue
}

/// `broadcast {channel, event, data?}` - send to the channel's other
/// subscribers. Requires being subscribed to the channel.
fn broadcast(vhost: &Arc<Vhost>, subscriber: &Arc<Subscriber>, data: &Map<String, Value>) -> Flow {
    let (channel_name, event_name, event_data) = match broadcast_args(data) {
        Some(args) => args,
        None => {
            subscriber.send(&error_payload(Status::BadRequest));
            return Flow::Continue;
        }
    };
    if !subscriber.is_subscribed_to(channel_name) {
        subscriber.send(&error_payload(Status::Forbidden));
        return Flow::Continue;
    }
    match vhost.channel(channel_name) {
        Ok(channel) => {
            channel.broadcast(event_name, &event_data, Some(subscriber.sid()));
        }
        Err(err) => {
            subscriber.send(&error_payload(err.status()));
        }
    }
    Flow::Continue
}

/// `trigger {channel, event, data?}` - hand an event to the vhost's
/// backend workers. Requires being subscribed to the named channel.
fn trigger(vhost: &Arc<Vhost>, subscriber: &Arc<Subscriber>, data: &Map<String, Value>) -> Flow {
    let (channel_name, event_name, event_data) = match broadcast_args(data) {
        Some(args) => args,
        None => {
            subscriber.send(&error_payload(Status::BadRequest));
            return Flow::Continue;
        }
    };
    if !subscriber.is_subscribed_to(channel_name) {
        subscriber.send(&error_payload(Status::Forbidden));
        return Flow::Continue;
    }
    vhost.trigger_workers(&Event::new(event_name, event_data));
    Flow::Continue
}

fn broadcast_args(data: &Map<String, Value>) -> Option<(&str, &str, Map<String, Value>)> {
    let channel = data.get("channel").and_then(Value::as_str)?;
    let event = data.get("event").and_then(Value::as_str)?;
    let event_data = match data.get("data") {
        Some(Value::Object(map)) => map.clone(),
        Some(_) | None => Map::new(),
    };
    Some((channel, event, event_data))
}

fn payload(name: &str, data: Value) -> String {
    json!({ name: data }).to_string()
}

fn error_payload(status: Status) -> String {
    payload(
        "__error",
        json!({ "code": status.code(), "status": status.message() }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    fn vhost() -> (Arc<Vhost>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::open(dir.path(), "test").unwrap());
        (Arc::new(Vhost::new("/test", storage).unwrap()), dir)
    }

    fn subscriber() -> (Arc<Subscriber>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Subscriber::new(tx)), rx)
    }

    fn recv(rx: &mut mpsc::UnboundedReceiver<String>) -> Event {
        Event::from_json(&rx.try_recv().expect("reply queued")).expect("valid reply")
    }

    #[test]
    fn test_malformed_frame_yields_400() {
        let (vhost, _dir) = vhost();
        let (sub, mut rx) = subscriber();
        handle_event(&vhost, &sub, "not json");
        let reply = recv(&mut rx);
        assert_eq!(reply.name, "__error");
        assert_eq!(reply.data["code"], 400);
    }

    #[test]
    fn test_subscribe_and_broadcast_flow() {
        let (vhost, _dir) = vhost();
        vhost.open_channel("chat", None).unwrap();
        let (alice, mut alice_rx) = subscriber();
        let (bob, mut bob_rx) = subscriber();

        handle_event(&vhost, &alice, r#"{"subscribe":{"channel":"chat"}}"#);
        handle_event(&vhost, &bob, r#"{"subscribe":{"channel":"chat"}}"#);
        assert_eq!(recv(&mut alice_rx).name, "__subscribed");
        assert_eq!(recv(&mut bob_rx).name, "__subscribed");

        handle_event(
            &vhost,
            &alice,
            r#"{"broadcast":{"channel":"chat","event":"said","data":{"msg":"hi"}}}"#,
        );
        let seen = recv(&mut bob_rx);
        assert_eq!(seen.name, "said");
        assert_eq!(seen.data["msg"], "hi");
        // The originator does not hear itself.
        assert!(alice_rx.try_recv().is_err());
    }

    #[test]
    fn test_broadcast_requires_subscription() {
        let (vhost, _dir) = vhost();
        vhost.open_channel("chat", None).unwrap();
        let (sub, mut rx) = subscriber();
        handle_event(
            &vhost,
            &sub,
            r#"{"broadcast":{"channel":"chat","event":"x","data":{}}}"#,
        );
        assert_eq!(recv(&mut rx).data["code"], 403);
    }

    #[test]
    fn test_subscribe_missing_channel_yields_454() {
        let (vhost, _dir) = vhost();
        let (sub, mut rx) = subscriber();
        handle_event(&vhost, &sub, r#"{"subscribe":{"channel":"nope"}}"#);
        assert_eq!(recv(&mut rx).data["code"], 454);
    }

    #[test]
    fn test_auth_consumes_token_once() {
        let (vhost, _dir) = vhost();
        let token = vhost.generate_single_access_token("joe", ".*").unwrap();
        let (first, mut first_rx) = subscriber();
        let (second, mut second_rx) = subscriber();

        let frame = format!(r#"{{"auth":{{"token":"{}"}}}}"#, token);
        handle_event(&vhost, &first, &frame);
        let reply = recv(&mut first_rx);
        assert_eq!(reply.name, "__authenticated");
        assert_eq!(reply.data["uid"], "joe");

        // The same token a second time is dead.
        handle_event(&vhost, &second, &frame);
        assert_eq!(recv(&mut second_rx).data["code"], 402);
    }

    #[test]
    fn test_private_channel_needs_auth() {
        let (vhost, _dir) = vhost();
        vhost.open_channel("private-vip", None).unwrap();
        let (sub, mut rx) = subscriber();

        handle_event(&vhost, &sub, r#"{"subscribe":{"channel":"private-vip"}}"#);
        assert_eq!(recv(&mut rx).data["code"], 402);

        let token = vhost
            .generate_single_access_token("joe", "private-.*")
            .unwrap();
        handle_event(
            &vhost,
            &sub,
            &format!(r#"{{"auth":{{"token":"{}"}}}}"#, token),
        );
        assert_eq!(recv(&mut rx).name, "__authenticated");

        handle_event(&vhost, &sub, r#"{"subscribe":{"channel":"private-vip"}}"#);
        assert_eq!(recv(&mut rx).name, "__subscribed");
    }

    #[test]
    fn test_trigger_reaches_workers() {
        let (vhost, _dir) = vhost();
        vhost.open_channel("foo", None).unwrap();
        let (sub, mut rx) = subscriber();
        handle_event(&vhost, &sub, r#"{"subscribe":{"channel":"foo"}}"#);
        assert_eq!(recv(&mut rx).name, "__subscribed");

        let (worker_tx, mut worker_rx) = mpsc::channel(4);
        vhost.lobby().add(Arc::new(crate::lobby::Worker::new(
            uuid::Uuid::new_v4(),
            "dlr:/test:t:id".into(),
            worker_tx,
        )));

        handle_event(
            &vhost,
            &sub,
            r#"{"trigger":{"channel":"foo","event":"test","data":{"foo":"bar"}}}"#,
        );
        let packet = worker_rx.try_recv().unwrap();
        assert_eq!(packet.frames[0], "TR");
        let event = Event::from_json(&packet.frames[1]).unwrap();
        assert_eq!(event.name, "test");
        assert_eq!(event.data["foo"], "bar");
    }

    #[test]
    fn test_close_ends_session() {
        let (vhost, _dir) = vhost();
        let (sub, mut rx) = subscriber();
        assert!(matches!(
            handle_event(&vhost, &sub, r#"{"close":{}}"#),
            Flow::Close
        ));
        assert_eq!(recv(&mut rx).name, "__closed");
    }
}
