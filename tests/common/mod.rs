//! Integration test infrastructure.
//!
//! Boots a complete broker in-process on ephemeral ports, with storage in a
//! temporary directory that lives as long as the harness.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use webrocket::{AdminEndpoint, BackendEndpoint, Context, Vhost, WebsocketEndpoint};
use webrocket_proto::Event;

/// A running broker plus the addresses of its endpoints.
pub struct TestBroker {
    pub ctx: Arc<Context>,
    pub backend_addr: SocketAddr,
    pub websocket_addr: SocketAddr,
    pub admin_addr: SocketAddr,
    _dir: tempfile::TempDir,
}

impl TestBroker {
    /// Boot a broker with every endpoint on an ephemeral port.
    pub async fn spawn() -> TestBroker {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut ctx = Context::new();
        ctx.set_storage_dir(dir.path()).expect("storage dir");
        ctx.set_node_name("testnode");
        ctx.lock().expect("lock");
        ctx.load().expect("load");
        ctx.generate_cookie(false).expect("cookie");
        let ctx = Arc::new(ctx);

        let any: SocketAddr = "127.0.0.1:0".parse().expect("addr");
        let backend = BackendEndpoint::bind(Arc::clone(&ctx), any, None)
            .await
            .expect("bind backend");
        let websocket = WebsocketEndpoint::bind(Arc::clone(&ctx), any, None)
            .await
            .expect("bind websocket");
        let admin = AdminEndpoint::bind(Arc::clone(&ctx), any)
            .await
            .expect("bind admin");

        let backend_addr = backend.local_addr().expect("backend addr");
        let websocket_addr = websocket.local_addr().expect("websocket addr");
        let admin_addr = admin.local_addr().expect("admin addr");
        tokio::spawn(backend.run());
        tokio::spawn(websocket.run());
        tokio::spawn(admin.run());

        TestBroker {
            ctx,
            backend_addr,
            websocket_addr,
            admin_addr,
            _dir: dir,
        }
    }

    /// Backend URL for a vhost, carrying its current access token.
    pub fn backend_url(&self, vhost: &Arc<Vhost>) -> String {
        format!(
            "wr://{}@{}{}",
            vhost.access_token(),
            self.backend_addr,
            vhost.path()
        )
    }

    /// Backend URL with a deliberately wrong token.
    pub fn backend_url_with_token(&self, path: &str, token: &str) -> String {
        format!("wr://{}@{}{}", token, self.backend_addr, path)
    }

    /// Admin URL for a path.
    pub fn admin_url(&self, path: &str) -> String {
        format!("http://{}{}", self.admin_addr, path)
    }

    pub fn kill(&self) {
        self.ctx.kill();
    }
}

/// Minimal frontend client for the WebSocket protocol.
pub struct TestFrontend {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    pub sid: String,
}

impl TestFrontend {
    /// Connect to a vhost and consume the `__connected` greeting.
    pub async fn connect(broker: &TestBroker, vhost_path: &str) -> TestFrontend {
        let url = format!("ws://{}{}", broker.websocket_addr, vhost_path);
        let (ws, _) = connect_async(url.as_str()).await.expect("websocket connect");
        let mut frontend = TestFrontend {
            ws,
            sid: String::new(),
        };
        let greeting = frontend.recv().await;
        assert_eq!(greeting.name, "__connected");
        frontend.sid = greeting.data["sid"].as_str().unwrap_or_default().to_string();
        frontend
    }

    /// Send one raw protocol frame.
    pub async fn send(&mut self, frame: &str) {
        self.ws
            .send(WsMessage::Text(frame.to_string()))
            .await
            .expect("websocket send");
    }

    /// Read the next event frame, skipping non-text traffic.
    pub async fn recv(&mut self) -> Event {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), self.ws.next())
                .await
                .expect("timed out waiting for frame")
                .expect("connection closed")
                .expect("websocket error");
            if let WsMessage::Text(raw) = message {
                return Event::from_json(&raw).expect("valid protocol frame");
            }
        }
    }
}

/// Poll until `check` passes or a deadline expires.
pub async fn wait_until<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {}", what);
}
