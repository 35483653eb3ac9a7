//! Accept loop for the WebSocket endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::context::Context;

use super::protocol;

/// TCP listener upgrading connections to WebSocket sessions.
pub struct WebsocketEndpoint {
    listener: TcpListener,
    ctx: Arc<Context>,
    tls: Option<TlsAcceptor>,
    cancel: CancellationToken,
}

impl WebsocketEndpoint {
    pub async fn bind(
        ctx: Arc<Context>,
        addr: SocketAddr,
        tls: Option<TlsAcceptor>,
    ) -> std::io::Result<WebsocketEndpoint> {
        let listener = TcpListener::bind(addr).await?;
        let cancel = ctx.cancel_token().child_token();
        info!(addr = %listener.local_addr()?, tls = tls.is_some(), "websocket endpoint listening");
        Ok(WebsocketEndpoint {
            listener,
            ctx,
            tls,
            cancel,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn kill(&self) {
        self.cancel.cancel();
    }

    /// Accept connections until killed.
    pub async fn run(self) {
        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    let ctx = Arc::clone(&self.ctx);
                    let cancel = self.cancel.clone();
                    let tls = self.tls.clone();
                    tokio::spawn(async move {
                        match tls {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(stream) => serve(ctx, stream, addr, cancel).await,
                                Err(err) => {
                                    debug!(%addr, error = %err, "tls handshake failed")
                                }
                            },
                            None => serve(ctx, stream, addr, cancel).await,
                        }
                    });
                }
                Err(err) => error!(error = %err, "websocket accept failed"),
            }
        }
        debug!("websocket endpoint stopped");
    }
}

async fn serve<S>(ctx: Arc<Context>, stream: S, addr: SocketAddr, cancel: CancellationToken)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut path = String::new();
    let callback = |req: &Request, resp: Response| {
        path = req.uri().path().to_string();
        Ok(resp)
    };
    let ws = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(err) => {
            debug!(%addr, error = %err, "websocket handshake failed");
            return;
        }
    };
    match ctx.vhost(&path) {
        Ok(vhost) => {
            debug!(%addr, vhost = %path, "websocket session started");
            protocol::serve(vhost, ws, cancel).await;
            debug!(%addr, vhost = %path, "websocket session ended");
        }
        Err(_) => {
            debug!(%addr, vhost = %path, "websocket connect to unknown vhost");
            protocol::reject_unknown_vhost(ws).await;
        }
    }
}
