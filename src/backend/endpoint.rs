//! Accept loop for the backend endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::context::Context;

use super::dispatcher;

/// TCP listener spawning one task per backend connection.
pub struct BackendEndpoint {
    listener: TcpListener,
    ctx: Arc<Context>,
    tls: Option<TlsAcceptor>,
    cancel: CancellationToken,
}

impl BackendEndpoint {
    /// Bind the endpoint. TLS applies to every accepted connection when an
    /// acceptor is given.
    pub async fn bind(
        ctx: Arc<Context>,
        addr: SocketAddr,
        tls: Option<TlsAcceptor>,
    ) -> std::io::Result<BackendEndpoint> {
        let listener = TcpListener::bind(addr).await?;
        let cancel = ctx.cancel_token().child_token();
        info!(addr = %listener.local_addr()?, tls = tls.is_some(), "backend endpoint listening");
        Ok(BackendEndpoint {
            listener,
            ctx,
            tls,
            cancel,
        })
    }

    /// Address the endpoint actually bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Stop accepting. Live connections are closed through the context's
    /// cancellation token.
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
                Err(err) => error!(error = %err, "backend accept failed"),
            }
        }
        debug!("backend endpoint stopped");
    }
}

async fn serve<S>(ctx: Arc<Context>, stream: S, addr: SocketAddr, cancel: CancellationToken)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    debug!(%addr, "backend connection accepted");
    dispatcher::serve(ctx, stream, addr, cancel).await;
    debug!(%addr, "backend connection closed");
}
