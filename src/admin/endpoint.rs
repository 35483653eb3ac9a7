//! HTTP server for the admin surface.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::context::Context;

use super::handler;

/// The admin HTTP endpoint, bound to one context.
pub struct AdminEndpoint {
    listener: TcpListener,
    ctx: Arc<Context>,
    cancel: CancellationToken,
}

impl AdminEndpoint {
    pub async fn bind(ctx: Arc<Context>, addr: SocketAddr) -> std::io::Result<AdminEndpoint> {
        let listener = TcpListener::bind(addr).await?;
        let cancel = ctx.cancel_token().child_token();
        info!(addr = %listener.local_addr()?, "admin endpoint listening");
        Ok(AdminEndpoint {
            listener,
            ctx,
            cancel,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn kill(&self) {
        self.cancel.cancel();
    }

    /// Serve requests until killed.
    pub async fn run(self) {
        let router = handler::router(self.ctx);
        let cancel = self.cancel;
        let shutdown = async move { cancel.cancelled().await };
        if let Err(err) = axum::serve(self.listener, router)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!(error = %err, "admin endpoint failed");
        }
        debug!("admin endpoint stopped");
    }
}
