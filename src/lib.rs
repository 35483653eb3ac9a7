//! WebRocket - a real-time pub/sub message broker.
//!
//! Browsers connect over WebSockets and subscribe to named channels;
//! backend applications connect over the TCP framing from
//! `webrocket-proto` to manage channels, broadcast events, issue
//! single-use access tokens and attach long-lived workers. An HTTP admin
//! surface manages vhosts and channels.
//!
//! The [`Context`] owns everything: build one, point it at a storage
//! directory, lock and load it, then hand it to the three endpoints.
//!
//! ```no_run
//! # async fn boot() -> anyhow::Result<()> {
//! use std::sync::Arc;
//! use webrocket::{AdminEndpoint, BackendEndpoint, Context, WebsocketEndpoint};
//!
//! let mut ctx = Context::new();
//! ctx.set_storage_dir(std::path::Path::new("/var/lib/webrocket"))?;
//! ctx.lock()?;
//! ctx.load()?;
//! ctx.generate_cookie(false)?;
//! let ctx = Arc::new(ctx);
//!
//! let backend = BackendEndpoint::bind(Arc::clone(&ctx), "0.0.0.0:8081".parse()?, None).await?;
//! let websocket = WebsocketEndpoint::bind(Arc::clone(&ctx), "0.0.0.0:8080".parse()?, None).await?;
//! let admin = AdminEndpoint::bind(Arc::clone(&ctx), "0.0.0.0:8082".parse()?).await?;
//! tokio::spawn(backend.run());
//! tokio::spawn(websocket.run());
//! tokio::spawn(admin.run());
//! # Ok(())
//! # }
//! ```

pub mod admin;
pub mod backend;
pub mod channel;
pub mod config;
pub mod context;
pub mod error;
pub mod lobby;
pub mod permission;
pub mod storage;
pub mod subscriber;
pub mod token;
pub mod vhost;
pub mod websocket;

pub use admin::AdminEndpoint;
pub use backend::BackendEndpoint;
pub use channel::{Channel, ChannelKind};
pub use context::Context;
pub use error::{EngineError, StorageError};
pub use lobby::Lobby;
pub use permission::Permission;
pub use subscriber::Subscriber;
pub use vhost::Vhost;
pub use websocket::WebsocketEndpoint;

/// Version of the broker.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
