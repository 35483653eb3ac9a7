//! # kosmonaut
//!
//! Backend client library for WebRocket.
//!
//! Two socket types talk to the broker's backend endpoint, addressed by a
//! `wr://` URL carrying the vhost access token:
//!
//! - [`Client`] is a REQ-style socket: one short-lived connection per
//!   operation, a single request and a single reply. Used to open and close
//!   channels, broadcast events and request single-use access tokens.
//! - [`Worker`] is a DLR-style socket: one long-lived connection announced
//!   with `RD`, kept alive with heartbeats, delivering triggered events as a
//!   lazy stream of [`Message`]s. The worker reconnects on any transport
//!   failure and terminates only on `stop()` or a 402 from the broker.
//!
//! ```no_run
//! # async fn demo() -> Result<(), kosmonaut::Error> {
//! let client = kosmonaut::Client::new("wr://token@127.0.0.1:8081/hello")?;
//! client.open_channel("world").await?;
//!
//! let worker = kosmonaut::Worker::new("wr://token@127.0.0.1:8081/hello")?;
//! let mut messages = worker.run();
//! while let Some(message) = messages.recv().await {
//!     match message {
//!         kosmonaut::Message::Event(event) => println!("{}", event.name),
//!         kosmonaut::Message::Error(err) => eprintln!("{}", err),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
mod message;
mod socket;
mod worker;

pub use client::Client;
pub use error::Error;
pub use message::Message;
pub use webrocket_proto::{Event, Status};
pub use worker::{Worker, WorkerConfig};
