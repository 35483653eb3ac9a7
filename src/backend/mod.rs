//! The backend TCP endpoint.
//!
//! Backend applications connect here with the framing from
//! `webrocket-proto`. Two session shapes share the listener, picked by the
//! identity prefix of the first message:
//!
//! - `req` connections are short-lived: one command (`OC`, `CC`, `BC`,
//!   `AT`), one reply, close.
//! - `dlr` connections announce with `RD` and stay: the broker registers
//!   them in the vhost's lobby, keeps them alive with heartbeats and feeds
//!   them `TR` frames for every accepted event.

mod dispatcher;
mod endpoint;
mod worker;

pub use endpoint::BackendEndpoint;

/// End-to-end deadline for a synchronous client request.
pub const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Cadence of broker heartbeats towards workers.
pub const HEARTBEAT_INTERVAL: std::time::Duration = std::time::Duration::from_millis(500);
