//! The browser-facing WebSocket endpoint.
//!
//! The URL path of the handshake selects the vhost. Once connected, the
//! client speaks a JSON event protocol: every frame is a single-key
//! `{event: data}` object, with broker replies using `__`-prefixed event
//! names (`__connected`, `__authenticated`, `__subscribed`, `__error`, …).

mod endpoint;
mod protocol;

pub use endpoint::WebsocketEndpoint;
