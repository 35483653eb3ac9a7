//! # webrocket-proto
//!
//! Wire protocol for the WebRocket backend endpoint.
//!
//! Backend applications talk to the broker over a line-oriented TCP framing:
//! a message is a sequence of `\n`-separated frames terminated by a
//! `\r\n\r\n` sentinel appearing as its own line. The first frame may carry
//! the sender's identity (`kind:vhost:token:uuid`), separated from the
//! payload by an empty frame.
//!
//! ```text
//! req:/hello:8f0a…:550e8400-…\n
//! \n
//! BC\n
//! chat\n
//! greeting\n
//! {"who":"joe"}\n
//! \r\n\r\n
//! ```
//!
//! The crate provides the tokio codec for this framing ([`FrameCodec`]),
//! identity parsing ([`Identity`]), the status code taxonomy ([`Status`])
//! and the single-key event payload format ([`Event`]).

pub mod codec;
pub mod event;
pub mod identity;
pub mod status;

pub use codec::{FrameCodec, Packet, ProtocolError, MAX_MESSAGE_LEN};
pub use event::Event;
pub use identity::{Identity, SocketKind};
pub use status::Status;
