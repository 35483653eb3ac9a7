//! Tokio codec for the backend framing.
//!
//! A message is a sequence of `\n`-terminated frames followed by the
//! four-byte sentinel `\r\n\r\n` on its own line. The decoder accumulates
//! frames until the sentinel (two consecutive `\r` lines) is seen, then
//! yields them as one message. Lines consisting of a lone `\r` never appear
//! as frames.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::identity::InvalidIdentity;
use crate::status::Status;

/// Upper bound for a single backend message, sentinel included.
pub const MAX_MESSAGE_LEN: usize = 64 * 1024;

/// Protocol-level failures raised by the codec and message parsing.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("bad request")]
    BadRequest,

    #[error("end of file before message terminator")]
    Eof,

    #[error("message too long: {actual} bytes (limit {limit})")]
    MessageTooLong { actual: usize, limit: usize },

    #[error("invalid identity: {0}")]
    Identity(#[from] InvalidIdentity),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// The wire status this failure maps to in an `ER` reply.
    pub fn status(&self) -> Status {
        match self {
            ProtocolError::BadRequest => Status::BadRequest,
            ProtocolError::Eof => Status::EndOfFile,
            ProtocolError::MessageTooLong { .. } => Status::BadRequest,
            ProtocolError::Identity(_) => Status::BadRequest,
            ProtocolError::Io(_) => Status::InternalError,
        }
    }
}

/// A decoded backend message: optional sender identity plus payload frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Raw identity frame, when the sender attached one.
    pub identity: Option<String>,
    /// Payload frames, command first.
    pub frames: Vec<String>,
}

impl Packet {
    /// A packet without an identity prefix.
    pub fn new<I, S>(frames: I) -> Packet
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Packet {
            identity: None,
            frames: frames.into_iter().map(Into::into).collect(),
        }
    }

    /// A packet carrying the sender's identity.
    pub fn with_identity<I, S>(identity: impl ToString, frames: I) -> Packet
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Packet {
            identity: Some(identity.to_string()),
            frames: frames.into_iter().map(Into::into).collect(),
        }
    }

    /// Split raw frames into identity and payload.
    ///
    /// If the second frame is empty, the first frame is the sender identity
    /// and the payload starts at the third frame; otherwise the payload is
    /// the whole message. A message with no payload frame is a bad request.
    pub fn parse(frames: Vec<String>) -> Result<Packet, ProtocolError> {
        if frames.is_empty() {
            return Err(ProtocolError::BadRequest);
        }
        let packet = if frames.len() >= 3 && frames[1].is_empty() {
            let mut frames = frames;
            let rest = frames.split_off(2);
            let identity = frames.swap_remove(0);
            Packet {
                identity: Some(identity),
                frames: rest,
            }
        } else {
            Packet {
                identity: None,
                frames,
            }
        };
        if packet.frames.is_empty() {
            return Err(ProtocolError::BadRequest);
        }
        Ok(packet)
    }
}

/// Codec turning a byte stream into frame vectors and back.
///
/// Decoder state survives partial reads; one `FrameCodec` must not be shared
/// between connections.
pub struct FrameCodec {
    frames: Vec<String>,
    possible_eom: bool,
    consumed: usize,
    max_len: usize,
}

impl FrameCodec {
    /// Codec with the default message size limit.
    pub fn new() -> FrameCodec {
        FrameCodec::with_max_len(MAX_MESSAGE_LEN)
    }

    /// Codec with a custom message size limit.
    pub fn with_max_len(max_len: usize) -> FrameCodec {
        FrameCodec {
            frames: Vec::new(),
            possible_eom: false,
            consumed: 0,
            max_len,
        }
    }

    fn check_len(&self, pending: usize) -> Result<(), ProtocolError> {
        let actual = self.consumed + pending;
        if actual > self.max_len {
            return Err(ProtocolError::MessageTooLong {
                actual,
                limit: self.max_len,
            });
        }
        Ok(())
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        FrameCodec::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Vec<String>;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Vec<String>>, ProtocolError> {
        loop {
            let newline = match src.iter().position(|b| *b == b'\n') {
                Some(pos) => pos,
                None => {
                    self.check_len(src.len())?;
                    return Ok(None);
                }
            };
            let line = src.split_to(newline + 1);
            self.consumed += line.len();
            self.check_len(0)?;

            let chunk = &line[..line.len() - 1];
            if chunk == b"\r" {
                if self.possible_eom {
                    self.possible_eom = false;
                    self.consumed = 0;
                    return Ok(Some(std::mem::take(&mut self.frames)));
                }
                self.possible_eom = true;
                continue;
            }
            self.possible_eom = false;
            let frame =
                String::from_utf8(chunk.to_vec()).map_err(|_| ProtocolError::BadRequest)?;
            self.frames.push(frame);
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Vec<String>>, ProtocolError> {
        match self.decode(src)? {
            Some(frames) => Ok(Some(frames)),
            None => {
                if src.is_empty() && self.frames.is_empty() && !self.possible_eom {
                    Ok(None)
                } else {
                    Err(ProtocolError::Eof)
                }
            }
        }
    }
}

impl Encoder<Packet> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let mut len = packet.frames.iter().map(|f| f.len() + 1).sum::<usize>() + 4;
        if let Some(identity) = &packet.identity {
            len += identity.len() + 2;
        }
        dst.reserve(len);
        if let Some(identity) = &packet.identity {
            dst.put_slice(identity.as_bytes());
            dst.put_slice(b"\n\n");
        }
        for (i, frame) in packet.frames.iter().enumerate() {
            if i > 0 {
                dst.put_u8(b'\n');
            }
            dst.put_slice(frame.as_bytes());
        }
        dst.put_slice(b"\n\r\n\r\n");
        Ok(())
    }
}
