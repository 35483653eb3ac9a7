//! Messages delivered by a [`Worker`](crate::Worker).

use webrocket_proto::Event;

use crate::error::Error;

/// A single item from a worker's message stream.
///
/// Heartbeats and reconnects are handled inside the worker loop and never
/// show up here.
#[derive(Debug)]
pub enum Message {
    /// An event triggered on the broker.
    Event(Event),
    /// An error reported by the broker, or a payload it failed to parse.
    Error(Error),
}

impl Message {
    /// The event, when this message carries one.
    pub fn event(&self) -> Option<&Event> {
        match self {
            Message::Event(event) => Some(event),
            Message::Error(_) => None,
        }
    }

    /// The error, when this message carries one.
    pub fn error(&self) -> Option<&Error> {
        match self {
            Message::Error(err) => Some(err),
            Message::Event(_) => None,
        }
    }
}

/// Parse the payload of a `TR` frame into a message.
///
/// A trigger carries exactly one frame: the `{event: data}` JSON object.
pub(crate) fn parse_trigger(frames: &[String]) -> Message {
    if frames.len() != 1 {
        return Message::Error(Error::InvalidMessage);
    }
    match Event::from_json(&frames[0]) {
        Ok(event) => Message::Event(event),
        Err(_) => Message::Error(Error::InvalidMessage),
    }
}
