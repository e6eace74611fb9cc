//! Multipart wire messages and the internal routing-key convention.
//!
//! Every message crossing an internal duplex channel between the dispatcher
//! and a subshell worker carries a leading routing-key frame naming which of
//! the three logical streams it belongs to: `shell`, `control`, or `stdin`.
//! Public-channel traffic never carries a routing key — it is addressed by the
//! per-connection identity frame the transport prepends instead.

use std::collections::VecDeque;
use std::fmt;

use bytes::Bytes;

/// One of the three logical streams multiplexed over an internal channel.
///
/// A closed enum rather than a free-form string so an unrecognized key on the
/// wire is a checked case, not a silent no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingKey {
    /// Request/reply traffic for the public shell channel.
    Shell,
    /// Control-plane traffic (interrupts, stop, subshell administration).
    Control,
    /// Synchronous input requests from a subshell to its client.
    Stdin,
}

impl RoutingKey {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Shell => "shell",
            Self::Control => "control",
            Self::Stdin => "stdin",
        }
    }

    /// Parse a wire frame into a routing key. `None` for anything unknown.
    #[must_use]
    pub fn from_bytes(frame: &[u8]) -> Option<Self> {
        match frame {
            b"shell" => Some(Self::Shell),
            b"control" => Some(Self::Control),
            b"stdin" => Some(Self::Stdin),
            _ => None,
        }
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw multipart message: an ordered sequence of opaque byte frames.
///
/// The payload frames are never interpreted by the routing core; only leading
/// frames (routing key on internal traffic, connection identity on public
/// traffic) are pushed and popped as messages move between channels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WireMessage {
    frames: VecDeque<Bytes>,
}

impl WireMessage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_frames(frames: Vec<Bytes>) -> Self {
        Self {
            frames: frames.into(),
        }
    }

    /// Build a message from UTF-8 string frames (control-plane payloads).
    #[must_use]
    pub fn from_str_frames(frames: &[&str]) -> Self {
        Self {
            frames: frames
                .iter()
                .map(|s| Bytes::copy_from_slice(s.as_bytes()))
                .collect(),
        }
    }

    /// Append a frame at the back.
    pub fn push(&mut self, frame: Bytes) {
        self.frames.push_back(frame);
    }

    /// Prepend a frame at the front.
    pub fn push_front(&mut self, frame: Bytes) {
        self.frames.push_front(frame);
    }

    /// Prepend a UTF-8 string frame at the front.
    pub fn push_front_str(&mut self, s: &str) {
        self.push_front(Bytes::copy_from_slice(s.as_bytes()));
    }

    pub fn pop_front(&mut self) -> Option<Bytes> {
        self.frames.pop_front()
    }

    /// View frame `index` as UTF-8, if present and valid.
    #[must_use]
    pub fn peek_str(&self, index: usize) -> Option<&str> {
        self.frames
            .get(index)
            .and_then(|f| std::str::from_utf8(f).ok())
    }

    /// Pop the leading frame and interpret it as UTF-8.
    pub fn pop_front_str(&mut self) -> Option<String> {
        self.pop_front()
            .and_then(|f| String::from_utf8(f.to_vec()).ok())
    }

    /// Prepend a routing-key frame.
    pub fn tag(&mut self, key: RoutingKey) {
        self.push_front_str(key.as_str());
    }

    /// Pop the leading frame and parse it as a routing key.
    ///
    /// Consumes the frame even when it does not parse — a message with an
    /// unrecognized key is unroutable and is dropped by every caller.
    pub fn pop_routing_key(&mut self) -> Option<RoutingKey> {
        self.pop_front().and_then(|f| RoutingKey::from_bytes(&f))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bytes> {
        self.frames.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}
