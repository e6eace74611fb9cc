//! Kernel-message envelope: the boundary between raw multipart frames and the
//! deserialized protocol messages the rest of the server consumes.
//!
//! The routing core treats payloads as opaque; only two things are ever read
//! out of the envelope: the subshell id used for addressing, and the full
//! message when a worker explicitly deserializes it. Both go through the
//! [`Codec`] trait so the envelope format (and any signing layer around it)
//! stays outside the router.
//!
//! The wire envelope is: zero or more identity frames, the `<IDS|MSG>`
//! delimiter frame, a JSON header frame, and a JSON content frame. Identity
//! frames are preserved across deserialize/serialize so replies are routed
//! back to the originating client connection.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::wire::WireMessage;

/// Frame separating transport identities from the message body.
pub const DELIMITER: &[u8] = b"<IDS|MSG>";

/// Parsed message header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageHeader {
    pub msg_id: String,
    pub session: String,
    pub msg_type: String,
    /// Target subshell. Absent or empty addresses the default subshell.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subshell_id: Option<String>,
}

/// A deserialized kernel message.
///
/// `identities` carries the transport envelope untouched so a reply built
/// from this message reaches the same client.
#[derive(Debug, Clone)]
pub struct KernelMessage {
    pub identities: Vec<Bytes>,
    pub header: MessageHeader,
    pub content: Value,
}

/// (De)serialization collaborator for the routing core.
///
/// Implementations own the envelope format; the router only calls
/// [`Codec::subshell_id`] on public traffic and workers call
/// [`Codec::deserialize`]/[`Codec::serialize`] at the channel boundary.
pub trait Codec: Send + Sync {
    /// Parse a raw multipart message. `None` on a malformed envelope.
    fn deserialize(&self, wire: &WireMessage) -> Option<KernelMessage>;

    /// Rebuild the wire envelope, including identity frames.
    fn serialize(&self, msg: &KernelMessage) -> WireMessage;

    /// Extract the addressing token. `None` when the envelope is malformed
    /// or carries no subshell id (both route to the default subshell).
    fn subshell_id(&self, wire: &WireMessage) -> Option<String>;
}

/// Shared handle to a codec implementation.
pub type SharedCodec = Arc<dyn Codec>;

/// Plain-JSON envelope codec (no signature frame).
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    /// Split a wire message at the delimiter frame.
    ///
    /// Returns `(identities, header_frame, content_frame)`.
    fn split<'a>(wire: &'a WireMessage) -> Option<(Vec<Bytes>, &'a Bytes, Option<&'a Bytes>)> {
        let frames: Vec<&Bytes> = wire.iter().collect();
        let delim = frames.iter().position(|f| f.as_ref() == DELIMITER)?;
        let header = frames.get(delim + 1).copied()?;
        let content = frames.get(delim + 2).copied();
        let identities = frames[..delim].iter().map(|f| (*f).clone()).collect();
        Some((identities, header, content))
    }
}

impl Codec for JsonCodec {
    fn deserialize(&self, wire: &WireMessage) -> Option<KernelMessage> {
        let (identities, header_frame, content_frame) = Self::split(wire)?;
        let header: MessageHeader = serde_json::from_slice(header_frame).ok()?;
        let content = match content_frame {
            Some(frame) => serde_json::from_slice(frame).ok()?,
            None => Value::Null,
        };
        Some(KernelMessage {
            identities,
            header,
            content,
        })
    }

    fn serialize(&self, msg: &KernelMessage) -> WireMessage {
        let mut out = WireMessage::new();
        for identity in &msg.identities {
            out.push(identity.clone());
        }
        out.push(Bytes::from_static(DELIMITER));
        // Header and content are serde-built values; encoding cannot fail.
        out.push(Bytes::from(
            serde_json::to_vec(&msg.header).unwrap_or_default(),
        ));
        out.push(Bytes::from(
            serde_json::to_vec(&msg.content).unwrap_or_default(),
        ));
        out
    }

    fn subshell_id(&self, wire: &WireMessage) -> Option<String> {
        let (_, header_frame, _) = Self::split(wire)?;
        let header: MessageHeader = serde_json::from_slice(header_frame).ok()?;
        header.subshell_id.filter(|id| !id.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample(subshell_id: Option<&str>) -> KernelMessage {
        KernelMessage {
            identities: vec![Bytes::from_static(b"conn-1")],
            header: MessageHeader {
                msg_id: "m1".into(),
                session: "s1".into(),
                msg_type: "execute_request".into(),
                subshell_id: subshell_id.map(str::to_owned),
            },
            content: json!({"code": "1 + 1"}),
        }
    }

    #[test]
    fn test_round_trip_preserves_identities() {
        let codec = JsonCodec;
        let wire = codec.serialize(&sample(Some("A")));
        let msg = codec.deserialize(&wire).unwrap();
        assert_eq!(msg.identities, vec![Bytes::from_static(b"conn-1")]);
        assert_eq!(msg.header.msg_type, "execute_request");
        assert_eq!(msg.content["code"], "1 + 1");
    }

    #[test]
    fn test_subshell_id_extraction() {
        let codec = JsonCodec;
        assert_eq!(
            codec.subshell_id(&codec.serialize(&sample(Some("A")))),
            Some("A".to_string())
        );
        // Absent and empty both mean "default subshell".
        assert_eq!(codec.subshell_id(&codec.serialize(&sample(None))), None);
        assert_eq!(codec.subshell_id(&codec.serialize(&sample(Some("")))), None);
    }

    #[test]
    fn test_malformed_envelope_is_none() {
        let codec = JsonCodec;
        // No delimiter frame at all.
        let wire = WireMessage::from_str_frames(&["not", "a", "message"]);
        assert!(codec.deserialize(&wire).is_none());
        assert!(codec.subshell_id(&wire).is_none());

        // Delimiter present but header is not JSON.
        let mut wire = WireMessage::new();
        wire.push(Bytes::from_static(DELIMITER));
        wire.push(Bytes::from_static(b"garbage"));
        assert!(codec.deserialize(&wire).is_none());
    }
}
