//! Length-delimited framing for multipart messages over a byte stream.
//!
//! Wire layout: a `u32` big-endian body length, then the body — each frame as
//! its own `u32` length followed by the frame bytes. The frame count is
//! implied by the body length, so zero-frame and zero-length frames both
//! round-trip.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::wire::WireMessage;

/// Upper bound on a single multipart message (header + payload frames).
const MAX_MESSAGE_SIZE: usize = 8 * 1024 * 1024;

/// Codec turning a TCP stream into a sequence of [`WireMessage`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct MultipartCodec;

impl MultipartCodec {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for MultipartCodec {
    type Item = WireMessage;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<WireMessage>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let body_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if body_len > MAX_MESSAGE_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("message of {body_len} bytes exceeds limit"),
            ));
        }
        if src.len() < 4 + body_len {
            src.reserve(4 + body_len - src.len());
            return Ok(None);
        }
        src.advance(4);
        let mut body = src.split_to(body_len);

        let mut frames: Vec<Bytes> = Vec::new();
        while !body.is_empty() {
            if body.len() < 4 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "truncated frame header",
                ));
            }
            let frame_len = body.get_u32() as usize;
            if body.len() < frame_len {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "frame length exceeds message body",
                ));
            }
            frames.push(body.split_to(frame_len).freeze());
        }
        Ok(Some(WireMessage::from_frames(frames)))
    }
}

impl Encoder<WireMessage> for MultipartCodec {
    type Error = io::Error;

    fn encode(&mut self, msg: WireMessage, dst: &mut BytesMut) -> io::Result<()> {
        let body_len: usize = msg.iter().map(|f| 4 + f.len()).sum();
        if body_len > MAX_MESSAGE_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("message of {body_len} bytes exceeds limit"),
            ));
        }
        dst.reserve(4 + body_len);
        dst.put_u32(body_len as u32);
        for frame in msg.iter() {
            dst.put_u32(frame.len() as u32);
            dst.extend_from_slice(frame);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_round_trip() {
        let mut codec = MultipartCodec::new();
        let mut buf = BytesMut::new();
        let msg = WireMessage::from_str_frames(&["shell", "", "payload"]);
        codec.encode(msg.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_input_waits() {
        let mut codec = MultipartCodec::new();
        let mut full = BytesMut::new();
        let msg = WireMessage::from_str_frames(&["control", "stop"]);
        codec.encode(msg.clone(), &mut full).unwrap();

        // Feed one byte at a time; nothing decodes until the last byte.
        let mut buf = BytesMut::new();
        let total = full.len();
        for (i, byte) in full.iter().enumerate() {
            buf.put_u8(*byte);
            let out = codec.decode(&mut buf).unwrap();
            if i + 1 < total {
                assert!(out.is_none());
            } else {
                assert_eq!(out.unwrap(), msg);
            }
        }
    }

    #[test]
    fn test_two_messages_in_one_buffer() {
        let mut codec = MultipartCodec::new();
        let mut buf = BytesMut::new();
        let first = WireMessage::from_str_frames(&["a"]);
        let second = WireMessage::from_str_frames(&["b", "c"]);
        codec.encode(first.clone(), &mut buf).unwrap();
        codec.encode(second.clone(), &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), first);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), second);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversized_message_rejected() {
        let mut codec = MultipartCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(u32::MAX);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_corrupt_frame_length_rejected() {
        let mut codec = MultipartCodec::new();
        let mut buf = BytesMut::new();
        // Body claims 8 bytes, frame inside claims 100.
        buf.put_u32(8);
        buf.put_u32(100);
        buf.put_u32(0);
        assert!(codec.decode(&mut buf).is_err());
    }
}
