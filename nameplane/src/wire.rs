//! Frame format for packets on a byte stream.
//!
//! Frame format: `<length>:<payload>`
//!
//! - **length**: payload size in bytes, ASCII decimal
//! - **payload**: one JSON-encoded [`ReconfigPacket`](crate::packet::ReconfigPacket)
//!
//! [`try_decode_frame`] works on a growing receive buffer: it returns
//! `Ok(None)` until a whole frame is buffered, then splits it off.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, PacketError};
use crate::packet::{self, ReconfigPacket};

/// Maximum payload size (1MB).
///
/// Larger frames are rejected before they are buffered.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Longest accepted length prefix, in digits.
const MAX_PREFIX_DIGITS: usize = 7;

/// Wrap a payload in a frame.
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, FrameError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    let prefix = payload.len().to_string();
    let mut buf = BytesMut::with_capacity(prefix.len() + 1 + payload.len());
    buf.put_slice(prefix.as_bytes());
    buf.put_u8(b':');
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Split the next complete frame's payload off the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed; `buf` is left untouched
/// in that case.
pub fn try_decode_frame(buf: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
    let Some(colon) = buf.iter().position(|b| *b == b':') else {
        if buf.len() > MAX_PREFIX_DIGITS || !buf.iter().all(u8::is_ascii_digit) {
            return Err(FrameError::InvalidLength(
                String::from_utf8_lossy(&buf[..]).into_owned(),
            ));
        }
        return Ok(None);
    };
    let length = parse_length(&buf[..colon])?;
    if buf.len() < colon + 1 + length {
        return Ok(None);
    }
    buf.advance(colon + 1);
    Ok(Some(buf.split_to(length).freeze()))
}

/// Payload of a buffer holding exactly one frame.
pub fn decode_frame(frame: &[u8]) -> Result<&[u8], FrameError> {
    let colon = frame
        .iter()
        .position(|b| *b == b':')
        .ok_or_else(|| FrameError::InvalidLength(String::from_utf8_lossy(frame).into_owned()))?;
    let length = parse_length(&frame[..colon])?;
    let payload = &frame[colon + 1..];
    if payload.len() != length {
        return Err(FrameError::LengthMismatch {
            declared: length,
            actual: payload.len(),
        });
    }
    Ok(payload)
}

/// Encode and frame a packet.
pub fn encode_packet(packet: &ReconfigPacket) -> Result<Bytes, PacketError> {
    let payload = packet::encode(packet)?;
    Ok(encode_frame(&payload)?)
}

/// Unframe and decode a packet.
pub fn decode_packet(frame: &[u8]) -> Result<ReconfigPacket, PacketError> {
    packet::decode(decode_frame(frame)?)
}

fn parse_length(prefix: &[u8]) -> Result<usize, FrameError> {
    let invalid = || FrameError::InvalidLength(String::from_utf8_lossy(prefix).into_owned());
    if prefix.is_empty() || prefix.len() > MAX_PREFIX_DIGITS || !prefix.iter().all(u8::is_ascii_digit)
    {
        return Err(invalid());
    }
    let length: usize = std::str::from_utf8(prefix)
        .map_err(|_| invalid())?
        .parse()
        .map_err(|_| invalid())?;
    if length > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge {
            size: length,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(length)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::GroupChange;
    use crate::types::{NodeId, RequestId, Version};

    #[test]
    fn test_encode_frame_layout() {
        let frame = encode_frame(b"{\"a\":1}").expect("encode");
        assert_eq!(&frame[..], b"7:{\"a\":1}");
        assert_eq!(decode_frame(&frame).expect("decode"), b"{\"a\":1}");
    }

    #[test]
    fn test_try_decode_partial_then_complete() {
        let mut buf = BytesMut::new();
        buf.put_slice(b"5:he");
        assert_eq!(try_decode_frame(&mut buf).expect("partial"), None);
        assert_eq!(buf.len(), 4);

        buf.put_slice(b"llo3:abc");
        let first = try_decode_frame(&mut buf).expect("first").expect("complete");
        assert_eq!(&first[..], b"hello");
        let second = try_decode_frame(&mut buf).expect("second").expect("complete");
        assert_eq!(&second[..], b"abc");
        assert!(buf.is_empty());
        assert_eq!(try_decode_frame(&mut buf).expect("empty"), None);
    }

    #[test]
    fn test_length_prefix_still_arriving() {
        let mut buf = BytesMut::from(&b"12"[..]);
        assert_eq!(try_decode_frame(&mut buf).expect("prefix"), None);
    }

    #[test]
    fn test_invalid_frames() {
        let mut buf = BytesMut::from(&b"x1:a"[..]);
        assert!(matches!(
            try_decode_frame(&mut buf),
            Err(FrameError::InvalidLength(_))
        ));

        let mut buf = BytesMut::from(&b"abc"[..]);
        assert!(matches!(
            try_decode_frame(&mut buf),
            Err(FrameError::InvalidLength(_))
        ));

        let mut buf = BytesMut::from(&b"9999999:"[..]);
        assert!(matches!(
            try_decode_frame(&mut buf),
            Err(FrameError::TooLarge { .. })
        ));

        assert!(matches!(
            decode_frame(b"5:abc"),
            Err(FrameError::LengthMismatch {
                declared: 5,
                actual: 3
            })
        ));
    }

    #[test]
    fn test_packet_through_frame() {
        let packet = ReconfigPacket::GroupChangeComplete(GroupChange {
            name: "n1".into(),
            request_id: RequestId::compose(NodeId(1), 3),
            proposer: NodeId(1),
            version: Version::new(2),
        });
        let frame = encode_packet(&packet).expect("encode");
        assert_eq!(decode_packet(&frame).expect("decode"), packet);
    }
}
