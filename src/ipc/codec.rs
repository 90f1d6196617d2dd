use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::MAX_FRAME_SIZE;

/// Frame type tag (§3 Frame).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Control,
    Output,
    Input,
}

impl FrameType {
    fn tag(self) -> u8 {
        match self {
            FrameType::Output => 0x00,
            FrameType::Control => 0x01,
            FrameType::Input => 0x02,
        }
    }

    fn from_tag(tag: u8) -> std::io::Result<Self> {
        match tag {
            0x00 => Ok(FrameType::Output),
            0x01 => Ok(FrameType::Control),
            0x02 => Ok(FrameType::Input),
            other => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown frame type tag {other}"),
            )),
        }
    }
}

/// A decoded frame: `(length, type, payload)` per §3/§4.A.
///
/// For [`FrameType::Output`] and [`FrameType::Input`], `payload` is itself
/// `(idLen: 1 byte) . (id: idLen bytes) . (bytes: remainder)`; use
/// [`Frame::session_scoped`] to split it back apart.
#[derive(Debug, Clone)]
pub struct Frame {
    pub frame_type: FrameType,
    pub payload: Bytes,
}

impl Frame {
    pub fn control(json: Bytes) -> Self {
        Self {
            frame_type: FrameType::Control,
            payload: json,
        }
    }

    pub fn output(session_id: &str, data: Bytes) -> Self {
        Self {
            frame_type: FrameType::Output,
            payload: encode_session_scoped(session_id, &data),
        }
    }

    pub fn input(session_id: &str, data: Bytes) -> Self {
        Self {
            frame_type: FrameType::Input,
            payload: encode_session_scoped(session_id, &data),
        }
    }

    /// Splits an Output/Input payload into `(session_id, bytes)`.
    /// Returns `None` if the payload is malformed (shorter than the
    /// declared id length).
    pub fn session_scoped(&self) -> Option<(String, Bytes)> {
        if self.payload.is_empty() {
            return None;
        }
        let id_len = self.payload[0] as usize;
        if self.payload.len() < 1 + id_len {
            return None;
        }
        let id = String::from_utf8(self.payload[1..1 + id_len].to_vec()).ok()?;
        let rest = self.payload.slice(1 + id_len..);
        Some((id, rest))
    }
}

fn encode_session_scoped(session_id: &str, data: &[u8]) -> Bytes {
    let id_bytes = session_id.as_bytes();
    debug_assert!(id_bytes.len() <= u8::MAX as usize, "session id too long");
    let mut buf = BytesMut::with_capacity(1 + id_bytes.len() + data.len());
    buf.put_u8(id_bytes.len() as u8);
    buf.extend_from_slice(id_bytes);
    buf.extend_from_slice(data);
    buf.freeze()
}

/// Tagged, length-delimited frame codec for the shepherd wire protocol.
/// Wire format: `[4-byte BE length][1-byte type tag][payload]`.
pub struct StreamCodec;

impl Decoder for StreamCodec {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if length == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "frame length must be at least 1",
            ));
        }
        if length > MAX_FRAME_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame too large: {length} bytes (max {MAX_FRAME_SIZE})"),
            ));
        }

        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);
        let frame_type = FrameType::from_tag(src[0])?;
        src.advance(1);
        let payload = src.split_to(length - 1).freeze();

        Ok(Some(Frame {
            frame_type,
            payload,
        }))
    }
}

impl Encoder<Frame> for StreamCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let total_len = 1 + item.payload.len();
        if total_len > MAX_FRAME_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "frame too large",
            ));
        }

        dst.reserve(4 + total_len);
        dst.put_u32(total_len as u32);
        dst.put_u8(item.frame_type.tag());
        dst.extend_from_slice(&item.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_control_frame() {
        let mut codec = StreamCodec;
        let mut buf = BytesMut::new();

        let frame = Frame::control(Bytes::from(r#"{"id":"r1","command":"ping"}"#));
        codec.encode(frame, &mut buf).unwrap();

        // §8 scenario 3: header is `00 00 00 1C 01` followed by 27 payload bytes.
        assert_eq!(&buf[0..5], &[0x00, 0x00, 0x00, 0x1C, 0x01]);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.frame_type, FrameType::Control);
        assert_eq!(&decoded.payload[..], br#"{"id":"r1","command":"ping"}"#);
    }

    #[test]
    fn roundtrip_session_scoped_frame() {
        let mut codec = StreamCodec;
        let mut buf = BytesMut::new();

        let frame = Frame::output("abc", Bytes::from_static(b"hello\n"));
        codec.encode(frame, &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.frame_type, FrameType::Output);
        let (id, data) = decoded.session_scoped().unwrap();
        assert_eq!(id, "abc");
        assert_eq!(&data[..], b"hello\n");
    }

    #[test]
    fn rejects_zero_length_frame() {
        let mut codec = StreamCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(0);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn rejects_oversized_frame() {
        let mut codec = StreamCodec;
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn waits_for_more_bytes_on_partial_frame() {
        let mut codec = StreamCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(10);
        buf.put_u8(0x00);
        buf.extend_from_slice(b"ab");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }
}
