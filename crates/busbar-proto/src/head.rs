use bytes::{Buf, BufMut, BytesMut};

use crate::error::CodecError;

/// Placeholder for future compatibility; there is no negotiation.
pub const PROTO_VERSION: u8 = 1;
pub const HEAD_SIZE: usize = 12;
/// Upper bound on a single frame body; anything larger is treated as a
/// corrupt header.
pub const MAX_FRAME_BODY: u32 = 16 * 1024 * 1024;

pub const MSG_TYPE_REQUEST: u8 = 0;
pub const MSG_TYPE_RESPONSE: u8 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum BodyType {
    ReqRegister = 0x11,
    RspRegister = 0x12,
    ReqUnregister = 0x13,
    RspUnregister = 0x14,
    ReqSendMsg = 0x15,
    RspSendMsg = 0x16,
    ReqGetClient = 0x17,
    RspGetClient = 0x18,
    ReqConfirmAlive = 0x19,
    RspConfirmAlive = 0x1a,
    Typed = 0x30,
}

impl BodyType {
    pub fn from_wire(raw: u16) -> Option<Self> {
        match raw {
            0x11 => Some(Self::ReqRegister),
            0x12 => Some(Self::RspRegister),
            0x13 => Some(Self::ReqUnregister),
            0x14 => Some(Self::RspUnregister),
            0x15 => Some(Self::ReqSendMsg),
            0x16 => Some(Self::RspSendMsg),
            0x17 => Some(Self::ReqGetClient),
            0x18 => Some(Self::RspGetClient),
            0x19 => Some(Self::ReqConfirmAlive),
            0x1a => Some(Self::RspConfirmAlive),
            0x30 => Some(Self::Typed),
            _ => None,
        }
    }
}

/// Fixed transport head:
/// `version(1) msg_type(1) body_type(2) msg_id(4) body_len(4)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHead {
    pub version: u8,
    pub msg_type: u8,
    pub body_type: u16,
    /// Client correlation id, echoed verbatim in responses.
    pub msg_id: u32,
    pub body_len: u32,
}

impl FrameHead {
    pub fn request(body_type: BodyType, msg_id: u32, body_len: u32) -> Self {
        Self {
            version: PROTO_VERSION,
            msg_type: MSG_TYPE_REQUEST,
            body_type: body_type as u16,
            msg_id,
            body_len,
        }
    }

    pub fn response(body_type: BodyType, msg_id: u32, body_len: u32) -> Self {
        Self { msg_type: MSG_TYPE_RESPONSE, ..Self::request(body_type, msg_id, body_len) }
    }

    /// The decoded body type; `None` for types this build does not know,
    /// which skips the frame rather than killing the connection.
    pub fn body_kind(&self) -> Option<BodyType> {
        BodyType::from_wire(self.body_type)
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        buf.put_u8(self.msg_type);
        buf.put_u16(self.body_type);
        buf.put_u32(self.msg_id);
        buf.put_u32(self.body_len);
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < HEAD_SIZE {
            return Err(CodecError::Short);
        }
        let head = Self {
            version: buf.get_u8(),
            msg_type: buf.get_u8(),
            body_type: buf.get_u16(),
            msg_id: buf.get_u32(),
            body_len: buf.get_u32(),
        };
        if head.version != PROTO_VERSION {
            return Err(CodecError::BadVersion(head.version));
        }
        if head.body_len > MAX_FRAME_BODY {
            return Err(CodecError::Oversize(head.body_len));
        }
        Ok(head)
    }
}

/// Incremental frame splitter for a receive buffer.
///
/// `Ok(None)` means more bytes are needed; nothing is consumed. On a full
/// frame, returns the head and the body slice; the caller pops
/// `HEAD_SIZE + body.len()` bytes. `Err` means the head itself is corrupt
/// and the connection cannot be resynchronised.
pub fn split_frame(buf: &[u8]) -> Result<Option<(FrameHead, &[u8])>, CodecError> {
    if buf.len() < HEAD_SIZE {
        return Ok(None);
    }
    let head = FrameHead::decode(buf)?;
    let total = HEAD_SIZE + head.body_len as usize;
    if buf.len() < total {
        return Ok(None);
    }
    Ok(Some((head, &buf[HEAD_SIZE..total])))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_roundtrip() {
        let head = FrameHead::request(BodyType::ReqSendMsg, 0xdead_beef, 42);
        let mut buf = BytesMut::new();
        head.encode(&mut buf);
        assert_eq!(buf.len(), HEAD_SIZE);
        assert_eq!(FrameHead::decode(&buf).unwrap(), head);
    }

    #[test]
    fn head_is_network_order() {
        let head = FrameHead::response(BodyType::RspRegister, 0x0102_0304, 0x0506);
        let mut buf = BytesMut::new();
        head.encode(&mut buf);
        assert_eq!(&buf[..], &[1, 1, 0x00, 0x12, 0x01, 0x02, 0x03, 0x04, 0x00, 0x00, 0x05, 0x06]);
    }

    #[test]
    fn split_waits_for_full_frame() {
        let head = FrameHead::request(BodyType::ReqConfirmAlive, 7, 3);
        let mut buf = BytesMut::new();
        head.encode(&mut buf);
        buf.extend_from_slice(b"abc");

        assert_eq!(split_frame(&buf[..5]).unwrap(), None);
        assert_eq!(split_frame(&buf[..HEAD_SIZE + 1]).unwrap(), None);
        let (got, body) = split_frame(&buf).unwrap().unwrap();
        assert_eq!(got, head);
        assert_eq!(body, b"abc");
    }

    #[test]
    fn split_accepts_empty_body() {
        let head = FrameHead::request(BodyType::ReqConfirmAlive, 9, 0);
        let mut buf = BytesMut::new();
        head.encode(&mut buf);
        let (got, body) = split_frame(&buf).unwrap().unwrap();
        assert_eq!(got.body_len, 0);
        assert!(body.is_empty());
    }

    #[test]
    fn bad_version_and_oversize_are_fatal() {
        let head = FrameHead::request(BodyType::ReqRegister, 1, 1);
        let mut buf = BytesMut::new();
        head.encode(&mut buf);
        buf[0] = 9;
        assert_eq!(split_frame(&buf), Err(CodecError::BadVersion(9)));

        let mut buf = BytesMut::new();
        FrameHead {
            body_len: MAX_FRAME_BODY + 1,
            ..FrameHead::request(BodyType::ReqRegister, 1, 0)
        }
        .encode(&mut buf);
        assert!(matches!(split_frame(&buf), Err(CodecError::Oversize(_))));
    }

    #[test]
    fn unknown_body_type_is_not_fatal() {
        let mut head = FrameHead::request(BodyType::ReqRegister, 1, 0);
        head.body_type = 0xfff0;
        let mut buf = BytesMut::new();
        head.encode(&mut buf);
        let (got, _) = split_frame(&buf).unwrap().unwrap();
        assert_eq!(got.body_kind(), None);
    }
}
