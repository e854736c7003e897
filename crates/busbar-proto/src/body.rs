use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    error::CodecError,
    head::{BodyType, FrameHead, HEAD_SIZE},
};

/// Where a service peer listens. Port 0 is the "not a provider, reachable
/// only through this broker connection" sentinel; registry identity is by
/// (ip, port) via [`same_host`](Self::same_host), `state` excluded.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Endpoint {
    pub ip: String,
    pub port: u16,
    pub state: u8,
}

impl Endpoint {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self { ip: ip.into(), port, state: 0 }
    }

    #[inline]
    pub fn same_host(&self, other: &Self) -> bool {
        self.ip == other.ip && self.port == other.port
    }

    fn encode(&self, buf: &mut BytesMut) {
        put_str8(buf, &self.ip);
        buf.put_u16(self.port);
        buf.put_u8(self.state);
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, CodecError> {
        let ip = get_str8(buf)?;
        if buf.remaining() < 3 {
            return Err(CodecError::Short);
        }
        Ok(Self { ip, port: buf.get_u16(), state: buf.get_u8() })
    }
}

/// A typed frame body with its network-order codec.
pub trait WireBody: Sized {
    const BODY_TYPE: BodyType;
    fn encode_body(&self, buf: &mut BytesMut);
    fn decode_body(buf: &[u8]) -> Result<Self, CodecError>;
}

/// Packs head + body into one wire-ready block.
pub fn pack_request<B: WireBody>(msg_id: u32, body: &B) -> Bytes {
    pack(FrameHead::request(B::BODY_TYPE, msg_id, 0), body)
}

pub fn pack_response<B: WireBody>(msg_id: u32, body: &B) -> Bytes {
    pack(FrameHead::response(B::BODY_TYPE, msg_id, 0), body)
}

fn pack<B: WireBody>(mut head: FrameHead, body: &B) -> Bytes {
    let mut body_buf = BytesMut::new();
    body.encode_body(&mut body_buf);
    head.body_len = body_buf.len() as u32;
    let mut out = BytesMut::with_capacity(HEAD_SIZE + body_buf.len());
    head.encode(&mut out);
    out.extend_from_slice(&body_buf);
    out.freeze()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterReq {
    pub service_name: String,
    pub host: Endpoint,
}

impl WireBody for RegisterReq {
    const BODY_TYPE: BodyType = BodyType::ReqRegister;

    fn encode_body(&self, buf: &mut BytesMut) {
        put_str16(buf, &self.service_name);
        self.host.encode(buf);
    }

    fn decode_body(mut buf: &[u8]) -> Result<Self, CodecError> {
        let service_name = get_str16(&mut buf)?;
        let host = Endpoint::decode(&mut buf)?;
        Ok(Self { service_name, host })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterRsp {
    pub ret_code: u16,
    pub service_name: String,
    pub err_msg: String,
}

impl WireBody for RegisterRsp {
    const BODY_TYPE: BodyType = BodyType::RspRegister;

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_u16(self.ret_code);
        put_str16(buf, &self.service_name);
        put_err_msg(buf, &self.err_msg);
    }

    fn decode_body(mut buf: &[u8]) -> Result<Self, CodecError> {
        if buf.remaining() < 2 {
            return Err(CodecError::Short);
        }
        let ret_code = buf.get_u16();
        let service_name = get_str16(&mut buf)?;
        let err_msg = get_err_msg(&mut buf)?;
        Ok(Self { ret_code, service_name, err_msg })
    }
}

/// Same shape as the register request; removal is by (name, endpoint).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnregisterReq {
    pub service_name: String,
    pub host: Endpoint,
}

impl WireBody for UnregisterReq {
    const BODY_TYPE: BodyType = BodyType::ReqUnregister;

    fn encode_body(&self, buf: &mut BytesMut) {
        put_str16(buf, &self.service_name);
        self.host.encode(buf);
    }

    fn decode_body(mut buf: &[u8]) -> Result<Self, CodecError> {
        let service_name = get_str16(&mut buf)?;
        let host = Endpoint::decode(&mut buf)?;
        Ok(Self { service_name, host })
    }
}

/// Forwarding request. An empty `dest_name` broadcasts; otherwise the
/// destination set is every prefix-matching service name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendMsgReq {
    pub dest_name: String,
    pub from_name: String,
    pub payload: Bytes,
}

impl WireBody for SendMsgReq {
    const BODY_TYPE: BodyType = BodyType::ReqSendMsg;

    fn encode_body(&self, buf: &mut BytesMut) {
        put_str16(buf, &self.dest_name);
        put_str16(buf, &self.from_name);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
    }

    fn decode_body(mut buf: &[u8]) -> Result<Self, CodecError> {
        let dest_name = get_str16(&mut buf)?;
        let from_name = get_str16(&mut buf)?;
        if buf.remaining() < 4 {
            return Err(CodecError::Short);
        }
        let len = buf.get_u32() as usize;
        if buf.remaining() < len {
            return Err(CodecError::Short);
        }
        Ok(Self { dest_name, from_name, payload: Bytes::copy_from_slice(&buf[..len]) })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendMsgRsp {
    pub ret_code: u16,
    pub err_msg: String,
}

impl WireBody for SendMsgRsp {
    const BODY_TYPE: BodyType = BodyType::RspSendMsg;

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_u16(self.ret_code);
        put_err_msg(buf, &self.err_msg);
    }

    fn decode_body(mut buf: &[u8]) -> Result<Self, CodecError> {
        if buf.remaining() < 2 {
            return Err(CodecError::Short);
        }
        let ret_code = buf.get_u16();
        let err_msg = get_err_msg(&mut buf)?;
        Ok(Self { ret_code, err_msg })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetClientReq {
    pub dest_name: String,
}

impl WireBody for GetClientReq {
    const BODY_TYPE: BodyType = BodyType::ReqGetClient;

    fn encode_body(&self, buf: &mut BytesMut) {
        put_str16(buf, &self.dest_name);
    }

    fn decode_body(mut buf: &[u8]) -> Result<Self, CodecError> {
        Ok(Self { dest_name: get_str16(&mut buf)? })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetClientRsp {
    pub ret_code: u16,
    pub dest_name: String,
    pub host: Endpoint,
}

impl WireBody for GetClientRsp {
    const BODY_TYPE: BodyType = BodyType::RspGetClient;

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_u16(self.ret_code);
        put_str16(buf, &self.dest_name);
        self.host.encode(buf);
    }

    fn decode_body(mut buf: &[u8]) -> Result<Self, CodecError> {
        if buf.remaining() < 2 {
            return Err(CodecError::Short);
        }
        let ret_code = buf.get_u16();
        let dest_name = get_str16(&mut buf)?;
        let host = Endpoint::decode(&mut buf)?;
        Ok(Self { ret_code, dest_name, host })
    }
}

/// Keep-alive ping; the response echoes the flag as its ret code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConfirmAliveReq {
    pub alive_flag: u8,
}

impl WireBody for ConfirmAliveReq {
    const BODY_TYPE: BodyType = BodyType::ReqConfirmAlive;

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_u8(self.alive_flag);
    }

    fn decode_body(mut buf: &[u8]) -> Result<Self, CodecError> {
        if buf.remaining() < 1 {
            return Err(CodecError::Short);
        }
        Ok(Self { alive_flag: buf.get_u8() })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConfirmAliveRsp {
    pub ret_code: u16,
}

impl WireBody for ConfirmAliveRsp {
    const BODY_TYPE: BodyType = BodyType::RspConfirmAlive;

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_u16(self.ret_code);
    }

    fn decode_body(mut buf: &[u8]) -> Result<Self, CodecError> {
        if buf.remaining() < 2 {
            return Err(CodecError::Short);
        }
        Ok(Self { ret_code: buf.get_u16() })
    }
}

/// Schema-described body: a wire type name (NUL-terminated on the wire)
/// selects the decoder and handler on the receiving side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypedBody {
    pub type_name: String,
    pub data: Bytes,
}

impl WireBody for TypedBody {
    const BODY_TYPE: BodyType = BodyType::Typed;

    fn encode_body(&self, buf: &mut BytesMut) {
        assert!(self.type_name.len() < u16::MAX as usize, "type name too long");
        buf.put_u16(self.type_name.len() as u16 + 1);
        buf.put_u32(self.data.len() as u32);
        buf.put_slice(self.type_name.as_bytes());
        buf.put_u8(0);
        buf.put_slice(&self.data);
    }

    fn decode_body(mut buf: &[u8]) -> Result<Self, CodecError> {
        if buf.remaining() < 6 {
            return Err(CodecError::Short);
        }
        let type_len = buf.get_u16() as usize;
        let data_len = buf.get_u32() as usize;
        if buf.remaining() < type_len + data_len {
            return Err(CodecError::Short);
        }
        let mut name = &buf[..type_len];
        if let [head @ .., 0] = name {
            name = head;
        }
        let type_name =
            std::str::from_utf8(name).map_err(|_| CodecError::BadString)?.to_string();
        buf.advance(type_len);
        Ok(Self { type_name, data: Bytes::copy_from_slice(&buf[..data_len]) })
    }
}

fn put_str8(buf: &mut BytesMut, s: &str) {
    assert!(s.len() <= u8::MAX as usize, "string too long for u8 length prefix");
    buf.put_u8(s.len() as u8);
    buf.put_slice(s.as_bytes());
}

fn get_str8(buf: &mut &[u8]) -> Result<String, CodecError> {
    if buf.remaining() < 1 {
        return Err(CodecError::Short);
    }
    let len = buf.get_u8() as usize;
    take_str(buf, len)
}

fn put_str16(buf: &mut BytesMut, s: &str) {
    assert!(s.len() <= u16::MAX as usize, "string too long for u16 length prefix");
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn get_str16(buf: &mut &[u8]) -> Result<String, CodecError> {
    if buf.remaining() < 2 {
        return Err(CodecError::Short);
    }
    let len = buf.get_u16() as usize;
    take_str(buf, len)
}

/// Error strings travel with a trailing NUL inside their length prefix.
fn put_err_msg(buf: &mut BytesMut, s: &str) {
    assert!(s.len() < u16::MAX as usize, "error string too long");
    buf.put_u16(s.len() as u16 + 1);
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn get_err_msg(buf: &mut &[u8]) -> Result<String, CodecError> {
    if buf.remaining() < 2 {
        return Err(CodecError::Short);
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(CodecError::Short);
    }
    let mut raw = &buf[..len];
    if let [head @ .., 0] = raw {
        raw = head;
    }
    let msg = std::str::from_utf8(raw).map_err(|_| CodecError::BadString)?.to_string();
    buf.advance(len);
    Ok(msg)
}

fn take_str(buf: &mut &[u8], len: usize) -> Result<String, CodecError> {
    if buf.remaining() < len {
        return Err(CodecError::Short);
    }
    let s = std::str::from_utf8(&buf[..len]).map_err(|_| CodecError::BadString)?.to_string();
    buf.advance(len);
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::head::split_frame;

    fn roundtrip<B: WireBody + PartialEq + std::fmt::Debug>(body: &B) {
        let packed = pack_request(77, body);
        let (head, raw) = split_frame(&packed).unwrap().unwrap();
        assert_eq!(head.msg_id, 77);
        assert_eq!(head.body_kind(), Some(B::BODY_TYPE));
        assert_eq!(head.body_len as usize, raw.len());
        assert_eq!(&B::decode_body(raw).unwrap(), body);
    }

    #[test]
    fn every_body_type_roundtrips() {
        roundtrip(&RegisterReq {
            service_name: "svc.a".into(),
            host: Endpoint { ip: "10.0.0.1".into(), port: 8000, state: 3 },
        });
        roundtrip(&RegisterRsp {
            ret_code: 1,
            service_name: "svc.a".into(),
            err_msg: "empty name is not allowed.".into(),
        });
        roundtrip(&UnregisterReq {
            service_name: "svc.a".into(),
            host: Endpoint::new("10.0.0.1", 8000),
        });
        roundtrip(&SendMsgReq {
            dest_name: "svc.a".into(),
            from_name: "cli".into(),
            payload: Bytes::from_static(b"hello"),
        });
        roundtrip(&SendMsgRsp { ret_code: 0, err_msg: String::new() });
        roundtrip(&GetClientReq { dest_name: "svc.a".into() });
        roundtrip(&GetClientRsp {
            ret_code: 0,
            dest_name: "svc.a".into(),
            host: Endpoint::new("10.0.0.1", 8000),
        });
        roundtrip(&ConfirmAliveReq { alive_flag: 0 });
        roundtrip(&ConfirmAliveRsp { ret_code: 0 });
        roundtrip(&TypedBody {
            type_name: "busbar.QueryServicesReq".into(),
            data: Bytes::from_static(b"{\"match_prefix\":\"svc\"}"),
        });
    }

    #[test]
    fn empty_payload_and_names_roundtrip() {
        roundtrip(&SendMsgReq {
            dest_name: String::new(),
            from_name: String::new(),
            payload: Bytes::new(),
        });
        roundtrip(&TypedBody { type_name: String::new(), data: Bytes::new() });
    }

    #[test]
    fn error_strings_carry_a_trailing_nul() {
        let rsp = SendMsgRsp { ret_code: 1, err_msg: "dest client not found.".into() };
        let mut buf = BytesMut::new();
        rsp.encode_body(&mut buf);
        // ret_code(2) + len(2) + text + NUL
        assert_eq!(buf.len(), 2 + 2 + rsp.err_msg.len() + 1);
        assert_eq!(buf[buf.len() - 1], 0);
        assert_eq!(SendMsgRsp::decode_body(&buf).unwrap().err_msg, rsp.err_msg);
    }

    #[test]
    fn truncated_bodies_fail_cleanly() {
        let req = RegisterReq {
            service_name: "svc".into(),
            host: Endpoint::new("127.0.0.1", 9),
        };
        let mut buf = BytesMut::new();
        req.encode_body(&mut buf);
        for cut in 0..buf.len() {
            assert_eq!(RegisterReq::decode_body(&buf[..cut]), Err(CodecError::Short));
        }
    }

    #[test]
    fn endpoint_identity_ignores_state() {
        let a = Endpoint { ip: "1.2.3.4".into(), port: 5, state: 0 };
        let b = Endpoint { ip: "1.2.3.4".into(), port: 5, state: 9 };
        assert!(a.same_host(&b));
        assert_ne!(a, b);
    }
}
