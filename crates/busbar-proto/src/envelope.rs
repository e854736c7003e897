use bytes::{BufMut, Bytes, BytesMut};

use crate::error::CodecError;

const SENDER_LEN_BYTES: usize = 1;
const TOPIC_LEN_BYTES: usize = 1;
const PARAM_LEN_BYTES: usize = 4;

/// The sender/topic/payload triplet a client packs into a forwarded
/// message's payload:
/// `sender_len(1) sender topic_len(1) topic param_len(4,BE) param`.
///
/// The transport never interprets it; the correlation id here is the
/// application-level topic, independent of the head's `msg_id`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub sender: String,
    pub topic: String,
    pub payload: Bytes,
}

impl Envelope {
    pub fn encode(&self, buf: &mut BytesMut) {
        assert!(self.sender.len() <= u8::MAX as usize, "sender too long");
        assert!(self.topic.len() <= u8::MAX as usize, "topic too long");
        buf.put_u8(self.sender.len() as u8);
        buf.put_slice(self.sender.as_bytes());
        buf.put_u8(self.topic.len() as u8);
        buf.put_slice(self.topic.as_bytes());
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            SENDER_LEN_BYTES
                + self.sender.len()
                + TOPIC_LEN_BYTES
                + self.topic.len()
                + PARAM_LEN_BYTES
                + self.payload.len(),
        );
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Every length is validated against the remaining bytes before any
    /// field is materialised; a shortfall fails without partial commit.
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < SENDER_LEN_BYTES {
            return Err(CodecError::Short);
        }
        let sender_len = buf[0] as usize;
        let topic_at = SENDER_LEN_BYTES + sender_len;
        if buf.len() < topic_at + TOPIC_LEN_BYTES {
            return Err(CodecError::Short);
        }
        let topic_len = buf[topic_at] as usize;
        let param_at = topic_at + TOPIC_LEN_BYTES + topic_len;
        if buf.len() < param_at + PARAM_LEN_BYTES {
            return Err(CodecError::Short);
        }
        // the length field is unaligned on the wire; copy before swapping
        let mut len4 = [0_u8; PARAM_LEN_BYTES];
        len4.copy_from_slice(&buf[param_at..param_at + PARAM_LEN_BYTES]);
        let param_len = u32::from_be_bytes(len4) as usize;
        let end = param_at + PARAM_LEN_BYTES + param_len;
        if buf.len() < end {
            return Err(CodecError::Short);
        }

        let sender = std::str::from_utf8(&buf[SENDER_LEN_BYTES..topic_at])
            .map_err(|_| CodecError::BadString)?
            .to_string();
        let topic = std::str::from_utf8(&buf[topic_at + TOPIC_LEN_BYTES..param_at])
            .map_err(|_| CodecError::BadString)?
            .to_string();
        let payload = Bytes::copy_from_slice(&buf[param_at + PARAM_LEN_BYTES..end]);
        Ok(Self { sender, topic, payload })
    }
}

/// Reply block for the sync-send pattern: a client that answered a sync
/// request writes `sync_sid(4,BE) data_len(4,BE) data` back through its
/// broker connection; the sid correlates with the one inside the request's
/// payload, independent of any transport ids.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncReply {
    pub sync_sid: u32,
    pub data: Bytes,
}

impl SyncReply {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + self.data.len());
        buf.put_u32(self.sync_sid);
        buf.put_u32(self.data.len() as u32);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < 8 {
            return Err(CodecError::Short);
        }
        let mut len4 = [0_u8; 4];
        len4.copy_from_slice(&buf[..4]);
        let sync_sid = u32::from_be_bytes(len4);
        len4.copy_from_slice(&buf[4..8]);
        let data_len = u32::from_be_bytes(len4) as usize;
        if buf.len() < 8 + data_len {
            return Err(CodecError::Short);
        }
        Ok(Self { sync_sid, data: Bytes::copy_from_slice(&buf[8..8 + data_len]) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_roundtrip_preserves_lengths() {
        let env = Envelope {
            sender: "client-7".into(),
            topic: "orders.created".into(),
            payload: Bytes::from_static(b"\x00\x01binary\xffpayload"),
        };
        let wire = env.to_bytes();
        assert_eq!(Envelope::decode(&wire).unwrap(), env);
    }

    #[test]
    fn sender_bounds() {
        for len in [0_usize, 255] {
            let env = Envelope {
                sender: "s".repeat(len),
                topic: "t".into(),
                payload: Bytes::new(),
            };
            let wire = env.to_bytes();
            let back = Envelope::decode(&wire).unwrap();
            assert_eq!(back.sender.len(), len);
            assert_eq!(back, env);
        }
    }

    #[test]
    fn truncation_never_partially_commits() {
        let env = Envelope {
            sender: "abc".into(),
            topic: "topic".into(),
            payload: Bytes::from_static(b"0123456789"),
        };
        let wire = env.to_bytes();
        for cut in 0..wire.len() {
            assert_eq!(Envelope::decode(&wire[..cut]), Err(CodecError::Short));
        }
    }

    #[test]
    fn sync_reply_roundtrip() {
        let reply = SyncReply { sync_sid: 0xfeed_f00d, data: Bytes::from_static(b"done") };
        let wire = reply.to_bytes();
        assert_eq!(SyncReply::decode(&wire).unwrap(), reply);

        assert_eq!(SyncReply::decode(&wire[..7]), Err(CodecError::Short));
        assert_eq!(SyncReply::decode(&wire[..9]), Err(CodecError::Short));
    }
}
