//! Wire protocol of the broker: a fixed 12-byte head followed by a typed,
//! length-prefixed body, all integers network order. Decoders validate every
//! length against the remaining buffer and fail without partial commit.

mod body;
mod envelope;
mod error;
mod head;

pub use body::{
    ConfirmAliveReq, ConfirmAliveRsp, Endpoint, GetClientReq, GetClientRsp, RegisterReq,
    RegisterRsp, SendMsgReq, SendMsgRsp, TypedBody, UnregisterReq, WireBody, pack_request,
    pack_response,
};
pub use envelope::{Envelope, SyncReply};
pub use error::CodecError;
pub use head::{
    BodyType, FrameHead, HEAD_SIZE, MAX_FRAME_BODY, MSG_TYPE_REQUEST, MSG_TYPE_RESPONSE,
    PROTO_VERSION, split_frame,
};
