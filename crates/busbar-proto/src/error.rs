use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("buffer too short for the declared lengths")]
    Short,
    #[error("unsupported protocol version {0}")]
    BadVersion(u8),
    #[error("frame body of {0} bytes exceeds the frame cap")]
    Oversize(u32),
    #[error("string field is not valid utf-8")]
    BadString,
}
