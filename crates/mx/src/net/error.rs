use std::io;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed varint")]
    Varint,
    #[error("invalid field number {0}")]
    InvalidField(u32),
    #[error("unsupported wire type {0}")]
    WireType(u8),
    #[error("truncated input: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },
    #[error("protocol id mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ProtocolMismatch { expected: u32, actual: u32 },
    #[error("empty fragment")]
    EmptyFragment,
    #[error("unknown fragment type {0}")]
    FragmentType(u8),
    #[error("fragment header declares {0} fragments")]
    FragmentCount(i32),
    #[error("fragment index {0} out of range")]
    FragmentIndex(i32),
}

#[derive(Debug, thiserror::Error)]
pub enum MxError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("dispatcher is closed")]
    Closed,
    #[error("cannot send to an empty group")]
    EmptyGroup,
    #[error("endpoint has neither a realtime nor a reliable address")]
    EmptyEndpoint,
    #[error("message of {len} bytes exceeds the {max} byte reliable limit")]
    MessageTooLarge { len: usize, max: usize },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
