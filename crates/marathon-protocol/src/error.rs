use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("buffer too small: {0} bytes needed, {1} bytes available")]
    BufferTooSmall(usize, usize),

    #[error("message shorter than the {0}-byte frame header: {1} bytes")]
    MessageTooShort(usize, usize),

    #[error("magic value was not 'MRTN' (0x4d52544e): {0:#010x}")]
    InvalidMagic(u32),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("payload ended before the declared {0} bytes: {1} bytes read")]
    IncompletePayload(usize, usize),

    #[error("ran out of data while decoding: {0} bytes needed, {1} bytes left")]
    UnexpectedEndOfData(usize, usize),

    #[error("invalid message type: {0:#04x}")]
    InvalidMessageType(u8),

    #[error("invalid task state: {0:#04x}")]
    InvalidTaskState(u8),

    #[error("invalid event type: {0:#04x}")]
    InvalidEventType(u8),

    #[error("invalid command tag: {0:#04x}")]
    InvalidCommandTag(u8),

    #[error("invalid output stream tag: {0:#04x}")]
    InvalidStreamTag(u8),

    #[error("invalid boolean byte: {0:#04x}")]
    InvalidBool(u8),

    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    #[error("declared length {0} exceeds the {1}-byte limit")]
    LengthOverflow(usize, usize),

    #[error("{0} undecoded bytes remain after the payload")]
    TrailingBytes(usize),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
