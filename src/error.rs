use std::io;

use thiserror::Error;

use crate::stream::{StreamId, StreamKind};

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("stream already opened")]
    AlreadyOpened,
    #[error("stream already closed")]
    AlreadyClosed,
    #[error("receive buffer full")]
    BufferFull,
    #[error("message too large: {size} > {max}")]
    MessageTooLarge { size: u64, max: u64 },
    #[error("stream {0:X} closed")]
    StreamClosed(StreamId),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("mux is already running")]
    AlreadyRunning,

    #[error("unknown stream kind {0}")]
    UnknownKind(StreamKind),
    #[error("stream kind {0} is not accepted")]
    KindNotAccepted(StreamKind),
    #[error("too many streams of kind {0}")]
    TooManyStreams(StreamKind),
    #[error("invalid window {0}")]
    InvalidWindow(u64),

    #[error("duplicated stream id {0:X}")]
    DuplicatedStreamId(StreamId),
    #[error("unknown stream id {0:X}")]
    UnknownStream(StreamId),
    #[error("stream {id:X} opened with kind {got}, expected {expected}")]
    KindMismatch {
        id: StreamId,
        expected: StreamKind,
        got: StreamKind,
    },
    #[error("frame received on stream {0:X} after close")]
    FrameAfterClose(StreamId),
    #[error("payload received without a message frame")]
    UnexpectedPayload,
    /// A handshake packet after the first one. `MuxCodec` never yields this.
    #[error("unexpected handshake")]
    UnexpectedHandshake,
    #[error("connection closed before handshake")]
    MissingHandshake,
    #[error("frame too large: {len} > {max}")]
    FrameTooLarge { len: usize, max: usize },
    #[error("handshake too large: {0}")]
    HandshakeTooLarge(usize),

    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),

    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("encode error: {0}")]
    Encode(#[from] prost::EncodeError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Lets callers working in `io::Result` propagate mux errors with `?`.
impl From<MuxError> for io::Error {
    fn from(e: MuxError) -> Self {
        match e {
            MuxError::Io(e) => e,
            MuxError::StreamClosed(_) => io::Error::new(io::ErrorKind::BrokenPipe, e),
            MuxError::ConnectionClosed => io::Error::new(io::ErrorKind::ConnectionReset, e),
            MuxError::MessageTooLarge { .. } => io::Error::new(io::ErrorKind::InvalidInput, e),
            e => io::Error::new(io::ErrorKind::InvalidData, e),
        }
    }
}

pub type MuxResult<T> = Result<T, MuxError>;

#[cfg(test)]
mod test {
    use super::*;

    fn relay(e: MuxError) -> io::Result<()> {
        Ok(Err(e)?)
    }

    #[test]
    fn into_io_error() {
        let kind = |e| relay(e).unwrap_err().kind();
        assert_eq!(kind(MuxError::StreamClosed(2)), io::ErrorKind::BrokenPipe);
        assert_eq!(kind(MuxError::ConnectionClosed), io::ErrorKind::ConnectionReset);
        assert_eq!(
            kind(MuxError::MessageTooLarge { size: 2, max: 1 }),
            io::ErrorKind::InvalidInput
        );
        assert_eq!(kind(MuxError::UnknownStream(1)), io::ErrorKind::InvalidData);
        let eof = io::Error::from(io::ErrorKind::UnexpectedEof);
        assert_eq!(kind(MuxError::Io(eof)), io::ErrorKind::UnexpectedEof);
    }
}
