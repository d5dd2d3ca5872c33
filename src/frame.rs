//! Frames and their wire encoding.
//!
//! Every packet on the wire is either a handshake (`u16` big-endian length
//! followed by an encoded [`Handshake`]), a frame (`u8` length followed by an
//! encoded [`WireFrame`]), or the raw payload bytes that follow a `Msg` frame.
//! The wire frame carries no type tag; [`decode_frame`] tells the variants
//! apart by which fields are present.

use std::{collections::HashMap, io};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message;
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    error::{MuxError, MuxResult},
    stream::{StreamId, StreamKind},
};

/// Largest frame length representable by the one-byte length prefix.
pub const MAX_FRAME_SIZE: usize = u8::MAX as usize;
/// Largest possible frame encoding: four tagged 10-byte varints.
pub const MIN_FRAME_SIZE: usize = 44;
pub const MAX_HANDSHAKE_SIZE: usize = u16::MAX as usize;

/// Declares a stream, along with the limits its sender imposes on the peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Open {
    pub stream_id: StreamId,
    pub kind: StreamKind,
    pub max_msg_size: u64,
    pub window_end: u64,
}

/// Grants more send window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resize {
    pub stream_id: StreamId,
    pub window_end: u64,
}

/// Announces `payload_size` payload bytes, which follow immediately.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Msg {
    pub stream_id: StreamId,
    pub payload_size: u64,
    pub msg_end: bool,
}

/// The sender will not send anything more on the stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Close {
    pub stream_id: StreamId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Frame {
    Open(Open),
    Resize(Resize),
    Msg(Msg),
    Close(Close),
}

impl Frame {
    pub fn stream_id(&self) -> StreamId {
        match self {
            Frame::Open(f) => f.stream_id,
            Frame::Resize(f) => f.stream_id,
            Frame::Msg(f) => f.stream_id,
            Frame::Close(f) => f.stream_id,
        }
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct WireFrame {
    #[prost(uint64, tag = "1")]
    pub stream_id: u64,
    #[prost(uint64, optional, tag = "2")]
    pub stream_kind: Option<u64>,
    #[prost(uint64, optional, tag = "3")]
    pub max_msg_size: Option<u64>,
    #[prost(uint64, optional, tag = "4")]
    pub window_end: Option<u64>,
    #[prost(uint64, optional, tag = "5")]
    pub payload_size: Option<u64>,
    #[prost(bool, optional, tag = "6")]
    pub msg_end: Option<bool>,
    #[prost(bool, optional, tag = "7")]
    pub stream_end: Option<bool>,
}

/// Exchanged once in each direction before any frame.
#[derive(Clone, PartialEq, Message)]
pub struct Handshake {
    /// Maximum number of concurrently accepted streams, per kind.
    #[prost(map = "uint64, uint64", tag = "1")]
    pub max_streams: HashMap<u64, u64>,
}

pub fn encode_frame(frame: &Frame) -> WireFrame {
    let mut wire = WireFrame {
        stream_id: frame.stream_id(),
        ..Default::default()
    };
    match *frame {
        Frame::Open(f) => {
            wire.stream_kind = Some(f.kind);
            wire.max_msg_size = Some(f.max_msg_size);
            wire.window_end = Some(f.window_end);
        }
        Frame::Resize(f) => {
            wire.window_end = Some(f.window_end);
        }
        Frame::Msg(f) => {
            wire.payload_size = Some(f.payload_size);
            if f.msg_end {
                wire.msg_end = Some(true);
            }
        }
        Frame::Close(_) => {
            wire.stream_end = Some(true);
        }
    }
    wire
}

/// Field precedence: kind ⇒ Open, window end ⇒ Resize, stream end ⇒ Close,
/// anything else ⇒ Msg.
pub fn decode_frame(wire: WireFrame) -> Frame {
    let stream_id = wire.stream_id;
    if let Some(kind) = wire.stream_kind {
        return Frame::Open(Open {
            stream_id,
            kind,
            max_msg_size: wire.max_msg_size.unwrap_or_default(),
            window_end: wire.window_end.unwrap_or_default(),
        });
    }
    if let Some(window_end) = wire.window_end {
        return Frame::Resize(Resize {
            stream_id,
            window_end,
        });
    }
    if wire.stream_end == Some(true) {
        return Frame::Close(Close { stream_id });
    }
    Frame::Msg(Msg {
        stream_id,
        payload_size: wire.payload_size.unwrap_or_default(),
        msg_end: wire.msg_end.unwrap_or(false),
    })
}

#[derive(Debug, PartialEq)]
pub enum Packet {
    Handshake(Handshake),
    Frame(Frame),
    Payload(Bytes),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReadState {
    Handshake,
    Header,
    Payload { remaining: u64 },
}

/// Splits the byte stream into [`Packet`]s.
///
/// The decoder expects one handshake first, then frames. After a `Msg` frame
/// it yields the announced payload as one or more `Payload` packets, as the
/// bytes arrive, before decoding the next frame.
#[derive(Debug)]
pub struct MuxCodec {
    frame_size: usize,
    state: ReadState,
}

impl MuxCodec {
    pub fn new(frame_size: usize) -> Self {
        Self {
            frame_size: frame_size.min(MAX_FRAME_SIZE),
            state: ReadState::Handshake,
        }
    }
}

impl Decoder for MuxCodec {
    type Item = Packet;
    type Error = MuxError;

    fn decode(&mut self, src: &mut BytesMut) -> MuxResult<Option<Packet>> {
        match self.state {
            ReadState::Handshake => {
                if src.len() < 2 {
                    return Ok(None);
                }
                let len = u16::from_be_bytes([src[0], src[1]]) as usize;
                if src.len() < 2 + len {
                    src.reserve(2 + len - src.len());
                    return Ok(None);
                }
                src.advance(2);
                let handshake = Handshake::decode(&src[..len])?;
                src.advance(len);
                self.state = ReadState::Header;
                Ok(Some(Packet::Handshake(handshake)))
            }
            ReadState::Header => {
                let Some(&len) = src.first() else {
                    return Ok(None);
                };
                let len = len as usize;
                if len > self.frame_size {
                    return Err(MuxError::FrameTooLarge {
                        len,
                        max: self.frame_size,
                    });
                }
                if src.len() < 1 + len {
                    return Ok(None);
                }
                src.advance(1);
                let frame = decode_frame(WireFrame::decode(&src[..len])?);
                src.advance(len);
                if let Frame::Msg(msg) = frame {
                    if msg.payload_size > 0 {
                        self.state = ReadState::Payload {
                            remaining: msg.payload_size,
                        };
                    }
                }
                Ok(Some(Packet::Frame(frame)))
            }
            ReadState::Payload { remaining } => {
                if src.is_empty() {
                    return Ok(None);
                }
                let n = usize::try_from(remaining).map_or(src.len(), |r| r.min(src.len()));
                let payload = src.split_to(n).freeze();
                let remaining = remaining - n as u64;
                self.state = if remaining == 0 {
                    ReadState::Header
                } else {
                    ReadState::Payload { remaining }
                };
                Ok(Some(Packet::Payload(payload)))
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> MuxResult<Option<Packet>> {
        if let Some(packet) = self.decode(src)? {
            return Ok(Some(packet));
        }
        match self.state {
            ReadState::Handshake | ReadState::Header if src.is_empty() => Ok(None),
            _ => Err(truncated()),
        }
    }
}

fn truncated() -> MuxError {
    io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed mid-packet").into()
}

impl Encoder<Packet> for MuxCodec {
    type Error = MuxError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> MuxResult<()> {
        match item {
            Packet::Handshake(handshake) => {
                let len = handshake.encoded_len();
                if len > MAX_HANDSHAKE_SIZE {
                    return Err(MuxError::HandshakeTooLarge(len));
                }
                dst.reserve(2 + len);
                dst.put_u16(len as u16);
                handshake.encode(dst)?;
            }
            Packet::Frame(frame) => {
                let wire = encode_frame(&frame);
                let len = wire.encoded_len();
                if len > self.frame_size {
                    return Err(MuxError::FrameTooLarge {
                        len,
                        max: self.frame_size,
                    });
                }
                dst.reserve(1 + len);
                dst.put_u8(len as u8);
                wire.encode(dst)?;
            }
            Packet::Payload(payload) => {
                dst.extend_from_slice(&payload);
            }
        }
        Ok(())
    }
}
