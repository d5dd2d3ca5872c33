use std::collections::HashMap;

use prost::Message;

use crate::{
    error::{MuxError, MuxResult},
    frame::{Handshake, MAX_FRAME_SIZE, MAX_HANDSHAKE_SIZE, MIN_FRAME_SIZE},
    stream::StreamKind,
};

/// Largest receive window a stream may declare, in messages.
pub const MAX_WINDOW: u64 = 0x10000;

/// Concurrency limits of one stream kind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamKindConfig {
    /// Maximum number of live streams of this kind opened by `connect`
    pub max_connects: u64,

    /// Maximum number of live streams of this kind opened by the peer
    pub max_accepts: u64,
}

/// `Mux` Configurations
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MuxConfig {
    /// Maximum encoded size of a frame, excluding its length prefix
    pub frame_size: usize,

    /// Maximum payload size carried by a single `Msg` frame. Larger messages
    /// are split and interleaved with other streams' frames
    pub chunk_size: usize,

    /// Stream kinds served on this connection
    pub kinds: HashMap<StreamKind, StreamKindConfig>,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            frame_size: MAX_FRAME_SIZE,
            chunk_size: 0x4000,
            kinds: HashMap::new(),
        }
    }
}

impl MuxConfig {
    /// Validates the config
    pub fn check(&self) -> MuxResult<()> {
        if self.frame_size < MIN_FRAME_SIZE {
            return Err(MuxError::InvalidConfig("frame_size too small for an open frame"));
        }
        if self.frame_size > MAX_FRAME_SIZE {
            return Err(MuxError::InvalidConfig("frame_size > 0xff"));
        }
        if self.chunk_size == 0 {
            return Err(MuxError::InvalidConfig("chunk_size == 0"));
        }
        if self.handshake().encoded_len() > MAX_HANDSHAKE_SIZE {
            return Err(MuxError::InvalidConfig("too many stream kinds"));
        }
        Ok(())
    }

    /// The handshake advertising this side's accept limits.
    pub(crate) fn handshake(&self) -> Handshake {
        Handshake {
            max_streams: self
                .kinds
                .iter()
                .map(|(kind, c)| (*kind, c.max_accepts))
                .collect(),
        }
    }
}
