//! An asynchronous stream multiplexer for tokio.
//!
//! Many independent, flow-controlled message streams share one reliable,
//! ordered connection. Each stream has a kind with its own concurrency
//! limits, a per-direction window counted in messages, and at most one
//! outgoing message buffered at a time, so a stalled stream never blocks the
//! others.

pub(crate) mod builder;
pub(crate) mod config;
pub mod error;
pub mod frame;
pub(crate) mod mux;
pub(crate) mod stream;
pub(crate) mod sync;

pub use builder::MuxBuilder;
pub use config::{MuxConfig, StreamKindConfig, MAX_WINDOW};
pub use error::{MuxError, MuxResult};
pub use mux::{Mux, TokioConn};
pub use stream::{Stream, StreamId, StreamKind};
