use std::future::Future;

use crate::{
    config::{MuxConfig, StreamKindConfig},
    error::MuxResult,
    mux::{Mux, TokioConn},
    stream::StreamKind,
};

pub struct WithConnection<T> {
    config: MuxConfig,
    connection: T,
}

pub struct WithConfig {
    config: MuxConfig,
}

pub struct MuxBuilder<State> {
    state: State,
}

impl MuxBuilder<WithConfig> {
    pub fn new() -> Self {
        MuxBuilder {
            state: WithConfig {
                config: MuxConfig::default(),
            },
        }
    }

    pub fn with_frame_size(&mut self, frame_size: usize) -> &mut Self {
        self.state.config.frame_size = frame_size;
        self
    }

    pub fn with_chunk_size(&mut self, chunk_size: usize) -> &mut Self {
        self.state.config.chunk_size = chunk_size;
        self
    }

    /// Serves streams of `kind`, allowing at most `max_connects` of them to be
    /// opened locally and `max_accepts` by the peer at any time.
    pub fn with_kind(
        &mut self,
        kind: StreamKind,
        max_connects: u64,
        max_accepts: u64,
    ) -> &mut Self {
        self.state.config.kinds.insert(
            kind,
            StreamKindConfig {
                max_connects,
                max_accepts,
            },
        );
        self
    }

    pub fn config(&self) -> &MuxConfig {
        &self.state.config
    }

    pub fn with_connection<T: TokioConn>(
        &mut self,
        connection: T,
    ) -> MuxBuilder<WithConnection<T>> {
        MuxBuilder {
            state: WithConnection {
                config: self.state.config.clone(),
                connection,
            },
        }
    }
}

impl Default for MuxBuilder<WithConfig> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TokioConn> MuxBuilder<WithConnection<T>> {
    /// Returns the mux and the worker driving its connection. The worker must
    /// be polled, usually by spawning it, for any stream to make progress.
    pub fn build(self) -> MuxResult<(Mux, impl Future<Output = MuxResult<()>>)> {
        let mux = Mux::new(self.state.config)?;
        let connection = self.state.connection;
        let worker = {
            let mux = mux.clone();
            async move { mux.run(connection).await }
        };
        Ok((mux, worker))
    }
}
