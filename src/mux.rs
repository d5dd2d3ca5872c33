use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use futures::{SinkExt, StreamExt};
use log::{debug, trace, warn};
use tokio::io::{self, AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::{
    config::{MuxConfig, StreamKindConfig, MAX_WINDOW},
    error::{MuxError, MuxResult},
    frame::{Frame, MuxCodec, Open, Packet},
    stream::{
        is_connected_id, peer_stream_id, SendQueue, Stream, StreamId, StreamKind, StreamState,
    },
    sync::Watch,
};

pub trait TokioConn: AsyncRead + AsyncWrite + Unpin {}

impl<T> TokioConn for T where T: AsyncRead + AsyncWrite + Unpin {}

/// A stream multiplexer over a single connection.
///
/// `Mux` is a cheap handle; clones share the same connection. The connection
/// is driven by [`Mux::run`], while any number of tasks open streams with
/// [`Mux::connect`] and [`Mux::accept`].
#[derive(Clone)]
pub struct Mux {
    inner: Arc<MuxInner>,
}

struct MuxInner {
    config: MuxConfig,
    state: Watch<MuxState>,
    queue: Arc<SendQueue>,
}

struct KindState {
    config: StreamKindConfig,
    connected: u64,
    accepted: u64,
    /// Streams opened by the peer, waiting for `accept`.
    acceptable: VecDeque<Arc<StreamState>>,
}

struct MuxState {
    streams: HashMap<StreamId, Arc<StreamState>>,
    kinds: HashMap<StreamKind, KindState>,
    next_connect_id: StreamId,
    /// Accept limits announced by the peer's handshake.
    peer_max_streams: Option<HashMap<StreamKind, u64>>,
    running: bool,
    closed: bool,
}

impl MuxState {
    fn try_connect(&mut self, kind: StreamKind) -> Option<MuxResult<Arc<StreamState>>> {
        if self.closed {
            return Some(Err(MuxError::ConnectionClosed));
        }
        let Some(k) = self.kinds.get_mut(&kind) else {
            return Some(Err(MuxError::UnknownKind(kind)));
        };
        let peer_max = *self.peer_max_streams.as_ref()?.get(&kind).unwrap_or(&0);
        let limit = k.config.max_connects.min(peer_max);
        if limit == 0 {
            return Some(Err(MuxError::KindNotAccepted(kind)));
        }
        if k.connected >= limit {
            return None;
        }
        k.connected += 1;

        let id = self.next_connect_id;
        self.next_connect_id += 2;
        let state = Arc::new(StreamState::new(id, kind));
        self.streams.insert(id, state.clone());
        Some(Ok(state))
    }

    fn try_accept(&mut self, kind: StreamKind) -> Option<MuxResult<Arc<StreamState>>> {
        if self.closed {
            return Some(Err(MuxError::ConnectionClosed));
        }
        let Some(k) = self.kinds.get_mut(&kind) else {
            return Some(Err(MuxError::UnknownKind(kind)));
        };
        if k.config.max_accepts == 0 {
            return Some(Err(MuxError::KindNotAccepted(kind)));
        }
        k.acceptable.pop_front().map(Ok)
    }

    /// Registers a stream opened by the peer.
    fn process_open(&mut self, id: StreamId, open: &Open) -> MuxResult<()> {
        let k = self
            .kinds
            .get_mut(&open.kind)
            .ok_or(MuxError::UnknownKind(open.kind))?;
        if k.accepted >= k.config.max_accepts {
            return Err(MuxError::TooManyStreams(open.kind));
        }
        if self.streams.contains_key(&id) {
            return Err(MuxError::DuplicatedStreamId(id));
        }

        let state = Arc::new(StreamState::new(id, open.kind));
        state.remote_open(open.max_msg_size)?;
        state.remote_window_end(open.window_end)?;
        k.accepted += 1;
        k.acceptable.push_back(state.clone());
        self.streams.insert(id, state);
        Ok(())
    }

    fn remove_stream(&mut self, stream: &StreamState) {
        let id = stream.id();
        if self.streams.remove(&id).is_none() {
            return;
        }
        if let Some(k) = self.kinds.get_mut(&stream.kind()) {
            if is_connected_id(id) {
                k.connected = k.connected.saturating_sub(1);
            } else {
                k.accepted = k.accepted.saturating_sub(1);
            }
        }
        debug!("stream {:X} removed", id);
    }
}

/// Message being received on the wire: its stream, the payload bytes still
/// to come, and whether they complete the message.
struct IncomingMsg {
    stream: Arc<StreamState>,
    remaining: u64,
    msg_end: bool,
}

impl Mux {
    pub fn new(config: MuxConfig) -> MuxResult<Self> {
        config.check()?;
        let kinds = config
            .kinds
            .iter()
            .map(|(kind, c)| {
                (
                    *kind,
                    KindState {
                        config: *c,
                        connected: 0,
                        accepted: 0,
                        acceptable: VecDeque::new(),
                    },
                )
            })
            .collect();
        let state = MuxState {
            streams: HashMap::new(),
            kinds,
            next_connect_id: 0,
            peer_max_streams: None,
            running: false,
            closed: false,
        };
        Ok(Self {
            inner: Arc::new(MuxInner {
                config,
                state: Watch::new(state),
                queue: Arc::new(SendQueue::new(VecDeque::new())),
            }),
        })
    }

    /// Opens a stream of `kind` to the peer.
    ///
    /// Waits for a free connect slot, then until the peer accepts the stream.
    /// `max_msg_size` and `window` bound what the peer may send to us.
    pub async fn connect(
        &self,
        kind: StreamKind,
        max_msg_size: u64,
        window: u64,
    ) -> MuxResult<Stream> {
        check_window(window)?;
        let state = self.inner.state.wait_for(|s| s.try_connect(kind)).await?;
        debug!("stream {:X} of kind {} connecting", state.id(), kind);
        let stream = Stream::new(state, self.inner.queue.clone());
        stream.open(max_msg_size, window).await?;
        Ok(stream)
    }

    /// Accepts a stream of `kind` opened by the peer.
    pub async fn accept(
        &self,
        kind: StreamKind,
        max_msg_size: u64,
        window: u64,
    ) -> MuxResult<Stream> {
        check_window(window)?;
        let state = self.inner.state.wait_for(|s| s.try_accept(kind)).await?;
        debug!("stream {:X} of kind {} accepted", state.id(), kind);
        let stream = Stream::new(state, self.inner.queue.clone());
        stream.open(max_msg_size, window).await?;
        Ok(stream)
    }

    /// Gets the number of live streams, including those waiting for `accept`.
    pub fn num_streams(&self) -> usize {
        self.inner.state.lock().streams.len()
    }

    /// Drives the connection until it ends.
    ///
    /// Returns `Ok(())` when the peer closes the connection cleanly. When this
    /// returns, or is dropped, every pending and future operation on this mux
    /// and its streams fails with [`MuxError::ConnectionClosed`].
    pub async fn run<T: TokioConn>(&self, connection: T) -> MuxResult<()> {
        self.inner.state.send_modify(|s| {
            if s.running {
                return Err(MuxError::AlreadyRunning);
            }
            s.running = true;
            Ok(())
        })?;
        let _shutdown = ShutdownOnDrop(&self.inner);

        let (reader, writer) = io::split(connection);
        let frame_size = self.inner.config.frame_size;
        let mut reader = FramedRead::new(reader, MuxCodec::new(frame_size));
        let mut writer = FramedWrite::new(writer, MuxCodec::new(frame_size));

        let result = self.inner.drive(&mut reader, &mut writer).await;
        match &result {
            Ok(()) => debug!("mux connection closed by peer"),
            Err(e) => warn!("mux connection terminated: {}", e),
        }
        result
    }
}

fn check_window(window: u64) -> MuxResult<()> {
    if window > MAX_WINDOW {
        return Err(MuxError::InvalidWindow(window));
    }
    Ok(())
}

struct ShutdownOnDrop<'a>(&'a MuxInner);

impl Drop for ShutdownOnDrop<'_> {
    fn drop(&mut self) {
        self.0.shutdown();
    }
}

impl MuxInner {
    async fn drive<R, W>(
        &self,
        reader: &mut FramedRead<R, MuxCodec>,
        writer: &mut FramedWrite<W, MuxCodec>,
    ) -> MuxResult<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        self.handshake(reader, writer).await?;
        tokio::select! {
            result = self.recv_loop(reader) => result,
            result = self.send_loop(writer) => result,
        }
    }

    /// Both sides exchange handshakes before any frame.
    async fn handshake<R, W>(
        &self,
        reader: &mut FramedRead<R, MuxCodec>,
        writer: &mut FramedWrite<W, MuxCodec>,
    ) -> MuxResult<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        // Written and read together so that large handshakes cannot both
        // block on a full transport.
        let (_, peer) = tokio::try_join!(
            writer.send(Packet::Handshake(self.config.handshake())),
            async {
                match reader.next().await {
                    Some(Ok(Packet::Handshake(handshake))) => Ok(handshake),
                    Some(Err(e)) => Err(e),
                    Some(Ok(_)) | None => Err(MuxError::MissingHandshake),
                }
            }
        )?;
        debug!("handshake received: {:?}", peer.max_streams);
        self.state
            .send_modify(|s| s.peer_max_streams = Some(peer.max_streams));
        Ok(())
    }

    async fn recv_loop<R>(&self, reader: &mut FramedRead<R, MuxCodec>) -> MuxResult<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut incoming: Option<IncomingMsg> = None;
        while let Some(packet) = reader.next().await {
            match packet? {
                Packet::Frame(frame) => {
                    trace!("recv {:?}", frame);
                    incoming = self.process_frame(frame)?;
                }
                Packet::Payload(payload) => {
                    let msg = incoming.as_mut().ok_or(MuxError::UnexpectedPayload)?;
                    msg.stream.remote_payload(&payload);
                    msg.remaining -= payload.len() as u64;
                    if msg.remaining == 0 {
                        if msg.msg_end {
                            msg.stream.remote_msg_end()?;
                        }
                        incoming = None;
                    }
                }
                // The codec only parses a handshake as the first packet.
                Packet::Handshake(_) => return Err(MuxError::UnexpectedHandshake),
            }
        }
        Ok(())
    }

    /// Applies one frame. Returns the message whose payload follows, if any.
    fn process_frame(&self, frame: Frame) -> MuxResult<Option<IncomingMsg>> {
        match frame {
            Frame::Open(open) => {
                let id = peer_stream_id(open.stream_id);
                if is_connected_id(id) {
                    // The peer accepted one of our streams.
                    let stream = self.get_stream(id)?;
                    if stream.kind() != open.kind {
                        return Err(MuxError::KindMismatch {
                            id,
                            expected: stream.kind(),
                            got: open.kind,
                        });
                    }
                    stream.remote_open(open.max_msg_size)?;
                    stream.remote_window_end(open.window_end)?;
                    debug!("stream {:X} opened", id);
                } else {
                    self.state.send_modify(|s| s.process_open(id, &open))?;
                    debug!("stream {:X} of kind {} incoming", id, open.kind);
                }
            }
            Frame::Resize(resize) => {
                let stream = self.get_stream(peer_stream_id(resize.stream_id))?;
                stream.remote_window_end(resize.window_end)?;
            }
            Frame::Msg(msg) => {
                let stream = self.get_stream(peer_stream_id(msg.stream_id))?;
                stream.remote_payload_size(msg.payload_size)?;
                if msg.payload_size > 0 {
                    return Ok(Some(IncomingMsg {
                        stream,
                        remaining: msg.payload_size,
                        msg_end: msg.msg_end,
                    }));
                }
                if msg.msg_end {
                    stream.remote_msg_end()?;
                }
            }
            Frame::Close(close) => {
                let stream = self.get_stream(peer_stream_id(close.stream_id))?;
                stream.remote_close()?;
                debug!("stream {:X} closed by peer", stream.id());
                self.try_remove(&stream);
            }
        }
        Ok(None)
    }

    fn get_stream(&self, id: StreamId) -> MuxResult<Arc<StreamState>> {
        self.state
            .lock()
            .streams
            .get(&id)
            .cloned()
            .ok_or(MuxError::UnknownStream(id))
    }

    async fn send_loop<W>(&self, writer: &mut FramedWrite<W, MuxCodec>) -> MuxResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        loop {
            let next = self.queue.lock().pop_front();
            let stream = match next {
                Some(stream) => stream,
                None => {
                    SinkExt::<Packet>::flush(writer).await?;
                    self.queue.wait_for(|q| q.pop_front()).await
                }
            };

            let (outgoing, requeue) = stream.pop_outgoing(self.config.chunk_size);
            if requeue {
                // Behind every other dirty stream.
                self.queue.send_modify(|q| q.push_back(stream.clone()));
            }
            let Some(outgoing) = outgoing else {
                continue;
            };

            trace!("send {:?}", outgoing.frame);
            let closes = matches!(outgoing.frame, Frame::Close(_));
            writer.feed(Packet::Frame(outgoing.frame)).await?;
            if !outgoing.payload.is_empty() {
                writer.feed(Packet::Payload(outgoing.payload)).await?;
            }
            if outgoing.msg_done {
                stream.msg_sent();
            }
            if closes {
                stream.close_sent();
                self.try_remove(&stream);
            }
        }
    }

    /// Frees the stream's slot once the close has completed in both
    /// directions.
    fn try_remove(&self, stream: &StreamState) {
        if stream.is_finished() {
            self.state.send_modify(|s| s.remove_stream(stream));
        }
    }

    fn shutdown(&self) {
        let streams = self.state.send_modify(|s| {
            s.closed = true;
            for k in s.kinds.values_mut() {
                k.acceptable.clear();
            }
            s.streams.drain().map(|(_, stream)| stream).collect::<Vec<_>>()
        });
        debug!("mux shutdown, {} streams reset", streams.len());
        for stream in streams {
            stream.reset();
        }
        self.queue.send_modify(|q| q.clear());
    }
}

impl Drop for MuxInner {
    fn drop(&mut self) {
        debug!("mux state dropped");
    }
}
