use std::{collections::VecDeque, sync::Arc};

use bytes::{Bytes, BytesMut};
use log::debug;
use parking_lot::Mutex;

use crate::{
    error::{MuxError, MuxResult},
    frame::{Close, Frame, Msg, Open, Resize},
    sync::Watch,
};

/// Identifies a stream within a connection. Streams opened locally by
/// `connect` have even ids, streams accepted from the peer have odd ids.
pub type StreamId = u64;

/// Application-defined stream type tag.
pub type StreamKind = u64;

/// Translates a stream id between the peer's id space and ours.
#[inline]
pub(crate) fn peer_stream_id(id: StreamId) -> StreamId {
    id ^ 1
}

#[inline]
pub(crate) fn is_connected_id(id: StreamId) -> bool {
    id & 1 == 0
}

/// Streams with staged outgoing frames, in the order the send loop serves
/// them. A stream appears at most once.
pub(crate) type SendQueue = Watch<VecDeque<Arc<StreamState>>>;

#[derive(Debug, Default)]
pub(crate) struct SendState {
    pub(crate) remote_opened: bool,
    pub(crate) max_msg_size: u64,
    /// Messages fully handed to the transport.
    pub(crate) buf_begin: u64,
    /// Messages staged.
    pub(crate) begin: u64,
    /// Window granted by the peer.
    pub(crate) end: u64,
}

#[derive(Debug, Default)]
pub(crate) struct RecvState {
    pub(crate) opened: bool,
    pub(crate) max_msg_size: u64,
    pub(crate) begin: u64,
    pub(crate) used: u64,
    pub(crate) end: u64,
    msgs: Vec<BytesMut>,
}

impl RecvState {
    #[inline]
    pub(crate) fn capacity(&self) -> u64 {
        self.msgs.len() as u64
    }

    #[inline]
    fn slot(&mut self, i: u64) -> &mut BytesMut {
        let cap = self.capacity();
        &mut self.msgs[(i % cap) as usize]
    }

    fn pop_front(&mut self) -> Bytes {
        let begin = self.begin;
        let msg = std::mem::take(self.slot(begin)).freeze();
        self.begin += 1;
        msg
    }
}

#[derive(Debug, Default)]
pub(crate) struct Closed {
    pub(crate) local: bool,
    pub(crate) remote: bool,
    pub(crate) close_sent: bool,
    /// The connection is gone.
    pub(crate) reset: bool,
}

/// Frames staged for the send loop, emitted in field order.
#[derive(Debug, Default)]
struct Outbox {
    open: Option<(u64, u64)>,
    resize: Option<u64>,
    msg: Option<Bytes>,
    close: bool,
    /// Close has been staged; nothing may follow it.
    close_staged: bool,
    queued: bool,
}

impl Outbox {
    fn has_pending(&self) -> bool {
        self.open.is_some() || self.resize.is_some() || self.msg.is_some() || self.close
    }
}

/// One frame taken from an outbox.
#[derive(Debug)]
pub(crate) struct Outgoing {
    pub(crate) frame: Frame,
    pub(crate) payload: Bytes,
    /// The frame completes the staged message.
    pub(crate) msg_done: bool,
}

pub(crate) struct StreamState {
    id: StreamId,
    kind: StreamKind,
    pub(crate) send: Watch<SendState>,
    pub(crate) recv: Watch<RecvState>,
    closed: Mutex<Closed>,
    outbox: Mutex<Outbox>,
}

impl StreamState {
    pub(crate) fn new(id: StreamId, kind: StreamKind) -> Self {
        Self {
            id,
            kind,
            send: Watch::new(SendState::default()),
            recv: Watch::new(RecvState::default()),
            closed: Mutex::new(Closed::default()),
            outbox: Mutex::new(Outbox::default()),
        }
    }

    #[inline]
    pub(crate) fn id(&self) -> StreamId {
        self.id
    }

    #[inline]
    pub(crate) fn kind(&self) -> StreamKind {
        self.kind
    }

    pub(crate) fn remote_open(&self, max_msg_size: u64) -> MuxResult<()> {
        self.send.send_modify(|s| {
            if s.remote_opened {
                return Err(MuxError::AlreadyOpened);
            }
            s.remote_opened = true;
            s.max_msg_size = max_msg_size;
            Ok(())
        })
    }

    pub(crate) fn remote_window_end(&self, window_end: u64) -> MuxResult<()> {
        self.check_remote_open()?;
        self.send.send_modify(|s| s.end = s.end.max(window_end));
        Ok(())
    }

    pub(crate) fn remote_close(&self) -> MuxResult<()> {
        {
            let mut closed = self.closed.lock();
            if closed.remote {
                return Err(MuxError::AlreadyClosed);
            }
            closed.remote = true;
        }
        self.send.notify();
        self.recv.notify();
        Ok(())
    }

    /// Admission check for `payload_size` more bytes of the message being
    /// assembled. Runs before any payload byte is accepted.
    pub(crate) fn remote_payload_size(&self, payload_size: u64) -> MuxResult<()> {
        self.check_remote_open()?;
        let mut recv = self.recv.lock();
        if recv.used == recv.end {
            return Err(MuxError::BufferFull);
        }
        let used = recv.used;
        let max = recv.max_msg_size;
        let size = (recv.slot(used).len() as u64).saturating_add(payload_size);
        if size > max {
            return Err(MuxError::MessageTooLarge { size, max });
        }
        Ok(())
    }

    pub(crate) fn remote_payload(&self, payload: &[u8]) {
        let mut recv = self.recv.lock();
        let used = recv.used;
        recv.slot(used).extend_from_slice(payload);
    }

    pub(crate) fn remote_msg_end(&self) -> MuxResult<()> {
        self.recv.send_modify(|r| {
            if r.used == r.end {
                return Err(MuxError::BufferFull);
            }
            r.used += 1;
            Ok(())
        })
    }

    fn check_remote_open(&self) -> MuxResult<()> {
        if self.closed.lock().remote {
            Err(MuxError::FrameAfterClose(self.id))
        } else {
            Ok(())
        }
    }

    /// Fails every current and future wait on this stream.
    pub(crate) fn reset(&self) {
        self.closed.lock().reset = true;
        self.send.notify();
        self.recv.notify();
    }

    /// Both halves are closed and both Close frames have crossed the wire.
    pub(crate) fn is_finished(&self) -> bool {
        let closed = self.closed.lock();
        closed.local && closed.remote && closed.close_sent
    }

    /// Takes the next frame to transmit. The second value is true when more
    /// frames remain, in which case the caller must requeue the stream.
    pub(crate) fn pop_outgoing(&self, chunk_size: usize) -> (Option<Outgoing>, bool) {
        let mut outbox = self.outbox.lock();
        let outgoing = self.next_outgoing(&mut outbox, chunk_size);
        outbox.queued = outbox.has_pending();
        (outgoing, outbox.queued)
    }

    fn next_outgoing(&self, outbox: &mut Outbox, chunk_size: usize) -> Option<Outgoing> {
        let stream_id = self.id;
        let frame = |frame| Outgoing {
            frame,
            payload: Bytes::new(),
            msg_done: false,
        };
        if let Some((max_msg_size, window_end)) = outbox.open.take() {
            return Some(frame(Frame::Open(Open {
                stream_id,
                kind: self.kind,
                max_msg_size,
                window_end,
            })));
        }
        if let Some(window_end) = outbox.resize.take() {
            return Some(frame(Frame::Resize(Resize {
                stream_id,
                window_end,
            })));
        }
        if let Some(msg) = &mut outbox.msg {
            let payload = msg.split_to(msg.len().min(chunk_size));
            let msg_done = msg.is_empty();
            if msg_done {
                outbox.msg = None;
            }
            return Some(Outgoing {
                frame: Frame::Msg(Msg {
                    stream_id,
                    payload_size: payload.len() as u64,
                    msg_end: msg_done,
                }),
                payload,
                msg_done,
            });
        }
        if outbox.close {
            outbox.close = false;
            return Some(frame(Frame::Close(Close { stream_id })));
        }
        None
    }

    /// The last chunk of the staged message was written; frees the slot.
    pub(crate) fn msg_sent(&self) {
        self.send.send_modify(|s| s.buf_begin += 1);
    }

    pub(crate) fn close_sent(&self) {
        self.closed.lock().close_sent = true;
    }
}

/// Closes the stream if dropped while armed, i.e. when the operation holding
/// it is cancelled mid-wait.
struct CloseOnDrop<'a> {
    stream: &'a Stream,
    armed: bool,
}

impl Drop for CloseOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!("stream {:X} operation cancelled", self.stream.id());
            self.stream.close();
        }
    }
}

/// A multiplexed, flow-controlled, bidirectional message stream.
///
/// A `Stream` is created by [`Mux::connect`](crate::Mux::connect) or
/// [`Mux::accept`](crate::Mux::accept). Dropping it closes the sending half.
pub struct Stream {
    state: Arc<StreamState>,
    queue: Arc<SendQueue>,
}

impl Stream {
    pub(crate) fn new(state: Arc<StreamState>, queue: Arc<SendQueue>) -> Self {
        Self { state, queue }
    }

    pub fn id(&self) -> StreamId {
        self.state.id
    }

    pub fn kind(&self) -> StreamKind {
        self.state.kind
    }

    /// The largest message the peer accepts, known once the stream is open.
    pub fn max_send_msg_size(&self) -> u64 {
        self.state.send.lock().max_msg_size
    }

    /// Stages frames and enqueues the stream for the send loop. Returns false,
    /// staging nothing, once Close has been staged.
    fn stage(&self, f: impl FnOnce(&mut Outbox)) -> bool {
        let enqueue = {
            let mut outbox = self.state.outbox.lock();
            if outbox.close_staged {
                return false;
            }
            f(&mut outbox);
            // Nobody drains the queue after the connection is gone.
            let enqueue =
                !outbox.queued && outbox.has_pending() && !self.state.closed.lock().reset;
            outbox.queued |= enqueue;
            enqueue
        };
        if enqueue {
            self.queue.send_modify(|q| q.push_back(self.state.clone()));
        }
        true
    }

    fn stage_msg(&self, msg: Bytes) -> MuxResult<()> {
        if self.stage(|o| o.msg = Some(msg)) {
            return Ok(());
        }
        // Closed after the slot was taken; give it back.
        self.state.send.send_modify(|s| s.begin -= 1);
        Err(MuxError::StreamClosed(self.id()))
    }

    fn stage_resize(&self, window_end: u64) {
        self.stage(|o| o.resize = Some(window_end));
    }

    /// Announces our receive limits and waits for the peer's.
    pub(crate) async fn open(&self, max_msg_size: u64, window: u64) -> MuxResult<()> {
        self.state.recv.send_modify(|r| {
            if r.opened {
                return Err(MuxError::AlreadyOpened);
            }
            r.opened = true;
            r.max_msg_size = max_msg_size;
            r.end = window;
            r.msgs = std::iter::repeat_with(BytesMut::new)
                .take(window as usize)
                .collect();
            Ok(())
        })?;
        self.stage(|o| o.open = Some((max_msg_size, window)));

        let mut guard = CloseOnDrop {
            stream: self,
            armed: true,
        };
        let id = self.id();
        let result = self
            .state
            .send
            .wait_for(|s| {
                let closed = self.state.closed.lock();
                if closed.reset {
                    Some(Err(MuxError::ConnectionClosed))
                } else if s.remote_opened {
                    Some(Ok(()))
                } else if closed.local || closed.remote {
                    Some(Err(MuxError::StreamClosed(id)))
                } else {
                    None
                }
            })
            .await;
        guard.armed = false;
        result
    }

    /// Sends one message.
    ///
    /// Waits until the previous message has been handed to the transport and
    /// the peer has granted window for another one. Fails with
    /// [`MuxError::StreamClosed`] once the stream can never send again, and
    /// with [`MuxError::MessageTooLarge`] if `msg` exceeds the peer's limit,
    /// in which case nothing is consumed. Dropping the returned future closes
    /// the stream.
    pub async fn send(&self, msg: impl Into<Bytes>) -> MuxResult<()> {
        let msg = msg.into();
        let size = msg.len() as u64;
        let id = self.id();

        let mut guard = CloseOnDrop {
            stream: self,
            armed: true,
        };
        let result = self
            .state
            .send
            .wait_for(|s| {
                let closed = self.state.closed.lock();
                if closed.reset {
                    return Some(Err(MuxError::ConnectionClosed));
                }
                if closed.local || (closed.remote && s.begin == s.end) {
                    return Some(Err(MuxError::StreamClosed(id)));
                }
                if s.buf_begin != s.begin || s.begin >= s.end {
                    return None;
                }
                // The peer's limit may only be known now that it has opened.
                if size > s.max_msg_size {
                    return Some(Err(MuxError::MessageTooLarge {
                        size,
                        max: s.max_msg_size,
                    }));
                }
                s.begin += 1;
                Some(Ok(()))
            })
            .await;
        guard.armed = false;
        result?;
        self.stage_msg(msg)
    }

    /// Receives one message.
    ///
    /// Buffered messages are returned even after the peer closed the stream;
    /// once they are drained this fails with [`MuxError::StreamClosed`]. With
    /// `free_buffer` set the consumed slot is granted back to the peer.
    pub async fn recv(&self, free_buffer: bool) -> MuxResult<Bytes> {
        let id = self.id();
        let (msg, window_end) = self
            .state
            .recv
            .wait_for(|r| {
                let closed = self.state.closed.lock();
                if r.begin < r.used {
                    let msg = r.pop_front();
                    let window_end = (free_buffer && !closed.local && !closed.reset).then(|| {
                        r.end = r.begin + r.capacity();
                        r.end
                    });
                    return Some(Ok((msg, window_end)));
                }
                if closed.reset {
                    Some(Err(MuxError::ConnectionClosed))
                } else if closed.remote {
                    Some(Err(MuxError::StreamClosed(id)))
                } else {
                    None
                }
            })
            .await?;
        if let Some(window_end) = window_end {
            self.stage_resize(window_end);
        }
        Ok(msg)
    }

    /// Closes the sending half. Calling it again has no effect.
    pub fn close(&self) {
        {
            let mut closed = self.state.closed.lock();
            if closed.local {
                return;
            }
            closed.local = true;
        }
        debug!("stream {:X} closed", self.id());
        self.stage(|o| {
            o.close = true;
            o.close_staged = true;
        });
        self.state.send.notify();
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    fn new_stream(id: StreamId) -> (Stream, Arc<SendQueue>) {
        let queue = Arc::new(SendQueue::new(VecDeque::new()));
        let state = Arc::new(StreamState::new(id, 1));
        (Stream::new(state, queue.clone()), queue)
    }

    fn drain(state: &StreamState) -> Vec<Frame> {
        let mut frames = Vec::new();
        loop {
            let (outgoing, more) = state.pop_outgoing(1024);
            if let Some(outgoing) = outgoing {
                if outgoing.msg_done {
                    state.msg_sent();
                }
                frames.push(outgoing.frame);
            }
            if !more {
                return frames;
            }
        }
    }

    fn check_invariants(state: &StreamState) {
        let s = state.send.lock();
        assert!(s.buf_begin <= s.begin && s.begin <= s.end);
        let r = state.recv.lock();
        assert!(r.begin <= r.used && r.used <= r.end && r.end <= r.begin + r.capacity());
    }

    /// Opens `stream` as if the peer had already announced its limits.
    async fn open(stream: &Stream, peer_max_msg_size: u64, peer_window: u64, window: u64) {
        stream.state.remote_open(peer_max_msg_size).unwrap();
        stream.state.remote_window_end(peer_window).unwrap();
        stream.open(1024, window).await.unwrap();
    }

    #[tokio::test]
    async fn open_twice() {
        let (stream, _) = new_stream(1);
        open(&stream, 10, 1, 2).await;
        assert!(matches!(
            stream.open(10, 2).await,
            Err(MuxError::AlreadyOpened)
        ));
        assert!(matches!(
            stream.state.remote_open(10),
            Err(MuxError::AlreadyOpened)
        ));
    }

    #[tokio::test]
    async fn oversized_send_has_no_effect() {
        let (stream, queue) = new_stream(0);
        open(&stream, 10, 4, 2).await;
        drain(&stream.state);
        assert!(queue.lock().pop_front().is_some());

        let err = stream.send(vec![0u8; 11]).await.unwrap_err();
        assert!(matches!(err, MuxError::MessageTooLarge { size: 11, max: 10 }));
        assert_eq!(stream.state.send.lock().begin, 0);
        assert!(queue.lock().is_empty());
        assert!(drain(&stream.state).is_empty());

        stream.send(vec![0u8; 10]).await.unwrap();
        assert_eq!(stream.state.send.lock().begin, 1);
        check_invariants(&stream.state);
    }

    #[tokio::test]
    async fn one_message_in_flight() {
        let (stream, _queue) = new_stream(0);
        open(&stream, 100, 8, 2).await;
        drain(&stream.state);

        stream.send(&b"first"[..]).await.unwrap();
        // The slot is taken until the send loop writes the message out.
        let blocked = tokio::time::timeout(Duration::from_millis(20), stream.send(&b"second"[..]));
        assert!(blocked.await.is_err());
        // The cancelled send closed the stream.
        assert!(stream.state.closed.lock().local);
        let frames = drain(&stream.state);
        assert!(matches!(frames[0], Frame::Msg(Msg { msg_end: true, payload_size: 5, .. })));
        assert!(matches!(frames[1], Frame::Close(_)));
        check_invariants(&stream.state);
    }

    #[tokio::test]
    async fn send_waits_for_window() {
        let (stream, _queue) = new_stream(0);
        open(&stream, 100, 1, 2).await;
        drain(&stream.state);

        stream.send(&b"a"[..]).await.unwrap();
        drain(&stream.state);
        let state = stream.state.clone();
        let resize = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            state.remote_window_end(2).unwrap();
        });
        stream.send(&b"b"[..]).await.unwrap();
        resize.await.unwrap();
        check_invariants(&stream.state);
    }

    #[tokio::test]
    async fn send_fails_after_remote_close_with_no_window() {
        let (stream, _queue) = new_stream(0);
        open(&stream, 100, 1, 2).await;
        drain(&stream.state);
        stream.send(&b"a"[..]).await.unwrap();
        drain(&stream.state);
        stream.state.remote_close().unwrap();
        assert!(matches!(
            stream.send(&b"b"[..]).await,
            Err(MuxError::StreamClosed(0))
        ));
    }

    #[tokio::test]
    async fn close_drains_then_fails() {
        let (stream, _queue) = new_stream(1);
        open(&stream, 100, 1, 4).await;
        for msg in [&b"one"[..], &b"two"[..]] {
            stream.state.remote_payload_size(msg.len() as u64).unwrap();
            stream.state.remote_payload(msg);
            stream.state.remote_msg_end().unwrap();
        }
        stream.state.remote_close().unwrap();
        assert!(matches!(
            stream.state.remote_close(),
            Err(MuxError::AlreadyClosed)
        ));

        assert_eq!(stream.recv(false).await.unwrap(), &b"one"[..]);
        assert_eq!(stream.recv(false).await.unwrap(), &b"two"[..]);
        assert!(matches!(
            stream.recv(false).await,
            Err(MuxError::StreamClosed(1))
        ));
        check_invariants(&stream.state);
    }

    #[tokio::test]
    async fn payload_is_assembled_across_frames() {
        let (stream, _queue) = new_stream(1);
        stream.state.remote_open(100).unwrap();
        stream.open(6, 1).await.unwrap();

        stream.state.remote_payload_size(4).unwrap();
        stream.state.remote_payload(b"abcd");
        stream.state.remote_payload_size(2).unwrap();
        stream.state.remote_payload(b"ef");
        assert!(matches!(
            stream.state.remote_payload_size(1),
            Err(MuxError::MessageTooLarge { size: 7, max: 6 })
        ));
        stream.state.remote_msg_end().unwrap();

        // The window is one message.
        assert!(matches!(
            stream.state.remote_payload_size(0),
            Err(MuxError::BufferFull)
        ));
        assert!(matches!(
            stream.state.remote_msg_end(),
            Err(MuxError::BufferFull)
        ));
        assert_eq!(stream.recv(false).await.unwrap(), &b"abcdef"[..]);
        check_invariants(&stream.state);
    }

    #[tokio::test]
    async fn recv_grants_window_only_when_asked() {
        let (stream, _queue) = new_stream(1);
        open(&stream, 100, 1, 2).await;
        drain(&stream.state);
        for _ in 0..2 {
            stream.state.remote_payload_size(1).unwrap();
            stream.state.remote_payload(b"x");
            stream.state.remote_msg_end().unwrap();
        }

        stream.recv(false).await.unwrap();
        assert_eq!(stream.state.recv.lock().end, 2);
        assert!(drain(&stream.state).is_empty());

        stream.recv(true).await.unwrap();
        assert_eq!(stream.state.recv.lock().end, 4);
        assert_eq!(
            drain(&stream.state),
            vec![Frame::Resize(Resize {
                stream_id: 1,
                window_end: 4
            })]
        );
        check_invariants(&stream.state);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (stream, queue) = new_stream(0);
        open(&stream, 100, 1, 1).await;
        drain(&stream.state);
        queue.lock().clear();

        stream.close();
        stream.close();
        assert_eq!(queue.lock().len(), 1);
        assert_eq!(drain(&stream.state), vec![Frame::Close(Close { stream_id: 0 })]);
        assert!(matches!(
            stream.send(&b"x"[..]).await,
            Err(MuxError::StreamClosed(0))
        ));
    }

    #[tokio::test]
    async fn nothing_is_staged_after_close() {
        let (stream, _queue) = new_stream(1);
        open(&stream, 100, 2, 2).await;
        drain(&stream.state);
        stream.close();
        assert_eq!(drain(&stream.state), vec![Frame::Close(Close { stream_id: 1 })]);

        // A window grant decided before close.
        stream.stage_resize(4);
        // A send that took its slot before close.
        stream.state.send.send_modify(|s| s.begin += 1);
        assert!(matches!(
            stream.stage_msg(Bytes::from_static(b"late")),
            Err(MuxError::StreamClosed(1))
        ));
        assert_eq!(stream.state.send.lock().begin, 0);
        assert!(drain(&stream.state).is_empty());
        check_invariants(&stream.state);
    }

    #[test]
    fn close_is_last_under_concurrent_callers() {
        for _ in 0..2000 {
            let (stream, _queue) = new_stream(1);
            futures::executor::block_on(open(&stream, 100, 2, 2));
            drain(&stream.state);
            stream.state.remote_payload_size(1).unwrap();
            stream.state.remote_payload(b"x");
            stream.state.remote_msg_end().unwrap();

            let frames = std::thread::scope(|scope| {
                let recv = scope.spawn(|| {
                    futures::executor::block_on(stream.recv(true)).unwrap();
                });
                let send = scope.spawn(|| {
                    let _ = futures::executor::block_on(stream.send(&b"y"[..]));
                });
                let close = scope.spawn(|| stream.close());

                let mut frames = Vec::new();
                while !(recv.is_finished() && send.is_finished() && close.is_finished()) {
                    if let (Some(outgoing), _) = stream.state.pop_outgoing(1024) {
                        if outgoing.msg_done {
                            stream.state.msg_sent();
                        }
                        frames.push(outgoing.frame);
                    }
                }
                frames.extend(drain(&stream.state));
                frames
            });
            let close = frames
                .iter()
                .position(|f| matches!(f, Frame::Close(_)))
                .unwrap();
            assert_eq!(close, frames.len() - 1, "{:?}", frames);
            check_invariants(&stream.state);
        }
    }

    #[tokio::test]
    async fn large_message_is_chunked() {
        let (stream, _queue) = new_stream(0);
        open(&stream, 100, 1, 1).await;
        drain(&stream.state);
        stream.send(vec![7u8; 25]).await.unwrap();

        let mut sizes = Vec::new();
        loop {
            let (outgoing, more) = stream.state.pop_outgoing(10);
            let outgoing = outgoing.unwrap();
            if let Frame::Msg(msg) = outgoing.frame {
                assert_eq!(msg.payload_size, outgoing.payload.len() as u64);
                assert_eq!(msg.msg_end, outgoing.msg_done);
                sizes.push(msg.payload_size);
            }
            if !more {
                break;
            }
        }
        assert_eq!(sizes, vec![10, 10, 5]);
        assert_eq!(stream.state.send.lock().buf_begin, 0);
    }

    #[tokio::test]
    async fn reset_stream_is_not_queued() {
        let (stream, queue) = new_stream(0);
        open(&stream, 100, 1, 1).await;
        drain(&stream.state);
        queue.lock().clear();

        stream.state.reset();
        drop(stream);
        assert!(queue.lock().is_empty());
    }

    #[tokio::test]
    async fn reset_fails_waiters() {
        let (stream, _queue) = new_stream(0);
        let stream = Arc::new(stream);
        let waiter = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.recv(false).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        stream.state.reset();
        assert!(matches!(
            waiter.await.unwrap(),
            Err(MuxError::ConnectionClosed)
        ));
        assert!(matches!(
            stream.open(10, 1).await,
            Err(MuxError::ConnectionClosed)
        ));
    }
}
