//! The HTTP/2 client connection driver.
//!
//! One connection runs two cooperating tasks: the read loop (the
//! [`Connection`] future) parses frames and dispatches them into
//! per-stream mailboxes, and a spawned write loop is the single writer,
//! serializing frames from all streams through one outbound queue. The
//! request-executing task owns only its stream's mailboxes and never
//! touches the socket.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use fnv::FnvHashMap;
use http::StatusCode;
use http::header::HeaderMap;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::sync::{Notify, mpsc, oneshot};

use crate::body::Payload;
use crate::error::Error;
use crate::fingerprint::PseudoOrder;
use crate::observe::dump::Dumper;
use crate::observe::trace::Tracer;
use crate::proto::{Io, WireRequest};

use super::H2Error;
use super::codec::{FramedRead, FramedWrite};
use super::flow::FlowControl;
use super::frame::{self, Frame, Priority, Reason, SettingsConfig, StreamDependency, StreamId};

/// Fingerprint-relevant knobs plus protocol limits for one connection.
#[derive(Debug, Clone)]
pub(crate) struct H2Config {
    /// Our SETTINGS frame, values and in-frame order preserved.
    pub(crate) settings: SettingsConfig,
    pub(crate) pseudo_order: PseudoOrder,
    /// Priority parameter attached to every request HEADERS frame.
    pub(crate) headers_priority: Option<StreamDependency>,
    /// Extra PRIORITY frames emitted right after the preface.
    pub(crate) priority_frames: Vec<Priority>,
    /// Connection-level WINDOW_UPDATE emitted right after SETTINGS.
    pub(crate) conn_window_bump: u32,
    /// Cap on a reassembled inbound header block.
    pub(crate) max_header_block: usize,
}

impl Default for H2Config {
    fn default() -> Self {
        Self {
            settings: SettingsConfig {
                enable_push: Some(0),
                ..Default::default()
            },
            pseudo_order: PseudoOrder::default(),
            headers_priority: None,
            priority_frames: Vec::new(),
            conn_window_bump: 0,
            max_header_block: 1024 * 1024,
        }
    }
}

/// What the read loop pushes into a stream's body mailbox.
enum StreamEvent {
    Data(Bytes),
    Trailers(HeaderMap),
    End,
    Error(StreamFault),
}

/// Cloneable description of a stream failure; materialized into an
/// [`Error`] at the surface.
#[derive(Debug, Clone)]
enum StreamFault {
    Reset(Reason),
    /// Stream refused before processing; safe to replay.
    Refused(Reason),
    Conn(Reason),
    Closed,
    Io(String),
}

impl StreamFault {
    fn to_error(&self) -> Error {
        match self {
            Self::Reset(reason) => Error::new_h2_stream(*reason, false),
            Self::Refused(reason) => Error::new_h2_stream(*reason, true),
            Self::Conn(reason) => Error::new_h2_conn(*reason),
            Self::Closed => Error::new_incomplete(),
            Self::Io(msg) => Error::new_read(msg.clone()),
        }
    }
}

enum WriteMessage {
    Frame(Frame),
    ApplyPeerSettings {
        max_frame_size: Option<u32>,
        header_table_size: Option<u32>,
    },
}

struct StreamState {
    head_tx: Option<oneshot::Sender<(StatusCode, HeaderMap, bool)>>,
    events: mpsc::UnboundedSender<StreamEvent>,
    send_flow: FlowControl,
    recv_flow: FlowControl,
    local_closed: bool,
    remote_closed: bool,
}

struct Inner {
    streams: FnvHashMap<StreamId, StreamState>,
    next_id: StreamId,
    conn_send_flow: FlowControl,
    conn_recv_flow: FlowControl,
    /// Peer's SETTINGS_INITIAL_WINDOW_SIZE, applied to new streams.
    peer_initial_window: u32,
    peer_max_streams: Option<u32>,
    /// Our advertised per-stream receive window.
    local_initial_window: u32,
    goaway: Option<(StreamId, Reason)>,
    fatal: Option<StreamFault>,
    /// Streams counted against the peer's concurrency limit.
    open: usize,
    pending_pings: VecDeque<oneshot::Sender<()>>,
}

impl Inner {
    /// Removes a fully-closed stream and releases its concurrency slot.
    fn finish_stream(&mut self, id: StreamId) -> bool {
        if self.streams.remove(&id).is_some() {
            self.open = self.open.saturating_sub(1);
            true
        } else {
            false
        }
    }
}

struct Shared {
    outbound: mpsc::UnboundedSender<WriteMessage>,
    inner: Mutex<Inner>,
    /// Send-window or settings changed; body pumps re-check capacity.
    capacity: Notify,
    /// A concurrency slot freed up; queued openers re-check.
    slots: Notify,
    /// Dropped alongside the last user handle; tells the read loop to
    /// shut the socket down.
    closed: Arc<Notify>,
    config: H2Config,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.closed.notify_waiters();
    }
}

impl Shared {
    fn fail_all(&self, fault: StreamFault) {
        let mut inner = self.inner.lock();
        inner.fatal = Some(fault.clone());
        for (_, stream) in inner.streams.drain() {
            let _ = stream.events.send(StreamEvent::Error(fault.clone()));
            drop(stream.head_tx);
        }
        inner.open = 0;
        inner.pending_pings.clear();
        drop(inner);
        self.capacity.notify_waiters();
        self.slots.notify_waiters();
    }
}

/// Performs the client-side connection setup: preface, SETTINGS, the
/// configured PRIORITY frames and connection window bump.
pub(crate) async fn handshake(
    io: Io,
    config: H2Config,
) -> crate::Result<(SendRequest, Connection)> {
    let (read_half, write_half) = tokio::io::split(io);

    let mut framed_write = FramedWrite::new(write_half);
    framed_write
        .write_preface()
        .await
        .map_err(Error::new_write)?;
    framed_write
        .write_frame(Frame::Settings(frame::Settings::new(
            config.settings.clone(),
        )))
        .await
        .map_err(Error::new_write)?;
    for priority in &config.priority_frames {
        framed_write
            .write_frame(Frame::Priority(priority.clone()))
            .await
            .map_err(Error::new_write)?;
    }
    if config.conn_window_bump > 0 {
        framed_write
            .write_frame(Frame::WindowUpdate(frame::WindowUpdate::new(
                StreamId::ZERO,
                config.conn_window_bump,
            )))
            .await
            .map_err(Error::new_write)?;
    }
    framed_write.flush().await.map_err(Error::new_write)?;

    let local_initial_window = config
        .settings
        .initial_window_size
        .unwrap_or(frame::DEFAULT_INITIAL_WINDOW_SIZE);
    let max_frame_size = config
        .settings
        .max_frame_size
        .unwrap_or(frame::DEFAULT_MAX_FRAME_SIZE);

    let framed_read = FramedRead::new(read_half, max_frame_size, config.max_header_block);

    let (outbound, write_rx) = mpsc::unbounded_channel();
    let closed = Arc::new(Notify::new());

    let push_allowed = config.settings.enable_push == Some(1);
    let shared = Arc::new(Shared {
        outbound: outbound.clone(),
        inner: Mutex::new(Inner {
            streams: FnvHashMap::default(),
            next_id: StreamId::ZERO,
            conn_send_flow: FlowControl::new(frame::DEFAULT_INITIAL_WINDOW_SIZE),
            conn_recv_flow: FlowControl::new(
                frame::DEFAULT_INITIAL_WINDOW_SIZE + config.conn_window_bump,
            ),
            peer_initial_window: frame::DEFAULT_INITIAL_WINDOW_SIZE,
            peer_max_streams: None,
            local_initial_window,
            goaway: None,
            fatal: None,
            open: 0,
            pending_pings: VecDeque::new(),
        }),
        capacity: Notify::new(),
        slots: Notify::new(),
        closed: closed.clone(),
        config,
    });

    let send_request = SendRequest {
        shared: shared.clone(),
    };
    let connection = Connection {
        framed_read,
        framed_write,
        write_rx,
        outbound,
        shared: Arc::downgrade(&shared),
        closed,
        push_allowed,
    };

    Ok((send_request, connection))
}

// ===== Connection (read loop) =====

/// The connection driver; the pool spawns it and it runs until the
/// socket closes or every user handle is gone.
pub(crate) struct Connection {
    framed_read: FramedRead<ReadHalf<Io>>,
    framed_write: FramedWrite<WriteHalf<Io>>,
    write_rx: mpsc::UnboundedReceiver<WriteMessage>,
    outbound: mpsc::UnboundedSender<WriteMessage>,
    shared: Weak<Shared>,
    closed: Arc<Notify>,
    push_allowed: bool,
}

impl Connection {
    pub(crate) async fn run(self) {
        let Self {
            mut framed_read,
            mut framed_write,
            mut write_rx,
            outbound,
            shared,
            closed,
            push_allowed,
        } = self;

        // The single writer: everything reaches the socket through here.
        let write_task = tokio::spawn(async move {
            while let Some(message) = write_rx.recv().await {
                match message {
                    WriteMessage::Frame(frame) => {
                        if let Err(err) = framed_write.write_frame(frame).await {
                            tracing::debug!("h2 write failed: {err}");
                            break;
                        }
                    }
                    WriteMessage::ApplyPeerSettings {
                        max_frame_size,
                        header_table_size,
                    } => framed_write.apply_peer_settings(max_frame_size, header_table_size),
                }
                if write_rx.is_empty() {
                    if let Err(err) = framed_write.flush().await {
                        tracing::debug!("h2 flush failed: {err}");
                        break;
                    }
                }
            }
            let _ = framed_write.shutdown().await;
        });

        let read_loop = ReadLoop {
            outbound,
            shared,
            push_allowed,
        };

        let fault = loop {
            tokio::select! {
                frame = framed_read.read_frame() => match frame {
                    Ok(Some(frame)) => {
                        if let Err(err) = read_loop.dispatch(frame) {
                            break read_loop.fatal(err);
                        }
                    }
                    Ok(None) => break StreamFault::Closed,
                    Err(err) => break read_loop.fatal(err),
                },
                _ = closed.notified() => {
                    tracing::trace!("h2 connection released by all handles");
                    break StreamFault::Closed;
                }
            }
        };

        if let Some(shared) = read_loop.shared.upgrade() {
            shared.fail_all(fault);
        }
        drop(read_loop);
        let _ = write_task.await;
    }
}

struct ReadLoop {
    outbound: mpsc::UnboundedSender<WriteMessage>,
    shared: Weak<Shared>,
    push_allowed: bool,
}

impl ReadLoop {
    fn fatal(&self, err: H2Error) -> StreamFault {
        match err {
            H2Error::Proto(reason) => {
                // best effort GOAWAY before tearing down
                let _ = self
                    .outbound
                    .send(WriteMessage::Frame(Frame::GoAway(frame::GoAway::new(
                        StreamId::ZERO,
                        reason,
                    ))));
                StreamFault::Conn(reason)
            }
            H2Error::Io(err) => StreamFault::Io(err.to_string()),
        }
    }

    fn send(&self, frame: Frame) {
        let _ = self.outbound.send(WriteMessage::Frame(frame));
    }

    fn dispatch(&self, frame: Frame) -> Result<(), H2Error> {
        let shared = match self.shared.upgrade() {
            Some(shared) => shared,
            None => return Ok(()),
        };

        match frame {
            Frame::Headers(headers) => self.recv_headers(&shared, headers)?,
            Frame::Data(data) => self.recv_data(&shared, data)?,
            Frame::WindowUpdate(update) => {
                let mut inner = shared.inner.lock();
                if update.stream_id().is_zero() {
                    inner
                        .conn_send_flow
                        .grant(update.size_increment())
                        .map_err(H2Error::Proto)?;
                } else if let Some(stream) = inner.streams.get_mut(&update.stream_id()) {
                    if stream.send_flow.grant(update.size_increment()).is_err() {
                        // stream-level overflow resets only that stream
                        let id = update.stream_id();
                        let _ = stream.events.send(StreamEvent::Error(StreamFault::Reset(
                            Reason::FLOW_CONTROL_ERROR,
                        )));
                        inner.finish_stream(id);
                        drop(inner);
                        self.send(Frame::Reset(frame::Reset::new(
                            id,
                            Reason::FLOW_CONTROL_ERROR,
                        )));
                        shared.slots.notify_waiters();
                        shared.capacity.notify_waiters();
                        return Ok(());
                    }
                }
                drop(inner);
                shared.capacity.notify_waiters();
            }
            Frame::Settings(settings) => {
                if settings.is_ack() {
                    return Ok(());
                }
                let config = settings.config;
                {
                    let mut inner = shared.inner.lock();
                    if let Some(size) = config.initial_window_size {
                        let delta = size as i64 - inner.peer_initial_window as i64;
                        inner.peer_initial_window = size;
                        for stream in inner.streams.values_mut() {
                            stream.send_flow.shift(delta);
                        }
                    }
                    if let Some(max) = config.max_concurrent_streams {
                        inner.peer_max_streams = Some(max);
                    }
                }
                // apply encode-side settings in the writer, then ACK
                let _ = self.outbound.send(WriteMessage::ApplyPeerSettings {
                    max_frame_size: config.max_frame_size,
                    header_table_size: config.header_table_size,
                });
                self.send(Frame::Settings(frame::Settings::ack()));
                shared.capacity.notify_waiters();
                shared.slots.notify_waiters();
            }
            Frame::Ping(ping) => {
                if ping.is_ack() {
                    let waiter = shared.inner.lock().pending_pings.pop_front();
                    if let Some(waiter) = waiter {
                        let _ = waiter.send(());
                    }
                } else {
                    self.send(Frame::Ping(frame::Ping::pong(ping.payload())));
                }
            }
            Frame::GoAway(go_away) => {
                let last = go_away.last_stream_id();
                let reason = go_away.reason();
                tracing::debug!("received GOAWAY; last_stream_id={last:?} reason={reason:?}");
                let mut inner = shared.inner.lock();
                inner.goaway = Some((last, reason));
                let doomed: Vec<StreamId> = inner
                    .streams
                    .keys()
                    .copied()
                    .filter(|id| *id > last)
                    .collect();
                for id in doomed {
                    if let Some(stream) = inner.streams.remove(&id) {
                        // streams above the goaway line were never
                        // processed; they are safe to replay elsewhere
                        let _ = stream
                            .events
                            .send(StreamEvent::Error(StreamFault::Refused(reason)));
                        inner.open = inner.open.saturating_sub(1);
                    }
                }
                drop(inner);
                shared.slots.notify_waiters();
                shared.capacity.notify_waiters();
            }
            Frame::Reset(reset) => {
                let mut inner = shared.inner.lock();
                if let Some(stream) = inner.streams.remove(&reset.stream_id()) {
                    let fault = if reset.reason() == Reason::REFUSED_STREAM {
                        StreamFault::Refused(reset.reason())
                    } else {
                        StreamFault::Reset(reset.reason())
                    };
                    let _ = stream.events.send(StreamEvent::Error(fault));
                    inner.open = inner.open.saturating_sub(1);
                }
                drop(inner);
                shared.slots.notify_waiters();
                shared.capacity.notify_waiters();
            }
            Frame::PushPromise(promise) => {
                if !self.push_allowed {
                    // we advertised ENABLE_PUSH=0
                    return Err(H2Error::Proto(Reason::PROTOCOL_ERROR));
                }
                // accepted on the wire, never surfaced
                self.send(Frame::Reset(frame::Reset::new(
                    promise.promised_id(),
                    Reason::REFUSED_STREAM,
                )));
            }
            Frame::Priority(_) => {
                // advisory; nothing to do
            }
        }
        Ok(())
    }

    fn recv_headers(&self, shared: &Arc<Shared>, headers: frame::Headers) -> Result<(), H2Error> {
        let id = headers.stream_id();
        let end_stream = headers.is_end_stream();

        let mut inner = shared.inner.lock();
        let stream = match inner.streams.get_mut(&id) {
            Some(stream) => stream,
            None => {
                // closed or canceled stream; frames may still be in flight
                tracing::trace!("HEADERS on unknown stream {id:?}");
                return Ok(());
            }
        };

        if stream.head_tx.is_some() {
            let (status, fields) = headers.into_response().map_err(H2Error::from)?;
            if status.is_informational() {
                tracing::trace!("skipping 1xx response headers");
                return Ok(());
            }
            if let Some(tx) = stream.head_tx.take() {
                let _ = tx.send((status, fields, end_stream));
            }
        } else {
            // second block on an open stream is trailers
            let trailers = headers.into_trailers().map_err(H2Error::from)?;
            let _ = stream.events.send(StreamEvent::Trailers(trailers));
        }

        if end_stream {
            let _ = stream.events.send(StreamEvent::End);
            stream.remote_closed = true;
            if stream.local_closed {
                inner.finish_stream(id);
                drop(inner);
                shared.slots.notify_waiters();
            }
        }
        Ok(())
    }

    fn recv_data(&self, shared: &Arc<Shared>, data: frame::Data) -> Result<(), H2Error> {
        let id = data.stream_id();
        let flow_len = data.flow_len();
        let end_stream = data.is_end_stream();

        let mut inner = shared.inner.lock();

        // Connection-level accounting happens even for unknown streams.
        inner
            .conn_recv_flow
            .receive(flow_len)
            .map_err(H2Error::Proto)?;
        if flow_len > 0 {
            // replenish the connection window immediately; the
            // per-stream budget is what applies backpressure
            let _ = inner.conn_recv_flow.grant(flow_len);
            self.send(Frame::WindowUpdate(frame::WindowUpdate::new(
                StreamId::ZERO,
                flow_len,
            )));
        }

        let stream = match inner.streams.get_mut(&id) {
            Some(stream) => stream,
            None => {
                tracing::trace!("DATA on unknown stream {id:?}");
                return Ok(());
            }
        };
        stream.recv_flow.receive(flow_len).map_err(H2Error::Proto)?;

        let _ = stream.events.send(StreamEvent::Data(data.into_payload()));
        if end_stream {
            let _ = stream.events.send(StreamEvent::End);
            stream.remote_closed = true;
            if stream.local_closed {
                inner.finish_stream(id);
                drop(inner);
                shared.slots.notify_waiters();
            }
        }
        Ok(())
    }
}

// ===== SendRequest =====

/// A cloneable handle for multiplexing requests onto one connection.
#[derive(Clone)]
pub(crate) struct SendRequest {
    shared: Arc<Shared>,
}

/// The response head delivered once the peer's HEADERS arrive.
pub(crate) struct ResponseHead {
    pub(crate) status: StatusCode,
    pub(crate) headers: HeaderMap,
}

impl SendRequest {
    /// True while the connection accepts new streams.
    pub(crate) fn is_usable(&self) -> bool {
        let inner = self.shared.inner.lock();
        inner.fatal.is_none() && inner.goaway.is_none()
    }

    /// True when a new stream can start right now without queueing on
    /// the peer's concurrency limit.
    pub(crate) fn has_capacity(&self) -> bool {
        let inner = self.shared.inner.lock();
        match inner.peer_max_streams {
            Some(max) => (inner.open as u32) < max,
            None => true,
        }
    }

    /// Application-level PING; resolves when the ACK arrives.
    pub(crate) async fn ping(&self) -> crate::Result<()> {
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.shared.inner.lock();
            if let Some(fault) = &inner.fatal {
                return Err(fault.to_error());
            }
            inner.pending_pings.push_back(tx);
        }
        self.send_frame(Frame::Ping(frame::Ping::new(*b"fletchpg")))?;
        rx.await.map_err(|_| Error::new_closed())
    }

    fn send_frame(&self, frame: Frame) -> crate::Result<()> {
        self.shared
            .outbound
            .send(WriteMessage::Frame(frame))
            .map_err(|_| Error::new_closed())
    }

    /// Sends one request and resolves with the response head and body
    /// stream. Dropping the returned future or the body stream resets
    /// the stream with CANCEL.
    pub(crate) async fn send_request(
        &self,
        wire: WireRequest,
        dumper: Dumper,
        tracer: Tracer,
    ) -> crate::Result<(ResponseHead, RecvStream)> {
        let payload = wire.payload;
        let has_body = !payload.is_empty();
        let body_len = payload.len();
        let end_stream = !has_body;

        // Queue on the peer's MAX_CONCURRENT_STREAMS. The slot future
        // is armed before the check so a slot freed in between is not
        // missed.
        let (id, mut events_rx, head_rx) = loop {
            let slot = self.shared.slots.notified();
            {
                let mut inner = self.shared.inner.lock();
                if let Some(fault) = &inner.fatal {
                    return Err(fault.to_error());
                }
                if let Some((_, reason)) = inner.goaway {
                    return Err(Error::new_h2_stream(reason, true));
                }
                let below_limit = match inner.peer_max_streams {
                    Some(max) => (inner.open as u32) < max,
                    None => true,
                };
                if below_limit {
                    let id = inner.next_id.next_client_id();
                    if id > StreamId::MAX {
                        // stream ids are spent; the connection retires
                        return Err(Error::new_h2_stream(Reason::NO_ERROR, true));
                    }
                    inner.next_id = id;
                    inner.open += 1;

                    let (head_tx, head_rx) = oneshot::channel();
                    let (events_tx, events_rx) = mpsc::unbounded_channel();
                    let local_window = inner.local_initial_window;
                    let peer_window = inner.peer_initial_window;
                    inner.streams.insert(
                        id,
                        StreamState {
                            head_tx: Some(head_tx),
                            events: events_tx,
                            send_flow: FlowControl::new(peer_window),
                            recv_flow: FlowControl::new(local_window),
                            local_closed: end_stream,
                            remote_closed: false,
                        },
                    );
                    break (id, events_rx, head_rx);
                }
            }
            slot.await;
        };

        let guard = StreamGuard {
            shared: self.shared.clone(),
            id,
            armed: true,
        };

        let fields = build_fields(
            &wire.method,
            wire.scheme,
            &wire.authority,
            &wire.path_and_query,
            &wire.headers,
            wire.header_order.as_ref(),
            body_len,
            &self.shared.config.pseudo_order,
        );

        if dumper.is_enabled() {
            dumper.request_head(&render_block(
                fields.iter().map(|f| (f.name.as_ref(), f.value.as_ref())),
            ));
        }

        let mut headers = frame::Headers::new(id, fields, end_stream);
        headers.priority = self.shared.config.headers_priority.clone();
        self.send_frame(Frame::Headers(headers))?;

        if has_body {
            let pump = BodyPump {
                shared: self.shared.clone(),
                id,
                dumper: dumper.clone(),
            };
            tokio::spawn(pump.run(payload));
        }
        tracer.wrote_request();

        let (status, headers, remote_done) = match head_rx.await {
            Ok(head) => head,
            Err(_) => {
                // the stream died before a head arrived; dig the true
                // fault out of the mailbox, else the connection latch
                let fault = loop {
                    match events_rx.try_recv() {
                        Ok(StreamEvent::Error(fault)) => break Some(fault),
                        Ok(_) => continue,
                        Err(_) => break None,
                    }
                };
                return Err(match fault {
                    Some(fault) => fault.to_error(),
                    None => {
                        let inner = self.shared.inner.lock();
                        match &inner.fatal {
                            Some(fault) => fault.to_error(),
                            None => Error::new_closed(),
                        }
                    }
                });
            }
        };
        tracer.first_byte();

        if dumper.is_enabled() {
            let status_line = [(&b":status"[..], status.as_str().as_bytes())];
            let rest = headers
                .iter()
                .map(|(name, value)| (name.as_str().as_bytes(), value.as_bytes()));
            dumper.response_head(&render_block(status_line.into_iter().chain(rest)));
        }

        let body = RecvStream {
            events: events_rx,
            buffered: Bytes::new(),
            guard,
            done: remote_done,
            trailers: None,
            dumper,
        };

        Ok((ResponseHead { status, headers }, body))
    }
}

fn render_block<'a>(fields: impl Iterator<Item = (&'a [u8], &'a [u8])>) -> Vec<u8> {
    let mut rendered = Vec::new();
    for (name, value) in fields {
        rendered.extend_from_slice(name);
        rendered.extend_from_slice(b": ");
        rendered.extend_from_slice(value);
        rendered.extend_from_slice(b"\r\n");
    }
    rendered.extend_from_slice(b"\r\n");
    rendered
}

/// Builds the wire-ordered field list: pseudo fields in the configured
/// order first, then regular headers (explicit order list honored),
/// never a pseudo field after a regular one.
fn build_fields(
    method: &http::Method,
    scheme: &str,
    authority: &str,
    path_and_query: &str,
    headers: &crate::headers::OrderedHeaders,
    order: Option<&crate::headers::HeaderOrder>,
    body_len: Option<u64>,
    pseudo_order: &PseudoOrder,
) -> Vec<frame::Field> {
    use crate::fingerprint::PseudoId;

    let mut fields = Vec::with_capacity(headers.len() + 5);
    for pseudo in pseudo_order.ids() {
        match pseudo {
            PseudoId::Method => fields.push(frame::Field::new(
                &b":method"[..],
                Bytes::copy_from_slice(method.as_str().as_bytes()),
            )),
            PseudoId::Scheme => fields.push(frame::Field::new(
                &b":scheme"[..],
                Bytes::copy_from_slice(scheme.as_bytes()),
            )),
            PseudoId::Authority => fields.push(frame::Field::new(
                &b":authority"[..],
                Bytes::copy_from_slice(authority.as_bytes()),
            )),
            PseudoId::Path => fields.push(frame::Field::new(
                &b":path"[..],
                Bytes::copy_from_slice(path_and_query.as_bytes()),
            )),
        }
    }

    for (name, value) in headers.iter_with_order(order) {
        if crate::headers::is_hop_by_hop(name) || *name == http::header::HOST {
            continue;
        }
        let sensitive = matches!(
            name.as_str(),
            "authorization" | "proxy-authorization" | "cookie"
        );
        fields.push(frame::Field {
            name: Bytes::copy_from_slice(name.as_str().as_bytes()),
            value: Bytes::copy_from_slice(value.as_bytes()),
            sensitive,
        });
    }

    if let Some(len) = body_len {
        if len > 0 {
            let mut buf = itoa::Buffer::new();
            fields.push(frame::Field::new(
                &b"content-length"[..],
                Bytes::copy_from_slice(buf.format(len).as_bytes()),
            ));
        }
    }

    fields
}

// ===== body pump =====

struct BodyPump {
    shared: Arc<Shared>,
    id: StreamId,
    dumper: Dumper,
}

enum PumpStep {
    Send { chunk: Bytes, last: bool },
    EmptyEnd,
    Stall,
    Done,
    Gone,
}

impl BodyPump {
    async fn run(self, payload: Payload) {
        let aborted = match payload {
            Payload::Empty => false,
            Payload::Full(bytes) => self.send_all(bytes, true).await.is_err(),
            Payload::Stream { mut reader, .. } => loop {
                let mut buf = BytesMut::with_capacity(16 * 1024);
                match reader.read_buf(&mut buf).await {
                    Ok(0) => break self.send_all(Bytes::new(), true).await.is_err(),
                    Ok(_) => {
                        if self.send_all(buf.freeze(), false).await.is_err() {
                            break true;
                        }
                    }
                    Err(err) => {
                        tracing::debug!("request body read failed: {err}");
                        self.reset(Reason::INTERNAL_ERROR);
                        break true;
                    }
                }
            },
        };

        if aborted {
            tracing::trace!("body pump aborted; stream {:?}", self.id);
        }
    }

    /// Sends `data`, respecting connection and stream send windows and
    /// the peer's max frame size; stalls until WINDOW_UPDATE when the
    /// window is exhausted.
    async fn send_all(&self, mut data: Bytes, end_stream: bool) -> Result<(), ()> {
        loop {
            // armed before the capacity check; a WINDOW_UPDATE landing
            // in between must not be missed
            let capacity = self.shared.capacity.notified();
            let step = {
                let mut guard = self.shared.inner.lock();
                let inner = &mut *guard;
                if inner.fatal.is_some() {
                    PumpStep::Gone
                } else if data.is_empty() {
                    if end_stream {
                        self.mark_local_closed(inner);
                        PumpStep::EmptyEnd
                    } else {
                        PumpStep::Done
                    }
                } else {
                    let conn_available = inner.conn_send_flow.available();
                    match inner.streams.get_mut(&self.id) {
                        None => PumpStep::Gone,
                        Some(stream) => {
                            let available = stream.send_flow.available().min(conn_available);
                            if available == 0 {
                                PumpStep::Stall
                            } else {
                                let n = (available as usize).min(data.len());
                                stream.send_flow.claim(n as u32);
                                inner.conn_send_flow.claim(n as u32);
                                let chunk = data.split_to(n);
                                let last = end_stream && data.is_empty();
                                if last {
                                    self.mark_local_closed(inner);
                                }
                                PumpStep::Send { chunk, last }
                            }
                        }
                    }
                }
            };

            match step {
                PumpStep::Send { chunk, last } => {
                    self.dumper.request_body(&chunk);
                    if self
                        .shared
                        .outbound
                        .send(WriteMessage::Frame(Frame::Data(frame::Data::new(
                            self.id, chunk, last,
                        ))))
                        .is_err()
                    {
                        return Err(());
                    }
                    if last {
                        return Ok(());
                    }
                }
                PumpStep::EmptyEnd => {
                    let _ = self.shared.outbound.send(WriteMessage::Frame(Frame::Data(
                        frame::Data::new(self.id, Bytes::new(), true),
                    )));
                    return Ok(());
                }
                PumpStep::Done => return Ok(()),
                PumpStep::Stall => capacity.await,
                PumpStep::Gone => return Err(()),
            }
        }
    }

    /// Marks the send half closed; frees the slot when the peer is done
    /// too.
    fn mark_local_closed(&self, inner: &mut Inner) {
        let remote_closed = match inner.streams.get_mut(&self.id) {
            Some(stream) => {
                stream.local_closed = true;
                stream.remote_closed
            }
            None => return,
        };
        if remote_closed {
            inner.finish_stream(self.id);
            self.shared.slots.notify_waiters();
        }
    }

    fn reset(&self, reason: Reason) {
        let mut inner = self.shared.inner.lock();
        inner.finish_stream(self.id);
        drop(inner);
        let _ = self
            .shared
            .outbound
            .send(WriteMessage::Frame(Frame::Reset(frame::Reset::new(
                self.id, reason,
            ))));
        self.shared.slots.notify_waiters();
    }
}

// ===== stream guard + receive stream =====

/// Resets the stream with CANCEL when the user abandons it mid-flight.
struct StreamGuard {
    shared: Arc<Shared>,
    id: StreamId,
    armed: bool,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut inner = self.shared.inner.lock();
        if inner.finish_stream(self.id) {
            drop(inner);
            let _ = self
                .shared
                .outbound
                .send(WriteMessage::Frame(Frame::Reset(frame::Reset::new(
                    self.id,
                    Reason::CANCEL,
                ))));
            self.shared.slots.notify_waiters();
            self.shared.capacity.notify_waiters();
        }
    }
}

/// The inbound half of a stream: DATA chunks in order, then optional
/// trailers, then end-of-stream. Consuming bytes releases stream-level
/// flow-control budget back to the peer.
pub(crate) struct RecvStream {
    events: mpsc::UnboundedReceiver<StreamEvent>,
    buffered: Bytes,
    guard: StreamGuard,
    done: bool,
    trailers: Option<HeaderMap>,
    dumper: Dumper,
}

impl RecvStream {
    pub(crate) fn take_trailers(&mut self) -> Option<HeaderMap> {
        self.trailers.take()
    }

    fn release(&self, n: u32) {
        if n == 0 {
            return;
        }
        let mut inner = self.guard.shared.inner.lock();
        if let Some(stream) = inner.streams.get_mut(&self.guard.id) {
            if stream.recv_flow.grant(n).is_ok() {
                let _ = self
                    .guard
                    .shared
                    .outbound
                    .send(WriteMessage::Frame(Frame::WindowUpdate(
                        frame::WindowUpdate::new(self.guard.id, n),
                    )));
            }
        }
    }
}

impl AsyncRead for RecvStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        loop {
            if !self.buffered.is_empty() {
                let n = self.buffered.len().min(buf.remaining());
                let chunk = self.buffered.split_to(n);
                buf.put_slice(&chunk);
                self.release(n as u32);
                return Poll::Ready(Ok(()));
            }
            if self.done {
                self.guard.armed = false;
                return Poll::Ready(Ok(()));
            }

            match std::task::ready!(self.events.poll_recv(cx)) {
                Some(StreamEvent::Data(data)) => {
                    self.dumper.response_body(&data);
                    self.buffered = data;
                }
                Some(StreamEvent::Trailers(trailers)) => {
                    self.trailers = Some(trailers);
                }
                Some(StreamEvent::End) => {
                    self.done = true;
                }
                Some(StreamEvent::Error(fault)) => {
                    self.done = true;
                    self.guard.armed = false;
                    return Poll::Ready(Err(std::io::Error::other(fault.to_error())));
                }
                None => {
                    self.done = true;
                    self.guard.armed = false;
                    return Poll::Ready(Err(std::io::Error::other(Error::new_incomplete())));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::PseudoId;
    use crate::headers::OrderedHeaders;
    use http::header::{HeaderName, HeaderValue};

    fn field_names(fields: &[frame::Field]) -> Vec<String> {
        fields
            .iter()
            .map(|f| String::from_utf8_lossy(&f.name).into_owned())
            .collect()
    }

    #[test]
    fn pseudo_fields_follow_configured_order() {
        let mut headers = OrderedHeaders::new();
        headers.insert(
            HeaderName::from_static("user-agent"),
            HeaderValue::from_static("fletch"),
        );

        let firefox_like = PseudoOrder::new([
            PseudoId::Method,
            PseudoId::Path,
            PseudoId::Authority,
            PseudoId::Scheme,
        ]);
        let fields = build_fields(
            &http::Method::GET,
            "https",
            "example.com",
            "/",
            &headers,
            None,
            Some(0),
            &firefox_like,
        );

        assert_eq!(
            field_names(&fields),
            vec![":method", ":path", ":authority", ":scheme", "user-agent"]
        );
    }

    #[test]
    fn sensitive_and_hop_by_hop_handling() {
        let mut headers = OrderedHeaders::new();
        headers.insert(
            HeaderName::from_static("authorization"),
            HeaderValue::from_static("Bearer x"),
        );
        headers.insert(
            HeaderName::from_static("connection"),
            HeaderValue::from_static("keep-alive"),
        );
        headers.insert(http::header::HOST, HeaderValue::from_static("example.com"));

        let fields = build_fields(
            &http::Method::POST,
            "https",
            "example.com",
            "/submit",
            &headers,
            None,
            Some(11),
            &PseudoOrder::default(),
        );

        let names = field_names(&fields);
        assert!(!names.contains(&"connection".to_owned()));
        assert!(!names.contains(&"host".to_owned()));
        assert_eq!(names.last().map(String::as_str), Some("content-length"));

        let auth = fields
            .iter()
            .find(|f| f.name.as_ref() == b"authorization")
            .unwrap();
        assert!(auth.sensitive);
    }

    #[test]
    fn explicit_header_order_is_honored() {
        let mut headers = OrderedHeaders::new();
        headers.insert(
            HeaderName::from_static("accept"),
            HeaderValue::from_static("*/*"),
        );
        headers.insert(
            HeaderName::from_static("user-agent"),
            HeaderValue::from_static("fletch"),
        );
        headers.insert(
            HeaderName::from_static("x-extra"),
            HeaderValue::from_static("1"),
        );

        let order: crate::headers::HeaderOrder = [
            HeaderName::from_static("user-agent"),
            HeaderName::from_static("accept"),
        ]
        .into_iter()
        .collect();

        let fields = build_fields(
            &http::Method::GET,
            "https",
            "example.com",
            "/",
            &headers,
            Some(&order),
            Some(0),
            &PseudoOrder::default(),
        );

        let names = field_names(&fields);
        let regular: Vec<&str> = names
            .iter()
            .filter(|n| !n.starts_with(':'))
            .map(String::as_str)
            .collect();
        assert_eq!(regular, vec!["user-agent", "accept", "x-extra"]);
    }
}
