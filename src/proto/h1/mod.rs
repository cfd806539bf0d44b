//! HTTP/1.1 client transport.
//!
//! One connection serves one exchange at a time. The response body
//! reader takes ownership of the connection and surrenders it back to
//! the pool once the body reaches EOF; a reader dropped mid-body closes
//! the connection instead, because a half-drained keep-alive socket can
//! never be reused safely.

pub(crate) mod decode;
pub(crate) mod encode;

use std::pin::Pin;
use std::task::{Context, Poll, Waker};

use bytes::{Buf, BytesMut};
use http::header::HeaderMap;
use http::{StatusCode, Version};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};
use tokio_util::io::poll_read_buf;

use crate::body::Payload;
use crate::error::Error;
use crate::observe::dump::Dumper;
use crate::observe::trace::Tracer;
use crate::proto::{Io, WireRequest};

use self::decode::BodyKind;

/// Callback through which a drained connection returns to its pool.
pub(crate) type GiveBack = Box<dyn FnOnce(Http1Conn) + Send>;

pub(crate) struct Http1Conn {
    io: Io,
    rbuf: BytesMut,
    head_cap: usize,
}

pub(crate) struct Http1ResponseHead {
    pub(crate) version: Version,
    pub(crate) status: StatusCode,
    pub(crate) headers: HeaderMap,
}

impl Http1Conn {
    pub(crate) fn new(io: Io, head_cap: usize) -> Self {
        Self {
            io,
            rbuf: BytesMut::with_capacity(8 * 1024),
            head_cap,
        }
    }

    /// Non-blocking liveness probe for idle pooled connections: a
    /// kept-alive socket must be readable-pending. EOF, an error, or
    /// unsolicited bytes all disqualify it.
    pub(crate) fn is_open(&mut self) -> bool {
        if !self.rbuf.is_empty() {
            return false;
        }
        let mut cx = Context::from_waker(Waker::noop());
        let mut probe = [0u8; 1];
        let mut buf = ReadBuf::new(&mut probe);
        match Pin::new(&mut self.io).poll_read(&mut cx, &mut buf) {
            Poll::Pending => true,
            Poll::Ready(_) => false,
        }
    }

    /// Runs one request/response exchange. Once this is called, bytes
    /// may have reached the wire: a failure is never transparently
    /// replayed, only the retry policy may resend.
    pub(crate) async fn send_request(
        mut self,
        wire: WireRequest,
        dumper: Dumper,
        tracer: Tracer,
    ) -> crate::Result<(Http1ResponseHead, RecvBody)> {
        let framing = encode::framing_for(&wire.method, &wire.payload);
        let head = encode::request_head(&wire, framing);
        dumper.request_head(&head);

        self.io.write_all(&head).await.map_err(Error::new_write)?;

        match wire.payload {
            Payload::Empty => {}
            Payload::Full(bytes) => {
                if !bytes.is_empty() {
                    dumper.request_body(&bytes);
                    self.io.write_all(&bytes).await.map_err(Error::new_write)?;
                }
            }
            Payload::Stream { mut reader, .. } => {
                if framing != encode::BodyFraming::None {
                    let mut chunk_buf = Vec::new();
                    let mut read_buf = BytesMut::with_capacity(16 * 1024);
                    loop {
                        read_buf.clear();
                        let n = reader
                            .read_buf(&mut read_buf)
                            .await
                            .map_err(Error::new_body_write)?;
                        if n == 0 {
                            break;
                        }
                        dumper.request_body(&read_buf);
                        match framing {
                            encode::BodyFraming::Chunked => {
                                encode::chunk(&read_buf, &mut chunk_buf);
                                self.io
                                    .write_all(&chunk_buf)
                                    .await
                                    .map_err(Error::new_write)?;
                            }
                            _ => {
                                self.io
                                    .write_all(&read_buf)
                                    .await
                                    .map_err(Error::new_write)?;
                            }
                        }
                    }
                    if framing == encode::BodyFraming::Chunked {
                        self.io
                            .write_all(encode::LAST_CHUNK)
                            .await
                            .map_err(Error::new_write)?;
                    }
                }
            }
        }
        self.io.flush().await.map_err(Error::new_write)?;
        tracer.wrote_request();

        // Read the response head; informational responses are consumed
        // and skipped.
        let parsed = loop {
            let parsed = loop {
                if let Some(parsed) = decode::parse_head(&self.rbuf, self.head_cap)? {
                    break parsed;
                }
                let n = self
                    .io
                    .read_buf(&mut self.rbuf)
                    .await
                    .map_err(Error::new_read)?;
                if n == 0 {
                    return Err(Error::new_incomplete());
                }
                tracer.first_byte();
            };

            dumper.response_head(&self.rbuf[..parsed.head_len]);
            self.rbuf.advance(parsed.head_len);

            if parsed.status.is_informational() {
                tracing::trace!("skipping {} response head", parsed.status);
                continue;
            }
            break parsed;
        };

        let body = decode::body_kind(
            wire.method == http::Method::HEAD,
            parsed.status,
            &parsed.headers,
        )?;
        let close = decode::connection_close(parsed.version, &parsed.headers);
        let reusable = !close && body != BodyKind::Eof;

        let head = Http1ResponseHead {
            version: parsed.version,
            status: parsed.status,
            headers: parsed.headers,
        };
        let state = match body {
            BodyKind::Empty => BodyState::Done,
            BodyKind::Length(0) => BodyState::Done,
            BodyKind::Length(n) => BodyState::Length { remaining: n },
            BodyKind::Chunked => BodyState::Chunked(ChunkState::Size),
            BodyKind::Eof => BodyState::Eof,
        };

        Ok((
            head,
            RecvBody {
                conn: Some(self),
                state,
                reusable,
                give_back: None,
                trailers: None,
                dumper,
                finished: false,
            },
        ))
    }
}

enum BodyState {
    Length { remaining: u64 },
    Chunked(ChunkState),
    Eof,
    Done,
}

enum ChunkState {
    Size,
    Data { remaining: u64 },
    DataCrlf,
    Trailers,
}

/// The streaming response body. Owns the connection until EOF.
pub(crate) struct RecvBody {
    conn: Option<Http1Conn>,
    state: BodyState,
    reusable: bool,
    give_back: Option<GiveBack>,
    trailers: Option<HeaderMap>,
    dumper: Dumper,
    finished: bool,
}

impl RecvBody {
    /// Arms the pool return path; without it the connection is simply
    /// dropped at EOF.
    pub(crate) fn set_give_back(&mut self, give_back: GiveBack) {
        self.give_back = Some(give_back);
    }

    pub(crate) fn take_trailers(&mut self) -> Option<HeaderMap> {
        self.trailers.take()
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let conn = self.conn.take();
        if self.reusable {
            if let (Some(conn), Some(give_back)) = (conn, self.give_back.take()) {
                give_back(conn);
                return;
            }
        }
        // not reusable (or no pool): the connection drops and closes
    }

    /// Refills the connection read buffer; `Ready(0)` is EOF.
    fn poll_fill(conn: &mut Http1Conn, cx: &mut Context<'_>) -> Poll<std::io::Result<usize>> {
        conn.rbuf.reserve(8 * 1024);
        poll_read_buf(Pin::new(&mut conn.io), cx, &mut conn.rbuf)
    }

    fn serve(&mut self, buf: &mut ReadBuf<'_>, max: usize) -> usize {
        let conn = match self.conn.as_mut() {
            Some(conn) => conn,
            None => return 0,
        };
        let n = conn.rbuf.len().min(max).min(buf.remaining());
        if n > 0 {
            let chunk = conn.rbuf.split_to(n);
            self.dumper.response_body(&chunk);
            buf.put_slice(&chunk);
        }
        n
    }
}

impl AsyncRead for RecvBody {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = &mut *self;
        loop {
            match &mut this.state {
                BodyState::Done => {
                    this.finish();
                    return Poll::Ready(Ok(()));
                }
                BodyState::Length { remaining } => {
                    let want = *remaining;
                    if want == 0 {
                        this.state = BodyState::Done;
                        continue;
                    }
                    let conn = match this.conn.as_mut() {
                        Some(conn) => conn,
                        None => return Poll::Ready(Ok(())),
                    };
                    if conn.rbuf.is_empty() {
                        match std::task::ready!(Self::poll_fill(conn, cx)) {
                            Ok(0) => {
                                return Poll::Ready(Err(std::io::Error::other(
                                    Error::new_incomplete(),
                                )));
                            }
                            Ok(_) => {}
                            Err(err) => return Poll::Ready(Err(err)),
                        }
                    }
                    let n = this.serve(buf, want.min(usize::MAX as u64) as usize);
                    if let BodyState::Length { remaining } = &mut this.state {
                        *remaining -= n as u64;
                        if *remaining == 0 {
                            this.state = BodyState::Done;
                            this.finish();
                        }
                    }
                    return Poll::Ready(Ok(()));
                }
                BodyState::Eof => {
                    let conn = match this.conn.as_mut() {
                        Some(conn) => conn,
                        None => return Poll::Ready(Ok(())),
                    };
                    if conn.rbuf.is_empty() {
                        match std::task::ready!(Self::poll_fill(conn, cx)) {
                            Ok(0) => {
                                this.state = BodyState::Done;
                                continue;
                            }
                            Ok(_) => {}
                            Err(err) => return Poll::Ready(Err(err)),
                        }
                    }
                    this.serve(buf, usize::MAX);
                    return Poll::Ready(Ok(()));
                }
                BodyState::Chunked(chunk_state) => match chunk_state {
                    ChunkState::Size => {
                        let conn = match this.conn.as_mut() {
                            Some(conn) => conn,
                            None => return Poll::Ready(Ok(())),
                        };
                        match find_crlf(&conn.rbuf) {
                            Some(line_end) => {
                                let line = conn.rbuf.split_to(line_end + 2);
                                let size = decode::parse_chunk_size(&line[..line_end])
                                    .map_err(std::io::Error::other)?;
                                this.state = if size == 0 {
                                    BodyState::Chunked(ChunkState::Trailers)
                                } else {
                                    BodyState::Chunked(ChunkState::Data { remaining: size })
                                };
                            }
                            None => match std::task::ready!(Self::poll_fill(conn, cx)) {
                                Ok(0) => {
                                    return Poll::Ready(Err(std::io::Error::other(
                                        Error::new_incomplete(),
                                    )));
                                }
                                Ok(_) => {}
                                Err(err) => return Poll::Ready(Err(err)),
                            },
                        }
                    }
                    ChunkState::Data { remaining } => {
                        let want = *remaining;
                        let conn = match this.conn.as_mut() {
                            Some(conn) => conn,
                            None => return Poll::Ready(Ok(())),
                        };
                        if conn.rbuf.is_empty() {
                            match std::task::ready!(Self::poll_fill(conn, cx)) {
                                Ok(0) => {
                                    return Poll::Ready(Err(std::io::Error::other(
                                        Error::new_incomplete(),
                                    )));
                                }
                                Ok(_) => {}
                                Err(err) => return Poll::Ready(Err(err)),
                            }
                        }
                        let n = this.serve(buf, want.min(usize::MAX as u64) as usize);
                        if let BodyState::Chunked(ChunkState::Data { remaining }) = &mut this.state
                        {
                            *remaining -= n as u64;
                            if *remaining == 0 {
                                this.state = BodyState::Chunked(ChunkState::DataCrlf);
                            }
                        }
                        if n > 0 {
                            return Poll::Ready(Ok(()));
                        }
                    }
                    ChunkState::DataCrlf => {
                        let conn = match this.conn.as_mut() {
                            Some(conn) => conn,
                            None => return Poll::Ready(Ok(())),
                        };
                        if conn.rbuf.len() < 2 {
                            match std::task::ready!(Self::poll_fill(conn, cx)) {
                                Ok(0) => {
                                    return Poll::Ready(Err(std::io::Error::other(
                                        Error::new_incomplete(),
                                    )));
                                }
                                Ok(_) => continue,
                                Err(err) => return Poll::Ready(Err(err)),
                            }
                        }
                        if &conn.rbuf[..2] != b"\r\n" {
                            return Poll::Ready(Err(std::io::Error::other(Error::new_parse(
                                crate::error::Parse::ChunkCoding,
                            ))));
                        }
                        conn.rbuf.advance(2);
                        this.state = BodyState::Chunked(ChunkState::Size);
                    }
                    ChunkState::Trailers => {
                        let conn = match this.conn.as_mut() {
                            Some(conn) => conn,
                            None => return Poll::Ready(Ok(())),
                        };
                        match find_crlf(&conn.rbuf) {
                            Some(0) => {
                                conn.rbuf.advance(2);
                                this.state = BodyState::Done;
                            }
                            Some(line_end) => {
                                let line = conn.rbuf.split_to(line_end + 2);
                                let (name, value) = decode::parse_trailer_line(&line[..line_end])
                                    .map_err(std::io::Error::other)?;
                                this.trailers
                                    .get_or_insert_with(HeaderMap::new)
                                    .append(name, value);
                            }
                            None => match std::task::ready!(Self::poll_fill(conn, cx)) {
                                Ok(0) => {
                                    return Poll::Ready(Err(std::io::Error::other(
                                        Error::new_incomplete(),
                                    )));
                                }
                                Ok(_) => {}
                                Err(err) => return Poll::Ready(Err(err)),
                            },
                        }
                    }
                },
            }
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::OrderedHeaders;
    use tokio::io::AsyncReadExt;

    fn wire_get() -> WireRequest {
        WireRequest {
            method: http::Method::GET,
            scheme: "http",
            authority: "example.com".to_owned(),
            path_and_query: "/".to_owned(),
            headers: OrderedHeaders::new(),
            header_order: None,
            payload: Payload::Empty,
            absolute_form: false,
        }
    }

    /// An in-memory duplex: what the "server" scripted, and what the
    /// client wrote.
    fn conn_over(script: &[u8]) -> Http1Conn {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let script = script.to_vec();
        tokio::spawn(async move {
            let mut sink = Vec::new();
            use tokio::io::AsyncWriteExt;
            // read the request first so writes cannot deadlock
            let mut buf = [0u8; 1024];
            loop {
                match server.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        sink.extend_from_slice(&buf[..n]);
                        if sink.windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            let _ = server.write_all(&script).await;
        });
        Http1Conn::new(Box::new(client), 1024 * 1024)
    }

    #[tokio::test]
    async fn content_length_body_round_trip() {
        let conn = conn_over(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello");
        let (head, mut body) = conn
            .send_request(wire_get(), Dumper::disabled(), Tracer::disabled())
            .await
            .unwrap();
        assert_eq!(head.status, StatusCode::OK);

        let mut out = Vec::new();
        body.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn chunked_body_with_trailers() {
        let conn = conn_over(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
              5\r\nhello\r\n6\r\n world\r\n0\r\nX-Check: done\r\n\r\n",
        );
        let (_, mut body) = conn
            .send_request(wire_get(), Dumper::disabled(), Tracer::disabled())
            .await
            .unwrap();

        let mut out = Vec::new();
        body.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
        let trailers = body.take_trailers().unwrap();
        assert_eq!(trailers["x-check"], "done");
    }

    #[tokio::test]
    async fn informational_heads_are_skipped() {
        let conn = conn_over(
            b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 204 No Content\r\n\r\n",
        );
        let (head, mut body) = conn
            .send_request(wire_get(), Dumper::disabled(), Tracer::disabled())
            .await
            .unwrap();
        assert_eq!(head.status, StatusCode::NO_CONTENT);

        let mut out = Vec::new();
        body.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn eof_body_reads_to_close() {
        let conn = conn_over(b"HTTP/1.1 200 OK\r\n\r\nstreamed until close");
        let (_, mut body) = conn
            .send_request(wire_get(), Dumper::disabled(), Tracer::disabled())
            .await
            .unwrap();

        let mut out = Vec::new();
        body.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"streamed until close");
    }

    #[tokio::test]
    async fn truncated_length_body_is_incomplete() {
        let conn = conn_over(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nshort");
        let (_, mut body) = conn
            .send_request(wire_get(), Dumper::disabled(), Tracer::disabled())
            .await
            .unwrap();

        let mut out = Vec::new();
        assert!(body.read_to_end(&mut out).await.is_err());
    }

    #[tokio::test]
    async fn drained_connection_is_given_back() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicBool, Ordering};

        let conn = conn_over(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok");
        let (_, mut body) = conn
            .send_request(wire_get(), Dumper::disabled(), Tracer::disabled())
            .await
            .unwrap();

        let returned = Arc::new(AtomicBool::new(false));
        let flag = returned.clone();
        body.set_give_back(Box::new(move |_conn| {
            flag.store(true, Ordering::SeqCst);
        }));

        let mut out = Vec::new();
        body.read_to_end(&mut out).await.unwrap();
        assert!(returned.load(Ordering::SeqCst), "conn returns at EOF");
    }
}
