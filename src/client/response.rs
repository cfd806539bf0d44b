//! The response value: head, body (buffered or streaming), trailers,
//! trace info and dump text.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::SystemTime;

use bytes::Bytes;
use http::header::HeaderMap;
use http::{Method, StatusCode, Version};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use url::Url;

use crate::body::BodyReader;
use crate::error::Error;
use crate::observe::dump::DumpBuffer;
use crate::observe::trace::TraceInfo;
use crate::proto::{h1, h2};

/// The response body, streaming or buffered.
pub struct ResponseBody {
    variant: Variant,
}

enum Variant {
    Empty,
    Buffered(Bytes),
    H1(h1::RecvBody),
    H2(h2::RecvStream),
    /// Decoder-wrapped stream; trailer access is gone after wrapping.
    Wrapped(BodyReader),
}

impl ResponseBody {
    pub(crate) fn empty() -> Self {
        Self {
            variant: Variant::Empty,
        }
    }

    pub(crate) fn buffered(bytes: Bytes) -> Self {
        Self {
            variant: Variant::Buffered(bytes),
        }
    }

    pub(crate) fn h1(body: h1::RecvBody) -> Self {
        Self {
            variant: Variant::H1(body),
        }
    }

    pub(crate) fn h2(stream: h2::RecvStream) -> Self {
        Self {
            variant: Variant::H2(stream),
        }
    }

    pub(crate) fn wrapped(reader: BodyReader) -> Self {
        Self {
            variant: Variant::Wrapped(reader),
        }
    }

    pub(crate) fn take_trailers(&mut self) -> Option<HeaderMap> {
        match &mut self.variant {
            Variant::H1(body) => body.take_trailers(),
            Variant::H2(stream) => stream.take_trailers(),
            _ => None,
        }
    }

    /// Remaining buffered bytes, when the body was auto-read.
    pub fn bytes(&self) -> Option<&Bytes> {
        match &self.variant {
            Variant::Buffered(bytes) => Some(bytes),
            _ => None,
        }
    }
}

impl AsyncRead for ResponseBody {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut self.variant {
            Variant::Empty => Poll::Ready(Ok(())),
            Variant::Buffered(bytes) => {
                use bytes::Buf;
                let n = bytes.len().min(buf.remaining());
                buf.put_slice(&bytes[..n]);
                bytes.advance(n);
                Poll::Ready(Ok(()))
            }
            Variant::H1(body) => Pin::new(body).poll_read(cx, buf),
            Variant::H2(stream) => Pin::new(stream).poll_read(cx, buf),
            Variant::Wrapped(reader) => Pin::new(reader.as_mut()).poll_read(cx, buf),
        }
    }
}

/// A received response.
pub struct Response {
    pub(crate) status: StatusCode,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
    pub(crate) trailers: Option<HeaderMap>,
    pub(crate) body: ResponseBody,
    pub(crate) method: Method,
    pub(crate) url: Url,
    pub(crate) trace: Option<TraceInfo>,
    pub(crate) dump_buffer: DumpBuffer,
    pub(crate) received_at: SystemTime,
    /// Charset auto-decode applies in `text()`.
    pub(crate) auto_decode: bool,
}

impl Response {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Trailer headers, when the protocol delivered any before the body
    /// finished being read.
    pub fn trailers(&self) -> Option<&HeaderMap> {
        self.trailers.as_ref()
    }

    /// The request method this response answers.
    pub fn request_method(&self) -> &Method {
        &self.method
    }

    /// The final URL after redirects.
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// The auto-read body buffer; `None` when auto-read was disabled or
    /// the body was routed elsewhere.
    pub fn body_bytes(&self) -> Option<&Bytes> {
        self.body.bytes()
    }

    /// Streaming access to the body.
    pub fn body_mut(&mut self) -> &mut ResponseBody {
        &mut self.body
    }

    /// Reads the remaining body to completion and returns it, buffered.
    pub async fn bytes(&mut self) -> crate::Result<Bytes> {
        if let Some(bytes) = self.body.bytes() {
            return Ok(bytes.clone());
        }
        let mut out = Vec::new();
        self.body
            .read_to_end(&mut out)
            .await
            .map_err(unwrap_io_error)?;
        self.trailers = self.body.take_trailers();
        let bytes = Bytes::from(out);
        self.body = ResponseBody::buffered(bytes.clone());
        Ok(bytes)
    }

    /// The body as text. With auto-decode on, a BOM or declared charset
    /// is transcoded to UTF-8; otherwise the raw bytes are interpreted
    /// as UTF-8, lossily.
    pub async fn text(&mut self) -> crate::Result<String> {
        let content_type = self
            .headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let bytes = self.bytes().await?;
        if self.auto_decode {
            crate::decoder::decode_buffer(&bytes, content_type.as_deref())
                .map_err(Error::new_decode)
        } else {
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }
    }

    /// Unmarshals the JSON body into `T`.
    pub async fn json<T: serde::de::DeserializeOwned>(&mut self) -> crate::Result<T> {
        let bytes = self.bytes().await?;
        serde_json::from_slice(&bytes).map_err(Error::new_codec)
    }

    /// Lifecycle timings, when tracing was enabled.
    pub fn trace_info(&self) -> Option<&TraceInfo> {
        self.trace.as_ref()
    }

    /// The wire dump captured for this exchange.
    pub fn dump(&self) -> String {
        self.dump_buffer.snapshot()
    }

    pub fn received_at(&self) -> SystemTime {
        self.received_at
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("version", &self.version)
            .field("url", &self.url.as_str())
            .finish()
    }
}

/// Body readers wrap crate errors into `io::Error`; unwrap them back at
/// the surface.
pub(crate) fn unwrap_io_error(err: std::io::Error) -> Error {
    match err.downcast::<Error>() {
        Ok(inner) => inner,
        Err(err) => Error::new_io(err),
    }
}
