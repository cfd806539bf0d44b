//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;

use crate::proto::h2::frame::Reason;

/// Alias for a type-erased error type.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Result type returned from methods that can have fletch `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents errors that can occur while building, sending or reading an
/// HTTP exchange.
///
/// # Formatting
///
/// The `Display` implementation of this type only prints the details of
/// this level of error, even though it may have been caused by another error
/// and contain that error in its source chain.
///
/// # Source
///
/// An `Error` may be caused by another error. To aid in debugging,
/// those are exposed in `Error::source()` as erased types. They may come
/// from private internal dependencies and can not be depended on.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<BoxError>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    /// The request could not be constructed; nothing was sent.
    Builder,
    /// Establishing the connection failed.
    Dial(DialPhase),
    /// A network error occurred while writing the request.
    Write,
    /// A network error occurred while reading the response.
    Read,
    /// A message reached EOF, but is not complete.
    IncompleteMessage,
    /// The response head could not be parsed.
    Parse(Parse),
    /// An HTTP/2 protocol error.
    Http2 {
        reason: Option<Reason>,
        /// Connection-level when false; a single stream failed when true.
        stream: bool,
        /// True when the request is known not to have been processed
        /// (GOAWAY refusal, refused stream) and may be replayed.
        retryable: bool,
    },
    /// A phase exceeded its deadline.
    Timeout(TimeoutPhase),
    /// The request was canceled by its cancel handle.
    Canceled,
    /// The response body could not be decompressed or charset-decoded.
    Decode,
    /// The response body could not be unmarshalled into the destination.
    Codec,
    /// A redirect was cut short.
    Redirect(RedirectCause),
    /// Error while reading a body from a connection.
    Body,
    /// Error produced by the caller's body producer.
    BodyWrite,
    /// A retry or redirect needed to replay the body, but the producer
    /// is one-shot.
    BodyNotReplayable,
    /// A connection task went away mid-exchange.
    ChannelClosed,
    /// An `io::Error` outside of a more specific phase.
    Io,
}

/// The connection-establishment phase an error or timeout is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialPhase {
    /// Hostname resolution.
    Dns,
    /// The TCP (or unix socket) connect.
    Connect,
    /// The proxy handshake (CONNECT tunnel or SOCKS5 negotiation).
    Proxy,
    /// The TLS handshake.
    Tls,
}

/// The pipeline phase a timeout is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    /// Waiting for a pooled connection or a dial.
    Acquire,
    /// Establishing the connection.
    Dial,
    /// The TLS handshake.
    Tls,
    /// Waiting for the response head.
    ReadHead,
    /// Reading the response body.
    ReadBody,
    /// The total wall-clock budget for the request.
    Total,
}

#[derive(Debug)]
pub(crate) enum Parse {
    Status,
    Version,
    Header,
    /// The response head exceeded the configured size cap.
    TooLarge,
    ChunkCoding,
    ContentLength,
}

// Sentinel type to indicate the error was caused by a timeout.
#[derive(Debug)]
pub(crate) struct TimedOut;

impl Error {
    /// Returns true if the request never made it onto the wire.
    #[must_use]
    pub fn is_builder(&self) -> bool {
        matches!(self.inner.kind, Kind::Builder)
    }

    /// Returns true if establishing the connection failed.
    #[must_use]
    pub fn is_dial(&self) -> bool {
        matches!(self.inner.kind, Kind::Dial(_))
    }

    /// Returns true if this was a timeout, in any phase.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::Timeout(_))
    }

    /// The phase that tripped the deadline, if this is a timeout error.
    #[must_use]
    pub fn timeout_phase(&self) -> Option<TimeoutPhase> {
        match self.inner.kind {
            Kind::Timeout(phase) => Some(phase),
            _ => None,
        }
    }

    /// Returns true if the request was canceled through its cancel handle.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        matches!(self.inner.kind, Kind::Canceled)
    }

    /// Returns true if this was an HTTP response head parse error.
    #[must_use]
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// Returns true if the response head exceeded the configured size cap.
    #[must_use]
    pub fn is_parse_too_large(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(Parse::TooLarge))
    }

    /// Returns true if the body could not be decompressed or
    /// charset-decoded; the raw body remains readable.
    #[must_use]
    pub fn is_decode(&self) -> bool {
        matches!(self.inner.kind, Kind::Decode)
    }

    /// Returns true if auto-unmarshalling the body failed.
    #[must_use]
    pub fn is_codec(&self) -> bool {
        matches!(self.inner.kind, Kind::Codec)
    }

    /// Returns true if a redirect chain was cut short, either by the hop
    /// limit or by a policy veto.
    #[must_use]
    pub fn is_redirect(&self) -> bool {
        matches!(self.inner.kind, Kind::Redirect(_))
    }

    /// Returns true if the connection closed before a message completed.
    #[must_use]
    pub fn is_incomplete_message(&self) -> bool {
        matches!(self.inner.kind, Kind::IncompleteMessage)
    }

    /// Returns true for transport-level failures where the peer is known
    /// (or safe to assume) not to have processed the request: dial
    /// failures, and protocol refusals such as an H2 GOAWAY that named a
    /// lower stream id. The default retry condition replays these.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self.inner.kind {
            Kind::Dial(_) => true,
            Kind::Http2 { retryable, .. } => retryable,
            Kind::Write => true,
            _ => false,
        }
    }

    /// The H2 reset/goaway reason, when this is an HTTP/2 protocol error.
    #[must_use]
    pub fn h2_reason(&self) -> Option<Reason> {
        match self.inner.kind {
            Kind::Http2 { reason, .. } => reason,
            _ => None,
        }
    }

    pub(crate) fn new(kind: Kind) -> Self {
        Self {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<BoxError>>(mut self, cause: C) -> Self {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn new_builder<E: Into<BoxError>>(cause: E) -> Self {
        Self::new(Kind::Builder).with(cause)
    }

    pub(crate) fn new_builder_msg(msg: &'static str) -> Self {
        Self::new(Kind::Builder).with(msg)
    }

    pub(crate) fn new_dial<E: Into<BoxError>>(phase: DialPhase, cause: E) -> Self {
        Self::new(Kind::Dial(phase)).with(cause)
    }

    pub(crate) fn new_write<E: Into<BoxError>>(cause: E) -> Self {
        Self::new(Kind::Write).with(cause)
    }

    pub(crate) fn new_read<E: Into<BoxError>>(cause: E) -> Self {
        Self::new(Kind::Read).with(cause)
    }

    pub(crate) fn new_incomplete() -> Self {
        Self::new(Kind::IncompleteMessage)
    }

    pub(crate) fn new_parse(parse: Parse) -> Self {
        Self::new(Kind::Parse(parse))
    }

    pub(crate) fn new_too_large() -> Self {
        Self::new(Kind::Parse(Parse::TooLarge))
    }

    pub(crate) fn new_h2_conn(reason: Reason) -> Self {
        Self::new(Kind::Http2 {
            reason: Some(reason),
            stream: false,
            retryable: false,
        })
    }

    pub(crate) fn new_h2_stream(reason: Reason, retryable: bool) -> Self {
        Self::new(Kind::Http2 {
            reason: Some(reason),
            stream: true,
            retryable,
        })
    }

    pub(crate) fn new_timeout(phase: TimeoutPhase) -> Self {
        Self::new(Kind::Timeout(phase)).with(TimedOut)
    }

    pub(crate) fn new_canceled() -> Self {
        Self::new(Kind::Canceled)
    }

    pub(crate) fn new_decode<E: Into<BoxError>>(cause: E) -> Self {
        Self::new(Kind::Decode).with(cause)
    }

    pub(crate) fn new_codec<E: Into<BoxError>>(cause: E) -> Self {
        Self::new(Kind::Codec).with(cause)
    }

    pub(crate) fn new_redirect(cause: RedirectCause) -> Self {
        Self::new(Kind::Redirect(cause))
    }

    pub(crate) fn new_body<E: Into<BoxError>>(cause: E) -> Self {
        Self::new(Kind::Body).with(cause)
    }

    pub(crate) fn new_body_write<E: Into<BoxError>>(cause: E) -> Self {
        Self::new(Kind::BodyWrite).with(cause)
    }

    pub(crate) fn new_body_not_replayable() -> Self {
        Self::new(Kind::BodyNotReplayable)
    }

    pub(crate) fn new_closed() -> Self {
        Self::new(Kind::ChannelClosed)
    }

    pub(crate) fn new_io(cause: std::io::Error) -> Self {
        Self::new(Kind::Io).with(cause)
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Builder => "request could not be built",
            Kind::Dial(DialPhase::Dns) => "hostname resolution failed",
            Kind::Dial(DialPhase::Connect) => "tcp connect failed",
            Kind::Dial(DialPhase::Proxy) => "proxy handshake failed",
            Kind::Dial(DialPhase::Tls) => "tls handshake failed",
            Kind::Write => "connection error while writing request",
            Kind::Read => "connection error while reading response",
            Kind::IncompleteMessage => "connection closed before message completed",
            Kind::Parse(Parse::Status) => "invalid HTTP status-code parsed",
            Kind::Parse(Parse::Version) => "invalid HTTP version parsed",
            Kind::Parse(Parse::Header) => "invalid HTTP header parsed",
            Kind::Parse(Parse::TooLarge) => "response head is too large",
            Kind::Parse(Parse::ChunkCoding) => "invalid chunked transfer coding",
            Kind::Parse(Parse::ContentLength) => "invalid content-length parsed",
            Kind::Http2 { stream: false, .. } => "http2 connection error",
            Kind::Http2 { stream: true, .. } => "http2 stream error",
            Kind::Timeout(TimeoutPhase::Acquire) => "timed out acquiring a connection",
            Kind::Timeout(TimeoutPhase::Dial) => "timed out establishing connection",
            Kind::Timeout(TimeoutPhase::Tls) => "timed out in tls handshake",
            Kind::Timeout(TimeoutPhase::ReadHead) => "timed out reading response head",
            Kind::Timeout(TimeoutPhase::ReadBody) => "timed out reading response body",
            Kind::Timeout(TimeoutPhase::Total) => "request exceeded total timeout",
            Kind::Canceled => "request was canceled",
            Kind::Decode => "error decoding response body",
            Kind::Codec => "error unmarshalling response body",
            Kind::Redirect(RedirectCause::TooMany) => "too many redirects",
            Kind::Redirect(RedirectCause::Denied) => "redirect denied by policy",
            Kind::Body => "error reading a body from connection",
            Kind::BodyWrite => "error writing a body to connection",
            Kind::BodyNotReplayable => "body producer cannot replay the request body",
            Kind::ChannelClosed => "connection task is gone",
            Kind::Io => "connection error",
        }
    }
}

/// Why a redirect chain was cut short.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectCause {
    /// The hop count exceeded the configured maximum.
    TooMany,
    /// A redirect policy vetoed the hop.
    Denied,
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("fletch::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

// ===== impl TimedOut =====

impl fmt::Display for TimedOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("operation timed out")
    }
}

impl StdError for TimedOut {}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send_sync<T: Send + Sync + 'static>() {}

    #[test]
    fn error_satisfies_send_sync() {
        assert_send_sync::<Error>()
    }

    #[test]
    fn error_size_of() {
        assert_eq!(std::mem::size_of::<Error>(), std::mem::size_of::<usize>());
    }

    #[test]
    fn timeout_phase_is_exposed() {
        let err = Error::new_timeout(TimeoutPhase::ReadHead);
        assert!(err.is_timeout());
        assert_eq!(err.timeout_phase(), Some(TimeoutPhase::ReadHead));
    }

    #[test]
    fn goaway_refusal_is_retryable() {
        let err = Error::new_h2_stream(Reason::REFUSED_STREAM, true);
        assert!(err.is_retryable());
        assert_eq!(err.h2_reason(), Some(Reason::REFUSED_STREAM));
    }
}
