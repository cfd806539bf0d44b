//! Protocol dispatch: one logical transport, two wire protocols.

pub(crate) mod h1;
pub(crate) mod h2;

use http::Method;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::body::Payload;
use crate::headers::{HeaderOrder, OrderedHeaders};

/// The byte stream a connection runs over: plain TCP, a TLS session, a
/// proxy tunnel, or a unix socket. Blanket-implemented; dial hooks
/// return any boxed duplex stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// A boxed connection stream, as produced by the dialer or a dial hook.
pub type Io = Box<dyn AsyncStream>;

/// A request reduced to what the wire needs: prepared, merged, and
/// stripped of everything the framer synthesizes itself.
pub(crate) struct WireRequest {
    pub(crate) method: Method,
    pub(crate) scheme: &'static str,
    pub(crate) authority: String,
    /// Path plus query, already percent-encoded.
    pub(crate) path_and_query: String,
    pub(crate) headers: OrderedHeaders,
    pub(crate) header_order: Option<HeaderOrder>,
    pub(crate) payload: Payload,
    /// H1 absolute-form request target, used through cleartext proxies.
    pub(crate) absolute_form: bool,
}

impl WireRequest {
    /// Methods that forbid a payload regardless of what was configured.
    pub(crate) fn forbids_payload(method: &Method) -> bool {
        matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
    }
}
