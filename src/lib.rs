//! fletch: a fluent HTTP/1.1 and HTTP/2 client transport.
//!
//! The crate centers on the request-execution pipeline: a shared
//! [`Client`] snapshot, a keep-alive connection [pool](crate::pool)
//! keyed by origin, a dialer handling proxies and TLS/ALPN, and one
//! logical transport dispatching over HTTP/1.1 or HTTP/2 per
//! connection. Redirects, retries, timeouts, cancellation, wire dumps
//! and lifecycle traces are all handled inside the pipeline.
//!
//! ```no_run
//! # async fn run() -> fletch::Result<()> {
//! let client = fletch::Client::builder()
//!     .with_base_url("https://api.example.com")
//!     .with_query("token", "abc")
//!     .build()?;
//!
//! let mut response = client
//!     .get("/users/{id}")
//!     .path_param("id", "42")
//!     .query("format", "json")
//!     .send()
//!     .await?;
//!
//! let body = response.text().await?;
//! # let _ = body;
//! # Ok(())
//! # }
//! ```

mod body;
mod cancel;
mod client;
mod connect;
mod decoder;
mod error;
pub mod fingerprint;
mod headers;
mod observe;
mod pool;
mod proto;

pub use body::{Body, BodyProducer, BodyReader};
pub use cancel::CancelToken;
pub use client::{
    Action, Attempt, Client, ClientBuilder, Form, Part, QueryParams, RedirectPolicy, Request,
    RequestBuilder, RequestHook, Response, ResponseBody, ResponseHook, RetryContext,
    RetryInterval, RetryPolicy, Rule,
};
pub use connect::HttpVersion;
pub use error::{BoxError, DialPhase, Error, RedirectCause, Result, TimeoutPhase};
pub use headers::{HeaderOrder, OrderedHeaders};
pub use proto::{AsyncStream, Io};
pub use observe::dump::{DumpBuffer, DumpOptions, DumpSink};
pub use observe::trace::TraceInfo;
pub use proto::h2::frame::{Priority, Reason, SettingId, SettingsConfig, StreamDependency, StreamId};
