//! The request value and its fluent builder.

use std::path::PathBuf;
use std::time::Duration;

use http::Method;
use http::header::{HeaderName, HeaderValue};

use crate::body::{Body, BodyReader};
use crate::cancel::CancelToken;
use crate::error::Error;
use crate::headers::{HeaderOrder, OrderedHeaders};
use crate::observe::dump::{DumpBuffer, DumpOptions};

use super::Client;
use super::retry::RetryPolicy;

/// Query parameters with set and add semantics, order preserved.
#[derive(Debug, Clone, Default)]
pub struct QueryParams {
    pairs: Vec<(String, String)>,
}

impl QueryParams {
    /// Appends a pair, keeping existing values for the same key.
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.pairs.push((key.into(), value.into()));
    }

    /// Replaces every value for `key`.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        self.pairs.retain(|(k, _)| *k != key);
        self.pairs.push((key, value.into()));
    }

    pub(crate) fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// A validated request, ready for the pipeline.
///
/// Middlewares receive `&mut Request` before URL resolution and may
/// mutate any part of it.
#[derive(Debug)]
pub struct Request {
    pub(crate) method: Method,
    /// Raw target: absolute URL, or a path resolved against the
    /// client's base URL, possibly with `{name}` templates.
    pub(crate) target: String,
    pub(crate) headers: OrderedHeaders,
    pub(crate) header_order: Option<HeaderOrder>,
    pub(crate) query: QueryParams,
    pub(crate) path_params: Vec<(String, String)>,
    pub(crate) form: Vec<(String, String)>,
    pub(crate) cookies: Vec<cookie::Cookie<'static>>,
    pub(crate) body: Body,
    pub(crate) timeout: Option<Duration>,
    pub(crate) cancel: Option<CancelToken>,
    pub(crate) retry: Option<RetryPolicy>,
    pub(crate) dump: Option<DumpOptions>,
    pub(crate) dump_buffer: DumpBuffer,
    pub(crate) output_file: Option<PathBuf>,
}

impl Request {
    pub(crate) fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            headers: OrderedHeaders::new(),
            header_order: None,
            query: QueryParams::default(),
            path_params: Vec::new(),
            form: Vec::new(),
            cookies: Vec::new(),
            body: Body::empty(),
            timeout: None,
            cancel: None,
            retry: None,
            dump: None,
            dump_buffer: DumpBuffer::default(),
            output_file: None,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn method_mut(&mut self) -> &mut Method {
        &mut self.method
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn set_target(&mut self, target: impl Into<String>) {
        self.target = target.into();
    }

    pub fn headers(&self) -> &OrderedHeaders {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut OrderedHeaders {
        &mut self.headers
    }

    pub fn query_mut(&mut self) -> &mut QueryParams {
        &mut self.query
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn set_body(&mut self, body: Body) {
        self.body = body;
    }

    /// The wire dump captured for this request so far.
    pub fn dump_buffer(&self) -> &DumpBuffer {
        &self.dump_buffer
    }
}

/// Fluent request construction; finished by [`RequestBuilder::send`].
pub struct RequestBuilder {
    client: Client,
    request: Request,
    /// First builder error; surfaced at send time.
    error: Option<Error>,
}

impl RequestBuilder {
    pub(crate) fn new(client: Client, method: Method, target: impl Into<String>) -> Self {
        Self {
            client,
            request: Request::new(method, target),
            error: None,
        }
    }

    /// Appends a header, keeping existing values.
    #[must_use]
    pub fn header<V>(mut self, name: HeaderName, value: V) -> Self
    where
        V: TryInto<HeaderValue>,
    {
        match value.try_into() {
            Ok(value) => self.request.headers.append(name, value),
            Err(_) => self.set_error(Error::new_builder_msg("invalid header value")),
        }
        self
    }

    /// Sets a header, replacing existing values.
    #[must_use]
    pub fn header_set<V>(mut self, name: HeaderName, value: V) -> Self
    where
        V: TryInto<HeaderValue>,
    {
        match value.try_into() {
            Ok(value) => self.request.headers.insert(name, value),
            Err(_) => self.set_error(Error::new_builder_msg("invalid header value")),
        }
        self
    }

    /// Pins an explicit wire order for the named headers.
    #[must_use]
    pub fn header_order<I: IntoIterator<Item = HeaderName>>(mut self, names: I) -> Self {
        self.request.header_order = Some(names.into_iter().collect());
        self
    }

    /// Adds a query parameter (append semantics).
    #[must_use]
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.request.query.add(key, value);
        self
    }

    /// Sets a query parameter (replace semantics).
    #[must_use]
    pub fn query_set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.request.query.set(key, value);
        self
    }

    /// Substitutes a `{name}` path template, URL-path-escaped.
    #[must_use]
    pub fn path_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request.path_params.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn cookie(mut self, cookie: cookie::Cookie<'static>) -> Self {
        self.request.cookies.push(cookie);
        self
    }

    #[must_use]
    pub fn bearer_auth(mut self, token: impl AsRef<str>) -> Self {
        match HeaderValue::try_from(format!("Bearer {}", token.as_ref())) {
            Ok(value) => self
                .request
                .headers
                .insert(http::header::AUTHORIZATION, value),
            Err(_) => self.set_error(Error::new_builder_msg("invalid bearer token")),
        }
        self
    }

    #[must_use]
    pub fn basic_auth(mut self, username: impl AsRef<str>, password: impl AsRef<str>) -> Self {
        use base64::Engine as _;
        let raw = format!("{}:{}", username.as_ref(), password.as_ref());
        let encoded = format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(raw)
        );
        match HeaderValue::try_from(encoded) {
            Ok(value) => self
                .request
                .headers
                .insert(http::header::AUTHORIZATION, value),
            Err(_) => self.set_error(Error::new_builder_msg("invalid basic credentials")),
        }
        self
    }

    /// Pre-materialized body bytes.
    #[must_use]
    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.request.body = body.into();
        self
    }

    /// A streaming one-shot body; not replayable across retries.
    #[must_use]
    pub fn body_reader<R>(mut self, reader: R, len: Option<u64>) -> Self
    where
        R: tokio::io::AsyncRead + Send + Unpin + 'static,
    {
        self.request.body = Body::from_reader(reader, len);
        self
    }

    /// A replayable streaming body.
    #[must_use]
    pub fn body_producer<F>(mut self, producer: F, len: Option<u64>) -> Self
    where
        F: Fn() -> std::io::Result<BodyReader> + Send + Sync + 'static,
    {
        self.request.body = Body::from_producer(producer, len);
        self
    }

    /// JSON-marshals `value` through the client's JSON codec knob and
    /// sets the content type.
    #[must_use]
    pub fn json<T: serde::Serialize>(mut self, value: &T) -> Self {
        let marshalled = serde_json::to_value(value)
            .map_err(|err| Error::new_builder(err))
            .and_then(|value| {
                (self.client.inner.config.json_marshal)(&value).map_err(Error::new_builder)
            });
        match marshalled {
            Ok(bytes) => {
                self.request.body = Body::from(bytes);
                self.request.headers.insert(
                    http::header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json; charset=utf-8"),
                );
            }
            Err(err) => self.set_error(err),
        }
        self
    }

    /// Adds URL-encoded form pairs; merged with the client's common
    /// form data and encoded at send time.
    #[must_use]
    pub fn form<I, K, V>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.request
            .form
            .extend(pairs.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// A multipart form body.
    #[must_use]
    pub fn multipart(mut self, form: super::multipart::Form) -> Self {
        let boundary = form
            .boundary()
            .map(str::to_owned)
            .unwrap_or_else(|| (self.client.inner.config.multipart_boundary)());
        let content_type = format!("multipart/form-data; boundary={boundary}");
        match HeaderValue::try_from(content_type) {
            Ok(value) => {
                self.request
                    .headers
                    .insert(http::header::CONTENT_TYPE, value);
                self.request.body = Body::from(form.encode(&boundary));
            }
            Err(_) => self.set_error(Error::new_builder_msg("invalid multipart boundary")),
        }
        self
    }

    /// Wall-clock budget for the whole request, overriding the client
    /// default.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.request.timeout = Some(timeout);
        self
    }

    /// Attaches an external cancellation handle.
    #[must_use]
    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.request.cancel = Some(token);
        self
    }

    #[must_use]
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.request.retry = Some(policy);
        self
    }

    /// Per-request dump override.
    #[must_use]
    pub fn dump(mut self, options: DumpOptions) -> Self {
        self.request.dump = Some(options);
        self
    }

    /// Streams the response body into a file instead of memory.
    /// Relative paths are cleaned against the client's output
    /// directory.
    #[must_use]
    pub fn output_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.request.output_file = Some(path.into());
        self
    }

    fn set_error(&mut self, error: Error) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    /// Executes the request.
    pub async fn send(self) -> crate::Result<super::Response> {
        if let Some(error) = self.error {
            return Err(error);
        }
        self.client.execute(self.request).await
    }
}
