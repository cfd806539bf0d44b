//! The client: a cheap-clone handle over an immutable configuration
//! snapshot, the shared connection pool, and the dialer.

pub(crate) mod multipart;
pub(crate) mod pipeline;
pub(crate) mod redirect;
pub(crate) mod request;
pub(crate) mod response;
pub(crate) mod retry;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use http::Method;
use http::header::{HeaderName, HeaderValue};
use url::Url;

use crate::connect::{Connector, DialHook, HttpVersion};
use crate::error::{BoxError, Error};
use crate::fingerprint::Preset;
use crate::headers::OrderedHeaders;
use crate::observe::dump::{DumpOptions, DumpSink};
use crate::pool::{Pool, PoolConfig};

pub use multipart::{Form, Part};
pub use redirect::{Action, Attempt, RedirectPolicy, Rule};
pub use request::{QueryParams, Request, RequestBuilder};
pub use response::{Response, ResponseBody};
pub use retry::{RetryContext, RetryInterval, RetryPolicy};

/// A request middleware: runs before URL resolution, may mutate
/// anything on the request, and may veto it with an error.
pub type RequestHook = Arc<dyn Fn(&mut Request) -> crate::Result<()> + Send + Sync>;

/// A response middleware; hooks that need the body force it to be read
/// even when auto-read is disabled.
#[derive(Clone)]
pub struct ResponseHook {
    pub(crate) f: Arc<dyn Fn(&mut Response) -> crate::Result<()> + Send + Sync>,
    pub(crate) needs_body: bool,
}

impl ResponseHook {
    #[must_use]
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&mut Response) -> crate::Result<()> + Send + Sync + 'static,
    {
        Self {
            f: Arc::new(f),
            needs_body: false,
        }
    }

    /// A hook that inspects body bytes; the pipeline buffers the body
    /// before invoking it, regardless of the auto-read flag.
    #[must_use]
    pub fn with_body<F>(f: F) -> Self
    where
        F: Fn(&mut Response) -> crate::Result<()> + Send + Sync + 'static,
    {
        Self {
            f: Arc::new(f),
            needs_body: true,
        }
    }
}

type JsonMarshal = Arc<dyn Fn(&serde_json::Value) -> Result<Vec<u8>, BoxError> + Send + Sync>;
type BoundaryFn = Arc<dyn Fn() -> String + Send + Sync>;

/// The configuration snapshot requests capture at creation time.
pub(crate) struct Config {
    pub(crate) base_url: Option<Url>,
    pub(crate) default_scheme: String,
    pub(crate) common_headers: OrderedHeaders,
    pub(crate) common_query: Vec<(String, String)>,
    pub(crate) common_path_params: Vec<(String, String)>,
    pub(crate) common_form: Vec<(String, String)>,
    pub(crate) common_cookies: Vec<cookie::Cookie<'static>>,
    pub(crate) content_type: Option<HeaderValue>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) redirect: RedirectPolicy,
    pub(crate) retry: Option<RetryPolicy>,
    pub(crate) disable_auto_read: bool,
    pub(crate) disable_auto_decode: bool,
    pub(crate) disable_compression: bool,
    pub(crate) head_cap: usize,
    pub(crate) body_limit: Option<u64>,
    pub(crate) dump: Option<DumpOptions>,
    pub(crate) trace: bool,
    pub(crate) force_version: HttpVersion,
    pub(crate) unix_socket: Option<String>,
    pub(crate) preset: Option<Preset>,
    pub(crate) output_dir: Option<PathBuf>,
    pub(crate) request_middlewares: Vec<RequestHook>,
    pub(crate) response_middlewares: Vec<ResponseHook>,
    pub(crate) json_marshal: JsonMarshal,
    pub(crate) multipart_boundary: BoundaryFn,
    pub(crate) proxy: Option<Url>,
}

pub(crate) struct ClientRef {
    pub(crate) config: Config,
    pub(crate) pool: Pool,
    pub(crate) connector: Connector,
    pub(crate) proxy: Option<crate::connect::proxy::ProxyConfig>,
    pub(crate) dump_sink: Option<DumpSink>,
    /// Stdout sink created on first dumped request, honoring the
    /// configured sync/async mode.
    pub(crate) default_dump_sink: std::sync::OnceLock<DumpSink>,
}

/// The HTTP client. Cloning shares the pool and configuration.
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: Arc<ClientRef>,
}

impl Client {
    /// A client with default settings.
    #[expect(clippy::expect_used, reason = "the default configuration always builds")]
    pub fn new() -> Self {
        ClientBuilder::default()
            .build()
            .expect("default client configuration is valid")
    }

    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    pub fn request(&self, method: Method, target: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(self.clone(), method, target)
    }

    pub fn get(&self, target: impl Into<String>) -> RequestBuilder {
        self.request(Method::GET, target)
    }

    pub fn post(&self, target: impl Into<String>) -> RequestBuilder {
        self.request(Method::POST, target)
    }

    pub fn put(&self, target: impl Into<String>) -> RequestBuilder {
        self.request(Method::PUT, target)
    }

    pub fn delete(&self, target: impl Into<String>) -> RequestBuilder {
        self.request(Method::DELETE, target)
    }

    pub fn patch(&self, target: impl Into<String>) -> RequestBuilder {
        self.request(Method::PATCH, target)
    }

    pub fn head(&self, target: impl Into<String>) -> RequestBuilder {
        self.request(Method::HEAD, target)
    }

    pub fn options(&self, target: impl Into<String>) -> RequestBuilder {
        self.request(Method::OPTIONS, target)
    }

    /// Executes a prepared request through the transport pipeline.
    pub async fn execute(&self, request: Request) -> crate::Result<Response> {
        pipeline::execute(self, request).await
    }

    /// Closes every idle pooled connection.
    pub fn close_idle_connections(&self) {
        self.inner.pool.close_idle();
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("base_url", &self.inner.config.base_url.as_ref().map(Url::as_str))
            .field("force_version", &self.inner.config.force_version)
            .finish()
    }
}

/// Builds a [`Client`].
pub struct ClientBuilder {
    config: Config,
    pool: PoolConfig,
    tls_config: Option<Arc<rustls::ClientConfig>>,
    dial_hook: Option<DialHook>,
    dump_sink: Option<DumpSink>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self {
            config: Config {
                base_url: None,
                default_scheme: "https".to_owned(),
                common_headers: OrderedHeaders::new(),
                common_query: Vec::new(),
                common_path_params: Vec::new(),
                common_form: Vec::new(),
                common_cookies: Vec::new(),
                content_type: None,
                timeout: None,
                redirect: RedirectPolicy::default(),
                retry: None,
                disable_auto_read: false,
                disable_auto_decode: false,
                disable_compression: false,
                head_cap: 1024 * 1024,
                body_limit: None,
                dump: None,
                trace: false,
                force_version: HttpVersion::Auto,
                unix_socket: None,
                preset: None,
                output_dir: None,
                request_middlewares: Vec::new(),
                response_middlewares: Vec::new(),
                json_marshal: Arc::new(|value| {
                    serde_json::to_vec(value).map_err(|err| Box::new(err) as BoxError)
                }),
                multipart_boundary: Arc::new(multipart::default_boundary),
                proxy: None,
            },
            pool: PoolConfig::default(),
            tls_config: None,
            dial_hook: None,
            dump_sink: None,
        }
    }
}

impl ClientBuilder {
    /// Base URL that relative request targets resolve against.
    #[must_use]
    pub fn with_base_url(mut self, base: impl AsRef<str>) -> Self {
        match Url::parse(base.as_ref()) {
            Ok(url) => self.config.base_url = Some(url),
            Err(err) => {
                tracing::debug!("ignoring invalid base url: {err}");
            }
        }
        self
    }

    /// Scheme applied when a request target carries none. Defaults to
    /// `https`.
    #[must_use]
    pub fn with_default_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.config.default_scheme = scheme.into();
        self
    }

    /// A header sent with every request unless the request overrides
    /// the name.
    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.config.common_headers.append(name, value);
        self
    }

    /// A query parameter appended to every request.
    #[must_use]
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.common_query.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_path_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config
            .common_path_params
            .push((name.into(), value.into()));
        self
    }

    /// A form field merged into every form-encoded request body.
    #[must_use]
    pub fn with_form_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.common_form.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_cookie(mut self, cookie: cookie::Cookie<'static>) -> Self {
        self.config.common_cookies.push(cookie);
        self
    }

    #[must_use]
    pub fn with_bearer_auth(self, token: impl AsRef<str>) -> Self {
        match HeaderValue::try_from(format!("Bearer {}", token.as_ref())) {
            Ok(value) => self.with_header(http::header::AUTHORIZATION, value),
            Err(_) => self,
        }
    }

    #[must_use]
    pub fn with_basic_auth(self, username: impl AsRef<str>, password: impl AsRef<str>) -> Self {
        use base64::Engine as _;
        let raw = format!("{}:{}", username.as_ref(), password.as_ref());
        let encoded = format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(raw)
        );
        match HeaderValue::try_from(encoded) {
            Ok(value) => self.with_header(http::header::AUTHORIZATION, value),
            Err(_) => self,
        }
    }

    /// Default content type for requests that carry a body but no
    /// explicit content type.
    #[must_use]
    pub fn with_content_type(mut self, value: HeaderValue) -> Self {
        self.config.content_type = Some(value);
        self
    }

    /// Total wall-clock budget per request.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_redirect_policy(mut self, policy: RedirectPolicy) -> Self {
        self.config.redirect = policy;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = Some(policy);
        self
    }

    /// Leave response bodies unread; the caller streams them.
    #[must_use]
    pub fn disable_auto_read(mut self) -> Self {
        self.config.disable_auto_read = true;
        self
    }

    /// Enables charset auto-decode to UTF-8 (the default).
    #[must_use]
    pub fn enable_auto_decode(mut self) -> Self {
        self.config.disable_auto_decode = false;
        self
    }

    /// Disables charset auto-decode; raw bytes are delivered.
    #[must_use]
    pub fn disable_auto_decode(mut self) -> Self {
        self.config.disable_auto_decode = true;
        self
    }

    /// Stop requesting (and transparently decoding) gzip.
    #[must_use]
    pub fn disable_compression(mut self) -> Self {
        self.config.disable_compression = true;
        self
    }

    /// Cap on a response head; exactly this many bytes still parses.
    #[must_use]
    pub fn with_max_response_head_size(mut self, cap: usize) -> Self {
        self.config.head_cap = cap;
        self
    }

    /// Cap on auto-read response bodies.
    #[must_use]
    pub fn with_response_body_limit(mut self, limit: u64) -> Self {
        self.config.body_limit = Some(limit);
        self
    }

    #[must_use]
    pub fn with_max_conns_per_host(mut self, max: usize) -> Self {
        self.pool.max_conns_per_host = max;
        self
    }

    #[must_use]
    pub fn with_max_idle_per_host(mut self, max: usize) -> Self {
        self.pool.max_idle_per_host = max;
        self
    }

    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.pool.idle_timeout = timeout;
        self
    }

    /// Enables wire dumping with the given options.
    #[must_use]
    pub fn with_dump(mut self, options: DumpOptions) -> Self {
        self.config.dump = Some(options);
        self
    }

    /// Client-level sink receiving a copy of every dump record.
    #[must_use]
    pub fn with_dump_sink(mut self, sink: DumpSink) -> Self {
        self.dump_sink = Some(sink);
        self
    }

    /// Records lifecycle timestamps on every response.
    #[must_use]
    pub fn enable_trace(mut self) -> Self {
        self.config.trace = true;
        self
    }

    /// Bypasses ALPN and pins the wire protocol.
    #[must_use]
    pub fn with_force_http_version(mut self, version: HttpVersion) -> Self {
        self.config.force_version = version;
        self
    }

    /// Dials this unix socket path instead of TCP.
    #[must_use]
    pub fn with_unix_socket(mut self, path: impl Into<String>) -> Self {
        self.config.unix_socket = Some(path.into());
        self
    }

    /// Applies a fingerprint preset: TLS shape, H2 SETTINGS and order,
    /// pseudo-header order, PRIORITY chatter, multipart boundary.
    #[must_use]
    pub fn with_fingerprint(mut self, preset: Preset) -> Self {
        if let Some(boundary) = preset.multipart_boundary.clone() {
            self.config.multipart_boundary = boundary;
        }
        self.config.preset = Some(preset);
        self
    }

    /// Routes all traffic through this proxy (`http`, `https`,
    /// `socks5`).
    #[must_use]
    pub fn with_proxy(mut self, proxy: impl AsRef<str>) -> Self {
        match Url::parse(proxy.as_ref()) {
            Ok(url) => self.config.proxy = Some(url),
            Err(err) => {
                tracing::debug!("ignoring invalid proxy url: {err}");
            }
        }
        self
    }

    /// Full TLS configuration override; ALPN included, taken as-is.
    #[must_use]
    pub fn with_tls_config(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.tls_config = Some(config);
        self
    }

    /// Replaces the TCP dial step.
    #[must_use]
    pub fn with_dial<F, Fut>(mut self, dial: F) -> Self
    where
        F: Fn(&str, u16) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = std::io::Result<crate::proto::Io>> + Send + 'static,
    {
        self.dial_hook = Some(Arc::new(move |host, port| Box::pin(dial(host, port))));
        self
    }

    /// Directory that relative `output_file` paths are cleaned against.
    #[must_use]
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = Some(dir.into());
        self
    }

    /// Appends a request middleware; middlewares run in registration
    /// order before the request hits the wire.
    #[must_use]
    pub fn with_request_middleware<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Request) -> crate::Result<()> + Send + Sync + 'static,
    {
        self.config.request_middlewares.push(Arc::new(f));
        self
    }

    /// Appends a response middleware; middlewares run in registration
    /// order once the response head (and, when needed, body) is
    /// available.
    #[must_use]
    pub fn with_response_middleware(mut self, hook: ResponseHook) -> Self {
        self.config.response_middlewares.push(hook);
        self
    }

    /// Replaces the JSON marshal knob.
    #[must_use]
    pub fn with_json_marshal<F>(mut self, f: F) -> Self
    where
        F: Fn(&serde_json::Value) -> Result<Vec<u8>, BoxError> + Send + Sync + 'static,
    {
        self.config.json_marshal = Arc::new(f);
        self
    }

    pub fn build(self) -> crate::Result<Client> {
        let proxy = match &self.config.proxy {
            Some(url) => Some(crate::connect::proxy::ProxyConfig::parse(url)?),
            None => None,
        };

        let connector = Connector::new(
            self.tls_config.clone(),
            self.config.preset.as_ref().map(|p| &p.tls),
            self.config.force_version,
            self.dial_hook.clone(),
        )?;

        if self.config.head_cap == 0 {
            return Err(Error::new_builder_msg("response head cap must be non-zero"));
        }

        Ok(Client {
            inner: Arc::new(ClientRef {
                config: self.config,
                pool: Pool::new(self.pool),
                connector,
                proxy,
                dump_sink: self.dump_sink,
                default_dump_sink: std::sync::OnceLock::new(),
            }),
        })
    }
}
