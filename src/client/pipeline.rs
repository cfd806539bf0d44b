//! The per-request driver: prepare, acquire, dispatch, redirect, retry,
//! decode, finalize.
//!
//! Each executed request runs on the caller's task; connection read and
//! write loops run in their own tasks. Every suspension point (acquire,
//! dial, response head, body) honors the request's cancel token and the
//! wall-clock deadline, and a timeout error names the phase that
//! tripped.

use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderValue};
use http::{Method, StatusCode, Version};
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use tokio::io::AsyncReadExt;
use url::Url;

use crate::body::Body;
use crate::cancel::CancelToken;
use crate::connect::{HttpVersion, OriginKey, Scheme, origin_key};
use crate::decoder;
use crate::error::{Error, RedirectCause, TimeoutPhase};
use crate::headers::OrderedHeaders;
use crate::observe::dump::Dumper;
use crate::observe::trace::Tracer;
use crate::pool::Checkout;
use crate::proto::h2::H2Config;
use crate::proto::{WireRequest, h1, h2};

use super::redirect::{self, Action, Attempt};
use super::request::Request;
use super::response::{Response, ResponseBody, unwrap_io_error};
use super::retry::RetryContext;
use super::{Client, Config};

/// Extra characters escaped in substituted path segments.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'#')
    .add(b'?')
    .add(b'{')
    .add(b'}')
    .add(b'/')
    .add(b'%');

/// What prepare distills a request into; retries rebuild wire requests
/// from this without re-running middlewares.
struct Prepared {
    method: Method,
    url: Url,
    headers: OrderedHeaders,
    header_order: Option<crate::headers::HeaderOrder>,
    body: Body,
    /// We added `Accept-Encoding: gzip` ourselves, so decoding the
    /// response transparently is ours to do.
    own_accept_encoding: bool,
}

pub(crate) async fn execute(client: &Client, mut request: Request) -> crate::Result<Response> {
    let config = &client.inner.config;

    // user middlewares first, then the built-in prepare chain
    for middleware in &config.request_middlewares {
        middleware(&mut request)?;
    }

    let retry = request.retry.clone().or_else(|| config.retry.clone());
    let cancel = request.cancel.clone().unwrap_or_default();
    let deadline = request
        .timeout
        .or(config.timeout)
        .map(|timeout| tokio::time::Instant::now() + timeout);
    let budget = Budget { deadline, cancel };

    let tracer = if config.trace {
        Tracer::enabled()
    } else {
        Tracer::disabled()
    };
    let dump_options = request.dump.or(config.dump);
    let dumper = match dump_options {
        Some(options) => {
            // sink defaults to standard output in the configured mode
            let sink = client.inner.dump_sink.clone().unwrap_or_else(|| {
                client
                    .inner
                    .default_dump_sink
                    .get_or_init(|| {
                        if options.async_mode {
                            crate::observe::dump::DumpSink::spawn_async(std::io::stdout())
                        } else {
                            crate::observe::dump::DumpSink::stdout()
                        }
                    })
                    .clone()
            });
            Dumper::new(options, request.dump_buffer.clone(), Some(sink))
        }
        None => Dumper::disabled(),
    };
    let dump_buffer = request.dump_buffer.clone();
    let output_file = request.output_file.clone();

    let prepared = prepare(config, request)?;

    let mut attempt: u32 = 0;
    loop {
        if attempt > 0 {
            // a fresh attempt gets a fresh dump record
            dump_buffer.reset();
        }

        let result = run_attempt(
            client,
            &prepared,
            &budget,
            &dumper,
            &tracer,
            &dump_buffer,
            output_file.as_deref(),
        )
        .await;

        let Some(policy) = &retry else {
            return result;
        };
        if attempt >= policy.count() {
            return result;
        }

        let should_retry = {
            let ctx = RetryContext {
                attempt,
                error: result.as_ref().err(),
                status: result.as_ref().ok().map(Response::status),
            };
            policy.should_retry(&ctx) && prepared.body.is_replayable()
        };
        if !should_retry {
            return result;
        }

        {
            let ctx = RetryContext {
                attempt,
                error: result.as_ref().err(),
                status: result.as_ref().ok().map(Response::status),
            };
            policy.run_hooks(&ctx);
        }
        drop(result);

        let delay = policy.delay(attempt);
        tracing::debug!("retrying request; attempt={} delay={:?}", attempt + 1, delay);
        budget
            .run(TimeoutPhase::Total, async {
                tokio::time::sleep(delay).await;
                Ok(())
            })
            .await?;
        attempt += 1;
    }
}

/// One attempt: the redirect loop plus response assembly.
#[allow(clippy::too_many_arguments)]
async fn run_attempt(
    client: &Client,
    prepared: &Prepared,
    budget: &Budget,
    dumper: &Dumper,
    tracer: &Tracer,
    dump_buffer: &crate::observe::dump::DumpBuffer,
    output_file: Option<&Path>,
) -> crate::Result<Response> {
    let config = &client.inner.config;

    let mut method = prepared.method.clone();
    let mut url = prepared.url.clone();
    let mut headers = prepared.headers.clone();
    let mut body = prepared.body.clone();
    let mut hops = 0usize;

    let exchange = loop {
        let exchange = dispatch(
            client,
            &method,
            &url,
            &headers,
            prepared.header_order.as_ref(),
            &body,
            budget,
            dumper,
            tracer,
        )
        .await?;

        if !redirect::is_redirect(exchange.status) {
            break exchange;
        }
        let Some(location) = exchange
            .headers
            .get(http::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
        else {
            break exchange;
        };
        let Ok(next_url) = url.join(&location) else {
            tracing::debug!("unparseable redirect location {location:?}");
            break exchange;
        };

        if hops >= config.redirect.max_hops() {
            return Err(Error::new_redirect(RedirectCause::TooMany));
        }
        let attempt = Attempt {
            status: exchange.status,
            next: &next_url,
            previous: &url,
            chain_len: hops,
        };
        if config.redirect.evaluate(&attempt) == Action::Stop {
            break exchange;
        }

        // the previous hop's body is fully discarded
        drain(exchange.body).await;

        // method and body rewrite per redirect semantics
        let drop_body = match exchange.status {
            StatusCode::SEE_OTHER => {
                if method != Method::HEAD {
                    method = Method::GET;
                }
                true
            }
            StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND => {
                if method == Method::POST {
                    method = Method::GET;
                    true
                } else {
                    false
                }
            }
            // 307/308 must replay the body
            _ => {
                if !body.is_replayable() {
                    return Err(Error::new_body_not_replayable());
                }
                false
            }
        };
        if drop_body {
            body = Body::empty();
            headers.remove(&http::header::CONTENT_TYPE);
            headers.remove(&http::header::CONTENT_LENGTH);
        }

        // sensitive headers do not cross hosts
        if next_url.host_str() != url.host_str() {
            headers.remove(&http::header::AUTHORIZATION);
            headers.remove(&http::header::COOKIE);
        }

        tracing::debug!("following redirect to {next_url}");
        url = next_url;
        hops += 1;
    };

    assemble_response(
        config,
        exchange,
        method,
        url,
        budget,
        tracer,
        dump_buffer,
        output_file,
        prepared.own_accept_encoding,
    )
    .await
}

/// A response fresh off a connection, before decoding and middlewares.
struct RawExchange {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    body: ResponseBody,
}

/// Acquires a transport and performs one wire exchange. The
/// nothing-written retry rule lives in the checkout path: dead
/// kept-alive connections are detected by the liveness probe before a
/// byte is written, and H2 refusals (GOAWAY, REFUSED_STREAM) that
/// guarantee non-processing re-dispatch here. Once writing has begun,
/// a failure is only resent by the retry policy.
#[allow(clippy::too_many_arguments)]
async fn dispatch(
    client: &Client,
    method: &Method,
    url: &Url,
    headers: &OrderedHeaders,
    header_order: Option<&crate::headers::HeaderOrder>,
    body: &Body,
    budget: &Budget,
    dumper: &Dumper,
    tracer: &Tracer,
) -> crate::Result<RawExchange> {
    let config = &client.inner.config;
    let pool = &client.inner.pool;

    let key = origin_key(
        url,
        config.proxy.as_ref(),
        config.force_version,
        config.unix_socket.as_deref(),
    )?;
    let h2_able = matches!(config.force_version, HttpVersion::Http2)
        || (key.scheme == Scheme::Https && config.force_version == HttpVersion::Auto);

    // H1 requests through a cleartext http proxy use absolute-form.
    let absolute_form = key.scheme == Scheme::Http
        && client
            .inner
            .proxy
            .as_ref()
            .is_some_and(|p| p.kind != crate::connect::proxy::ProxyKind::Socks5);

    let mut reuse_rounds = 0u8;
    loop {
        let wire = build_wire(method, url, headers, header_order, body, &key, absolute_form)?;

        let checkout = budget
            .run(TimeoutPhase::Acquire, async {
                Ok(pool.checkout(&key, h2_able).await)
            })
            .await?;

        match checkout {
            Checkout::H1(conn, guard, idle_for) => {
                tracer.got_conn(true, idle_for);
                let exchange = budget
                    .run(
                        TimeoutPhase::ReadHead,
                        conn.send_request(wire, dumper.clone(), tracer.clone()),
                    )
                    .await;
                match exchange {
                    Ok((head, recv)) => {
                        return Ok(finish_h1(pool, &key, guard, head, recv));
                    }
                    Err(err) => {
                        // bytes may already be on the wire; dropping the
                        // guard closes the connection, the retry policy
                        // decides whether to resend
                        drop(guard);
                        return Err(err);
                    }
                }
            }
            Checkout::H2(sender) => {
                tracer.got_conn(true, None);
                let result = budget
                    .run(
                        TimeoutPhase::ReadHead,
                        sender.send_request(wire, dumper.clone(), tracer.clone()),
                    )
                    .await;
                match result {
                    Ok((head, recv)) => {
                        return Ok(RawExchange {
                            status: head.status,
                            version: Version::HTTP_2,
                            headers: head.headers,
                            body: ResponseBody::h2(recv),
                        });
                    }
                    Err(err) if err.is_retryable() && reuse_rounds < 2 => {
                        // GOAWAY or refused stream: replay elsewhere
                        reuse_rounds += 1;
                        continue;
                    }
                    Err(err) => return Err(err),
                }
            }
            Checkout::Dial(permit) => {
                let established = budget
                    .run(
                        TimeoutPhase::Dial,
                        client
                            .inner
                            .connector
                            .connect(&key, client.inner.proxy.as_ref(), tracer),
                    )
                    .await?;
                tracer.got_conn(false, None);

                match established.proto {
                    crate::connect::Proto::H1 => {
                        let guard = permit.take_h1();
                        let conn = h1::Http1Conn::new(established.io, config.head_cap);
                        let (head, recv) = budget
                            .run(
                                TimeoutPhase::ReadHead,
                                conn.send_request(wire, dumper.clone(), tracer.clone()),
                            )
                            .await?;
                        return Ok(finish_h1(pool, &key, guard, head, recv));
                    }
                    crate::connect::Proto::H2 => {
                        let h2_config = h2_config(config);
                        let (sender, driver) = budget
                            .run(TimeoutPhase::Dial, h2::handshake(established.io, h2_config))
                            .await?;
                        let guard = permit.register_h2(pool, &sender);
                        tokio::spawn(async move {
                            driver.run().await;
                            drop(guard);
                        });

                        let (head, recv) = budget
                            .run(
                                TimeoutPhase::ReadHead,
                                sender.send_request(wire, dumper.clone(), tracer.clone()),
                            )
                            .await?;
                        return Ok(RawExchange {
                            status: head.status,
                            version: Version::HTTP_2,
                            headers: head.headers,
                            body: ResponseBody::h2(recv),
                        });
                    }
                }
            }
        }
    }
}

fn finish_h1(
    pool: &crate::pool::Pool,
    key: &OriginKey,
    guard: crate::pool::ActiveGuard,
    head: h1::Http1ResponseHead,
    mut recv: h1::RecvBody,
) -> RawExchange {
    let pool = pool.clone();
    let key = key.clone();
    recv.set_give_back(Box::new(move |conn| {
        pool.checkin(&key, conn, guard);
    }));
    RawExchange {
        status: head.status,
        version: head.version,
        headers: head.headers,
        body: ResponseBody::h1(recv),
    }
}

fn h2_config(config: &Config) -> H2Config {
    match &config.preset {
        Some(preset) => H2Config {
            settings: preset.h2_settings.clone(),
            pseudo_order: preset.pseudo_order.clone(),
            headers_priority: preset.headers_priority.clone(),
            priority_frames: preset.priority_frames.clone(),
            conn_window_bump: preset.conn_window_bump,
            max_header_block: config.head_cap,
        },
        None => H2Config {
            max_header_block: config.head_cap,
            ..Default::default()
        },
    }
}

/// Builds the response: transparent decode, auto-read, middlewares,
/// download-to-file, trace publication.
#[allow(clippy::too_many_arguments)]
async fn assemble_response(
    config: &Config,
    exchange: RawExchange,
    method: Method,
    url: Url,
    budget: &Budget,
    tracer: &Tracer,
    dump_buffer: &crate::observe::dump::DumpBuffer,
    output_file: Option<&Path>,
    own_accept_encoding: bool,
) -> crate::Result<Response> {
    let mut headers = exchange.headers;
    let mut body = exchange.body;

    // transparent gzip: only when the transport asked for it
    if own_accept_encoding && decoder::is_gzip(&headers) {
        decoder::strip_coding_headers(&mut headers);
        body = ResponseBody::wrapped(decoder::gzip_reader(Box::new(body)));
    }

    let needs_body = config
        .response_middlewares
        .iter()
        .any(|hook| hook.needs_body);
    let auto_read = (!config.disable_auto_read || needs_body) && output_file.is_none();

    let content_type = headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let mut trailers = None;
    if auto_read {
        let buffered = budget
            .run(
                TimeoutPhase::ReadBody,
                read_limited(&mut body, config.body_limit),
            )
            .await?;
        trailers = body.take_trailers();
        body = ResponseBody::buffered(buffered);
    } else if !config.disable_auto_decode && decoder::is_textual(content_type.as_deref()) {
        // streaming auto-decode: peek, sniff, splice
        body = ResponseBody::wrapped(
            budget
                .run(TimeoutPhase::ReadBody, async {
                    decoder::auto_decode_reader(Box::new(body), content_type.as_deref())
                        .await
                        .map_err(unwrap_io_error)
                })
                .await?,
        );
    }

    tracer.done();
    let mut response = Response {
        status: exchange.status,
        version: exchange.version,
        headers,
        trailers,
        body,
        method,
        url,
        trace: tracer.finish(),
        dump_buffer: dump_buffer.clone(),
        received_at: SystemTime::now(),
        auto_decode: !config.disable_auto_decode,
    };

    for hook in &config.response_middlewares {
        (hook.f)(&mut response)?;
    }

    // exactly-once finalization: download-to-file
    if let Some(path) = output_file {
        let path = clean_output_path(config.output_dir.as_deref(), path);
        write_body_to_file(&mut response, &path, budget).await?;
    }

    Ok(response)
}

async fn write_body_to_file(
    response: &mut Response,
    path: &Path,
    budget: &Budget,
) -> crate::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(Error::new_body)?;
        }
    }
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(Error::new_body)?;
    budget
        .run(TimeoutPhase::ReadBody, async {
            tokio::io::copy(response.body_mut(), &mut file)
                .await
                .map_err(unwrap_io_error)?;
            Ok(())
        })
        .await?;
    response.trailers = response.body.take_trailers();
    response.body = ResponseBody::empty();
    Ok(())
}

/// Resolves a download path: absolute paths pass through, relative ones
/// are cleaned (no parent escapes) against the output directory.
fn clean_output_path(output_dir: Option<&Path>, path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => cleaned.push(part),
            Component::ParentDir => {
                cleaned.pop();
            }
            _ => {}
        }
    }
    match output_dir {
        Some(dir) => dir.join(cleaned),
        None => cleaned,
    }
}

/// Reads a body to completion under an optional size cap.
async fn read_limited(
    body: &mut ResponseBody,
    limit: Option<u64>,
) -> crate::Result<Bytes> {
    let mut out = Vec::new();
    match limit {
        Some(limit) => {
            let mut capped = (&mut *body).take(limit + 1);
            capped
                .read_to_end(&mut out)
                .await
                .map_err(unwrap_io_error)?;
            if out.len() as u64 > limit {
                return Err(Error::new_body("response body exceeds configured limit"));
            }
        }
        None => {
            body.read_to_end(&mut out).await.map_err(unwrap_io_error)?;
        }
    }
    Ok(Bytes::from(out))
}

/// Discards a redirect hop's body so its connection can be pooled;
/// oversized bodies are simply dropped with the connection.
async fn drain(mut body: ResponseBody) {
    let mut remaining = 64 * 1024u64;
    let mut buf = [0u8; 8 * 1024];
    while remaining > 0 {
        match body.read(&mut buf).await {
            Ok(0) => return,
            Ok(n) => remaining = remaining.saturating_sub(n as u64),
            Err(_) => return,
        }
    }
    // still bytes left: dropping the body closes the connection
}

// ===== prepare =====

fn prepare(config: &Config, request: Request) -> crate::Result<Prepared> {
    let Request {
        method,
        target,
        mut headers,
        header_order,
        query,
        path_params,
        form,
        cookies,
        mut body,
        ..
    } = request;

    // header merge: request wins per name
    headers.merge_defaults(&config.common_headers);

    // URL resolution
    let url = resolve_url(config, &target, &path_params, &query)?;

    // body assembly: form encoding (request fields trigger, client
    // common fields merge in front)
    if !form.is_empty() {
        let mut pairs = config.common_form.clone();
        pairs.extend(form);
        let encoded =
            serde_urlencoded::to_string(&pairs).map_err(Error::new_builder)?;
        body = Body::from(encoded);
        if !headers.contains(&http::header::CONTENT_TYPE) {
            headers.insert(
                http::header::CONTENT_TYPE,
                HeaderValue::from_static("application/x-www-form-urlencoded"),
            );
        }
    }

    // cookie merge: client cookies first, then request cookies
    let mut cookie_pairs: Vec<String> = Vec::new();
    if let Some(existing) = headers.get(&http::header::COOKIE) {
        if let Ok(existing) = existing.to_str() {
            cookie_pairs.push(existing.to_owned());
        }
    }
    for cookie in config.common_cookies.iter().chain(cookies.iter()) {
        cookie_pairs.push(format!("{}={}", cookie.name(), cookie.value()));
    }
    if !cookie_pairs.is_empty() {
        let joined = cookie_pairs.join("; ");
        if let Ok(value) = HeaderValue::try_from(joined) {
            headers.insert(http::header::COOKIE, value);
        }
    }

    // default content type for bodied requests
    if !body.is_empty() && !headers.contains(&http::header::CONTENT_TYPE) {
        if let Some(content_type) = &config.content_type {
            headers.insert(http::header::CONTENT_TYPE, content_type.clone());
        }
    }

    // transparent compression: only when the caller stayed silent
    let mut own_accept_encoding = false;
    if !config.disable_compression && !headers.contains(&http::header::ACCEPT_ENCODING) {
        headers.insert(
            http::header::ACCEPT_ENCODING,
            HeaderValue::from_static("gzip"),
        );
        own_accept_encoding = true;
    }

    // methods that forbid a payload drop it here, whatever was set
    if WireRequest::forbids_payload(&method) && !body.is_empty() {
        tracing::debug!("{} request configured with a body; dropping it", method);
        body = Body::empty();
    }

    Ok(Prepared {
        method,
        url,
        headers,
        header_order,
        body,
        own_accept_encoding,
    })
}

fn resolve_url(
    config: &Config,
    target: &str,
    path_params: &[(String, String)],
    query: &super::request::QueryParams,
) -> crate::Result<Url> {
    // path-param substitution: request params win over client defaults
    let mut target = target.to_owned();
    for (name, value) in config.common_path_params.iter().chain(path_params.iter()) {
        let needle = format!("{{{name}}}");
        if target.contains(&needle) {
            let escaped = utf8_percent_encode(value, SEGMENT).to_string();
            target = target.replace(&needle, &escaped);
        }
    }

    let mut url = match Url::parse(&target) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => match &config.base_url {
            Some(base) => base.join(&target).map_err(Error::new_builder)?,
            None => {
                // scheme defaulting: treat the target as host[/path]
                let with_scheme = format!("{}://{}", config.default_scheme, target);
                Url::parse(&with_scheme).map_err(Error::new_builder)?
            }
        },
        Err(err) => return Err(Error::new_builder(err)),
    };

    // query merge: request pairs keep their order, client common pairs
    // append when the key is not already present
    {
        let request_keys: Vec<&str> = query.pairs().iter().map(|(k, _)| k.as_str()).collect();
        let mut pairs = url.query_pairs_mut();
        for (key, value) in query.pairs() {
            pairs.append_pair(key, value);
        }
        for (key, value) in &config.common_query {
            if !request_keys.contains(&key.as_str()) {
                pairs.append_pair(key, value);
            }
        }
    }
    if url.query() == Some("") {
        url.set_query(None);
    }

    Ok(url)
}

/// Builds the wire request for one dispatch; opening the payload may
/// fail for spent one-shot bodies.
fn build_wire(
    method: &Method,
    url: &Url,
    headers: &OrderedHeaders,
    header_order: Option<&crate::headers::HeaderOrder>,
    body: &Body,
    key: &OriginKey,
    absolute_form: bool,
) -> crate::Result<WireRequest> {
    let payload = body.payload()?;
    let mut path_and_query = url.path().to_owned();
    if let Some(query) = url.query() {
        path_and_query.push('?');
        path_and_query.push_str(query);
    }

    Ok(WireRequest {
        method: method.clone(),
        scheme: key.scheme.as_str(),
        authority: key.authority(),
        path_and_query,
        headers: headers.clone(),
        header_order: header_order.cloned(),
        payload,
        absolute_form,
    })
}

// ===== deadline / cancellation =====

pub(crate) struct Budget {
    deadline: Option<tokio::time::Instant>,
    cancel: CancelToken,
}

impl Budget {
    /// Runs `fut`, racing it against cancellation and the wall-clock
    /// deadline; a timeout error names `phase`.
    pub(crate) async fn run<T, F>(&self, phase: TimeoutPhase, fut: F) -> crate::Result<T>
    where
        F: Future<Output = crate::Result<T>>,
    {
        tokio::select! {
            result = fut => result,
            () = self.cancel.canceled() => Err(Error::new_canceled()),
            () = sleep_until_opt(self.deadline) => Err(Error::new_timeout(phase)),
        }
    }
}

async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        let builder = super::super::ClientBuilder::default();
        builder.config
    }

    #[test]
    fn url_resolution_with_templates_and_query_merge() {
        let mut config = test_config();
        config.base_url = Some(Url::parse("https://api.example.com").unwrap());
        config.common_query = vec![("token".to_owned(), "abc".to_owned())];

        let mut query = super::super::request::QueryParams::default();
        query.add("format", "json");

        let url = resolve_url(
            &config,
            "/users/{id}",
            &[("id".to_owned(), "42".to_owned())],
            &query,
        )
        .unwrap();

        assert_eq!(url.as_str(), "https://api.example.com/users/42?format=json&token=abc");
    }

    #[test]
    fn path_params_are_escaped() {
        let config = test_config();
        let url = resolve_url(
            &config,
            "example.com/files/{name}",
            &[("name".to_owned(), "a b/c".to_owned())],
            &super::super::request::QueryParams::default(),
        )
        .unwrap();
        assert_eq!(url.path(), "/files/a%20b%2Fc");
    }

    #[test]
    fn scheme_defaulting() {
        let mut config = test_config();
        config.default_scheme = "http".to_owned();
        let url = resolve_url(
            &config,
            "example.com/ping",
            &[],
            &super::super::request::QueryParams::default(),
        )
        .unwrap();
        assert_eq!(url.as_str(), "http://example.com/ping");
    }

    #[test]
    fn request_query_overrides_common() {
        let mut config = test_config();
        config.common_query = vec![("token".to_owned(), "abc".to_owned())];

        let mut query = super::super::request::QueryParams::default();
        query.add("token", "mine");

        let url = resolve_url(&config, "https://x.dev/p", &[], &query).unwrap();
        assert_eq!(url.query(), Some("token=mine"));
    }

    #[test]
    fn forbidden_payload_is_dropped() {
        let config = test_config();
        let mut request = Request::new(Method::GET, "https://example.com/");
        request.body = Body::from("should not be sent");
        let prepared = prepare(&config, request).unwrap();
        assert!(prepared.body.is_empty());
    }

    #[test]
    fn form_body_merges_common_fields_first() {
        let mut config = test_config();
        config.common_form = vec![("k1".to_owned(), "v1".to_owned())];

        let mut request = Request::new(Method::POST, "https://example.com/submit");
        request.form.push(("k2".to_owned(), "v2".to_owned()));

        let prepared = prepare(&config, request).unwrap();
        let payload = prepared.body.payload().unwrap();
        match payload {
            crate::body::Payload::Full(bytes) => assert_eq!(bytes.as_ref(), b"k1=v1&k2=v2"),
            _ => panic!("expected full payload"),
        }
        assert_eq!(prepared.body.content_length(), Some(11));
    }

    #[test]
    fn accept_encoding_is_ours_unless_set() {
        let config = test_config();
        let request = Request::new(Method::GET, "https://example.com/");
        let prepared = prepare(&config, request).unwrap();
        assert!(prepared.own_accept_encoding);
        assert_eq!(
            prepared
                .headers
                .get(&http::header::ACCEPT_ENCODING)
                .map(HeaderValue::as_bytes),
            Some(&b"gzip"[..])
        );

        let mut request = Request::new(Method::GET, "https://example.com/");
        request.headers.insert(
            http::header::ACCEPT_ENCODING,
            HeaderValue::from_static("identity"),
        );
        let prepared = prepare(&config, request).unwrap();
        assert!(!prepared.own_accept_encoding);
    }

    #[test]
    fn middleware_failure_short_circuits() {
        let client = super::super::ClientBuilder::default()
            .with_request_middleware(|_req| Err(Error::new_builder_msg("vetoed")))
            .build()
            .unwrap();
        let request = Request::new(Method::GET, "https://example.com/");
        let err = tokio_test::block_on(execute(&client, request)).unwrap_err();
        assert!(err.is_builder());
    }

    #[test]
    fn output_paths_are_cleaned() {
        let cleaned = clean_output_path(
            Some(Path::new("/downloads")),
            Path::new("../../etc/passwd"),
        );
        assert_eq!(cleaned, Path::new("/downloads/etc/passwd"));

        let cleaned = clean_output_path(Some(Path::new("/downloads")), Path::new("a/../b.txt"));
        assert_eq!(cleaned, Path::new("/downloads/b.txt"));

        let absolute = clean_output_path(Some(Path::new("/downloads")), Path::new("/tmp/x"));
        assert_eq!(absolute, Path::new("/tmp/x"));
    }

    #[test]
    fn cookies_merge_into_one_header() {
        let mut config = test_config();
        config
            .common_cookies
            .push(cookie::Cookie::new("session", "s1"));

        let mut request = Request::new(Method::GET, "https://example.com/");
        request.cookies.push(cookie::Cookie::new("pref", "dark"));

        let prepared = prepare(&config, request).unwrap();
        assert_eq!(
            prepared
                .headers
                .get(&http::header::COOKIE)
                .and_then(|v| v.to_str().ok()),
            Some("session=s1; pref=dark")
        );
    }

}
