//! End-to-end HTTP/1.1 behavior against scripted TCP servers.

use std::io::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use fletch::{Client, DumpOptions, HttpVersion, RetryPolicy};

/// A scripted server: for each accepted connection, reads request heads
/// (and `Content-Length` bodies) and answers from a canned list. Served
/// requests are recorded verbatim.
struct Script {
    listener: TcpListener,
    requests: Arc<Mutex<Vec<String>>>,
}

impl Script {
    async fn bind() -> Self {
        Self {
            listener: TcpListener::bind("127.0.0.1:0").await.unwrap(),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.listener.local_addr().unwrap(), path)
    }

    /// Serves `responses_per_conn` exchanges per accepted connection,
    /// for `conns` connections.
    fn serve(self, conns: usize, responses_per_conn: Vec<Vec<u8>>) -> Arc<Mutex<Vec<String>>> {
        let requests = self.requests.clone();
        let listener = self.listener;
        tokio::spawn(async move {
            for _ in 0..conns {
                let (mut socket, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                let requests = requests.clone();
                let responses = responses_per_conn.clone();
                tokio::spawn(async move {
                    for response in responses {
                        let Some(request) = read_request(&mut socket).await else {
                            return;
                        };
                        requests.lock().await.push(request);
                        if socket.write_all(&response).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        self.requests
    }
}

/// Reads one request (head plus any Content-Length body) as text.
async fn read_request(socket: &mut TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())?
        })
        .unwrap_or(0);

    while buf.len() < head_end + content_length {
        match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
    Some(String::from_utf8_lossy(&buf[..head_end + content_length]).into_owned())
}

fn ok_response(body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    )
    .into_bytes()
}

#[tokio::test]
async fn get_merges_query_params_and_path_templates() {
    let script = Script::bind().await;
    let base = format!("http://{}", script.listener.local_addr().unwrap());
    let requests = script.serve(1, vec![ok_response("ok")]);

    let client = Client::builder()
        .with_base_url(base)
        .with_query("token", "abc")
        .build()
        .unwrap();

    let mut response = client
        .get("/users/{id}")
        .path_param("id", "42")
        .query("format", "json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"ok");

    let seen = requests.lock().await;
    assert!(
        seen[0].starts_with("GET /users/42?format=json&token=abc HTTP/1.1\r\n"),
        "unexpected request line in {:?}",
        seen[0]
    );
    assert!(seen[0].contains("Host: 127.0.0.1"));
}

#[tokio::test]
async fn post_form_merges_common_fields() {
    let script = Script::bind().await;
    let url = script.url("/submit");
    let requests = script.serve(1, vec![ok_response("")]);

    let client = Client::builder()
        .with_form_field("k1", "v1")
        .build()
        .unwrap();

    let response = client
        .post(url)
        .form([("k2", "v2")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let seen = requests.lock().await;
    assert!(seen[0].contains("Content-Type: application/x-www-form-urlencoded\r\n"));
    assert!(seen[0].contains("Content-Length: 11\r\n"));
    assert!(seen[0].ends_with("\r\n\r\nk1=v1&k2=v2"));
}

#[tokio::test]
async fn retry_on_connection_error_with_fixed_interval() {
    let script = Script::bind().await;
    let url = script.url("/flaky");
    script.serve(1, vec![ok_response("ok")]);

    let attempts = Arc::new(AtomicUsize::new(0));
    let dial_attempts = attempts.clone();

    let client = Client::builder()
        .with_retry(RetryPolicy::fixed(2, Duration::from_millis(10)))
        .with_dial(move |host, port| {
            let attempt = dial_attempts.fetch_add(1, Ordering::SeqCst);
            let target = format!("{host}:{port}");
            async move {
                if attempt < 2 {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::ConnectionRefused,
                        "connection refused",
                    ));
                }
                let stream = TcpStream::connect(target).await?;
                Ok(Box::new(stream) as fletch::Io)
            }
        })
        .build()
        .unwrap();

    let started = Instant::now();
    let mut response = client.get(url).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"ok");
    assert_eq!(attempts.load(Ordering::SeqCst), 3, "exactly three attempts");
    assert!(started.elapsed() >= Duration::from_millis(20));
}

#[tokio::test]
async fn see_other_redirect_drops_body_and_switches_to_get() {
    let script = Script::bind().await;
    let url = script.url("/a");
    let redirect = b"HTTP/1.1 303 See Other\r\nLocation: /b\r\nContent-Length: 0\r\n\r\n".to_vec();
    let requests = script.serve(1, vec![redirect, ok_response("done")]);

    let client = Client::new();
    let mut response = client.post(url).body("x=1").send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"done");

    let seen = requests.lock().await;
    assert!(seen[0].starts_with("POST /a HTTP/1.1\r\n"));
    assert!(seen[1].starts_with("GET /b HTTP/1.1\r\n"));
    assert!(!seen[1].to_lowercase().contains("content-length"));
    assert!(seen[1].ends_with("\r\n\r\n"), "no body on the GET hop");
}

#[tokio::test]
async fn temporary_redirect_preserves_method_and_body() {
    let script = Script::bind().await;
    let url = script.url("/a");
    let redirect =
        b"HTTP/1.1 307 Temporary Redirect\r\nLocation: /b\r\nContent-Length: 0\r\n\r\n".to_vec();
    let requests = script.serve(1, vec![redirect, ok_response("done")]);

    let client = Client::new();
    let response = client.post(url).body("x=1").send().await.unwrap();
    assert_eq!(response.status(), 200);

    let seen = requests.lock().await;
    assert!(seen[1].starts_with("POST /b HTTP/1.1\r\n"));
    assert!(seen[1].ends_with("\r\n\r\nx=1"), "body replayed on 307");
}

#[tokio::test]
async fn redirect_loop_exhausts_hop_budget() {
    let script = Script::bind().await;
    let url = script.url("/loop");
    let redirect =
        b"HTTP/1.1 302 Found\r\nLocation: /loop\r\nContent-Length: 0\r\n\r\n".to_vec();
    script.serve(1, vec![redirect; 32]);

    let client = Client::new();
    let err = client.get(url).send().await.unwrap_err();
    assert!(err.is_redirect());
}

#[tokio::test]
async fn keep_alive_connection_is_reused() {
    let script = Script::bind().await;
    let first = script.url("/1");
    let second = script.url("/2");
    let requests = script.serve(1, vec![ok_response("a"), ok_response("b")]);

    let client = Client::builder().enable_trace().build().unwrap();

    let mut r1 = client.get(first).send().await.unwrap();
    assert_eq!(r1.bytes().await.unwrap().as_ref(), b"a");
    let trace1 = r1.trace_info().unwrap();
    assert!(!trace1.is_conn_reused);

    let mut r2 = client.get(second).send().await.unwrap();
    assert_eq!(r2.bytes().await.unwrap().as_ref(), b"b");
    let trace2 = r2.trace_info().unwrap();
    assert!(trace2.is_conn_reused, "second request rides the idle conn");
    assert!(trace2.is_conn_was_idle);

    assert_eq!(requests.lock().await.len(), 2);
}

#[tokio::test]
async fn zero_length_post_sends_content_length_without_chunked() {
    let script = Script::bind().await;
    let url = script.url("/empty");
    let requests = script.serve(1, vec![ok_response("")]);

    let client = Client::new();
    let response = client.post(url).send().await.unwrap();
    assert_eq!(response.status(), 200);

    let seen = requests.lock().await;
    assert!(seen[0].contains("Content-Length: 0\r\n"));
    assert!(!seen[0].to_lowercase().contains("chunked"));
}

#[tokio::test]
async fn gzip_is_transparently_decoded_and_headers_stripped() {
    let script = Script::bind().await;
    let url = script.url("/gz");

    let mut encoder =
        flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(b"the original payload").unwrap();
    let gz = encoder.finish().unwrap();

    let mut response_bytes = format!(
        "HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\n\r\n",
        gz.len()
    )
    .into_bytes();
    response_bytes.extend_from_slice(&gz);
    let requests = script.serve(1, vec![response_bytes]);

    let client = Client::new();
    let mut response = client.get(url).send().await.unwrap();
    assert_eq!(
        response.bytes().await.unwrap().as_ref(),
        b"the original payload"
    );
    assert!(response.headers().get("content-encoding").is_none());
    assert!(response.headers().get("content-length").is_none());

    let seen = requests.lock().await;
    assert!(seen[0].contains("Accept-Encoding: gzip\r\n"));
}

#[tokio::test]
async fn explicit_accept_encoding_disables_transparent_decode() {
    let script = Script::bind().await;
    let url = script.url("/gz");

    let body = b"raw gzip stays raw";
    let mut response_bytes = format!(
        "HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\n\r\n",
        body.len()
    )
    .into_bytes();
    response_bytes.extend_from_slice(body);
    script.serve(1, vec![response_bytes]);

    let client = Client::new();
    let mut response = client
        .get(url)
        .header_set(http::header::ACCEPT_ENCODING, "gzip")
        .send()
        .await
        .unwrap();
    // caller opted in themselves: bytes come through untouched
    assert_eq!(response.bytes().await.unwrap().as_ref(), body);
    assert_eq!(response.headers()["content-encoding"], "gzip");
}

#[tokio::test]
async fn response_head_cap_is_exact() {
    let head = "HTTP/1.1 200 OK\r\nContent-Length: 0\r\nX-Pad: abcdef\r\n\r\n";

    // exactly at the cap: accepted
    let script = Script::bind().await;
    let url = script.url("/at");
    script.serve(1, vec![head.as_bytes().to_vec()]);
    let client = Client::builder()
        .with_max_response_head_size(head.len())
        .build()
        .unwrap();
    assert_eq!(client.get(url).send().await.unwrap().status(), 200);

    // one byte smaller cap: rejected
    let script = Script::bind().await;
    let url = script.url("/over");
    script.serve(1, vec![head.as_bytes().to_vec()]);
    let client = Client::builder()
        .with_max_response_head_size(head.len() - 1)
        .build()
        .unwrap();
    let err = client.get(url).send().await.unwrap_err();
    assert!(err.is_parse_too_large());
}

#[tokio::test]
async fn charset_auto_decode_follows_the_toggle() {
    let gbk_body: &[u8] = &[0xc4, 0xe3, 0xba, 0xc3]; // "你好"
    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=gbk\r\nContent-Length: {}\r\n\r\n",
        gbk_body.len()
    );
    let mut scripted = head.clone().into_bytes();
    scripted.extend_from_slice(gbk_body);

    let script = Script::bind().await;
    let url = script.url("/cn");
    script.serve(1, vec![scripted.clone()]);
    let client = Client::new();
    let mut response = client.get(url).send().await.unwrap();
    assert_eq!(response.text().await.unwrap(), "你好");

    let script = Script::bind().await;
    let url = script.url("/cn");
    script.serve(1, vec![scripted]);
    let client = Client::builder().disable_auto_decode().build().unwrap();
    let mut response = client.get(url).send().await.unwrap();
    assert_eq!(response.bytes().await.unwrap().as_ref(), gbk_body);
}

#[tokio::test]
async fn dump_buffer_contains_only_the_last_attempt() {
    let script = Script::bind().await;
    let url = script.url("/dumped");
    let flaky = b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 4\r\n\r\nboom".to_vec();
    script.serve(1, vec![flaky, ok_response("fine")]);

    let client = Client::builder()
        .with_dump(DumpOptions::default())
        .with_retry(
            RetryPolicy::fixed(2, Duration::from_millis(1))
                .with_condition(|ctx| ctx.status == Some(http::StatusCode::INTERNAL_SERVER_ERROR)),
        )
        .build()
        .unwrap();

    let response = client.get(url).send().await.unwrap();
    assert_eq!(response.status(), 200);

    // the first attempt's bytes were discarded with the buffer reset
    let dump = response.dump();
    assert_eq!(dump.matches("GET /dumped HTTP/1.1").count(), 1);
    assert!(dump.contains("HTTP/1.1 200 OK"));
    assert!(dump.contains("fine"));
    assert!(!dump.contains("500"));
    assert!(!dump.contains("boom"));
}

#[tokio::test]
async fn per_host_cap_queues_checkouts_fifo() {
    let script = Script::bind().await;
    let url_a = script.url("/slow-a");
    let url_b = script.url("/slow-b");
    let requests = script.serve(1, vec![ok_response("one"), ok_response("two")]);

    let client = Client::builder()
        .with_max_conns_per_host(1)
        .build()
        .unwrap();

    let (a, b) = tokio::join!(
        client.get(url_a).send(),
        client.get(url_b).send()
    );
    let mut a = a.unwrap();
    let mut b = b.unwrap();
    let mut bodies = vec![
        String::from_utf8_lossy(&a.bytes().await.unwrap()).into_owned(),
        String::from_utf8_lossy(&b.bytes().await.unwrap()).into_owned(),
    ];
    bodies.sort();
    assert_eq!(bodies, vec!["one".to_owned(), "two".to_owned()]);

    // both requests, one connection
    assert_eq!(requests.lock().await.len(), 2);
}

#[tokio::test]
async fn total_timeout_names_the_phase() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/never", listener.local_addr().unwrap());
    tokio::spawn(async move {
        // accept and go silent
        let (_socket, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let client = Client::builder()
        .with_timeout(Duration::from_millis(80))
        .build()
        .unwrap();
    let err = client.get(url).send().await.unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(err.timeout_phase(), Some(fletch::TimeoutPhase::ReadHead));
}

#[tokio::test]
async fn cancel_token_aborts_in_flight_request() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/hang", listener.local_addr().unwrap());
    tokio::spawn(async move {
        let (_socket, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let client = Client::new();
    let token = fletch::CancelToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
    });

    let err = client
        .get(url)
        .cancel_token(token)
        .send()
        .await
        .unwrap_err();
    assert!(err.is_canceled());
}

#[tokio::test]
async fn chunked_response_with_unknown_length_body() {
    let script = Script::bind().await;
    let url = script.url("/chunked");
    let response =
        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n7\r\nchunked\r\n6\r\n body!\r\n0\r\n\r\n"
            .to_vec();
    script.serve(1, vec![response]);

    let client = Client::new();
    let mut got = client.get(url).send().await.unwrap();
    assert_eq!(got.bytes().await.unwrap().as_ref(), b"chunked body!");
}

#[tokio::test]
async fn streaming_body_uses_chunked_encoding() {
    let script = Script::bind().await;
    let url = script.url("/upload");
    let requests = script.serve(1, vec![ok_response("")]);

    let client = Client::new();
    let response = client
        .post(url)
        .body_reader(std::io::Cursor::new(b"streamed payload".to_vec()), None)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let seen = requests.lock().await;
    assert!(seen[0].contains("Transfer-Encoding: chunked\r\n"));
}

#[tokio::test]
async fn force_http1_over_tls_free_origin() {
    // Auto on a cleartext origin is H1 already; force flag must not
    // break anything.
    let script = Script::bind().await;
    let url = script.url("/");
    script.serve(1, vec![ok_response("h1")]);

    let client = Client::builder()
        .with_force_http_version(HttpVersion::Http1)
        .build()
        .unwrap();
    let mut response = client.get(url).send().await.unwrap();
    assert_eq!(response.version(), http::Version::HTTP_11);
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"h1");
}
