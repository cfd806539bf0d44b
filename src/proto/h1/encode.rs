//! HTTP/1.1 request head serialization.

use crate::body::Payload;
use crate::headers::{self, OrderedHeaders};
use crate::proto::WireRequest;

/// How the body will be framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyFraming {
    /// No body bytes and no framing header.
    None,
    /// `Content-Length: n`.
    Length(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked,
}

pub(crate) fn framing_for(method: &http::Method, payload: &Payload) -> BodyFraming {
    match payload.len() {
        Some(0) => {
            // A bodyless POST/PUT/PATCH still advertises a zero length;
            // GET and friends stay silent.
            if matches!(
                *method,
                http::Method::POST | http::Method::PUT | http::Method::PATCH
            ) {
                BodyFraming::Length(0)
            } else {
                BodyFraming::None
            }
        }
        Some(len) => BodyFraming::Length(len),
        None => BodyFraming::Chunked,
    }
}

/// Serializes the request line and headers, CRLF-terminated.
///
/// Hop-by-hop headers from the user map are skipped; `Host`,
/// `Content-Length` / `Transfer-Encoding` are synthesized. Names in the
/// request's explicit order list go first, the rest follow in insertion
/// order, all title-cased (H1 peers expect canonical casing).
pub(crate) fn request_head(wire: &WireRequest, framing: BodyFraming) -> Vec<u8> {
    let mut dst = Vec::with_capacity(256);

    dst.extend_from_slice(wire.method.as_str().as_bytes());
    dst.push(b' ');
    if wire.absolute_form {
        dst.extend_from_slice(wire.scheme.as_bytes());
        dst.extend_from_slice(b"://");
        dst.extend_from_slice(wire.authority.as_bytes());
    }
    dst.extend_from_slice(wire.path_and_query.as_bytes());
    dst.extend_from_slice(b" HTTP/1.1\r\n");

    if !wire.headers.contains(&http::header::HOST) {
        dst.extend_from_slice(b"Host: ");
        dst.extend_from_slice(wire.authority.as_bytes());
        dst.extend_from_slice(b"\r\n");
    }

    write_headers(&mut dst, &wire.headers, wire.header_order.as_ref());

    match framing {
        BodyFraming::None => {}
        BodyFraming::Length(len) => {
            dst.extend_from_slice(b"Content-Length: ");
            let mut buf = itoa::Buffer::new();
            dst.extend_from_slice(buf.format(len).as_bytes());
            dst.extend_from_slice(b"\r\n");
        }
        BodyFraming::Chunked => {
            dst.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
        }
    }

    dst.extend_from_slice(b"\r\n");
    dst
}

fn write_headers(
    dst: &mut Vec<u8>,
    headers: &OrderedHeaders,
    order: Option<&crate::headers::HeaderOrder>,
) {
    for (name, value) in headers.iter_with_order(order) {
        if headers::is_hop_by_hop(name) {
            continue;
        }
        headers::write_title_case(dst, name);
        dst.extend_from_slice(b": ");
        dst.extend_from_slice(value.as_bytes());
        dst.extend_from_slice(b"\r\n");
    }
}

/// One chunk of a chunked-encoded body: size line, payload, CRLF.
pub(crate) fn chunk(data: &[u8], dst: &mut Vec<u8>) {
    dst.clear();
    dst.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
    dst.extend_from_slice(data);
    dst.extend_from_slice(b"\r\n");
}

/// The terminating zero chunk.
pub(crate) const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::HeaderOrder;
    use http::header::{HeaderName, HeaderValue};

    fn wire(method: http::Method, headers: OrderedHeaders) -> WireRequest {
        WireRequest {
            method,
            scheme: "http",
            authority: "example.com".to_owned(),
            path_and_query: "/users/42?format=json".to_owned(),
            headers,
            header_order: None,
            payload: Payload::Empty,
            absolute_form: false,
        }
    }

    #[test]
    fn request_line_and_host_are_synthesized() {
        let head = request_head(&wire(http::Method::GET, OrderedHeaders::new()), BodyFraming::None);
        let text = String::from_utf8(head).unwrap();
        assert!(text.starts_with("GET /users/42?format=json HTTP/1.1\r\n"));
        assert!(text.contains("Host: example.com\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn absolute_form_for_cleartext_proxy() {
        let mut req = wire(http::Method::GET, OrderedHeaders::new());
        req.absolute_form = true;
        let head = request_head(&req, BodyFraming::None);
        let text = String::from_utf8(head).unwrap();
        assert!(text.starts_with("GET http://example.com/users/42?format=json HTTP/1.1\r\n"));
    }

    #[test]
    fn hop_by_hop_headers_are_never_emitted() {
        let mut headers = OrderedHeaders::new();
        headers.insert(
            HeaderName::from_static("connection"),
            HeaderValue::from_static("upgrade"),
        );
        headers.insert(
            HeaderName::from_static("transfer-encoding"),
            HeaderValue::from_static("gzip"),
        );
        headers.insert(
            HeaderName::from_static("x-ok"),
            HeaderValue::from_static("1"),
        );

        let head = request_head(&wire(http::Method::GET, headers), BodyFraming::None);
        let text = String::from_utf8(head).unwrap();
        assert!(!text.contains("Connection"));
        assert!(!text.contains("Transfer-Encoding"));
        assert!(text.contains("X-Ok: 1\r\n"));
    }

    #[test]
    fn explicit_order_then_insertion_order() {
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
            HeaderName::from_static("x-last"),
            HeaderValue::from_static("z"),
        );
        let mut req = wire(http::Method::GET, headers);
        req.header_order = Some(
            [
                HeaderName::from_static("user-agent"),
                HeaderName::from_static("accept"),
            ]
            .into_iter()
            .collect::<HeaderOrder>(),
        );

        let head = request_head(&req, BodyFraming::None);
        let text = String::from_utf8(head).unwrap();
        let ua = text.find("User-Agent").unwrap();
        let accept = text.find("Accept").unwrap();
        let last = text.find("X-Last").unwrap();
        assert!(ua < accept && accept < last);
    }

    #[test]
    fn zero_length_post_gets_content_length_without_chunked() {
        let framing = framing_for(&http::Method::POST, &Payload::Empty);
        assert_eq!(framing, BodyFraming::Length(0));

        let head = request_head(&wire(http::Method::POST, OrderedHeaders::new()), framing);
        let text = String::from_utf8(head).unwrap();
        assert!(text.contains("Content-Length: 0\r\n"));
        assert!(!text.contains("chunked"));
    }

    #[test]
    fn unknown_length_body_is_chunked() {
        let framing = framing_for(
            &http::Method::POST,
            &Payload::Stream {
                reader: Box::new(std::io::Cursor::new(Vec::new())),
                len: None,
            },
        );
        assert_eq!(framing, BodyFraming::Chunked);
    }

    #[test]
    fn chunk_encoding_shape() {
        let mut buf = Vec::new();
        chunk(b"hello", &mut buf);
        assert_eq!(buf, b"5\r\nhello\r\n");
        assert_eq!(LAST_CHUNK, b"0\r\n\r\n");
    }
}
