//! HTTP/1.1 response head parsing and body framing.

use bytes::BytesMut;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{StatusCode, Version};

use crate::error::{Error, Parse};

const MAX_HEADERS: usize = 128;

/// A parsed response head plus how many buffer bytes it consumed.
pub(crate) struct ResponseHead {
    pub(crate) version: Version,
    pub(crate) status: StatusCode,
    pub(crate) headers: HeaderMap,
    pub(crate) head_len: usize,
}

/// Attempts to parse a response head out of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed. The head size cap is
/// inclusive: a head of exactly `cap` bytes parses, one byte more is
/// rejected.
pub(crate) fn parse_head(buf: &BytesMut, cap: usize) -> crate::Result<Option<ResponseHead>> {
    let head_len = match find_head_end(buf) {
        Some(len) => len,
        None => {
            if buf.len() >= cap {
                return Err(Error::new_too_large());
            }
            return Ok(None);
        }
    };
    if head_len > cap {
        return Err(Error::new_too_large());
    }

    let mut header_buf = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut header_buf);
    match parsed.parse(&buf[..head_len]) {
        Ok(httparse::Status::Complete(len)) => {
            debug_assert_eq!(len, head_len);
            let version = match parsed.version {
                Some(0) => Version::HTTP_10,
                Some(1) => Version::HTTP_11,
                _ => return Err(Error::new_parse(Parse::Version)),
            };
            let status = parsed
                .code
                .ok_or_else(|| Error::new_parse(Parse::Status))
                .and_then(|code| {
                    StatusCode::from_u16(code).map_err(|_| Error::new_parse(Parse::Status))
                })?;

            let mut headers = HeaderMap::with_capacity(parsed.headers.len());
            for header in parsed.headers.iter() {
                let name = HeaderName::from_bytes(header.name.as_bytes())
                    .map_err(|_| Error::new_parse(Parse::Header))?;
                let value = HeaderValue::from_bytes(header.value)
                    .map_err(|_| Error::new_parse(Parse::Header))?;
                headers.append(name, value);
            }

            Ok(Some(ResponseHead {
                version,
                status,
                headers,
                head_len,
            }))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(httparse::Error::TooManyHeaders) => Err(Error::new_too_large()),
        Err(httparse::Error::Status) => Err(Error::new_parse(Parse::Status)),
        Err(httparse::Error::Version) => Err(Error::new_parse(Parse::Version)),
        Err(_) => Err(Error::new_parse(Parse::Header)),
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// How the response body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyKind {
    /// No body bytes follow (HEAD, 1xx/204/304).
    Empty,
    Length(u64),
    Chunked,
    /// Body runs to connection close.
    Eof,
}

/// RFC 7230 section 3.3.3 message body length rules, client side.
pub(crate) fn body_kind(
    method_is_head: bool,
    status: StatusCode,
    headers: &HeaderMap,
) -> crate::Result<BodyKind> {
    if method_is_head
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return Ok(BodyKind::Empty);
    }

    if let Some(te) = headers.get(http::header::TRANSFER_ENCODING) {
        let te = te.to_str().map_err(|_| Error::new_parse(Parse::Header))?;
        if te
            .split(',')
            .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
        {
            return Ok(BodyKind::Chunked);
        }
        // transfer-encoding without a final chunked coding: length is
        // unknowable, read to EOF
        return Ok(BodyKind::Eof);
    }

    let mut lengths = headers.get_all(http::header::CONTENT_LENGTH).iter();
    if let Some(first) = lengths.next() {
        // multiple differing content-lengths are malformed
        for other in lengths {
            if other != first {
                return Err(Error::new_parse(Parse::ContentLength));
            }
        }
        let len: u64 = first
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| Error::new_parse(Parse::ContentLength))?;
        return Ok(BodyKind::Length(len));
    }

    Ok(BodyKind::Eof)
}

/// True when the connection must not be reused after this exchange.
pub(crate) fn connection_close(version: Version, headers: &HeaderMap) -> bool {
    let close_tokens = headers
        .get_all(http::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim);

    for token in close_tokens {
        if token.eq_ignore_ascii_case("close") {
            return true;
        }
        if version == Version::HTTP_10 && token.eq_ignore_ascii_case("keep-alive") {
            return false;
        }
    }
    version == Version::HTTP_10
}

/// Parses a chunk-size line (hex size plus optional extensions).
pub(crate) fn parse_chunk_size(line: &[u8]) -> crate::Result<u64> {
    let size_part = line
        .split(|&b| b == b';')
        .next()
        .unwrap_or_default();
    let text = std::str::from_utf8(size_part)
        .map_err(|_| Error::new_parse(Parse::ChunkCoding))?
        .trim();
    if text.is_empty() {
        return Err(Error::new_parse(Parse::ChunkCoding));
    }
    u64::from_str_radix(text, 16).map_err(|_| Error::new_parse(Parse::ChunkCoding))
}

/// Parses one `name: value` trailer line.
pub(crate) fn parse_trailer_line(line: &[u8]) -> crate::Result<(HeaderName, HeaderValue)> {
    let colon = line
        .iter()
        .position(|&b| b == b':')
        .ok_or_else(|| Error::new_parse(Parse::Header))?;
    let name = HeaderName::from_bytes(&line[..colon])
        .map_err(|_| Error::new_parse(Parse::Header))?;
    let value_raw = line[colon + 1..]
        .iter()
        .copied()
        .skip_while(|&b| b == b' ' || b == b'\t')
        .collect::<Vec<u8>>();
    let value =
        HeaderValue::from_bytes(&value_raw).map_err(|_| Error::new_parse(Parse::Header))?;
    Ok((name, value))
}
