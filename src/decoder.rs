//! Transparent response decoding: gzip, and charset transcoding to
//! UTF-8 for textual payloads.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use encoding_rs::{Decoder as CharsetDecoder, Encoding, UTF_8};
use http::header::HeaderMap;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader, ReadBuf};

use crate::body::BodyReader;

/// True when the transport added `Accept-Encoding: gzip` itself and the
/// response came back gzip-coded, i.e. decoding is ours to do.
pub(crate) fn is_gzip(headers: &HeaderMap) -> bool {
    headers
        .get(http::header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("gzip"))
}

/// Strips the metadata that no longer describes the decoded bytes.
pub(crate) fn strip_coding_headers(headers: &mut HeaderMap) {
    headers.remove(http::header::CONTENT_ENCODING);
    headers.remove(http::header::CONTENT_LENGTH);
}

/// Wraps the raw body in a streaming gzip decoder.
pub(crate) fn gzip_reader(body: BodyReader) -> BodyReader {
    let decoder = async_compression::tokio::bufread::GzipDecoder::new(BufReader::new(body));
    Box::new(decoder)
}

/// Content types eligible for charset auto-decode: the JSON, XML, HTML,
/// plain-text and script families.
pub(crate) fn is_textual(content_type: Option<&str>) -> bool {
    let Some(mime) = content_type.and_then(|ct| ct.parse::<mime::Mime>().ok()) else {
        return false;
    };
    mime.type_() == mime::TEXT
        || mime.suffix().is_some_and(|s| s == mime::JSON || s == mime::XML)
        || (mime.type_() == mime::APPLICATION
            && matches!(
                mime.subtype().as_str(),
                "json" | "xml" | "xhtml" | "javascript" | "ecmascript"
            ))
}

/// The charset declared in the content type, when it names a real
/// encoding.
pub(crate) fn declared_encoding(content_type: Option<&str>) -> Option<&'static Encoding> {
    let mime = content_type?.parse::<mime::Mime>().ok()?;
    let charset = mime.get_param(mime::CHARSET)?;
    Encoding::for_label(charset.as_str().as_bytes())
}

/// Decodes a fully buffered body: BOM wins (and is stripped), then the
/// declared charset, defaulting to UTF-8. The error case keeps the raw
/// bytes readable.
pub(crate) fn decode_buffer(
    bytes: &Bytes,
    content_type: Option<&str>,
) -> Result<String, &'static str> {
    let encoding = Encoding::for_bom(bytes)
        .map(|(encoding, _)| encoding)
        .or_else(|| declared_encoding(content_type))
        .unwrap_or(UTF_8);

    let (text, _, had_errors) = encoding.decode(bytes);
    if had_errors {
        return Err("body contains bytes invalid for its charset");
    }
    Ok(text.into_owned())
}

const PEEK_LEN: usize = 512;

/// Streaming auto-decode: peeks up to 512 bytes, sniffs BOM or uses the
/// declared charset, and splices a transcoding reader over peeked plus
/// remaining bytes. A BOM is consumed, never surfaced, matching the
/// buffered path; UTF-8 (or unknown) charsets pass through untouched.
pub(crate) async fn auto_decode_reader(
    mut body: BodyReader,
    content_type: Option<&str>,
) -> std::io::Result<BodyReader> {
    let mut peeked = BytesMut::with_capacity(PEEK_LEN);
    while peeked.len() < PEEK_LEN {
        let n = body.read_buf(&mut peeked).await?;
        if n == 0 {
            break;
        }
    }
    let mut peeked = peeked.freeze();

    let (encoding, bom_len) = match Encoding::for_bom(&peeked) {
        Some((encoding, bom_len)) => (Some(encoding), bom_len),
        None => (None, 0),
    };
    let encoding = encoding
        .or_else(|| declared_encoding(content_type))
        .unwrap_or(UTF_8);
    peeked.advance(bom_len);

    let spliced = PeekedReader {
        peeked,
        inner: body,
    };
    if encoding == UTF_8 {
        return Ok(Box::new(spliced));
    }

    tracing::debug!("transcoding response body from {}", encoding.name());
    Ok(Box::new(TranscodeReader {
        inner: spliced,
        decoder: encoding.new_decoder_without_bom_handling(),
        src: BytesMut::with_capacity(8 * 1024),
        carry: Bytes::new(),
        src_eof: false,
        done: false,
    }))
}

/// Serves the peeked prefix, then the remaining stream; the caller
/// sees one seamless body.
struct PeekedReader {
    peeked: Bytes,
    inner: BodyReader,
}

impl AsyncRead for PeekedReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if !self.peeked.is_empty() {
            let n = self.peeked.len().min(buf.remaining());
            buf.put_slice(&self.peeked[..n]);
            self.peeked.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

/// Incremental charset-to-UTF-8 transcoder.
struct TranscodeReader {
    inner: PeekedReader,
    decoder: CharsetDecoder,
    src: BytesMut,
    carry: Bytes,
    src_eof: bool,
    done: bool,
}

impl AsyncRead for TranscodeReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = &mut *self;
        loop {
            if !this.carry.is_empty() {
                let n = this.carry.len().min(buf.remaining());
                buf.put_slice(&this.carry[..n]);
                this.carry.advance(n);
                return Poll::Ready(Ok(()));
            }
            if this.done {
                return Poll::Ready(Ok(()));
            }

            if this.src.is_empty() && !this.src_eof {
                this.src.reserve(8 * 1024);
                match std::task::ready!(tokio_util::io::poll_read_buf(
                    Pin::new(&mut this.inner),
                    cx,
                    &mut this.src
                )) {
                    Ok(0) => this.src_eof = true,
                    Ok(_) => {}
                    Err(err) => return Poll::Ready(Err(err)),
                }
            }

            let mut out = vec![0u8; (this.src.len() * 2).max(64)];
            let last = this.src_eof;
            let (_result, read, written, had_errors) =
                this.decoder.decode_to_utf8(&this.src, &mut out, last);
            if had_errors {
                return Poll::Ready(Err(std::io::Error::other(
                    crate::Error::new_decode("invalid bytes for declared charset"),
                )));
            }
            this.src.advance(read);
            out.truncate(written);
            this.carry = Bytes::from(out);

            if last && this.src.is_empty() && this.carry.is_empty() {
                this.done = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn textual_families() {
        assert!(is_textual(Some("text/html; charset=gbk")));
        assert!(is_textual(Some("application/json")));
        assert!(is_textual(Some("application/xhtml+xml")));
        assert!(is_textual(Some("image/svg+xml")));
        assert!(!is_textual(Some("application/octet-stream")));
        assert!(!is_textual(None));
    }

    #[test]
    fn buffered_gbk_decodes_to_utf8() {
        // "你好" in GBK
        let gbk = Bytes::from_static(&[0xc4, 0xe3, 0xba, 0xc3]);
        let text = decode_buffer(&gbk, Some("text/html; charset=gbk")).unwrap();
        assert_eq!(text, "你好");
    }

    #[test]
    fn bom_beats_declared_charset_and_is_stripped() {
        let mut bytes = vec![0xef, 0xbb, 0xbf];
        bytes.extend_from_slice("plain utf-8".as_bytes());
        let text = decode_buffer(&Bytes::from(bytes), Some("text/plain; charset=gbk")).unwrap();
        assert_eq!(text, "plain utf-8");
    }

    #[tokio::test]
    async fn streaming_transcode_splices_peek_and_tail() {
        // "你好你好…" repeated so the body extends past the peek window
        let mut gbk = Vec::new();
        for _ in 0..400 {
            gbk.extend_from_slice(&[0xc4, 0xe3, 0xba, 0xc3]);
        }
        let reader: BodyReader = Box::new(std::io::Cursor::new(gbk));
        let mut decoded = auto_decode_reader(reader, Some("text/plain; charset=gbk"))
            .await
            .unwrap();

        let mut out = String::new();
        decoded.read_to_string(&mut out).await.unwrap();
        assert_eq!(out.chars().count(), 800);
        assert!(out.starts_with("你好你好"));
    }

    #[tokio::test]
    async fn utf8_stream_passes_through() {
        let reader: BodyReader = Box::new(std::io::Cursor::new(b"plain".to_vec()));
        let mut decoded = auto_decode_reader(reader, Some("text/plain"))
            .await
            .unwrap();
        let mut out = String::new();
        decoded.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "plain");
    }

    #[tokio::test]
    async fn streaming_bom_is_stripped_like_the_buffered_path() {
        let mut bytes = vec![0xef, 0xbb, 0xbf];
        bytes.extend_from_slice("plain utf-8".as_bytes());

        let reader: BodyReader = Box::new(std::io::Cursor::new(bytes));
        let mut decoded = auto_decode_reader(reader, Some("text/plain; charset=gbk"))
            .await
            .unwrap();
        let mut out = String::new();
        decoded.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "plain utf-8");
    }
}
