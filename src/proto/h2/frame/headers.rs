use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::StatusCode;

use super::{Error, Head, StreamDependency, StreamId};

pub(crate) const END_STREAM: u8 = 0x1;
pub(crate) const END_HEADERS: u8 = 0x4;
pub(crate) const PADDED: u8 = 0x8;
pub(crate) const PRIORITY: u8 = 0x20;

/// One header field, pseudo or regular, in wire order.
#[derive(Debug, Clone)]
pub(crate) struct Field {
    pub(crate) name: Bytes,
    pub(crate) value: Bytes,
    /// Encoded as a never-indexed literal when set.
    pub(crate) sensitive: bool,
}

impl Field {
    pub(crate) fn new(name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            sensitive: false,
        }
    }

    pub(crate) fn sensitive(name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            sensitive: true,
        }
    }

    pub(crate) fn is_pseudo(&self) -> bool {
        self.name.first() == Some(&b':')
    }
}

/// A HEADERS frame, after CONTINUATION reassembly and HPACK decoding on
/// the read side, or before HPACK encoding and CONTINUATION splitting on
/// the write side. Field order is wire order in both directions.
#[derive(Debug)]
pub(crate) struct Headers {
    stream_id: StreamId,
    pub(crate) fields: Vec<Field>,
    end_stream: bool,
    /// Advisory priority parameter emitted with the frame, a
    /// fingerprint knob.
    pub(crate) priority: Option<StreamDependency>,
}

impl Headers {
    pub(crate) fn new(stream_id: StreamId, fields: Vec<Field>, end_stream: bool) -> Self {
        Self {
            stream_id,
            fields,
            end_stream,
            priority: None,
        }
    }

    /// Trailers: a header block with END_STREAM and no pseudo fields.
    pub(crate) fn trailers(stream_id: StreamId, trailers: &HeaderMap) -> Self {
        let fields = trailers
            .iter()
            .map(|(name, value)| {
                Field::new(
                    Bytes::copy_from_slice(name.as_str().as_bytes()),
                    Bytes::copy_from_slice(value.as_bytes()),
                )
            })
            .collect();
        Self::new(stream_id, fields, true)
    }

    pub(crate) fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub(crate) fn is_end_stream(&self) -> bool {
        self.end_stream
    }

    /// Strips padding and the optional priority field from a raw HEADERS
    /// payload, leaving only the header block fragment.
    pub(crate) fn strip_payload(
        flag: u8,
        mut payload: Bytes,
    ) -> Result<(Bytes, Option<StreamDependency>), Error> {
        use bytes::Buf;

        if flag & PADDED == PADDED {
            super::strip_padding(&mut payload)?;
        }
        let priority = if flag & PRIORITY == PRIORITY {
            if payload.len() < 5 {
                return Err(Error::InvalidPayloadLength);
            }
            let dependency = StreamDependency::load(&payload[..5])?;
            payload.advance(5);
            Some(dependency)
        } else {
            None
        };
        Ok((payload, priority))
    }

    /// Interprets a decoded response header block: `:status` plus
    /// regular fields. `1xx` heads are informational and skipped by the
    /// caller.
    pub(crate) fn into_response(self) -> Result<(StatusCode, HeaderMap), Error> {
        let mut status = None;
        let mut headers = HeaderMap::with_capacity(self.fields.len());
        let mut seen_regular = false;

        for field in self.fields {
            if field.is_pseudo() {
                // Pseudo fields after a regular field are malformed.
                if seen_regular || field.name.as_ref() != b":status" {
                    return Err(Error::Hpack(
                        crate::proto::h2::hpack::DecoderError::InvalidPseudoheader,
                    ));
                }
                status = Some(
                    StatusCode::from_bytes(&field.value)
                        .map_err(|_| Error::Hpack(
                            crate::proto::h2::hpack::DecoderError::InvalidPseudoheader,
                        ))?,
                );
            } else {
                seen_regular = true;
                let name = HeaderName::from_bytes(&field.name).map_err(|_| {
                    Error::Hpack(crate::proto::h2::hpack::DecoderError::InvalidHeaderField)
                })?;
                let value = HeaderValue::from_bytes(&field.value).map_err(|_| {
                    Error::Hpack(crate::proto::h2::hpack::DecoderError::InvalidHeaderField)
                })?;
                headers.append(name, value);
            }
        }

        let status = status.ok_or(Error::Hpack(
            crate::proto::h2::hpack::DecoderError::InvalidPseudoheader,
        ))?;
        Ok((status, headers))
    }

    /// Interprets a decoded trailer block: regular fields only.
    pub(crate) fn into_trailers(self) -> Result<HeaderMap, Error> {
        let mut trailers = HeaderMap::with_capacity(self.fields.len());
        for field in self.fields {
            if field.is_pseudo() {
                return Err(Error::Hpack(
                    crate::proto::h2::hpack::DecoderError::InvalidPseudoheader,
                ));
            }
            let name = HeaderName::from_bytes(&field.name).map_err(|_| {
                Error::Hpack(crate::proto::h2::hpack::DecoderError::InvalidHeaderField)
            })?;
            let value = HeaderValue::from_bytes(&field.value).map_err(|_| {
                Error::Hpack(crate::proto::h2::hpack::DecoderError::InvalidHeaderField)
            })?;
            trailers.append(name, value);
        }
        Ok(trailers)
    }
}

/// A PUSH_PROMISE frame. The client accepts them on the wire but resets
/// every promised stream; bodies are never surfaced.
#[derive(Debug)]
pub(crate) struct PushPromise {
    stream_id: StreamId,
    promised_id: StreamId,
}

impl PushPromise {
    pub(crate) fn new(stream_id: StreamId, promised_id: StreamId) -> Self {
        Self {
            stream_id,
            promised_id,
        }
    }

    /// Strips padding and extracts the promised stream id; the header
    /// block fragment is returned for hpack-context consistency (it must
    /// be decoded even when discarded).
    pub(crate) fn strip_payload(
        head: &Head,
        mut payload: Bytes,
    ) -> Result<(Self, Bytes), Error> {
        use bytes::Buf;

        if head.flag() & PADDED == PADDED {
            super::strip_padding(&mut payload)?;
        }
        if payload.len() < 4 {
            return Err(Error::InvalidPayloadLength);
        }
        let (promised_id, _) = StreamId::parse(&payload[..4]);
        payload.advance(4);
        if !promised_id.is_client_initiated() && !promised_id.is_zero() {
            // server-initiated ids are even; zero is malformed
            Ok((Self::new(head.stream_id(), promised_id), payload))
        } else {
            Err(Error::InvalidStreamId)
        }
    }

    pub(crate) fn promised_id(&self) -> StreamId {
        self.promised_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_head_parses_status_and_fields() {
        let headers = Headers::new(
            StreamId::from(1),
            vec![
                Field::new(&b":status"[..], &b"200"[..]),
                Field::new(&b"content-type"[..], &b"text/plain"[..]),
            ],
            false,
        );
        let (status, map) = headers.into_response().unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(map["content-type"], "text/plain");
    }

    #[test]
    fn pseudo_after_regular_is_malformed() {
        let headers = Headers::new(
            StreamId::from(1),
            vec![
                Field::new(&b"content-type"[..], &b"text/plain"[..]),
                Field::new(&b":status"[..], &b"200"[..]),
            ],
            false,
        );
        assert!(headers.into_response().is_err());
    }

    #[test]
    fn priority_field_is_stripped() {
        let mut payload = Vec::new();
        StreamDependency::new(StreamId::ZERO, 200, true).encode(&mut payload);
        payload.extend_from_slice(b"block");

        let (fragment, priority) =
            Headers::strip_payload(PRIORITY, Bytes::from(payload)).unwrap();
        assert_eq!(fragment.as_ref(), b"block");
        let dependency = priority.unwrap();
        assert_eq!(dependency.weight(), 200);
        assert!(dependency.is_exclusive());
    }
}
