use bytes::{BufMut, Bytes};

use super::{Error, Head, Kind, StreamId};

const END_STREAM: u8 = 0x1;
const PADDED: u8 = 0x8;

/// A DATA frame: a chunk of a request or response body.
#[derive(Clone)]
pub(crate) struct Data {
    stream_id: StreamId,
    data: Bytes,
    end_stream: bool,
    /// Padding to emit, only when explicitly requested.
    pad_len: Option<u8>,
}

impl Data {
    pub(crate) fn new(stream_id: StreamId, data: Bytes, end_stream: bool) -> Self {
        Self {
            stream_id,
            data,
            end_stream,
            pad_len: None,
        }
    }

    pub(crate) fn load(head: Head, mut payload: Bytes) -> Result<Self, Error> {
        debug_assert_eq!(head.kind(), Kind::Data);

        if head.stream_id().is_zero() {
            return Err(Error::InvalidStreamId);
        }

        let pad_len = if head.flag() & PADDED == PADDED {
            Some(super::strip_padding(&mut payload)?)
        } else {
            None
        };

        Ok(Self {
            stream_id: head.stream_id(),
            data: payload,
            end_stream: head.flag() & END_STREAM == END_STREAM,
            pad_len,
        })
    }

    pub(crate) fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub(crate) fn is_end_stream(&self) -> bool {
        self.end_stream
    }

    pub(crate) fn payload(&self) -> &Bytes {
        &self.data
    }

    pub(crate) fn into_payload(self) -> Bytes {
        self.data
    }

    /// The number of flow-controlled bytes this frame occupies on the
    /// wire: payload plus padding plus the pad-length octet.
    pub(crate) fn flow_len(&self) -> u32 {
        let pad = self.pad_len.map(|p| p as usize + 1).unwrap_or(0);
        (self.data.len() + pad) as u32
    }

    pub(crate) fn encode<B: BufMut>(&self, dst: &mut B) {
        let mut flag = 0;
        if self.end_stream {
            flag |= END_STREAM;
        }
        if self.pad_len.is_some() {
            flag |= PADDED;
        }

        let pad_len = self.pad_len.unwrap_or(0) as usize;
        let payload_len = self.data.len() + if self.pad_len.is_some() { pad_len + 1 } else { 0 };

        let head = Head::new(Kind::Data, flag, self.stream_id);
        tracing::trace!(
            "encoding DATA; id={:?} len={} eos={}",
            self.stream_id,
            self.data.len(),
            self.end_stream
        );
        head.encode(payload_len, dst);

        if self.pad_len.is_some() {
            dst.put_u8(pad_len as u8);
        }
        dst.put_slice(&self.data);
        dst.put_bytes(0, pad_len);
    }
}

impl std::fmt::Debug for Data {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Data")
            .field("stream_id", &self.stream_id)
            .field("len", &self.data.len())
            .field("end_stream", &self.end_stream)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let frame = Data::new(StreamId::from(3), Bytes::from_static(b"hello"), true);
        let mut buf = Vec::new();
        frame.encode(&mut buf);

        let (len, head) = Head::parse(&buf);
        assert_eq!(len, 5);
        let parsed = Data::load(head, Bytes::copy_from_slice(&buf[super::super::HEADER_LEN..])).unwrap();
        assert_eq!(parsed.payload().as_ref(), b"hello");
        assert!(parsed.is_end_stream());
    }

    #[test]
    fn padding_is_honored_on_read() {
        // payload "hi" with 3 bytes of padding
        let mut buf = Vec::new();
        Head::new(Kind::Data, PADDED, StreamId::from(1)).encode(6, &mut buf);
        buf.push(3);
        buf.extend_from_slice(b"hi");
        buf.extend_from_slice(&[0, 0, 0]);

        let (len, head) = Head::parse(&buf);
        let parsed = Data::load(head, Bytes::copy_from_slice(&buf[super::super::HEADER_LEN..][..len])).unwrap();
        assert_eq!(parsed.payload().as_ref(), b"hi");
        assert_eq!(parsed.flow_len(), 6);
    }

    #[test]
    fn padding_longer_than_payload_is_rejected() {
        let mut buf = Vec::new();
        Head::new(Kind::Data, PADDED, StreamId::from(1)).encode(2, &mut buf);
        buf.push(5);
        buf.push(b'x');

        let (_, head) = Head::parse(&buf);
        let err = Data::load(head, Bytes::copy_from_slice(&buf[super::super::HEADER_LEN..])).unwrap_err();
        assert_eq!(err, Error::TooMuchPadding);
    }
}
