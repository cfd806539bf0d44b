use bytes::{BufMut, Bytes};

use super::{Error, Head, Kind, Reason, StreamId};

/// A GOAWAY frame: the peer is shutting the connection down and promises
/// to process streams up to `last_stream_id`.
#[derive(Debug, Clone)]
pub(crate) struct GoAway {
    last_stream_id: StreamId,
    reason: Reason,
    debug_data: Bytes,
}

impl GoAway {
    pub(crate) fn new(last_stream_id: StreamId, reason: Reason) -> Self {
        Self {
            last_stream_id,
            reason,
            debug_data: Bytes::new(),
        }
    }

    pub(crate) fn last_stream_id(&self) -> StreamId {
        self.last_stream_id
    }

    pub(crate) fn reason(&self) -> Reason {
        self.reason
    }

    pub(crate) fn load(head: Head, payload: &[u8]) -> Result<Self, Error> {
        debug_assert_eq!(head.kind(), Kind::GoAway);

        if !head.stream_id().is_zero() {
            return Err(Error::InvalidStreamId);
        }
        if payload.len() < 8 {
            return Err(Error::BadFrameSize);
        }

        let (last_stream_id, _) = StreamId::parse(&payload[..4]);
        let reason = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);

        Ok(Self {
            last_stream_id,
            reason: reason.into(),
            debug_data: Bytes::copy_from_slice(&payload[8..]),
        })
    }

    pub(crate) fn encode<B: BufMut>(&self, dst: &mut B) {
        tracing::trace!("encoding GO_AWAY; code={:?}", self.reason);
        let head = Head::new(Kind::GoAway, 0, StreamId::ZERO);
        head.encode(8 + self.debug_data.len(), dst);
        dst.put_u32(self.last_stream_id.into());
        dst.put_u32(self.reason.into());
        dst.put_slice(&self.debug_data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::h2::frame::HEADER_LEN;

    #[test]
    fn round_trip() {
        let frame = GoAway::new(StreamId::from(9), Reason::ENHANCE_YOUR_CALM);
        let mut buf = Vec::new();
        frame.encode(&mut buf);

        let (len, head) = Head::parse(&buf);
        let parsed = GoAway::load(head, &buf[HEADER_LEN..][..len]).unwrap();
        assert_eq!(parsed.last_stream_id(), StreamId::from(9));
        assert_eq!(parsed.reason(), Reason::ENHANCE_YOUR_CALM);
    }
}
