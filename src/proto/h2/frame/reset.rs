use bytes::BufMut;

use super::{Error, Head, Kind, Reason, StreamId};

/// A RST_STREAM frame: immediate termination of one stream.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Reset {
    stream_id: StreamId,
    reason: Reason,
}

impl Reset {
    pub(crate) fn new(stream_id: StreamId, reason: Reason) -> Self {
        Self { stream_id, reason }
    }

    pub(crate) fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub(crate) fn reason(&self) -> Reason {
        self.reason
    }

    pub(crate) fn load(head: Head, payload: &[u8]) -> Result<Self, Error> {
        debug_assert_eq!(head.kind(), Kind::Reset);

        if head.stream_id().is_zero() {
            return Err(Error::InvalidStreamId);
        }
        if payload.len() != 4 {
            return Err(Error::BadFrameSize);
        }

        let reason = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        Ok(Self {
            stream_id: head.stream_id(),
            reason: reason.into(),
        })
    }

    pub(crate) fn encode<B: BufMut>(&self, dst: &mut B) {
        tracing::trace!(
            "encoding RST_STREAM; id={:?} code={:?}",
            self.stream_id,
            self.reason
        );
        let head = Head::new(Kind::Reset, 0, self.stream_id);
        head.encode(4, dst);
        dst.put_u32(self.reason.into());
    }
}
