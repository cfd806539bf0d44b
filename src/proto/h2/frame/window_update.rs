use bytes::BufMut;

use super::{Error, Head, Kind, StreamId};

/// A WINDOW_UPDATE frame: grants `size_increment` flow-control bytes on
/// one stream, or on the connection when the stream id is zero.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WindowUpdate {
    stream_id: StreamId,
    size_increment: u32,
}

impl WindowUpdate {
    pub(crate) fn new(stream_id: StreamId, size_increment: u32) -> Self {
        Self {
            stream_id,
            size_increment,
        }
    }

    pub(crate) fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub(crate) fn size_increment(&self) -> u32 {
        self.size_increment
    }

    pub(crate) fn load(head: Head, payload: &[u8]) -> Result<Self, Error> {
        debug_assert_eq!(head.kind(), Kind::WindowUpdate);

        if payload.len() != 4 {
            return Err(Error::BadFrameSize);
        }

        // Reserved high bit is ignored.
        let size_increment =
            u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & !(1 << 31);
        if size_increment == 0 {
            return Err(Error::InvalidWindowUpdateValue);
        }

        Ok(Self {
            stream_id: head.stream_id(),
            size_increment,
        })
    }

    pub(crate) fn encode<B: BufMut>(&self, dst: &mut B) {
        tracing::trace!(
            "encoding WINDOW_UPDATE; id={:?} incr={}",
            self.stream_id,
            self.size_increment
        );
        let head = Head::new(Kind::WindowUpdate, 0, self.stream_id);
        head.encode(4, dst);
        dst.put_u32(self.size_increment);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::h2::frame::HEADER_LEN;

    #[test]
    fn round_trip() {
        let frame = WindowUpdate::new(StreamId::ZERO, 65_535);
        let mut buf = Vec::new();
        frame.encode(&mut buf);

        let (_, head) = Head::parse(&buf);
        let parsed = WindowUpdate::load(head, &buf[HEADER_LEN..]).unwrap();
        assert_eq!(parsed.size_increment(), 65_535);
        assert!(parsed.stream_id().is_zero());
    }

    #[test]
    fn zero_increment_is_rejected() {
        let head = Head::new(Kind::WindowUpdate, 0, StreamId::from(1));
        assert_eq!(
            WindowUpdate::load(head, &[0; 4]).unwrap_err(),
            Error::InvalidWindowUpdateValue
        );
    }
}
