use bytes::BufMut;

use super::{Error, Head, Kind, StreamId};

const ACK: u8 = 0x1;

/// A PING frame: 8 opaque bytes, echoed back with the ACK flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Ping {
    ack: bool,
    payload: [u8; 8],
}

impl Ping {
    pub(crate) fn new(payload: [u8; 8]) -> Self {
        Self {
            ack: false,
            payload,
        }
    }

    pub(crate) fn pong(payload: [u8; 8]) -> Self {
        Self { ack: true, payload }
    }

    pub(crate) fn is_ack(&self) -> bool {
        self.ack
    }

    pub(crate) fn payload(&self) -> [u8; 8] {
        self.payload
    }

    pub(crate) fn load(head: Head, payload: &[u8]) -> Result<Self, Error> {
        debug_assert_eq!(head.kind(), Kind::Ping);

        if !head.stream_id().is_zero() {
            return Err(Error::InvalidStreamId);
        }
        if payload.len() != 8 {
            return Err(Error::BadFrameSize);
        }

        let mut bytes = [0; 8];
        bytes.copy_from_slice(payload);
        Ok(Self {
            ack: head.flag() & ACK == ACK,
            payload: bytes,
        })
    }

    pub(crate) fn encode<B: BufMut>(&self, dst: &mut B) {
        let head = Head::new(Kind::Ping, if self.ack { ACK } else { 0 }, StreamId::ZERO);
        tracing::trace!("encoding PING; ack={}", self.ack);
        head.encode(8, dst);
        dst.put_slice(&self.payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::h2::frame::HEADER_LEN;

    #[test]
    fn round_trip() {
        let ping = Ping::new([1, 2, 3, 4, 5, 6, 7, 8]);
        let mut buf = Vec::new();
        ping.encode(&mut buf);

        let (_, head) = Head::parse(&buf);
        let parsed = Ping::load(head, &buf[HEADER_LEN..]).unwrap();
        assert_eq!(parsed, ping);
        assert!(!parsed.is_ack());
    }

    #[test]
    fn bad_length_is_rejected() {
        let head = Head::new(Kind::Ping, 0, StreamId::ZERO);
        assert_eq!(Ping::load(head, &[0; 7]).unwrap_err(), Error::BadFrameSize);
    }
}
