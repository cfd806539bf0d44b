use bytes::BufMut;

/// The number of bytes in a frame header.
pub(crate) const HEADER_LEN: usize = 9;

/// The fixed 9-byte header every HTTP/2 frame starts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Head {
    kind: Kind,
    flag: u8,
    stream_id: StreamId,
}

/// Registered frame types. Unknown kinds are carried, not rejected;
/// extension frames must be ignored by the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    Data,
    Headers,
    Priority,
    Reset,
    Settings,
    PushPromise,
    Ping,
    GoAway,
    WindowUpdate,
    Continuation,
    Unknown(u8),
}

/// An HTTP/2 stream identifier. Client-initiated streams are odd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StreamId(u32);

// ===== impl Head =====

impl Head {
    pub(crate) fn new(kind: Kind, flag: u8, stream_id: StreamId) -> Self {
        Self {
            kind,
            flag,
            stream_id,
        }
    }

    /// Parse the frame header from the first 9 bytes of `buf`, returning
    /// the payload length alongside.
    pub(crate) fn parse(buf: &[u8]) -> (usize, Self) {
        debug_assert!(buf.len() >= HEADER_LEN);
        let len = ((buf[0] as usize) << 16) | ((buf[1] as usize) << 8) | buf[2] as usize;
        let (stream_id, _) = StreamId::parse(&buf[5..9]);
        (
            len,
            Self {
                kind: Kind::load(buf[3]),
                flag: buf[4],
                stream_id,
            },
        )
    }

    pub(crate) fn kind(&self) -> Kind {
        self.kind
    }

    pub(crate) fn flag(&self) -> u8 {
        self.flag
    }

    pub(crate) fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub(crate) fn encode<B: BufMut>(&self, payload_len: usize, dst: &mut B) {
        debug_assert!(payload_len < 1 << 24);
        dst.put_uint(payload_len as u64, 3);
        dst.put_u8(self.kind.encode());
        dst.put_u8(self.flag);
        dst.put_u32(self.stream_id.0);
    }
}

// ===== impl Kind =====

impl Kind {
    pub(crate) fn load(byte: u8) -> Self {
        match byte {
            0 => Self::Data,
            1 => Self::Headers,
            2 => Self::Priority,
            3 => Self::Reset,
            4 => Self::Settings,
            5 => Self::PushPromise,
            6 => Self::Ping,
            7 => Self::GoAway,
            8 => Self::WindowUpdate,
            9 => Self::Continuation,
            other => Self::Unknown(other),
        }
    }

    fn encode(self) -> u8 {
        match self {
            Self::Data => 0,
            Self::Headers => 1,
            Self::Priority => 2,
            Self::Reset => 3,
            Self::Settings => 4,
            Self::PushPromise => 5,
            Self::Ping => 6,
            Self::GoAway => 7,
            Self::WindowUpdate => 8,
            Self::Continuation => 9,
            Self::Unknown(other) => other,
        }
    }
}

// ===== impl StreamId =====

impl StreamId {
    /// Stream 0, the connection control stream.
    pub(crate) const ZERO: Self = Self(0);

    /// The maximum allowed stream id.
    pub(crate) const MAX: Self = Self(u32::MAX >> 1);

    /// Parse a 4-byte stream identifier field, returning the id and the
    /// leading (reserved or exclusive) bit.
    pub(crate) fn parse(buf: &[u8]) -> (Self, bool) {
        debug_assert_eq!(buf.len(), 4);
        let raw = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        (Self(raw & (u32::MAX >> 1)), raw & (1 << 31) != 0)
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub(crate) fn is_client_initiated(&self) -> bool {
        self.0 % 2 == 1
    }

    /// The next client-initiated stream id after this one.
    pub(crate) fn next_client_id(&self) -> Self {
        debug_assert!(self.0 % 2 == 1 || self.0 == 0);
        Self(if self.0 == 0 { 1 } else { self.0 + 2 })
    }
}

impl From<u32> for StreamId {
    fn from(src: u32) -> Self {
        debug_assert!(src & (1 << 31) == 0, "invalid stream id, larger than 31 bits");
        Self(src)
    }
}

impl From<StreamId> for u32 {
    fn from(src: StreamId) -> Self {
        src.0
    }
}

impl PartialEq<u32> for StreamId {
    fn eq(&self, other: &u32) -> bool {
        self.0 == *other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_round_trip() {
        let head = Head::new(Kind::Headers, 0x5, StreamId::from(7));
        let mut buf = Vec::new();
        head.encode(1234, &mut buf);
        assert_eq!(buf.len(), HEADER_LEN);

        let (len, parsed) = Head::parse(&buf);
        assert_eq!(len, 1234);
        assert_eq!(parsed, head);
    }

    #[test]
    fn stream_id_high_bit_is_masked() {
        let (id, bit) = StreamId::parse(&[0x80, 0, 0, 3]);
        assert_eq!(id, StreamId::from(3));
        assert!(bit);
    }

    #[test]
    fn next_client_id_is_odd_and_monotonic() {
        let id = StreamId::ZERO.next_client_id();
        assert_eq!(id, 1u32);
        assert_eq!(id.next_client_id(), 3u32);
        assert!(id.is_client_initiated());
    }
}
