use bytes::BufMut;

use super::{Error, Head, Kind, StreamId};

/// A PRIORITY frame. Priority is advisory; the client emits these only
/// as fingerprint knobs and ignores them on read.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Priority {
    stream_id: StreamId,
    dependency: StreamDependency,
}

/// The 5-byte stream dependency field shared by PRIORITY frames and the
/// HEADERS priority flag.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct StreamDependency {
    /// The ID of the stream dependency target.
    dependency_id: StreamId,

    /// The weight for the stream, in the range [0, 255] (one less than
    /// the protocol value, so that it fits into a `u8`).
    weight: u8,

    /// True if the stream dependency is exclusive.
    is_exclusive: bool,
}

impl Priority {
    #[must_use]
    pub fn new(stream_id: StreamId, dependency: StreamDependency) -> Self {
        Self {
            stream_id,
            dependency,
        }
    }

    pub(crate) fn load(head: Head, payload: &[u8]) -> Result<Self, Error> {
        let dependency = StreamDependency::load(payload)?;
        if dependency.dependency_id() == head.stream_id() {
            return Err(Error::InvalidDependencyId);
        }
        Ok(Self {
            stream_id: head.stream_id(),
            dependency,
        })
    }

    pub(crate) fn encode<B: BufMut>(&self, dst: &mut B) {
        let head = Head::new(Kind::Priority, 0, self.stream_id);
        head.encode(5, dst);
        self.dependency.encode(dst);
    }
}

// ===== impl StreamDependency =====

impl StreamDependency {
    #[must_use]
    pub fn new(dependency_id: StreamId, weight: u8, is_exclusive: bool) -> Self {
        Self {
            dependency_id,
            weight,
            is_exclusive,
        }
    }

    pub(crate) fn load(src: &[u8]) -> Result<Self, Error> {
        if src.len() != 5 {
            return Err(Error::InvalidPayloadLength);
        }

        let (dependency_id, is_exclusive) = StreamId::parse(&src[..4]);
        Ok(Self::new(dependency_id, src[4], is_exclusive))
    }

    #[must_use]
    pub fn dependency_id(&self) -> StreamId {
        self.dependency_id
    }

    #[must_use]
    pub fn weight(&self) -> u8 {
        self.weight
    }

    #[must_use]
    pub fn is_exclusive(&self) -> bool {
        self.is_exclusive
    }

    pub(crate) fn encode<B: BufMut>(&self, dst: &mut B) {
        let mut dependency_id: u32 = self.dependency_id.into();
        if self.is_exclusive {
            dependency_id |= 1 << 31;
        }
        dst.put_u32(dependency_id);
        dst.put_u8(self.weight);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::h2::frame::HEADER_LEN;

    #[test]
    fn round_trip() {
        let dependency = StreamDependency::new(StreamId::from(13), 201, false);
        let priority = Priority::new(StreamId::from(3), dependency.clone());

        let mut buf = Vec::new();
        priority.encode(&mut buf);

        let (_, head) = Head::parse(&buf);
        let parsed = Priority::load(head, &buf[HEADER_LEN..]).unwrap();
        assert_eq!(parsed.dependency, dependency);
        assert_eq!(parsed.stream_id, StreamId::from(3));
    }

    #[test]
    fn self_dependency_is_rejected() {
        let dependency = StreamDependency::new(StreamId::from(3), 0, false);
        let mut buf = Vec::new();
        dependency.encode(&mut buf);

        let head = Head::new(Kind::Priority, 0, StreamId::from(3));
        assert_eq!(
            Priority::load(head, &buf).unwrap_err(),
            Error::InvalidDependencyId
        );
    }
}
