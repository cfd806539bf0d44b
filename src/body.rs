//! Request body plumbing.
//!
//! A body is either absent, a pre-materialized byte buffer, or a
//! *producer*: a function returning a fresh readable stream on every
//! call. Producers that can be re-called make the request replayable,
//! which is what retry and 307/308 redirects of bodied requests require.

use std::fmt;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::AsyncRead;

/// A readable byte stream produced for one attempt of a request.
pub type BodyReader = Box<dyn AsyncRead + Send + Unpin>;

/// A function returning a fresh [`BodyReader`] per call.
pub type BodyProducer = Arc<dyn Fn() -> io::Result<BodyReader> + Send + Sync>;

/// The body configured on a request.
///
/// Exactly one of {no body, pre-materialized bytes, producer} is active.
#[derive(Clone)]
pub struct Body {
    inner: Inner,
}

#[derive(Clone)]
enum Inner {
    Empty,
    Full(Bytes),
    Producer {
        producer: BodyProducer,
        len: Option<u64>,
    },
    /// A single readable stream handed over by the caller; usable for
    /// exactly one attempt.
    Once {
        reader: Arc<Mutex<Option<BodyReader>>>,
        len: Option<u64>,
    },
}

impl Body {
    /// A body carrying no bytes.
    #[must_use]
    pub fn empty() -> Self {
        Self { inner: Inner::Empty }
    }

    /// A replayable body backed by a producer function.
    #[must_use]
    pub fn from_producer<F>(producer: F, len: Option<u64>) -> Self
    where
        F: Fn() -> io::Result<BodyReader> + Send + Sync + 'static,
    {
        Self {
            inner: Inner::Producer {
                producer: Arc::new(producer),
                len,
            },
        }
    }

    /// A one-shot body backed by a reader the caller already opened.
    ///
    /// One-shot bodies cannot be replayed: a retry or a 307/308 redirect
    /// needing the body again fails with a not-replayable error.
    #[must_use]
    pub fn from_reader<R>(reader: R, len: Option<u64>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            inner: Inner::Once {
                reader: Arc::new(Mutex::new(Some(Box::new(reader)))),
                len,
            },
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        match &self.inner {
            Inner::Empty => true,
            Inner::Full(bytes) => bytes.is_empty(),
            _ => false,
        }
    }

    /// True when a second attempt can produce the same bytes again.
    #[must_use]
    pub fn is_replayable(&self) -> bool {
        !matches!(self.inner, Inner::Once { .. })
    }

    /// The number of bytes an attempt will carry, when known up front.
    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        match &self.inner {
            Inner::Empty => Some(0),
            Inner::Full(bytes) => Some(bytes.len() as u64),
            Inner::Producer { len, .. } | Inner::Once { len, .. } => *len,
        }
    }

    /// Opens the payload for one attempt.
    pub(crate) fn payload(&self) -> crate::Result<Payload> {
        match &self.inner {
            Inner::Empty => Ok(Payload::Empty),
            Inner::Full(bytes) => Ok(Payload::Full(bytes.clone())),
            Inner::Producer { producer, len } => {
                let reader = producer().map_err(crate::Error::new_body_write)?;
                Ok(Payload::Stream { reader, len: *len })
            }
            Inner::Once { reader, len } => match reader.lock().take() {
                Some(reader) => Ok(Payload::Stream { reader, len: *len }),
                None => Err(crate::Error::new_body_not_replayable()),
            },
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Inner::Empty => f.write_str("Body::Empty"),
            Inner::Full(bytes) => f.debug_tuple("Body::Full").field(&bytes.len()).finish(),
            Inner::Producer { len, .. } => {
                f.debug_struct("Body::Producer").field("len", len).finish()
            }
            Inner::Once { len, .. } => f.debug_struct("Body::Once").field("len", len).finish(),
        }
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Self {
            inner: Inner::Full(bytes),
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Bytes::from(bytes).into()
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Bytes::from(text).into()
    }
}

impl From<&'static str> for Body {
    fn from(text: &'static str) -> Self {
        Bytes::from_static(text.as_bytes()).into()
    }
}

impl From<&'static [u8]> for Body {
    fn from(bytes: &'static [u8]) -> Self {
        Bytes::from_static(bytes).into()
    }
}

/// The bytes source for a single attempt.
pub(crate) enum Payload {
    Empty,
    Full(Bytes),
    Stream {
        reader: BodyReader,
        len: Option<u64>,
    },
}

impl Payload {
    pub(crate) fn len(&self) -> Option<u64> {
        match self {
            Self::Empty => Some(0),
            Self::Full(bytes) => Some(bytes.len() as u64),
            Self::Stream { len, .. } => *len,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        matches!(self, Self::Empty) || matches!(self, Self::Full(b) if b.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_shot_body_is_spent_after_first_payload() {
        let body = Body::from_reader(std::io::Cursor::new(b"hello".to_vec()), Some(5));
        assert!(!body.is_replayable());
        assert!(body.payload().is_ok());
        assert!(body.payload().is_err());
    }

    #[test]
    fn producer_body_replays() {
        let body = Body::from_producer(
            || Ok(Box::new(std::io::Cursor::new(b"hello".to_vec())) as BodyReader),
            Some(5),
        );
        assert!(body.is_replayable());
        assert!(body.payload().is_ok());
        assert!(body.payload().is_ok());
    }

    #[test]
    fn full_body_length_is_known() {
        let body = Body::from("x=1");
        assert_eq!(body.content_length(), Some(3));
        assert!(!body.is_empty());
    }
}
