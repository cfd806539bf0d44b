//! HTTP/2 client transport: frames, HPACK, and the connection driver.

pub(crate) mod codec;
pub(crate) mod conn;
pub(crate) mod flow;
pub(crate) mod frame;
pub(crate) mod hpack;


pub(crate) use conn::{Connection, H2Config, RecvStream, ResponseHead, SendRequest, handshake};

use frame::Reason;

/// Transport-internal error: connection-level failures only. Stream
/// failures surface per stream.
#[derive(Debug)]
pub(crate) enum H2Error {
    Io(std::io::Error),
    /// A connection-level protocol violation; sent out as GOAWAY.
    Proto(Reason),
}

impl From<std::io::Error> for H2Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<frame::Error> for H2Error {
    fn from(err: frame::Error) -> Self {
        match err {
            frame::Error::Hpack(_) => Self::Proto(Reason::COMPRESSION_ERROR),
            frame::Error::BadFrameSize | frame::Error::InvalidPayloadLength => {
                Self::Proto(Reason::FRAME_SIZE_ERROR)
            }
            frame::Error::InvalidWindowUpdateValue => Self::Proto(Reason::FLOW_CONTROL_ERROR),
            _ => Self::Proto(Reason::PROTOCOL_ERROR),
        }
    }
}

impl std::fmt::Display for H2Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "h2 io error: {err}"),
            Self::Proto(reason) => write!(f, "h2 protocol error: {reason}"),
        }
    }
}

impl std::error::Error for H2Error {}
