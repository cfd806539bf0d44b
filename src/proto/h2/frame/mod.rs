//! HTTP/2 frame taxonomy per RFC 7540 section 6.
//!
//! Frames are represented after (for reads) or before (for writes) HPACK
//! processing: a [`Headers`] value carries the flattened field list, and
//! the codec owns the compression contexts and the CONTINUATION
//! splitting/reassembly.

mod data;
mod go_away;
mod head;
mod headers;
mod ping;
mod priority;
mod reason;
mod reset;
mod settings;
mod window_update;

pub(crate) use self::data::Data;
pub(crate) use self::go_away::GoAway;
pub(crate) use self::head::{HEADER_LEN, Head, Kind};
pub(crate) use self::headers::{Field, Headers, PushPromise};
pub(crate) use self::ping::Ping;
pub use self::priority::{Priority, StreamDependency};
pub(crate) use self::reset::Reset;
pub(crate) use self::settings::Settings;
pub(crate) use self::window_update::WindowUpdate;

pub use self::head::StreamId;
pub use self::reason::Reason;
pub use self::settings::{SettingId, SettingsConfig};

pub(crate) mod headers_flags {
    pub(crate) use super::headers::{END_HEADERS, END_STREAM, PRIORITY};
}

/// The default value of SETTINGS_HEADER_TABLE_SIZE.
pub(crate) const DEFAULT_SETTINGS_HEADER_TABLE_SIZE: usize = 4_096;

/// The default value of SETTINGS_INITIAL_WINDOW_SIZE.
pub(crate) const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65_535;

/// The default value of SETTINGS_MAX_FRAME_SIZE.
pub(crate) const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;

/// MAX_FRAME_SIZE upper bound.
pub(crate) const MAX_MAX_FRAME_SIZE: u32 = (1 << 24) - 1;

/// INITIAL_WINDOW_SIZE upper bound.
pub(crate) const MAX_INITIAL_WINDOW_SIZE: u32 = (1 << 31) - 1;

/// A single decoded (or to-be-encoded) frame.
#[derive(Debug)]
pub(crate) enum Frame {
    Data(Data),
    Headers(Headers),
    Priority(Priority),
    Reset(Reset),
    Settings(Settings),
    PushPromise(PushPromise),
    Ping(Ping),
    GoAway(GoAway),
    WindowUpdate(WindowUpdate),
}

/// Errors that can occur during parsing an HTTP/2 frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Error {
    /// A length value other than 8 was set on a PING message.
    BadFrameSize,

    /// The padding length was larger than the frame-header-specified
    /// length of the payload.
    TooMuchPadding,

    /// The payload length specified by the frame header was not the
    /// value necessary for the specific frame type.
    InvalidPayloadLength,

    /// Received a payload with an ACK settings frame.
    InvalidPayloadAckSettings,

    /// An invalid setting value was provided.
    InvalidSettingValue,

    /// An invalid window update value was provided.
    InvalidWindowUpdateValue,

    /// A SETTINGS or PING frame was received with a stream identifier
    /// other than zero, or a stream frame on stream zero.
    InvalidStreamId,

    /// A stream dependency on the stream itself.
    InvalidDependencyId,

    /// Failed to perform HPACK decoding.
    Hpack(crate::proto::h2::hpack::DecoderError),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadFrameSize => f.write_str("frame with invalid size"),
            Self::TooMuchPadding => f.write_str("frame padding exceeds payload"),
            Self::InvalidPayloadLength => f.write_str("invalid frame payload length"),
            Self::InvalidPayloadAckSettings => f.write_str("SETTINGS ACK with a payload"),
            Self::InvalidSettingValue => f.write_str("invalid setting value"),
            Self::InvalidWindowUpdateValue => f.write_str("invalid window update value"),
            Self::InvalidStreamId => f.write_str("frame on unexpected stream id"),
            Self::InvalidDependencyId => f.write_str("stream depends on itself"),
            Self::Hpack(err) => write!(f, "hpack decoding failed: {err:?}"),
        }
    }
}

impl std::error::Error for Error {}

/// Strips RFC 7540 padding: the first payload byte is the pad length,
/// the trailing `pad` bytes are discarded.
pub(crate) fn strip_padding(payload: &mut bytes::Bytes) -> Result<u8, Error> {
    use bytes::Buf;

    if payload.is_empty() {
        return Err(Error::TooMuchPadding);
    }
    let pad_len = payload[0];
    if pad_len as usize >= payload.len() {
        return Err(Error::TooMuchPadding);
    }
    payload.advance(1);
    payload.truncate(payload.len() - pad_len as usize);
    Ok(pad_len)
}
