use std::fmt;

use bytes::BufMut;

use super::{Error, Head, Kind, StreamId};

const ACK: u8 = 0x1;

/// A SETTINGS parameter identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingId {
    HeaderTableSize,
    EnablePush,
    MaxConcurrentStreams,
    InitialWindowSize,
    MaxFrameSize,
    MaxHeaderListSize,
    EnableConnectProtocol,
    Unknown(u16),
}

impl SettingId {
    fn load(raw: u16) -> Self {
        match raw {
            1 => Self::HeaderTableSize,
            2 => Self::EnablePush,
            3 => Self::MaxConcurrentStreams,
            4 => Self::InitialWindowSize,
            5 => Self::MaxFrameSize,
            6 => Self::MaxHeaderListSize,
            8 => Self::EnableConnectProtocol,
            other => Self::Unknown(other),
        }
    }

    fn encode(self) -> u16 {
        match self {
            Self::HeaderTableSize => 1,
            Self::EnablePush => 2,
            Self::MaxConcurrentStreams => 3,
            Self::InitialWindowSize => 4,
            Self::MaxFrameSize => 5,
            Self::MaxHeaderListSize => 6,
            Self::EnableConnectProtocol => 8,
            Self::Unknown(other) => other,
        }
    }
}

/// One `(identifier, value)` pair, 6 bytes on the wire.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Setting {
    pub(crate) id: SettingId,
    pub(crate) value: u32,
}

impl Setting {
    fn load(raw: &[u8]) -> Self {
        debug_assert_eq!(raw.len(), 6);
        Self {
            id: SettingId::load(u16::from_be_bytes([raw[0], raw[1]])),
            value: u32::from_be_bytes([raw[2], raw[3], raw[4], raw[5]]),
        }
    }

    fn encode<B: BufMut>(&self, dst: &mut B) {
        dst.put_u16(self.id.encode());
        dst.put_u32(self.value);
    }
}

/// The settings a peer advertises, plus the order they appeared in (or
/// should appear in) within the frame.
///
/// The order is load-bearing for fingerprinting: the encoder iterates
/// the order list as-is and never sorts it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsConfig {
    pub header_table_size: Option<u32>,
    pub enable_push: Option<u32>,
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: Option<u32>,
    pub max_frame_size: Option<u32>,
    pub max_header_list_size: Option<u32>,
    pub enable_connect_protocol: Option<u32>,
    /// Order of settings within the frame; identifiers not listed are
    /// appended in ascending-id order.
    pub order: Option<Vec<SettingId>>,
}

const DEFAULT_ORDER: &[SettingId] = &[
    SettingId::HeaderTableSize,
    SettingId::EnablePush,
    SettingId::MaxConcurrentStreams,
    SettingId::InitialWindowSize,
    SettingId::MaxFrameSize,
    SettingId::MaxHeaderListSize,
    SettingId::EnableConnectProtocol,
];

impl SettingsConfig {
    fn get(&self, id: SettingId) -> Option<u32> {
        match id {
            SettingId::HeaderTableSize => self.header_table_size,
            SettingId::EnablePush => self.enable_push,
            SettingId::MaxConcurrentStreams => self.max_concurrent_streams,
            SettingId::InitialWindowSize => self.initial_window_size,
            SettingId::MaxFrameSize => self.max_frame_size,
            SettingId::MaxHeaderListSize => self.max_header_list_size,
            SettingId::EnableConnectProtocol => self.enable_connect_protocol,
            SettingId::Unknown(_) => None,
        }
    }

    fn for_each<F: FnMut(Setting)>(&self, mut f: F) {
        let mut order: Vec<SettingId> = self.order.clone().unwrap_or_default();
        for id in DEFAULT_ORDER {
            if !order.contains(id) {
                order.push(*id);
            }
        }
        for id in order {
            if let Some(value) = self.get(id) {
                f(Setting { id, value });
            }
        }
    }
}

/// A SETTINGS frame.
#[derive(Clone, Default)]
pub(crate) struct Settings {
    ack: bool,
    pub(crate) config: SettingsConfig,
}

impl Settings {
    pub(crate) fn new(config: SettingsConfig) -> Self {
        Self { ack: false, config }
    }

    pub(crate) fn ack() -> Self {
        Self {
            ack: true,
            ..Self::default()
        }
    }

    pub(crate) fn is_ack(&self) -> bool {
        self.ack
    }

    pub(crate) fn load(head: Head, payload: &[u8]) -> Result<Self, Error> {
        debug_assert_eq!(head.kind(), Kind::Settings);

        if !head.stream_id().is_zero() {
            return Err(Error::InvalidStreamId);
        }

        if head.flag() & ACK == ACK {
            if !payload.is_empty() {
                return Err(Error::InvalidPayloadLength);
            }
            return Ok(Self::ack());
        }

        if payload.len() % 6 != 0 {
            tracing::debug!("invalid settings payload length; len={:?}", payload.len());
            return Err(Error::InvalidPayloadAckSettings);
        }

        let mut config = SettingsConfig::default();
        let mut order = Vec::with_capacity(payload.len() / 6);

        for raw in payload.chunks(6) {
            let setting = Setting::load(raw);
            order.push(setting.id);
            match setting.id {
                SettingId::HeaderTableSize => config.header_table_size = Some(setting.value),
                SettingId::EnablePush => match setting.value {
                    0 | 1 => config.enable_push = Some(setting.value),
                    _ => return Err(Error::InvalidSettingValue),
                },
                SettingId::MaxConcurrentStreams => {
                    config.max_concurrent_streams = Some(setting.value)
                }
                SettingId::InitialWindowSize => {
                    if setting.value > super::MAX_INITIAL_WINDOW_SIZE {
                        return Err(Error::InvalidSettingValue);
                    }
                    config.initial_window_size = Some(setting.value);
                }
                SettingId::MaxFrameSize => {
                    if !(super::DEFAULT_MAX_FRAME_SIZE..=super::MAX_MAX_FRAME_SIZE)
                        .contains(&setting.value)
                    {
                        return Err(Error::InvalidSettingValue);
                    }
                    config.max_frame_size = Some(setting.value);
                }
                SettingId::MaxHeaderListSize => config.max_header_list_size = Some(setting.value),
                SettingId::EnableConnectProtocol => match setting.value {
                    0 | 1 => config.enable_connect_protocol = Some(setting.value),
                    _ => return Err(Error::InvalidSettingValue),
                },
                SettingId::Unknown(id) => {
                    tracing::trace!(%id, value = %setting.value, "ignore unknown h2 setting");
                }
            }
        }

        if !order.is_empty() {
            config.order = Some(order);
        }

        Ok(Self { ack: false, config })
    }

    fn payload_len(&self) -> usize {
        let mut len = 0;
        self.config.for_each(|_| len += 6);
        len
    }

    pub(crate) fn encode<B: BufMut>(&self, dst: &mut B) {
        let head = Head::new(Kind::Settings, if self.ack { ACK } else { 0 }, StreamId::ZERO);
        let payload_len = self.payload_len();

        tracing::trace!("encoding SETTINGS; len={}", payload_len);
        head.encode(payload_len, dst);

        self.config.for_each(|setting| setting.encode(dst));
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ack {
            return f.write_str("Settings(ACK)");
        }
        f.debug_struct("Settings").field("config", &self.config).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::h2::frame::HEADER_LEN;

    #[test]
    fn order_within_frame_is_preserved() {
        // Firefox-like order: table size, window size, max frame size
        let config = SettingsConfig {
            header_table_size: Some(65_536),
            initial_window_size: Some(131_072),
            max_frame_size: Some(16_384),
            order: Some(vec![
                SettingId::HeaderTableSize,
                SettingId::InitialWindowSize,
                SettingId::MaxFrameSize,
            ]),
            ..Default::default()
        };

        let mut buf = Vec::new();
        Settings::new(config).encode(&mut buf);

        let ids: Vec<u16> = buf[HEADER_LEN..]
            .chunks(6)
            .map(|raw| u16::from_be_bytes([raw[0], raw[1]]))
            .collect();
        assert_eq!(ids, vec![1, 4, 5]);
    }

    #[test]
    fn round_trip_keeps_order() {
        let config = SettingsConfig {
            max_concurrent_streams: Some(100),
            initial_window_size: Some(65_535),
            order: Some(vec![
                SettingId::MaxConcurrentStreams,
                SettingId::InitialWindowSize,
            ]),
            ..Default::default()
        };

        let mut buf = Vec::new();
        Settings::new(config.clone()).encode(&mut buf);

        let (len, head) = Head::parse(&buf);
        let parsed = Settings::load(head, &buf[HEADER_LEN..][..len]).unwrap();
        assert_eq!(parsed.config, config);
    }

    #[test]
    fn ack_with_payload_is_rejected() {
        let head = Head::new(Kind::Settings, ACK, StreamId::ZERO);
        assert_eq!(
            Settings::load(head, &[0; 6]).unwrap_err(),
            Error::InvalidPayloadLength
        );
    }

    #[test]
    fn bad_enable_push_is_rejected() {
        let mut buf = Vec::new();
        Head::new(Kind::Settings, 0, StreamId::ZERO).encode(6, &mut buf);
        Setting {
            id: SettingId::EnablePush,
            value: 2,
        }
        .encode(&mut buf);

        let (len, head) = Head::parse(&buf);
        assert_eq!(
            Settings::load(head, &buf[HEADER_LEN..][..len]).unwrap_err(),
            Error::InvalidSettingValue
        );
    }
}
