//! On-wire fingerprint knobs.
//!
//! Everything here is correctness-neutral: the knobs shape how the
//! client looks on the wire (TLS ClientHello where expressible, H2
//! SETTINGS values and their in-frame order, pseudo-header order,
//! PRIORITY chatter, multipart boundary format) without changing
//! request semantics.

use std::sync::Arc;

use crate::proto::h2::frame::{
    Priority, SettingId, SettingsConfig, StreamDependency, StreamId,
};

/// The four request pseudo-headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PseudoId {
    Method,
    Scheme,
    Authority,
    Path,
}

/// Emission order for request pseudo-headers.
///
/// The default (method, authority, scheme, path) matches the commonly
/// observed Chrome ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PseudoOrder([PseudoId; 4]);

impl PseudoOrder {
    /// Builds an order; the four ids must each appear exactly once.
    #[must_use]
    pub fn new(ids: [PseudoId; 4]) -> Self {
        debug_assert!(
            [
                PseudoId::Method,
                PseudoId::Scheme,
                PseudoId::Authority,
                PseudoId::Path
            ]
            .iter()
            .all(|id| ids.contains(id)),
            "each pseudo header must appear exactly once"
        );
        Self(ids)
    }

    pub(crate) fn ids(&self) -> impl Iterator<Item = PseudoId> + '_ {
        self.0.iter().copied()
    }
}

impl Default for PseudoOrder {
    fn default() -> Self {
        Self([
            PseudoId::Method,
            PseudoId::Authority,
            PseudoId::Scheme,
            PseudoId::Path,
        ])
    }
}

/// TLS ClientHello shaping, to the extent rustls can express it:
/// ALPN contents and order, and the cipher-suite list order by IANA id.
/// Unknown or unsupported ids are skipped.
#[derive(Debug, Clone, Default)]
pub struct TlsPreset {
    /// ALPN protocols in offer order; empty means the transport default.
    pub alpn: Vec<String>,
    /// Cipher suites by IANA identifier, in offer order.
    pub cipher_suites: Option<Vec<u16>>,
}

/// A multipart boundary generator.
pub type BoundaryGenerator = Arc<dyn Fn() -> String + Send + Sync>;

/// A complete fingerprint preset: every knob the transport exposes.
#[derive(Clone)]
pub struct Preset {
    pub tls: TlsPreset,
    /// H2 SETTINGS values; the `order` field controls the order of
    /// settings within the frame and is never sorted.
    pub h2_settings: SettingsConfig,
    pub pseudo_order: PseudoOrder,
    /// Priority parameter carried on every request HEADERS frame.
    pub headers_priority: Option<StreamDependency>,
    /// Standalone PRIORITY frames emitted right after the preface.
    pub priority_frames: Vec<Priority>,
    /// Connection-level WINDOW_UPDATE increment sent at connection
    /// start.
    pub conn_window_bump: u32,
    /// Multipart boundary format.
    pub multipart_boundary: Option<BoundaryGenerator>,
}

impl std::fmt::Debug for Preset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Preset")
            .field("tls", &self.tls)
            .field("h2_settings", &self.h2_settings)
            .field("pseudo_order", &self.pseudo_order)
            .field("conn_window_bump", &self.conn_window_bump)
            .finish()
    }
}

impl Default for Preset {
    fn default() -> Self {
        Self {
            tls: TlsPreset::default(),
            h2_settings: SettingsConfig {
                enable_push: Some(0),
                ..Default::default()
            },
            pseudo_order: PseudoOrder::default(),
            headers_priority: None,
            priority_frames: Vec::new(),
            conn_window_bump: 0,
            multipart_boundary: None,
        }
    }
}

impl Preset {
    /// A Firefox-like shape: its SETTINGS triple in Firefox order, the
    /// characteristic PRIORITY tree after the preface, and a large
    /// connection window bump.
    #[must_use]
    pub fn firefox_like() -> Self {
        let tree = [(3u32, 200u8), (5, 100), (7, 0), (9, 0), (11, 0), (13, 240)];
        Self {
            h2_settings: SettingsConfig {
                header_table_size: Some(65_536),
                initial_window_size: Some(131_072),
                max_frame_size: Some(16_384),
                order: Some(vec![
                    SettingId::HeaderTableSize,
                    SettingId::InitialWindowSize,
                    SettingId::MaxFrameSize,
                ]),
                ..Default::default()
            },
            pseudo_order: PseudoOrder::new([
                PseudoId::Method,
                PseudoId::Path,
                PseudoId::Authority,
                PseudoId::Scheme,
            ]),
            headers_priority: Some(StreamDependency::new(StreamId::from(13), 41, false)),
            priority_frames: tree
                .iter()
                .map(|&(id, weight)| {
                    Priority::new(
                        StreamId::from(id),
                        StreamDependency::new(StreamId::ZERO, weight, false),
                    )
                })
                .collect(),
            conn_window_bump: 12_517_377,
            ..Default::default()
        }
    }

    /// A Chrome-like shape: single SETTINGS frame with Chrome's values
    /// and order, no PRIORITY chatter, a 15 MiB window bump.
    #[must_use]
    pub fn chrome_like() -> Self {
        Self {
            h2_settings: SettingsConfig {
                header_table_size: Some(65_536),
                enable_push: Some(0),
                max_concurrent_streams: Some(1000),
                initial_window_size: Some(6_291_456),
                max_header_list_size: Some(262_144),
                order: Some(vec![
                    SettingId::HeaderTableSize,
                    SettingId::EnablePush,
                    SettingId::MaxConcurrentStreams,
                    SettingId::InitialWindowSize,
                    SettingId::MaxHeaderListSize,
                ]),
                ..Default::default()
            },
            pseudo_order: PseudoOrder::new([
                PseudoId::Method,
                PseudoId::Authority,
                PseudoId::Scheme,
                PseudoId::Path,
            ]),
            headers_priority: Some(StreamDependency::new(StreamId::ZERO, 255, true)),
            conn_window_bump: 15_663_105,
            ..Default::default()
        }
    }
}
