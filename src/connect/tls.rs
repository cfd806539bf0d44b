//! TLS client setup: rustls config construction, ALPN negotiation, and
//! the fingerprint-preset shaping rustls can express.

use std::sync::Arc;

use rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

use crate::error::{DialPhase, Error};
use crate::fingerprint::TlsPreset;
use crate::proto::Io;

/// The negotiated application protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Alpn {
    H2,
    H1,
}

/// Which protocols to offer; restricted by `force_http_version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AlpnOffer {
    Both,
    H1Only,
    H2Only,
}

pub(crate) struct TlsSetup {
    config: Arc<rustls::ClientConfig>,
}

impl TlsSetup {
    /// Builds the client TLS configuration: webpki roots, TLS 1.2+,
    /// preset-shaped cipher list, and the ALPN offer.
    pub(crate) fn new(
        user_config: Option<Arc<rustls::ClientConfig>>,
        preset: Option<&TlsPreset>,
        offer: AlpnOffer,
    ) -> crate::Result<Self> {
        if let Some(config) = user_config {
            // caller-supplied config is taken as-is, ALPN included
            return Ok(Self { config });
        }

        let mut provider = rustls::crypto::ring::default_provider();
        if let Some(ids) = preset.and_then(|p| p.cipher_suites.as_ref()) {
            let mut suites = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(suite) = provider
                    .cipher_suites
                    .iter()
                    .find(|s| u16::from(s.suite()) == *id)
                {
                    suites.push(*suite);
                }
            }
            if !suites.is_empty() {
                provider.cipher_suites = suites;
            }
        }

        let roots = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };

        let mut config = rustls::ClientConfig::builder_with_provider(Arc::new(provider))
            .with_safe_default_protocol_versions()
            .map_err(|err| Error::new_dial(DialPhase::Tls, err))?
            .with_root_certificates(roots)
            .with_no_client_auth();

        config.alpn_protocols = match preset.map(|p| p.alpn.as_slice()) {
            Some(alpn) if !alpn.is_empty() => {
                alpn.iter().map(|p| p.as_bytes().to_vec()).collect()
            }
            _ => match offer {
                AlpnOffer::Both => vec![b"h2".to_vec(), b"http/1.1".to_vec()],
                AlpnOffer::H1Only => vec![b"http/1.1".to_vec()],
                AlpnOffer::H2Only => vec![b"h2".to_vec()],
            },
        };

        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Performs the handshake over `io` and reports the negotiated
    /// protocol; anything other than `h2` (including no ALPN at all)
    /// routes to HTTP/1.1.
    pub(crate) async fn connect(&self, host: &str, io: Io) -> crate::Result<(Io, Alpn)> {
        let server_name = ServerName::try_from(host.to_owned())
            .map_err(|err| Error::new_dial(DialPhase::Tls, err))?;

        let connector = TlsConnector::from(self.config.clone());
        let stream = connector
            .connect(server_name, io)
            .await
            .map_err(|err| Error::new_dial(DialPhase::Tls, err))?;

        let alpn = match stream.get_ref().1.alpn_protocol() {
            Some(b"h2") => Alpn::H2,
            _ => Alpn::H1,
        };
        tracing::trace!("tls handshake complete; alpn={alpn:?}");

        Ok((Box::new(stream), alpn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpn_offer_shapes_protocol_list() {
        let setup = TlsSetup::new(None, None, AlpnOffer::H1Only).unwrap();
        assert_eq!(setup.config.alpn_protocols, vec![b"http/1.1".to_vec()]);

        let setup = TlsSetup::new(None, None, AlpnOffer::Both).unwrap();
        assert_eq!(
            setup.config.alpn_protocols,
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );
    }

    #[test]
    fn preset_alpn_wins() {
        let preset = TlsPreset {
            alpn: vec!["http/1.1".to_owned(), "h2".to_owned()],
            cipher_suites: None,
        };
        let setup = TlsSetup::new(None, Some(&preset), AlpnOffer::Both).unwrap();
        assert_eq!(
            setup.config.alpn_protocols,
            vec![b"http/1.1".to_vec(), b"h2".to_vec()]
        );
    }
}
