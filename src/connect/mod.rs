//! The dialer: origin resolution, TCP/unix connect, proxy tunneling,
//! TLS, and ALPN-driven protocol selection.

pub(crate) mod proxy;
pub(crate) mod tls;

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use tokio::net::TcpStream;
use url::Url;

use crate::error::{DialPhase, Error};
use crate::observe::trace::Tracer;
use crate::proto::Io;

use self::proxy::{ProxyConfig, ProxyKind};
use self::tls::{Alpn, AlpnOffer, TlsSetup};

/// Protocol selection override; `Auto` follows ALPN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HttpVersion {
    #[default]
    Auto,
    Http1,
    Http2,
}

/// The scheme of an origin; only the two HTTP schemes dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }

    pub(crate) fn default_port(&self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
        }
    }
}

/// The pool bucket key: two requests share connections iff their origin
/// keys are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct OriginKey {
    pub(crate) scheme: Scheme,
    pub(crate) host: String,
    pub(crate) port: u16,
    /// Normalized proxy url, when one applies to this origin.
    pub(crate) proxy: Option<String>,
    pub(crate) hint: HttpVersion,
    /// Unix socket path override.
    pub(crate) unix: Option<String>,
}

impl OriginKey {
    /// `host[:port]`, the port elided when it is the scheme default.
    pub(crate) fn authority(&self) -> String {
        if self.port == self.scheme.default_port() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Which protocol the established connection speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Proto {
    H1,
    H2,
}

pub(crate) struct Established {
    pub(crate) io: Io,
    pub(crate) proto: Proto,
}

/// Caller-supplied replacement for the TCP dial step.
pub(crate) type DialHook = Arc<
    dyn Fn(&str, u16) -> Pin<Box<dyn Future<Output = std::io::Result<Io>> + Send>> + Send + Sync,
>;

pub(crate) struct Connector {
    tls: TlsSetup,
    proxy_tls: TlsSetup,
    force_version: HttpVersion,
    dial_hook: Option<DialHook>,
}

impl Connector {
    pub(crate) fn new(
        user_tls: Option<Arc<rustls::ClientConfig>>,
        preset: Option<&crate::fingerprint::TlsPreset>,
        force_version: HttpVersion,
        dial_hook: Option<DialHook>,
    ) -> crate::Result<Self> {
        let offer = match force_version {
            HttpVersion::Auto => AlpnOffer::Both,
            HttpVersion::Http1 => AlpnOffer::H1Only,
            HttpVersion::Http2 => AlpnOffer::H2Only,
        };
        Ok(Self {
            tls: TlsSetup::new(user_tls, preset, offer)?,
            // proxies are talked to in plain HTTP/1.1
            proxy_tls: TlsSetup::new(None, None, AlpnOffer::H1Only)?,
            force_version,
            dial_hook,
        })
    }

    /// Establishes a connection for `key`, running the DNS, TCP, proxy
    /// and TLS phases with their trace hooks.
    pub(crate) async fn connect(
        &self,
        key: &OriginKey,
        proxy: Option<&ProxyConfig>,
        tracer: &Tracer,
    ) -> crate::Result<Established> {
        let (mut io, remote_addr) = if let Some(path) = &key.unix {
            (self.dial_unix(path).await?, None)
        } else if let Some(proxy) = proxy {
            let (mut io, addr) = self.dial_tcp(&proxy.host, proxy.port, tracer).await?;

            // https proxies get their own TLS session first
            if proxy.kind == ProxyKind::Https {
                tracer.tls_start();
                let (tls_io, _) = self.proxy_tls.connect(&proxy.host, io).await?;
                tracer.tls_done();
                io = tls_io;
            }

            match (proxy.kind, key.scheme) {
                (ProxyKind::Socks5, _) => {
                    proxy::socks5(&mut io, proxy, &key.host, key.port).await?;
                }
                (_, Scheme::Https) => {
                    proxy::http_connect(&mut io, proxy, &key.host, key.port).await?;
                }
                (_, Scheme::Http) => {
                    // cleartext through an http proxy: no tunnel, the
                    // request line carries the absolute URI instead
                }
            }
            (io, Some(addr))
        } else {
            let (io, addr) = self.dial_tcp(&key.host, key.port, tracer).await?;
            (io, Some(addr))
        };

        if let Some(addr) = remote_addr {
            tracer.remote_addr(addr);
        }

        let proto = match key.scheme {
            Scheme::Https => {
                tracer.tls_start();
                let (tls_io, alpn) = self.tls.connect(&key.host, io).await?;
                tracer.tls_done();
                io = tls_io;
                match self.force_version {
                    HttpVersion::Http1 => Proto::H1,
                    HttpVersion::Http2 => Proto::H2,
                    HttpVersion::Auto => match alpn {
                        Alpn::H2 => Proto::H2,
                        Alpn::H1 => Proto::H1,
                    },
                }
            }
            Scheme::Http => match self.force_version {
                // h2 prior knowledge over cleartext, for test rigs
                HttpVersion::Http2 => Proto::H2,
                _ => Proto::H1,
            },
        };

        Ok(Established { io, proto })
    }

    async fn dial_tcp(
        &self,
        host: &str,
        port: u16,
        tracer: &Tracer,
    ) -> crate::Result<(Io, SocketAddr)> {
        if let Some(hook) = &self.dial_hook {
            tracer.connect_start();
            let io = hook(host, port)
                .await
                .map_err(|err| Error::new_dial(DialPhase::Connect, err))?;
            tracer.connect_done();
            // the hook owns address selection; report the target as-is
            let addr: Option<SocketAddr> = format!("{host}:{port}").parse().ok();
            return Ok((io, addr.unwrap_or_else(|| ([0, 0, 0, 0], port).into())));
        }

        tracer.dns_start();
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|err| Error::new_dial(DialPhase::Dns, err))?
            .collect();
        tracer.dns_done();
        if addrs.is_empty() {
            return Err(Error::new_dial(DialPhase::Dns, "no addresses resolved"));
        }

        tracer.connect_start();
        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    tracer.connect_done();
                    tracing::trace!("connected to {addr}");
                    return Ok((Box::new(stream), addr));
                }
                Err(err) => {
                    tracing::debug!("connect to {addr} failed: {err}");
                    last_err = Some(err);
                }
            }
        }
        Err(match last_err {
            Some(err) => Error::new_dial(DialPhase::Connect, err),
            None => Error::new_dial(DialPhase::Connect, "connect failed"),
        })
    }

    #[cfg(unix)]
    async fn dial_unix(&self, path: &str) -> crate::Result<Io> {
        let stream = tokio::net::UnixStream::connect(path)
            .await
            .map_err(|err| Error::new_dial(DialPhase::Connect, err))?;
        Ok(Box::new(stream))
    }

    #[cfg(not(unix))]
    async fn dial_unix(&self, _path: &str) -> crate::Result<Io> {
        Err(Error::new_dial(
            DialPhase::Connect,
            "unix sockets are not supported on this platform",
        ))
    }
}

/// Derives the origin key for a prepared request URL.
pub(crate) fn origin_key(
    url: &Url,
    proxy: Option<&Url>,
    hint: HttpVersion,
    unix: Option<&str>,
) -> crate::Result<OriginKey> {
    let scheme = match url.scheme() {
        "http" => Scheme::Http,
        "https" => Scheme::Https,
        other => {
            return Err(Error::new_builder(format!("unsupported url scheme {other:?}")));
        }
    };
    let host = url
        .host_str()
        .ok_or_else(|| Error::new_builder_msg("url is missing a host"))?
        .trim_matches(['[', ']'])
        .to_owned();
    let port = url.port().unwrap_or_else(|| scheme.default_port());

    Ok(OriginKey {
        scheme,
        host,
        port,
        proxy: proxy.map(|p| p.as_str().to_owned()),
        hint,
        unix: unix.map(str::to_owned),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_keys_collapse_equal_origins() {
        let a = origin_key(
            &Url::parse("https://api.example.com/users").unwrap(),
            None,
            HttpVersion::Auto,
            None,
        )
        .unwrap();
        let b = origin_key(
            &Url::parse("https://api.example.com:443/other?q=1").unwrap(),
            None,
            HttpVersion::Auto,
            None,
        )
        .unwrap();
        assert_eq!(a, b);

        let proxied = origin_key(
            &Url::parse("https://api.example.com/users").unwrap(),
            Some(&Url::parse("http://proxy:3128").unwrap()),
            HttpVersion::Auto,
            None,
        )
        .unwrap();
        assert_ne!(a, proxied);

        let forced = origin_key(
            &Url::parse("https://api.example.com/users").unwrap(),
            None,
            HttpVersion::Http1,
            None,
        )
        .unwrap();
        assert_ne!(a, forced);
    }

    #[test]
    fn authority_elides_default_port() {
        let key = origin_key(
            &Url::parse("https://api.example.com/").unwrap(),
            None,
            HttpVersion::Auto,
            None,
        )
        .unwrap();
        assert_eq!(key.authority(), "api.example.com");

        let key = origin_key(
            &Url::parse("http://api.example.com:8080/").unwrap(),
            None,
            HttpVersion::Auto,
            None,
        )
        .unwrap();
        assert_eq!(key.authority(), "api.example.com:8080");
    }

    #[test]
    fn non_http_scheme_is_a_builder_error() {
        let err = origin_key(
            &Url::parse("ftp://example.com/").unwrap(),
            None,
            HttpVersion::Auto,
            None,
        )
        .unwrap_err();
        assert!(err.is_builder());
    }
}
