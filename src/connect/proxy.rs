//! Proxy handshakes: HTTP CONNECT tunneling and SOCKS5 (RFC 1928).

use base64::Engine as _;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use url::Url;

use crate::error::{DialPhase, Error};
use crate::proto::Io;

/// A parsed proxy target.
#[derive(Debug, Clone)]
pub(crate) struct ProxyConfig {
    pub(crate) kind: ProxyKind,
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) auth: Option<ProxyAuth>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProxyKind {
    Http,
    Https,
    Socks5,
}

#[derive(Debug, Clone)]
pub(crate) struct ProxyAuth {
    pub(crate) username: String,
    pub(crate) password: String,
}

impl ProxyConfig {
    pub(crate) fn parse(url: &Url) -> crate::Result<Self> {
        let kind = match url.scheme() {
            "http" => ProxyKind::Http,
            "https" => ProxyKind::Https,
            "socks5" | "socks5h" => ProxyKind::Socks5,
            other => {
                return Err(Error::new_builder(format!(
                    "unsupported proxy scheme {other:?}"
                )));
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| Error::new_builder_msg("proxy url is missing a host"))?
            .to_owned();
        let port = url.port_or_known_default().unwrap_or(match kind {
            ProxyKind::Socks5 => 1080,
            ProxyKind::Http => 80,
            ProxyKind::Https => 443,
        });
        let auth = match url.password() {
            Some(password) if !url.username().is_empty() => Some(ProxyAuth {
                username: url.username().to_owned(),
                password: password.to_owned(),
            }),
            _ => None,
        };
        Ok(Self {
            kind,
            host,
            port,
            auth,
        })
    }

    pub(crate) fn basic_authorization(&self) -> Option<String> {
        self.auth.as_ref().map(|auth| {
            let raw = format!("{}:{}", auth.username, auth.password);
            format!(
                "Basic {}",
                base64::engine::general_purpose::STANDARD.encode(raw)
            )
        })
    }
}

/// Issues `CONNECT host:port` through an established proxy stream and
/// waits for the 2xx tunnel response.
pub(crate) async fn http_connect(
    io: &mut Io,
    proxy: &ProxyConfig,
    host: &str,
    port: u16,
) -> crate::Result<()> {
    let mut request = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n");
    if let Some(auth) = proxy.basic_authorization() {
        request.push_str("Proxy-Authorization: ");
        request.push_str(&auth);
        request.push_str("\r\n");
    }
    request.push_str("\r\n");

    io.write_all(request.as_bytes())
        .await
        .map_err(|err| Error::new_dial(DialPhase::Proxy, err))?;
    io.flush()
        .await
        .map_err(|err| Error::new_dial(DialPhase::Proxy, err))?;

    // Read the tunnel response head; anything other than 2xx fails the
    // dial.
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    loop {
        let n = io
            .read(&mut byte)
            .await
            .map_err(|err| Error::new_dial(DialPhase::Proxy, err))?;
        if n == 0 {
            return Err(Error::new_dial(DialPhase::Proxy, "proxy closed during CONNECT"));
        }
        head.push(byte[0]);
        if head.ends_with(b"\r\n\r\n") {
            break;
        }
        if head.len() > 16 * 1024 {
            return Err(Error::new_dial(DialPhase::Proxy, "oversized CONNECT response"));
        }
    }

    let status_line = head.split(|&b| b == b'\r').next().unwrap_or_default();
    let ok = status_line
        .split(|&b| b == b' ')
        .nth(1)
        .is_some_and(|code| code.first() == Some(&b'2'));
    if !ok {
        return Err(Error::new_dial(
            DialPhase::Proxy,
            format!(
                "proxy refused CONNECT: {}",
                String::from_utf8_lossy(status_line)
            ),
        ));
    }
    tracing::trace!("CONNECT tunnel to {host}:{port} established");
    Ok(())
}

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NONE: u8 = 0x00;
const METHOD_USERPASS: u8 = 0x02;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// SOCKS5 negotiation per RFC 1928 (and RFC 1929 username/password
/// subnegotiation), always addressing the target by domain so the proxy
/// resolves it.
pub(crate) async fn socks5(
    io: &mut Io,
    proxy: &ProxyConfig,
    host: &str,
    port: u16,
) -> crate::Result<()> {
    let err = |e| Error::new_dial(DialPhase::Proxy, e);

    // method selection
    let greeting: &[u8] = if proxy.auth.is_some() {
        &[SOCKS_VERSION, 2, METHOD_NONE, METHOD_USERPASS]
    } else {
        &[SOCKS_VERSION, 1, METHOD_NONE]
    };
    io.write_all(greeting).await.map_err(err)?;

    let mut choice = [0u8; 2];
    io.read_exact(&mut choice).await.map_err(err)?;
    if choice[0] != SOCKS_VERSION {
        return Err(Error::new_dial(DialPhase::Proxy, "bad socks version"));
    }
    match choice[1] {
        METHOD_NONE => {}
        METHOD_USERPASS => {
            let auth = proxy.auth.as_ref().ok_or_else(|| {
                Error::new_dial(DialPhase::Proxy, "proxy requires authentication")
            })?;
            if auth.username.len() > 255 || auth.password.len() > 255 {
                return Err(Error::new_dial(DialPhase::Proxy, "oversized credentials"));
            }
            let mut msg = Vec::with_capacity(3 + auth.username.len() + auth.password.len());
            msg.push(0x01);
            msg.push(auth.username.len() as u8);
            msg.extend_from_slice(auth.username.as_bytes());
            msg.push(auth.password.len() as u8);
            msg.extend_from_slice(auth.password.as_bytes());
            io.write_all(&msg).await.map_err(err)?;

            let mut reply = [0u8; 2];
            io.read_exact(&mut reply).await.map_err(err)?;
            if reply[1] != 0x00 {
                return Err(Error::new_dial(DialPhase::Proxy, "proxy rejected credentials"));
            }
        }
        _ => {
            return Err(Error::new_dial(
                DialPhase::Proxy,
                "no acceptable authentication method",
            ));
        }
    }

    // connect request, domain-addressed
    if host.len() > 255 {
        return Err(Error::new_dial(DialPhase::Proxy, "hostname too long for socks5"));
    }
    let mut request = Vec::with_capacity(7 + host.len());
    request.extend_from_slice(&[SOCKS_VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN]);
    request.push(host.len() as u8);
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    io.write_all(&request).await.map_err(err)?;

    let mut reply = [0u8; 4];
    io.read_exact(&mut reply).await.map_err(err)?;
    if reply[0] != SOCKS_VERSION {
        return Err(Error::new_dial(DialPhase::Proxy, "bad socks version in reply"));
    }
    if reply[1] != 0x00 {
        return Err(Error::new_dial(
            DialPhase::Proxy,
            format!("socks5 connect failed; code={}", reply[1]),
        ));
    }

    // drain the bound address
    let addr_len = match reply[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            io.read_exact(&mut len).await.map_err(err)?;
            len[0] as usize
        }
        _ => return Err(Error::new_dial(DialPhase::Proxy, "bad socks address type")),
    };
    let mut bound = vec![0u8; addr_len + 2];
    io.read_exact(&mut bound).await.map_err(err)?;

    tracing::trace!("socks5 tunnel to {host}:{port} established");
    Ok(())
}
