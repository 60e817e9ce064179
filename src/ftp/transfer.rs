//! Passive-mode data channels
//!
//! EPSV (RFC 2428) is tried first; servers that reject it fall back to
//! PASV. Under FTPS the data socket is wrapped in TLS once the server has
//! accepted the transfer command.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tracing::{debug, warn};

use super::codec::{reply_error, FtpCodec};
use super::tls::TlsContext;
use crate::remote::{RemoteError, RemoteResult};

static PASV_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\((\d+),(\d+),(\d+),(\d+),(\d+),(\d+)\)").expect("static regex")
});

static EPSV_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(\|\|\|(\d+)\|\)").expect("static regex"));

/// Parse `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)`
pub fn parse_pasv(text: &str) -> RemoteResult<(Ipv4Addr, u16)> {
    let caps = PASV_RE
        .captures(text)
        .ok_or_else(|| RemoteError::Protocol(format!("Cannot parse PASV reply: {}", text)))?;
    let mut n = [0u8; 6];
    for (i, slot) in n.iter_mut().enumerate() {
        *slot = caps[i + 1]
            .parse()
            .map_err(|_| RemoteError::Protocol(format!("PASV value out of range: {}", text)))?;
    }
    let ip = Ipv4Addr::new(n[0], n[1], n[2], n[3]);
    let port = u16::from(n[4]) << 8 | u16::from(n[5]);
    Ok((ip, port))
}

/// Parse `229 Entering Extended Passive Mode (|||port|)`
pub fn parse_epsv(text: &str) -> RemoteResult<u16> {
    EPSV_RE
        .captures(text)
        .and_then(|caps| caps[1].parse().ok())
        .ok_or_else(|| RemoteError::Protocol(format!("Cannot parse EPSV reply: {}", text)))
}

/// Pick the address to dial for a PASV reply.
///
/// Servers behind NAT often advertise an internal or unspecified address;
/// in that case the control connection's peer is used instead.
fn pasv_target(advertised: Ipv4Addr, control_peer: Option<IpAddr>) -> IpAddr {
    match control_peer {
        Some(peer) if advertised.is_unspecified() => peer,
        Some(peer @ IpAddr::V4(peer_v4))
            if advertised.is_private() && !peer_v4.is_private() && !peer_v4.is_loopback() =>
        {
            peer
        }
        _ => IpAddr::V4(advertised),
    }
}

/// Passive-mode negotiation state for one control connection
#[derive(Debug, Clone, Copy)]
pub struct PassiveMode {
    /// Cleared after the server refuses EPSV once
    pub use_epsv: bool,
}

impl Default for PassiveMode {
    fn default() -> Self {
        Self { use_epsv: true }
    }
}

impl PassiveMode {
    /// Ask the server for a passive port and connect to it
    pub async fn open(
        &mut self,
        codec: &mut FtpCodec,
        host: &str,
        connect_timeout: Duration,
    ) -> RemoteResult<TcpStream> {
        let peer = codec.peer_ip();
        if self.use_epsv {
            let reply = codec.execute("EPSV").await?;
            if reply.code == 229 {
                let port = parse_epsv(&reply.text())?;
                let target = peer.map(|ip| ip.to_string()).unwrap_or_else(|| host.to_string());
                debug!("EPSV data channel at {}:{}", target, port);
                return dial(&target, port, connect_timeout).await;
            }
            warn!("EPSV refused ({}), falling back to PASV", reply.code);
            self.use_epsv = false;
        }

        let reply = codec.execute("PASV").await?;
        if reply.code != 227 {
            return Err(reply_error(&reply, "PASV"));
        }
        let (advertised, port) = parse_pasv(&reply.text())?;
        let target = pasv_target(advertised, peer);
        if target != IpAddr::V4(advertised) {
            debug!("PASV advertised {}, dialing {} instead", advertised, target);
        }
        dial(&target.to_string(), port, connect_timeout).await
    }
}

async fn dial(host: &str, port: u16, connect_timeout: Duration) -> RemoteResult<TcpStream> {
    tokio::time::timeout(connect_timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| RemoteError::Timeout(format!("data connection to {}:{}", host, port)))?
        .map_err(|e| RemoteError::Connection(format!("data connection to {}:{} failed: {}", host, port, e)))
}

/// An open data channel
pub enum DataStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl DataStream {
    /// Wrap `tcp` in TLS when the session is protected
    pub async fn establish(tcp: TcpStream, tls: Option<&TlsContext>) -> RemoteResult<Self> {
        match tls {
            Some(ctx) => Ok(Self::Tls(Box::new(ctx.connect(tcp).await?))),
            None => Ok(Self::Plain(tcp)),
        }
    }

    pub async fn read_all(&mut self) -> RemoteResult<Vec<u8>> {
        let mut buf = Vec::new();
        match self {
            Self::Plain(s) => s.read_to_end(&mut buf).await?,
            Self::Tls(s) => read_tls_to_end(s, &mut buf).await?,
        };
        Ok(buf)
    }

    /// Write everything and close the channel, signalling end of file
    pub async fn write_all_and_close(mut self, data: &[u8]) -> RemoteResult<()> {
        match &mut self {
            Self::Plain(s) => {
                s.write_all(data).await?;
                s.shutdown().await?;
            }
            Self::Tls(s) => {
                s.write_all(data).await?;
                s.shutdown().await?;
            }
        }
        Ok(())
    }
}

/// Some servers close the data socket without a TLS close_notify; the data
/// is complete at that point, and the final control reply confirms it.
async fn read_tls_to_end(
    stream: &mut TlsStream<TcpStream>,
    buf: &mut Vec<u8>,
) -> std::io::Result<usize> {
    match stream.read_to_end(buf).await {
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            debug!("Data channel closed without close_notify");
            Ok(buf.len())
        }
        other => other,
    }
}
