//! FTP control channel codec (RFC 959 §4)
//!
//! Sends CRLF-terminated commands and reads single- and multi-line replies
//! over a plain or TLS-wrapped control socket.

use std::net::IpAddr;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tracing::trace;

use super::tls::TlsContext;
use crate::remote::{RemoteError, RemoteResult};

/// A complete server reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtpReply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl FtpReply {
    /// Text of the final line, without the code
    pub fn message(&self) -> &str {
        self.lines
            .last()
            .map(|l| l.get(4..).unwrap_or_default())
            .unwrap_or_default()
    }

    /// Full reply text, lines joined
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    pub fn is_preliminary(&self) -> bool {
        (100..200).contains(&self.code)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn is_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }
}

/// Map a negative reply onto the shared error taxonomy.
///
/// `subject` names the path (or command) the reply refers to.
pub fn reply_error(reply: &FtpReply, subject: &str) -> RemoteError {
    let text = reply.text();
    let lower = text.to_lowercase();
    match reply.code {
        421 => RemoteError::Connection(text),
        425 | 426 => RemoteError::Connection(format!("data connection failed: {}", text)),
        430 | 530 => RemoteError::Authentication(text),
        450 | 550 => {
            if lower.contains("permission") || lower.contains("denied") {
                RemoteError::PermissionDenied(subject.to_string())
            } else if lower.contains("not found")
                || lower.contains("no such")
                || lower.contains("not exist")
            {
                RemoteError::NotFound(subject.to_string())
            } else {
                RemoteError::Protocol(format!("{}: {}", subject, text))
            }
        }
        502 | 504 => RemoteError::Unsupported(text),
        _ => RemoteError::Protocol(format!("{}: {}", subject, text)),
    }
}

/// Plain or TLS control socket
enum ControlStream {
    Plain(BufReader<TcpStream>),
    Tls(Box<BufReader<TlsStream<TcpStream>>>),
}

/// FTP command/response codec
pub struct FtpCodec {
    stream: ControlStream,
    peer_ip: Option<IpAddr>,
}

impl FtpCodec {
    pub fn from_tcp(stream: TcpStream) -> Self {
        let peer_ip = stream.peer_addr().ok().map(|a| a.ip());
        Self {
            stream: ControlStream::Plain(BufReader::new(stream)),
            peer_ip,
        }
    }

    pub fn from_tls(stream: TlsStream<TcpStream>) -> Self {
        let peer_ip = stream.get_ref().0.peer_addr().ok().map(|a| a.ip());
        Self {
            stream: ControlStream::Tls(Box::new(BufReader::new(stream))),
            peer_ip,
        }
    }

    /// Address of the server end of the control connection
    pub fn peer_ip(&self) -> Option<IpAddr> {
        self.peer_ip
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.stream, ControlStream::Tls(_))
    }

    /// Upgrade a plain control connection after `AUTH TLS` was accepted
    pub async fn upgrade(self, tls: &TlsContext) -> RemoteResult<Self> {
        let tcp = match self.stream {
            ControlStream::Plain(reader) => {
                if !reader.buffer().is_empty() {
                    return Err(RemoteError::Protocol(
                        "unexpected data before TLS handshake".to_string(),
                    ));
                }
                reader.into_inner()
            }
            ControlStream::Tls(_) => {
                return Err(RemoteError::Protocol(
                    "control connection is already TLS".to_string(),
                ))
            }
        };
        let stream = tls.connect(tcp).await?;
        Ok(Self::from_tls(stream))
    }

    /// Send a raw command; CRLF is appended.
    pub async fn send_command(&mut self, cmd: &str) -> RemoteResult<()> {
        if cmd.starts_with("PASS ") {
            trace!(">>> PASS ****");
        } else {
            trace!(">>> {}", cmd);
        }
        let line = format!("{}\r\n", cmd);
        match &mut self.stream {
            ControlStream::Plain(s) => {
                s.get_mut().write_all(line.as_bytes()).await?;
                s.get_mut().flush().await?;
            }
            ControlStream::Tls(s) => {
                s.get_mut().write_all(line.as_bytes()).await?;
                s.get_mut().flush().await?;
            }
        }
        Ok(())
    }

    async fn read_line(&mut self) -> RemoteResult<String> {
        let mut buf = String::new();
        let n = match &mut self.stream {
            ControlStream::Plain(s) => s.read_line(&mut buf).await?,
            ControlStream::Tls(s) => s.read_line(&mut buf).await?,
        };
        if n == 0 {
            return Err(RemoteError::Connection(
                "Server closed connection".to_string(),
            ));
        }
        Ok(buf.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Read a complete (possibly multi-line) reply.
    ///
    /// ```text
    /// 211-Features:
    ///  MLST type*;size*;modify*;
    /// 211 End
    /// ```
    pub async fn read_reply(&mut self) -> RemoteResult<FtpReply> {
        let first = self.read_line().await?;
        let code = parse_code(&first)?;
        let mut lines = vec![first];

        if lines[0].as_bytes().get(3) == Some(&b'-') {
            let terminator = format!("{} ", code);
            loop {
                let next = self.read_line().await?;
                let done = next.starts_with(&terminator) || next == code.to_string();
                lines.push(next);
                if done {
                    break;
                }
            }
        }

        let reply = FtpReply { code, lines };
        trace!("<<< {} {}", reply.code, reply.message());
        Ok(reply)
    }

    /// Send a command and read its reply
    pub async fn execute(&mut self, cmd: &str) -> RemoteResult<FtpReply> {
        self.send_command(cmd).await?;
        self.read_reply().await
    }

    /// Send a command and require a 2xx reply
    pub async fn expect_ok(&mut self, cmd: &str, subject: &str) -> RemoteResult<FtpReply> {
        let reply = self.execute(cmd).await?;
        if reply.is_success() {
            Ok(reply)
        } else {
            Err(reply_error(&reply, subject))
        }
    }
}

fn parse_code(line: &str) -> RemoteResult<u16> {
    line.get(..3)
        .and_then(|c| c.parse::<u16>().ok())
        .filter(|c| (100..600).contains(c))
        .ok_or_else(|| RemoteError::Protocol(format!("Invalid reply from server: '{}'", line)))
}
