//! FTP/FTPS Session
//!
//! [`ProtocolSession`] over an FTP control connection. FTP servers drop idle
//! control connections freely, so every operation first checks the control
//! channel with `NOOP` and transparently logs in again if it is gone.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::codec::{reply_error, FtpCodec, FtpReply};
use super::parser::{parse_list, parse_mlsd, parse_mlst_line, ListingEntry};
use super::tls::TlsContext;
use super::transfer::{DataStream, PassiveMode};
use crate::config::{AuthConfig, ConnectionConfig, Protocol, TransportSecurity};
use crate::remote::{path, ProtocolSession, RemoteEntry, RemoteError, RemoteResult};

/// Bound for NOOP liveness checks and QUIT
const CONTROL_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Password sent for anonymous logins
const ANONYMOUS_PASSWORD: &str = "anonymous@";

/// Server capabilities from `FEAT`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Features {
    pub mlsd: bool,
    pub mlst: bool,
    pub epsv: bool,
    pub utf8: bool,
}

impl Features {
    /// Parse a `211` FEAT reply. The first and last lines are framing.
    pub fn parse(reply: &FtpReply) -> Self {
        let mut features = Self::default();
        let inner = reply
            .lines
            .iter()
            .skip(1)
            .take(reply.lines.len().saturating_sub(2));
        for line in inner {
            let name = line
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_ascii_uppercase();
            match name.as_str() {
                "MLSD" => features.mlsd = true,
                // MLST implies MLSD (RFC 3659 §7.8)
                "MLST" => {
                    features.mlst = true;
                    features.mlsd = true;
                }
                "EPSV" => features.epsv = true,
                "UTF8" => features.utf8 = true,
                _ => {}
            }
        }
        features
    }
}

/// One logged-in control connection
struct Control {
    codec: FtpCodec,
    features: Features,
    passive: PassiveMode,
    tls: Option<TlsContext>,
    host: String,
    data_timeout: Duration,
    /// Set while a command exchange is running; still set on entry means the
    /// previous exchange was cancelled and replies may be out of step.
    in_flight: bool,
}

impl Control {
    /// Connect, negotiate TLS and log in
    async fn establish(
        config: &ConnectionConfig,
        tls: Option<&TlsContext>,
        on_authenticating: &(dyn Fn() + Send + Sync),
    ) -> RemoteResult<Self> {
        let port = config.port();
        info!("Connecting to FTP server at {}:{}", config.host, port);
        let tcp = TcpStream::connect((config.host.as_str(), port)).await?;

        let mut codec = match (config.security, tls) {
            (TransportSecurity::FtpsImplicit, Some(ctx)) => {
                debug!("Implicit FTPS: TLS handshake at socket establishment");
                FtpCodec::from_tls(ctx.connect(tcp).await?)
            }
            _ => FtpCodec::from_tcp(tcp),
        };

        let mut banner = codec.read_reply().await?;
        if banner.code == 120 {
            debug!("Server not ready yet: {}", banner.message());
            banner = codec.read_reply().await?;
        }
        if banner.code != 220 {
            return Err(reply_error(&banner, "greeting"));
        }
        debug!("FTP banner: {}", banner.message());

        if let (TransportSecurity::FtpsExplicit, Some(ctx)) = (config.security, tls) {
            let reply = codec.execute("AUTH TLS").await?;
            if reply.code != 234 {
                return Err(RemoteError::Unsupported(format!(
                    "server refused AUTH TLS: {}",
                    reply.text()
                )));
            }
            codec = codec.upgrade(ctx).await?;
            debug!("Explicit FTPS: control connection upgraded");
        }

        on_authenticating();
        login(&mut codec, config).await?;

        if codec.is_tls() {
            codec.expect_ok("PBSZ 0", "PBSZ").await?;
            codec.expect_ok("PROT P", "PROT").await?;
        }

        let feat = codec.execute("FEAT").await?;
        let features = if feat.is_success() {
            Features::parse(&feat)
        } else {
            Features::default()
        };
        debug!("Server features: {:?}", features);

        if features.utf8 {
            let _ = codec.execute("OPTS UTF8 ON").await?;
        }
        codec.expect_ok("TYPE I", "TYPE").await?;

        Ok(Self {
            codec,
            passive: PassiveMode {
                use_epsv: features.epsv,
            },
            features,
            tls: tls.cloned(),
            host: config.host.clone(),
            data_timeout: config.connect_timeout(),
            in_flight: false,
        })
    }

    async fn noop(&mut self) -> bool {
        matches!(
            tokio::time::timeout(CONTROL_PROBE_TIMEOUT, self.codec.execute("NOOP")).await,
            Ok(Ok(reply)) if reply.is_success()
        )
    }

    /// Open a data channel and start `cmd` on it
    async fn open_transfer(&mut self, cmd: &str, subject: &str) -> RemoteResult<DataStream> {
        let tcp = self
            .passive
            .open(&mut self.codec, &self.host, self.data_timeout)
            .await?;
        let reply = self.codec.execute(cmd).await?;
        if !reply.is_preliminary() {
            return Err(reply_error(&reply, subject));
        }
        DataStream::establish(tcp, self.tls.as_ref()).await
    }

    /// Read the completion reply after the data channel closed
    async fn finish_transfer(&mut self, subject: &str) -> RemoteResult<()> {
        let reply = self.codec.read_reply().await?;
        if reply.is_success() {
            Ok(())
        } else {
            Err(reply_error(&reply, subject))
        }
    }

    async fn list_raw(&mut self, dir: &str) -> RemoteResult<Vec<ListingEntry>> {
        let use_mlsd = self.features.mlsd;
        let cmd = if use_mlsd {
            format!("MLSD {}", dir)
        } else {
            format!("LIST {}", dir)
        };
        let mut data = self.open_transfer(&cmd, dir).await?;
        let body = data.read_all().await?;
        drop(data);
        self.finish_transfer(dir).await?;

        let text = String::from_utf8_lossy(&body);
        Ok(if use_mlsd {
            parse_mlsd(&text)
        } else {
            parse_list(&text, Utc::now())
        })
    }

    async fn list(&mut self, dir: &str) -> RemoteResult<Vec<RemoteEntry>> {
        let entries = self.list_raw(dir).await?;
        Ok(entries
            .into_iter()
            .map(|e| bind_entry(&path::join(dir, &e.name), e))
            .collect())
    }

    async fn read(&mut self, target: &str) -> RemoteResult<Vec<u8>> {
        let mut data = self.open_transfer(&format!("RETR {}", target), target).await?;
        let bytes = data.read_all().await?;
        drop(data);
        self.finish_transfer(target).await?;
        Ok(bytes)
    }

    async fn write(&mut self, target: &str, bytes: &[u8]) -> RemoteResult<()> {
        let data = self.open_transfer(&format!("STOR {}", target), target).await?;
        data.write_all_and_close(bytes).await?;
        self.finish_transfer(target).await
    }

    async fn stat(&mut self, target: &str) -> RemoteResult<RemoteEntry> {
        if target == "/" {
            return Ok(RemoteEntry::directory("/", None));
        }

        if self.features.mlst {
            let reply = self.codec.execute(&format!("MLST {}", target)).await?;
            match reply.code {
                250 => {
                    let facts = reply
                        .lines
                        .iter()
                        .skip(1)
                        .find(|l| l.starts_with(' '))
                        .and_then(|l| parse_mlst_line(l));
                    if let Some(entry) = facts {
                        return Ok(bind_entry(target, entry));
                    }
                    debug!("MLST reply for {} had no facts; listing parent", target);
                }
                450 | 550 => return Err(RemoteError::NotFound(target.to_string())),
                _ => debug!("MLST failed ({}); listing parent", reply.code),
            }
        }

        let name = path::file_name(target);
        let parent = path::parent(target);
        let entries = match self.list_raw(parent).await {
            Ok(entries) => entries,
            Err(RemoteError::Protocol(_)) | Err(RemoteError::NotFound(_)) => {
                return Err(RemoteError::NotFound(target.to_string()))
            }
            Err(e) => return Err(e),
        };
        entries
            .into_iter()
            .find(|e| e.name == name)
            .map(|e| bind_entry(target, e))
            .ok_or_else(|| RemoteError::NotFound(target.to_string()))
    }

    async fn remove(&mut self, target: &str, recursive: bool) -> RemoteResult<()> {
        let entry = self.stat(target).await?;
        if !entry.is_dir {
            self.codec.expect_ok(&format!("DELE {}", target), target).await?;
            return Ok(());
        }
        if recursive {
            for child in self.list(target).await? {
                Box::pin(self.remove(&child.path, true)).await?;
            }
        }
        self.codec.expect_ok(&format!("RMD {}", target), target).await?;
        Ok(())
    }

    async fn rename(&mut self, from: &str, to: &str) -> RemoteResult<()> {
        let reply = self.codec.execute(&format!("RNFR {}", from)).await?;
        if !reply.is_intermediate() {
            return Err(reply_error(&reply, from));
        }
        self.codec.expect_ok(&format!("RNTO {}", to), to).await?;
        Ok(())
    }

    async fn mkdir(&mut self, target: &str) -> RemoteResult<()> {
        self.codec.expect_ok(&format!("MKD {}", target), target).await?;
        Ok(())
    }
}

async fn login(codec: &mut FtpCodec, config: &ConnectionConfig) -> RemoteResult<()> {
    let user = config.login_name();
    let reply = codec.execute(&format!("USER {}", user)).await?;
    match reply.code {
        230 => {}
        331 => {
            let password = match &config.auth {
                AuthConfig::Anonymous => ANONYMOUS_PASSWORD,
                auth => auth.secret().ok_or_else(|| {
                    RemoteError::Authentication(format!(
                        "no password available for {}@{}",
                        user, config.host
                    ))
                })?,
            };
            let reply = codec.execute(&format!("PASS {}", password)).await?;
            match reply.code {
                230 | 202 => {}
                332 => {
                    return Err(RemoteError::Unsupported(
                        "server requires an ACCT login".to_string(),
                    ))
                }
                _ => return Err(RemoteError::Authentication(reply.text())),
            }
        }
        _ => return Err(RemoteError::Authentication(reply.text())),
    }
    info!("FTP login successful for {}@{}", user, config.host);
    Ok(())
}

fn bind_entry(full_path: &str, entry: ListingEntry) -> RemoteEntry {
    if entry.is_dir {
        RemoteEntry::directory(full_path, entry.modified)
    } else {
        RemoteEntry::file(full_path, entry.size, entry.modified)
    }
}

/// FTP/FTPS session wrapper
pub struct FtpSession {
    config: ConnectionConfig,
    tls: Option<TlsContext>,
    control: Mutex<Option<Control>>,
    connected: AtomicBool,
    closed: AtomicBool,
    /// `user@host:port`, for logs
    label: String,
}

impl FtpSession {
    /// Connect and log in. The config's secrets must already be resolved.
    pub async fn connect(
        config: &ConnectionConfig,
        on_authenticating: &(dyn Fn() + Send + Sync),
    ) -> RemoteResult<Self> {
        let tls = if config.security.is_tls() {
            Some(TlsContext::new(&config.host, config.accept_invalid_certs)?)
        } else {
            None
        };
        let control = Control::establish(config, tls.as_ref(), on_authenticating).await?;
        let label = config.identity().lock_key();
        info!("FTP session ready for {} ({})", label, config.security);

        Ok(Self {
            config: config.clone(),
            tls,
            control: Mutex::new(Some(control)),
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            label,
        })
    }

    /// Verified control connection, logging in again if the old one is gone
    async fn ready_control<'a>(&self, slot: &'a mut Option<Control>) -> RemoteResult<&'a mut Control> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RemoteError::Connection(format!(
                "FTP session for {} is closed",
                self.label
            )));
        }

        let alive = match slot.as_mut() {
            Some(ctl) if ctl.in_flight => {
                warn!("Previous FTP command on {} was interrupted", self.label);
                false
            }
            Some(ctl) => ctl.noop().await,
            None => false,
        };

        if !alive {
            self.connected.store(false, Ordering::SeqCst);
            if slot.take().is_some() {
                info!("FTP control connection to {} lost; reconnecting", self.label);
            }
            let fresh = tokio::time::timeout(
                self.config.connect_timeout(),
                Control::establish(&self.config, self.tls.as_ref(), &|| {}),
            )
            .await
            .map_err(|_| RemoteError::Timeout(format!("FTP reconnect to {}", self.label)))??;
            self.connected.store(true, Ordering::SeqCst);
            info!("FTP control connection to {} re-established", self.label);
            *slot = Some(fresh);
        }

        let ctl = slot
            .as_mut()
            .ok_or_else(|| RemoteError::Connection("FTP control connection unavailable".into()))?;
        ctl.in_flight = true;
        Ok(ctl)
    }

    /// Drop the control connection after a transport failure
    fn settle<T>(&self, slot: &mut Option<Control>, result: &RemoteResult<T>) {
        match result {
            Err(RemoteError::Connection(_) | RemoteError::Timeout(_) | RemoteError::Io(_)) => {
                debug!("Discarding FTP control connection for {}", self.label);
                *slot = None;
                self.connected.store(false, Ordering::SeqCst);
            }
            _ => {
                if let Some(ctl) = slot.as_mut() {
                    ctl.in_flight = false;
                }
            }
        }
    }
}

/// Run one exchange on a verified control connection
macro_rules! with_control {
    ($self:ident, |$ctl:ident| $body:expr) => {{
        let mut slot = $self.control.lock().await;
        let result = match $self.ready_control(&mut slot).await {
            Ok($ctl) => $body.await,
            Err(e) => Err(e),
        };
        $self.settle(&mut slot, &result);
        result
    }};
}

#[async_trait]
impl ProtocolSession for FtpSession {
    fn protocol(&self) -> Protocol {
        Protocol::Ftp
    }

    async fn list(&self, dir: &str) -> RemoteResult<Vec<RemoteEntry>> {
        debug!("Listing {}", dir);
        with_control!(self, |ctl| ctl.list(dir))
    }

    async fn read(&self, target: &str) -> RemoteResult<Vec<u8>> {
        let data = with_control!(self, |ctl| ctl.read(target))?;
        debug!("Read {} bytes from {}", data.len(), target);
        Ok(data)
    }

    async fn write(&self, target: &str, data: &[u8]) -> RemoteResult<()> {
        with_control!(self, |ctl| ctl.write(target, data))?;
        info!("Wrote {} bytes to {}", data.len(), target);
        Ok(())
    }

    async fn remove(&self, target: &str, recursive: bool) -> RemoteResult<()> {
        info!("Deleting {} (recursive={})", target, recursive);
        with_control!(self, |ctl| ctl.remove(target, recursive))
    }

    async fn rename(&self, from: &str, to: &str) -> RemoteResult<()> {
        info!("Renaming {} to {}", from, to);
        with_control!(self, |ctl| ctl.rename(from, to))
    }

    async fn mkdir(&self, target: &str) -> RemoteResult<()> {
        info!("Creating directory {}", target);
        with_control!(self, |ctl| ctl.mkdir(target))
    }

    async fn stat(&self, target: &str) -> RemoteResult<RemoteEntry> {
        with_control!(self, |ctl| ctl.stat(target))
    }

    async fn probe(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        // A busy control connection is in use, so it is alive
        let Ok(mut slot) = self.control.try_lock() else {
            return true;
        };
        let alive = match slot.as_mut() {
            Some(ctl) if !ctl.in_flight => ctl.noop().await,
            _ => false,
        };
        if !alive {
            *slot = None;
            self.connected.store(false, Ordering::SeqCst);
        }
        alive
    }

    async fn keep_alive(&self) -> RemoteResult<()> {
        let Ok(mut slot) = self.control.try_lock() else {
            debug!("Control connection for {} busy; skipping NOOP", self.label);
            return Ok(());
        };
        let ctl = match slot.as_mut() {
            Some(ctl) if !ctl.in_flight => ctl,
            _ => {
                return Err(RemoteError::Connection(format!(
                    "FTP control connection to {} is down",
                    self.label
                )))
            }
        };
        let result = ctl.codec.expect_ok("NOOP", "NOOP").await.map(|_| ());
        self.settle(&mut slot, &result);
        result
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> RemoteResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        let mut slot = self.control.lock().await;
        if let Some(mut ctl) = slot.take() {
            match tokio::time::timeout(CONTROL_PROBE_TIMEOUT, ctl.codec.execute("QUIT")).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => debug!("QUIT for {} returned: {}", self.label, e),
                Err(_) => debug!("QUIT for {} timed out", self.label),
            }
        }
        info!("FTP session closed for {}", self.label);
        Ok(())
    }
}
