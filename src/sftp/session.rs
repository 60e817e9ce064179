//! SFTP Session
//!
//! [`ProtocolSession`] over the SSH `sftp` subsystem.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use russh::client;
use russh::Disconnect;
use russh_sftp::client::error::Error as SftpErrorInner;
use russh_sftp::client::SftpSession as RusshSftpSession;
use russh_sftp::protocol::{FileAttributes, OpenFlags};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::client::{connect_and_authenticate, ClientHandler};
use super::keys::KeyConverter;
use crate::config::{ConnectionConfig, Protocol};
use crate::remote::{path, ProtocolSession, RemoteEntry, RemoteError, RemoteResult};

/// Upper bound for the post-connect ready probe
const READY_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// SFTP session wrapper
pub struct SftpSession {
    handle: client::Handle<ClientHandler>,
    sftp: RusshSftpSession,
    /// `user@host:port`, for logs
    label: String,
}

impl SftpSession {
    /// Connect, authenticate and open the SFTP subsystem.
    ///
    /// Returns only once the subsystem has answered a first request, or the
    /// probe timed out while the transport still reports connected.
    pub async fn connect(
        config: &ConnectionConfig,
        converter: &dyn KeyConverter,
        on_authenticating: &(dyn Fn() + Send + Sync),
    ) -> RemoteResult<Self> {
        let label = config.identity().lock_key();
        let handle = connect_and_authenticate(config, converter, on_authenticating).await?;

        info!("Opening SFTP subsystem for {}", label);
        let channel = handle.channel_open_session().await?;
        channel.request_subsystem(true, "sftp").await.map_err(|e| {
            RemoteError::Unsupported(format!("SFTP subsystem not available: {}", e))
        })?;

        let sftp = RusshSftpSession::new(channel.into_stream()).await?;

        let session = Self {
            handle,
            sftp,
            label,
        };
        session.wait_ready().await?;
        Ok(session)
    }

    async fn wait_ready(&self) -> RemoteResult<()> {
        match tokio::time::timeout(READY_PROBE_TIMEOUT, self.sftp.canonicalize(".")).await {
            Ok(Ok(home)) => {
                info!("SFTP ready for {} (home: {})", self.label, home);
                Ok(())
            }
            outcome if !self.handle.is_closed() => {
                let reason = match outcome {
                    Ok(Err(e)) => e.to_string(),
                    _ => format!("no answer within {:?}", READY_PROBE_TIMEOUT),
                };
                warn!(
                    "SFTP ready probe for {} missed ({}); transport is connected, proceeding",
                    self.label, reason
                );
                Ok(())
            }
            _ => Err(RemoteError::Connection(format!(
                "SSH transport to {} closed before SFTP became ready",
                self.label
            ))),
        }
    }

    fn to_entry(path: &str, attrs: &FileAttributes) -> RemoteEntry {
        let modified = attrs.mtime.and_then(mtime_to_utc);
        if attrs.is_dir() {
            RemoteEntry::directory(path, modified)
        } else {
            RemoteEntry::file(path, attrs.size.unwrap_or(0), modified)
        }
    }

    async fn remove_recursive(&self, target: &str) -> RemoteResult<()> {
        let entry = self.stat(target).await?;
        if entry.is_dir {
            for child in self.list(target).await? {
                Box::pin(self.remove_recursive(&child.path)).await?;
            }
            self.sftp
                .remove_dir(target)
                .await
                .map_err(|e| map_sftp_error(e, target))
        } else {
            self.sftp
                .remove_file(target)
                .await
                .map_err(|e| map_sftp_error(e, target))
        }
    }
}

fn mtime_to_utc(secs: u32) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(i64::from(secs), 0)
}

/// Map SFTP status errors onto the shared taxonomy, attaching the path
fn map_sftp_error(err: SftpErrorInner, path: &str) -> RemoteError {
    RemoteError::from_transport(err.to_string()).at_path(path)
}

#[async_trait]
impl ProtocolSession for SftpSession {
    fn protocol(&self) -> Protocol {
        Protocol::Sftp
    }

    async fn list(&self, dir: &str) -> RemoteResult<Vec<RemoteEntry>> {
        debug!("Listing {}", dir);
        let read_dir = self
            .sftp
            .read_dir(dir)
            .await
            .map_err(|e| map_sftp_error(e, dir))?;

        let mut entries = Vec::new();
        for entry in read_dir {
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }
            let full_path = path::join(dir, &name);
            entries.push(Self::to_entry(&full_path, &entry.metadata()));
        }
        Ok(entries)
    }

    async fn read(&self, target: &str) -> RemoteResult<Vec<u8>> {
        let mut file = self
            .sftp
            .open(target)
            .await
            .map_err(|e| map_sftp_error(e, target))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data).await?;
        debug!("Read {} bytes from {}", data.len(), target);
        Ok(data)
    }

    async fn write(&self, target: &str, data: &[u8]) -> RemoteResult<()> {
        let mut file = self
            .sftp
            .open_with_flags(
                target,
                OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE,
            )
            .await
            .map_err(|e| map_sftp_error(e, target))?;

        file.write_all(data).await?;
        file.flush().await?;
        file.shutdown().await?;

        info!("Wrote {} bytes to {}", data.len(), target);
        Ok(())
    }

    async fn remove(&self, target: &str, recursive: bool) -> RemoteResult<()> {
        info!("Deleting {} (recursive={})", target, recursive);
        if recursive {
            return self.remove_recursive(target).await;
        }
        let entry = self.stat(target).await?;
        let result = if entry.is_dir {
            self.sftp.remove_dir(target).await
        } else {
            self.sftp.remove_file(target).await
        };
        result.map_err(|e| map_sftp_error(e, target))
    }

    async fn rename(&self, from: &str, to: &str) -> RemoteResult<()> {
        info!("Renaming {} to {}", from, to);
        self.sftp
            .rename(from, to)
            .await
            .map_err(|e| map_sftp_error(e, from))
    }

    async fn mkdir(&self, target: &str) -> RemoteResult<()> {
        info!("Creating directory {}", target);
        self.sftp
            .create_dir(target)
            .await
            .map_err(|e| map_sftp_error(e, target))
    }

    async fn stat(&self, target: &str) -> RemoteResult<RemoteEntry> {
        let attrs = self
            .sftp
            .metadata(target)
            .await
            .map_err(|e| map_sftp_error(e, target))?;
        Ok(Self::to_entry(target, &attrs))
    }

    async fn probe(&self) -> bool {
        self.is_connected()
    }

    async fn keep_alive(&self) -> RemoteResult<()> {
        self.sftp.canonicalize(".").await?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.handle.is_closed()
    }

    async fn close(&self) -> RemoteResult<()> {
        debug!("Closing SFTP session for {}", self.label);
        if let Err(e) = self.sftp.close().await {
            debug!("SFTP close for {} returned: {}", self.label, e);
        }
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await?;
        info!("SFTP session closed for {}", self.label);
        Ok(())
    }
}
