//! Protocol session capability interface
//!
//! Both wire protocols implement [`ProtocolSession`]; the variant is chosen
//! once at connect time by a [`SessionConnector`], after which the
//! connection manager never branches on protocol again.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{RemoteError, RemoteResult};
use super::path;
use crate::config::{ConnectionConfig, Protocol};
use crate::ftp::FtpSession;
use crate::sftp::{KeyConverter, SftpSession, StandardKeyConverter};

/// One entry of a directory listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEntry {
    pub name: String,
    /// Absolute remote path
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    /// Modification time, normalized to UTC regardless of protocol format
    pub modified: Option<DateTime<Utc>>,
}

impl RemoteEntry {
    pub fn file(path: &str, size: u64, modified: Option<DateTime<Utc>>) -> Self {
        Self {
            name: path::file_name(path).to_string(),
            path: path.to_string(),
            is_dir: false,
            size,
            modified,
        }
    }

    pub fn directory(path: &str, modified: Option<DateTime<Utc>>) -> Self {
        Self {
            name: path::file_name(path).to_string(),
            path: path.to_string(),
            is_dir: true,
            size: 0,
            modified,
        }
    }
}

/// Narrow file-operation surface shared by the SFTP and FTP/FTPS variants.
///
/// All paths handed to a session are absolute and normalized.
#[async_trait]
pub trait ProtocolSession: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// List a directory, excluding `.` and `..`
    async fn list(&self, path: &str) -> RemoteResult<Vec<RemoteEntry>>;

    async fn read(&self, path: &str) -> RemoteResult<Vec<u8>>;

    /// Create or truncate `path` and write `data`
    async fn write(&self, path: &str, data: &[u8]) -> RemoteResult<()>;

    async fn remove(&self, path: &str, recursive: bool) -> RemoteResult<()>;

    async fn rename(&self, from: &str, to: &str) -> RemoteResult<()>;

    async fn mkdir(&self, path: &str) -> RemoteResult<()>;

    async fn stat(&self, path: &str) -> RemoteResult<RemoteEntry>;

    async fn exists(&self, path: &str) -> RemoteResult<bool> {
        match self.stat(path).await {
            Ok(_) => Ok(true),
            Err(RemoteError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Cheap liveness check used before trusting an existing session
    async fn probe(&self) -> bool;

    /// Protocol-appropriate no-op sent by the keep-alive scheduler
    async fn keep_alive(&self) -> RemoteResult<()>;

    /// Whether the underlying transport still reports connected
    fn is_connected(&self) -> bool;

    async fn close(&self) -> RemoteResult<()>;

    /// Copy `src` to `dst` through the client.
    ///
    /// Neither protocol has a server-side copy, so files are downloaded and
    /// re-uploaded; directories are recreated entry by entry.
    async fn copy(&self, src: &str, dst: &str, recursive: bool) -> RemoteResult<()> {
        let entry = self.stat(src).await?;
        if !entry.is_dir {
            let data = self.read(src).await?;
            return self.write(dst, &data).await;
        }

        if !recursive {
            return Err(RemoteError::Unsupported(format!(
                "{} is a directory; copy it recursively",
                src
            )));
        }
        if path::is_within(src, dst) {
            return Err(RemoteError::Unsupported(format!(
                "cannot copy {} into itself ({})",
                src, dst
            )));
        }

        if !self.exists(dst).await? {
            self.mkdir(dst).await?;
        }
        for child in self.list(src).await? {
            let target = path::join(dst, &child.name);
            self.copy(&child.path, &target, true).await?;
        }
        Ok(())
    }
}

/// Opens protocol sessions for a validated config
#[async_trait]
pub trait SessionConnector: Send + Sync {
    /// Establish and authenticate a session. `on_authenticating` fires once
    /// the transport is up and credentials are about to be presented.
    async fn open(
        &self,
        config: &ConnectionConfig,
        on_authenticating: &(dyn Fn() + Send + Sync),
    ) -> RemoteResult<Arc<dyn ProtocolSession>>;
}

/// Connector for the real SFTP and FTP/FTPS transports
pub struct DefaultConnector {
    key_converter: Arc<dyn KeyConverter>,
}

impl DefaultConnector {
    pub fn new(key_converter: Arc<dyn KeyConverter>) -> Self {
        Self { key_converter }
    }
}

impl Default for DefaultConnector {
    fn default() -> Self {
        Self::new(Arc::new(StandardKeyConverter))
    }
}

#[async_trait]
impl SessionConnector for DefaultConnector {
    async fn open(
        &self,
        config: &ConnectionConfig,
        on_authenticating: &(dyn Fn() + Send + Sync),
    ) -> RemoteResult<Arc<dyn ProtocolSession>> {
        match config.protocol {
            Protocol::Sftp => {
                let session =
                    SftpSession::connect(config, self.key_converter.as_ref(), on_authenticating)
                        .await?;
                Ok(Arc::new(session))
            }
            Protocol::Ftp => {
                let session = FtpSession::connect(config, on_authenticating).await?;
                Ok(Arc::new(session))
            }
        }
    }
}
