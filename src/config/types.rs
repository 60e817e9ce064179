//! Connection configuration types
//!
//! Auth and transport security are explicit variants rather than a bag of
//! optional flags; [`ConnectionConfig::validate`] rejects combinations that
//! make no sense for the chosen protocol.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::remote::identity::ConnectionIdentity;
use crate::remote::path;

/// Current config file version
pub const CONFIG_VERSION: u32 = 1;

pub const DEFAULT_SFTP_PORT: u16 = 22;
pub const DEFAULT_FTP_PORT: u16 = 21;
pub const DEFAULT_FTPS_IMPLICIT_PORT: u16 = 990;

const DEFAULT_SFTP_CONNECT_TIMEOUT_SECS: u64 = 20;
const DEFAULT_FTP_CONNECT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_OPERATION_TIMEOUT_SECS: u64 = 60;
const DEFAULT_KEEP_ALIVE_SECS: u64 = 30;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1_000;
const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30 * 60;

/// Username sent for anonymous FTP logins
pub const ANONYMOUS_USER: &str = "anonymous";

/// Configuration validation errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Host must not be empty")]
    EmptyHost,

    #[error("Username must not be empty")]
    EmptyUsername,

    #[error("Port must be between 1 and 65535")]
    InvalidPort,

    #[error("{auth} authentication is not available over {protocol}")]
    UnsupportedAuth { auth: &'static str, protocol: Protocol },

    #[error("TLS ({security}) is only available for FTP connections")]
    UnsupportedSecurity { security: TransportSecurity },

    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),

    #[error("Remote root must be an absolute path: {0}")]
    RelativeRoot(String),
}

/// Wire protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Sftp,
    Ftp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sftp => "sftp",
            Self::Ftp => "ftp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authentication methods
///
/// Secrets are never written to disk; a persisted record carries `None`
/// and the secret is resolved from the credential store at connect time.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    Password {
        #[serde(default, skip_serializing)]
        password: Option<String>,
    },

    /// Private key authentication (SFTP only)
    Key {
        /// Path to private key file (OpenSSH or PuTTY format)
        key_path: String,
        /// Passphrase for encrypted keys
        #[serde(default, skip_serializing)]
        passphrase: Option<String>,
    },

    /// Anonymous login (FTP only)
    Anonymous,
}

impl AuthConfig {
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password {
            password: Some(password.into()),
        }
    }

    pub fn key(key_path: impl Into<String>, passphrase: Option<String>) -> Self {
        Self::Key {
            key_path: key_path.into(),
            passphrase,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Password { .. } => "password",
            Self::Key { .. } => "key",
            Self::Anonymous => "anonymous",
        }
    }

    /// Whether a password or key passphrase is absent and should be looked
    /// up in the credential store
    pub fn needs_secret(&self) -> bool {
        matches!(
            self,
            Self::Password { password: None } | Self::Key { passphrase: None, .. }
        )
    }

    /// Fill in a secret resolved from the credential store
    pub fn with_secret(self, secret: String) -> Self {
        match self {
            Self::Password { .. } => Self::Password {
                password: Some(secret),
            },
            Self::Key { key_path, .. } => Self::Key {
                key_path,
                passphrase: Some(secret),
            },
            Self::Anonymous => Self::Anonymous,
        }
    }

    /// The secret currently held, if any
    pub fn secret(&self) -> Option<&str> {
        match self {
            Self::Password { password } => password.as_deref(),
            Self::Key { passphrase, .. } => passphrase.as_deref(),
            Self::Anonymous => None,
        }
    }
}

// Keep secrets out of logs
impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password { password } => f
                .debug_struct("Password")
                .field("password", &password.as_ref().map(|_| "***"))
                .finish(),
            Self::Key {
                key_path,
                passphrase,
            } => f
                .debug_struct("Key")
                .field("key_path", key_path)
                .field("passphrase", &passphrase.as_ref().map(|_| "***"))
                .finish(),
            Self::Anonymous => f.write_str("Anonymous"),
        }
    }
}

/// Transport security for FTP connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportSecurity {
    #[default]
    Plain,
    /// `AUTH TLS` upgrade after connecting (default port 21)
    FtpsExplicit,
    /// TLS from the first byte (default port 990)
    FtpsImplicit,
}

impl TransportSecurity {
    pub fn is_tls(self) -> bool {
        !matches!(self, Self::Plain)
    }
}

impl fmt::Display for TransportSecurity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Plain => "plain",
            Self::FtpsExplicit => "ftps_explicit",
            Self::FtpsImplicit => "ftps_implicit",
        })
    }
}

/// Optional tuning; absent fields fall back to protocol-aware defaults
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvancedOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_alive_interval_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_base_delay_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_max_delay_ms: Option<u64>,
    /// Sessions idle longer than this are re-established before use
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_timeout_secs: Option<u64>,
}

/// A saved remote connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "new_id")]
    pub id: String,

    /// Display name
    #[serde(default)]
    pub label: String,

    pub protocol: Protocol,

    pub host: String,

    /// Explicit port; `None` uses the protocol default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(default)]
    pub username: String,

    pub auth: AuthConfig,

    #[serde(default)]
    pub security: TransportSecurity,

    /// Base for relative paths
    #[serde(default = "default_remote_root")]
    pub remote_root: String,

    /// Accept self-signed or otherwise unverifiable FTPS certificates
    #[serde(default)]
    pub accept_invalid_certs: bool,

    #[serde(default)]
    pub advanced: AdvancedOptions,
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn default_remote_root() -> String {
    "/".to_string()
}

impl ConnectionConfig {
    fn base(protocol: Protocol, host: String, username: String, auth: AuthConfig) -> Self {
        Self {
            id: new_id(),
            label: String::new(),
            protocol,
            host,
            port: None,
            username,
            auth,
            security: TransportSecurity::Plain,
            remote_root: default_remote_root(),
            accept_invalid_certs: false,
            advanced: AdvancedOptions::default(),
        }
    }

    /// SFTP connection with password or key auth
    pub fn sftp(
        host: impl Into<String>,
        username: impl Into<String>,
        auth: AuthConfig,
    ) -> Result<Self, ConfigError> {
        let config = Self::base(Protocol::Sftp, host.into(), username.into(), auth);
        config.validate()?;
        Ok(config)
    }

    /// FTP or FTPS connection with password or anonymous auth
    pub fn ftp(
        host: impl Into<String>,
        username: impl Into<String>,
        auth: AuthConfig,
        security: TransportSecurity,
    ) -> Result<Self, ConfigError> {
        let mut config = Self::base(Protocol::Ftp, host.into(), username.into(), auth);
        config.security = security;
        config.validate()?;
        Ok(config)
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_remote_root(mut self, root: impl Into<String>) -> Self {
        self.remote_root = root.into();
        self
    }

    pub fn with_advanced(mut self, advanced: AdvancedOptions) -> Self {
        self.advanced = advanced;
        self
    }

    /// Check the config for illegal combinations
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if self.username.trim().is_empty() && !matches!(self.auth, AuthConfig::Anonymous) {
            return Err(ConfigError::EmptyUsername);
        }
        if self.port == Some(0) {
            return Err(ConfigError::InvalidPort);
        }

        match (self.protocol, &self.auth) {
            (Protocol::Sftp, AuthConfig::Anonymous) | (Protocol::Ftp, AuthConfig::Key { .. }) => {
                return Err(ConfigError::UnsupportedAuth {
                    auth: self.auth.kind(),
                    protocol: self.protocol,
                });
            }
            _ => {}
        }
        if self.protocol == Protocol::Sftp && self.security.is_tls() {
            return Err(ConfigError::UnsupportedSecurity {
                security: self.security,
            });
        }

        let a = &self.advanced;
        let numeric = [
            ("connect_timeout_secs", a.connect_timeout_secs),
            ("operation_timeout_secs", a.operation_timeout_secs),
            ("keep_alive_interval_secs", a.keep_alive_interval_secs),
            ("retry_base_delay_ms", a.retry_base_delay_ms),
            ("retry_max_delay_ms", a.retry_max_delay_ms),
            ("idle_timeout_secs", a.idle_timeout_secs),
        ];
        for (name, value) in numeric {
            if value == Some(0) {
                return Err(ConfigError::ZeroValue(name));
            }
        }

        if !path::is_absolute(&self.remote_root) {
            return Err(ConfigError::RelativeRoot(self.remote_root.clone()));
        }
        Ok(())
    }

    /// Effective port
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(match (self.protocol, self.security) {
            (Protocol::Sftp, _) => DEFAULT_SFTP_PORT,
            (Protocol::Ftp, TransportSecurity::FtpsImplicit) => DEFAULT_FTPS_IMPLICIT_PORT,
            (Protocol::Ftp, _) => DEFAULT_FTP_PORT,
        })
    }

    /// Effective login name
    pub fn login_name(&self) -> &str {
        match (&self.auth, self.username.trim().is_empty()) {
            (AuthConfig::Anonymous, true) => ANONYMOUS_USER,
            _ => &self.username,
        }
    }

    pub fn identity(&self) -> ConnectionIdentity {
        ConnectionIdentity::new(self.protocol, self.login_name(), &self.host, self.port())
    }

    pub fn display_name(&self) -> String {
        if self.label.is_empty() {
            self.identity().lock_key()
        } else {
            self.label.clone()
        }
    }

    /// Normalized remote root
    pub fn root(&self) -> String {
        path::normalize(&self.remote_root)
    }

    pub fn connect_timeout(&self) -> Duration {
        let default = match self.protocol {
            Protocol::Sftp => DEFAULT_SFTP_CONNECT_TIMEOUT_SECS,
            Protocol::Ftp => DEFAULT_FTP_CONNECT_TIMEOUT_SECS,
        };
        Duration::from_secs(self.advanced.connect_timeout_secs.unwrap_or(default))
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(
            self.advanced
                .operation_timeout_secs
                .unwrap_or(DEFAULT_OPERATION_TIMEOUT_SECS),
        )
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(
            self.advanced
                .keep_alive_interval_secs
                .unwrap_or(DEFAULT_KEEP_ALIVE_SECS),
        )
    }

    pub fn max_retries(&self) -> u32 {
        self.advanced.max_retries.unwrap_or(DEFAULT_MAX_RETRIES)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(
            self.advanced
                .retry_base_delay_ms
                .unwrap_or(DEFAULT_RETRY_BASE_DELAY_MS),
        )
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(
            self.advanced
                .retry_max_delay_ms
                .unwrap_or(DEFAULT_RETRY_MAX_DELAY_MS),
        )
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(
            self.advanced
                .idle_timeout_secs
                .unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS),
        )
    }
}

/// On-disk config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    pub version: u32,
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            connections: Vec::new(),
        }
    }
}
