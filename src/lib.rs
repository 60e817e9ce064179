//! Oxide Remote - connection and file-operation layer for SFTP and FTP/FTPS
//!
//! A [`ConnectionManager`] owns one remote session and keeps it usable:
//! retries with backoff, keep-alive, idle and liveness checks before each
//! operation, and per-path locks that stop overlapping writes.

pub mod config;
pub mod ftp;
pub mod remote;
pub mod sftp;

pub use config::{
    AdvancedOptions, AuthConfig, ConfigStorage, ConnectionConfig, CredentialStore, KeychainStore,
    MemoryCredentialStore, Protocol, TransportSecurity,
};
pub use remote::{
    ConnectionManager, HealthSnapshot, ProtocolSession, RemoteEntry, RemoteError, RemoteResult,
    SessionState, StateEvent, Verb,
};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber.
///
/// Filtering follows `RUST_LOG` and defaults to `info`. Calling it again
/// after a subscriber is installed is a no-op.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
