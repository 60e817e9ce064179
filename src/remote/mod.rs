//! Remote Connection Module
//!
//! Protocol-agnostic connection management: the [`ProtocolSession`] seam
//! both transports implement, error classification, retry backoff,
//! per-path operation locks, health tracking and the [`ConnectionManager`]
//! that ties them together.

pub mod classify;
pub mod error;
pub mod health;
pub mod identity;
pub mod lock;
pub mod manager;
pub mod path;
pub mod retry;
pub mod session;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;

pub use classify::{classify, classify_message, ErrorClass};
pub use error::{RemoteError, RemoteResult};
pub use health::{HealthMonitor, HealthSnapshot, KeepAliveOutcome};
pub use identity::{local_cache_path, ConnectionIdentity};
pub use lock::{OperationLockGuard, OperationLockRegistry, Verb};
pub use manager::ConnectionManager;
pub use retry::RetryPolicy;
pub use session::{DefaultConnector, ProtocolSession, RemoteEntry, SessionConnector};
pub use state::{SessionState, StateEvent};
