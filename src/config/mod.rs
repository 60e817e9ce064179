//! Configuration Management Module
//!
//! Connection configuration types, persistent storage of saved connections,
//! and secure credential storage via the system keychain.

pub mod keychain;
pub mod storage;
pub mod types;

pub use keychain::{CredentialError, CredentialStore, KeychainStore, MemoryCredentialStore};
pub use storage::{config_dir, connections_file, ConfigStorage, StorageError};
pub use types::{
    AdvancedOptions, AuthConfig, ConfigError, ConfigFile, ConnectionConfig, Protocol,
    TransportSecurity, CONFIG_VERSION,
};
