//! SFTP transport
//!
//! SSH connection setup, private key conversion and the SFTP
//! [`ProtocolSession`](crate::remote::ProtocolSession) variant.

pub mod client;
pub mod keys;
pub mod session;

pub use client::ClientHandler;
pub use keys::{detect_format, KeyConversionError, KeyConverter, KeyFormat, StandardKeyConverter};
pub use session::SftpSession;
