//! FTP/FTPS transport
//!
//! Control channel codec, RFC 4217 TLS (explicit and implicit), passive
//! data channels, listing parsers and the FTP
//! [`ProtocolSession`](crate::remote::ProtocolSession) variant.

pub mod codec;
pub mod parser;
pub mod session;
pub mod tls;
pub mod transfer;

#[cfg(test)]
pub(crate) mod testing;

pub use codec::{FtpCodec, FtpReply};
pub use parser::ListingEntry;
pub use session::{Features, FtpSession};
pub use tls::TlsContext;
