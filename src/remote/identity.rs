//! Connection identity
//!
//! `(protocol, username, host, port)` is the one stable identity of a
//! connection. Three derived keys are views over it:
//!
//! - `user@host:port` keys locks and health in logs
//! - `protocol-user-host-port` keys the credential store, so an SFTP and an
//!   FTP account on the same host never collide
//! - a filesystem-safe directory name isolates each connection's local cache

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::error::{RemoteError, RemoteResult};
use crate::config::Protocol;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionIdentity {
    pub protocol: Protocol,
    pub username: String,
    pub host: String,
    pub port: u16,
}

impl ConnectionIdentity {
    pub fn new(
        protocol: Protocol,
        username: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            protocol,
            username: username.into(),
            host: host.into(),
            port,
        }
    }

    /// `username@host:port`
    pub fn lock_key(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }

    /// `protocol-username-host-port`
    pub fn credential_key(&self) -> String {
        format!(
            "{}-{}-{}-{}",
            self.protocol, self.username, self.host, self.port
        )
    }

    /// Filesystem-safe directory name for this connection's cache subtree
    pub fn cache_dir_name(&self) -> String {
        sanitize_component(&self.lock_key())
    }
}

/// Substitute characters that are unsafe in a single path component:
/// `@` becomes `-at-`, separators and `:` become `-`, and other reserved
/// characters become `_`.
pub fn sanitize_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 4);
    for c in raw.chars() {
        match c {
            '@' => out.push_str("-at-"),
            ':' | '/' | '\\' => out.push('-'),
            '<' | '>' | '"' | '|' | '?' | '*' => out.push('_'),
            c if c.is_control() => out.push('_'),
            c => out.push(c),
        }
    }
    match out.as_str() {
        "" | "." | ".." => out.replace('.', "_") + "_",
        _ => out,
    }
}

/// Local path mirroring `remote_path` inside the connection's cache subtree.
///
/// The result always lies under `base/<cache_dir_name>`; remote paths that
/// would climb out of it are rejected.
pub fn local_cache_path(
    base: &Path,
    identity: &ConnectionIdentity,
    remote_path: &str,
) -> RemoteResult<PathBuf> {
    let mut path = base.join(identity.cache_dir_name());
    for segment in remote_path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                return Err(RemoteError::Unsupported(format!(
                    "remote path escapes the cache directory: {}",
                    remote_path
                )))
            }
            other => path.push(sanitize_segment(other)),
        }
    }
    Ok(path)
}

// Remote names keep `@` and `:` readable but must not carry separators.
fn sanitize_segment(segment: &str) -> String {
    segment
        .chars()
        .map(|c| match c {
            '\\' | ':' | '<' | '>' | '"' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> ConnectionIdentity {
        ConnectionIdentity::new(Protocol::Sftp, "deploy", "example.com", 22)
    }

    #[test]
    fn test_derived_keys() {
        let id = identity();
        assert_eq!(id.lock_key(), "deploy@example.com:22");
        assert_eq!(id.credential_key(), "sftp-deploy-example.com-22");
        assert_eq!(id.cache_dir_name(), "deploy-at-example.com-22");

        let ftp = ConnectionIdentity::new(Protocol::Ftp, "deploy", "example.com", 22);
        assert_ne!(ftp.credential_key(), id.credential_key());
        assert_eq!(ftp.lock_key(), id.lock_key());
    }

    #[test]
    fn test_sanitize_reserved() {
        assert_eq!(sanitize_component("a@b:c/d\\e"), "a-at-b-c-d-e");
        assert_eq!(sanitize_component("x*y?z|w"), "x_y_z_w");
        assert_eq!(sanitize_component(".."), "___");

        let v6 = ConnectionIdentity::new(Protocol::Ftp, "me", "fe80::1", 21);
        assert_eq!(v6.cache_dir_name(), "me-at-fe80--1-21");
    }

    #[test]
    fn test_local_cache_path_isolated() {
        let base = Path::new("/tmp/cache");
        let path = local_cache_path(base, &identity(), "/var/www/index.html").unwrap();
        assert_eq!(
            path,
            PathBuf::from("/tmp/cache/deploy-at-example.com-22/var/www/index.html")
        );

        assert!(local_cache_path(base, &identity(), "/var/../../etc/passwd").is_err());
    }
}
