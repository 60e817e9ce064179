//! SSH transport for SFTP sessions, using russh

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use russh::client;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::ssh_key::HashAlg;
use russh::keys::PublicKey;
use tracing::{debug, info};

use super::keys::{load_private_key, KeyConverter};
use crate::config::{AuthConfig, ConnectionConfig};
use crate::remote::{RemoteError, RemoteResult};

/// Client handler for russh callbacks
///
/// Host keys are accepted on first use; known-hosts management belongs to
/// the UI layer.
pub struct ClientHandler {
    host: String,
    port: u16,
}

impl ClientHandler {
    pub fn new(host: String, port: u16) -> Self {
        Self { host, port }
    }
}

impl client::Handler for ClientHandler {
    type Error = RemoteError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        info!(
            "Accepting host key for {}:{} ({})",
            self.host,
            self.port,
            server_public_key.fingerprint(HashAlg::Sha256)
        );
        Ok(true)
    }
}

/// Open an SSH connection and authenticate it.
///
/// The caller bounds the whole exchange with the connect timeout.
pub async fn connect_and_authenticate(
    config: &ConnectionConfig,
    converter: &dyn KeyConverter,
    on_authenticating: &(dyn Fn() + Send + Sync),
) -> RemoteResult<client::Handle<ClientHandler>> {
    let port = config.port();
    info!("Connecting to SSH server at {}:{}", config.host, port);

    // Transport keepalives stay on as a backstop; liveness decisions come
    // from the manager's own keep-alive probe.
    let ssh_config = client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(config.keep_alive_interval().max(Duration::from_secs(5))),
        keepalive_max: 3,
        ..Default::default()
    };

    let handler = ClientHandler::new(config.host.clone(), port);
    let mut handle = client::connect(
        Arc::new(ssh_config),
        (config.host.as_str(), port),
        handler,
    )
    .await?;

    debug!("SSH handshake completed");
    on_authenticating();

    let username = config.login_name();
    let authenticated = match &config.auth {
        AuthConfig::Password { password } => {
            let password = password.as_deref().ok_or_else(|| {
                RemoteError::Authentication(format!(
                    "no password available for {}@{}",
                    username, config.host
                ))
            })?;
            handle.authenticate_password(username, password).await?
        }
        AuthConfig::Key {
            key_path,
            passphrase,
        } => {
            let key = load_private_key(Path::new(key_path), passphrase.as_deref(), converter)
                .await?;
            let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);
            handle.authenticate_publickey(username, key_with_hash).await?
        }
        AuthConfig::Anonymous => {
            return Err(RemoteError::Authentication(
                "anonymous login is not available over SFTP".to_string(),
            ));
        }
    };

    if !authenticated.success() {
        return Err(RemoteError::Authentication(format!(
            "credentials for {}@{} rejected by server",
            username, config.host
        )));
    }

    info!("SSH authentication successful for {}@{}", username, config.host);
    Ok(handle)
}
