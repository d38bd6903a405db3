use crate::endpoint::Endpoint;
use crate::error::{Result, TunnelError};
use crate::ssh::handler::{ClientHandler, HostKeyPolicy};
use crate::transport::{Dialer, TransportClient};
use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::keys::{load_secret_key, PrivateKey, PrivateKeyWithHashAlg};
use russh::{ChannelStream, Disconnect};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Credentials presented to the SSH server.
#[derive(Clone)]
pub enum AuthMethod {
    Password(String),
    PublicKey(Arc<PrivateKey>),
}

impl AuthMethod {
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password(password.into())
    }

    pub fn public_key(key: PrivateKey) -> Self {
        Self::PublicKey(Arc::new(key))
    }

    /// Load an OpenSSH private key from disk.
    pub fn key_file(path: impl AsRef<Path>, passphrase: Option<&str>) -> Result<Self> {
        let path = path.as_ref();
        let key = load_secret_key(path, passphrase)
            .map_err(|e| TunnelError::Key(format!("Failed to load key {:?}: {}", path, e)))?;
        Ok(Self::public_key(key))
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Password(_) => "password",
            Self::PublicKey(_) => "publickey",
        }
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthMethod({})", self.kind())
    }
}

/// Dials the jump server over SSH and authenticates with a fixed method.
#[derive(Clone)]
pub struct SshDialer {
    config: Arc<client::Config>,
    auth: AuthMethod,
    host_key_policy: HostKeyPolicy,
}

impl SshDialer {
    pub fn new(auth: AuthMethod) -> Self {
        Self {
            config: Arc::new(client::Config::default()),
            auth,
            host_key_policy: HostKeyPolicy::default(),
        }
    }

    pub fn with_config(mut self, config: client::Config) -> Self {
        self.config = Arc::new(config);
        self
    }

    pub fn with_host_key_policy(mut self, policy: HostKeyPolicy) -> Self {
        self.host_key_policy = policy;
        self
    }

    pub fn auth(&self) -> &AuthMethod {
        &self.auth
    }

    pub fn host_key_policy(&self) -> &HostKeyPolicy {
        &self.host_key_policy
    }

    async fn authenticate(&self, handle: &mut Handle<ClientHandler>, user: &str) -> Result<()> {
        let result = match &self.auth {
            AuthMethod::Password(password) => {
                handle
                    .authenticate_password(user, password.as_str())
                    .await
            }
            AuthMethod::PublicKey(key) => {
                let key_with_alg = PrivateKeyWithHashAlg::new(key.clone(), None);
                handle.authenticate_publickey(user, key_with_alg).await
            }
        }
        .map_err(|e| TunnelError::Auth(e.to_string()))?;

        if result.success() {
            Ok(())
        } else {
            Err(TunnelError::Auth(format!(
                "{} authentication rejected for user {:?}",
                self.auth.kind(),
                user
            )))
        }
    }
}

impl fmt::Debug for SshDialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshDialer")
            .field("auth", &self.auth)
            .field("host_key_policy", &self.host_key_policy)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Dialer for SshDialer {
    type Client = SshClient;

    async fn dial(&self, server: &Endpoint) -> Result<SshClient> {
        let addr = server.to_string();
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| TunnelError::Connection(format!("TCP connection to {} failed: {}", addr, e)))?;

        let handler = ClientHandler::new(server.clone(), self.host_key_policy.clone());
        let mut handle = client::connect_stream(self.config.clone(), stream, handler)
            .await
            .map_err(|e| TunnelError::Connection(e.to_string()))?;

        let user = server.user.clone().unwrap_or_default();
        self.authenticate(&mut handle, &user).await?;
        info!(server = %addr, user = %user, auth = self.auth.kind(), "SSH session established");

        Ok(SshClient {
            handle,
            server: server.clone(),
        })
    }
}

/// An authenticated SSH connection to the jump server.
pub struct SshClient {
    handle: Handle<ClientHandler>,
    server: Endpoint,
}

impl SshClient {
    pub fn server(&self) -> &Endpoint {
        &self.server
    }
}

#[async_trait]
impl TransportClient for SshClient {
    type Stream = ChannelStream<client::Msg>;

    async fn open_channel(&self, remote: &Endpoint) -> Result<Self::Stream> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(remote.host.as_str(), remote.port as u32, "127.0.0.1", 0)
            .await
            .map_err(|e| {
                TunnelError::Channel(format!("Failed to open direct-tcpip channel to {}: {}", remote, e))
            })?;
        debug!(server = %self.server, remote = %remote, "direct-tcpip channel open");
        Ok(channel.into_stream())
    }

    async fn close(&self) -> Result<()> {
        self.handle
            .disconnect(Disconnect::ByApplication, "tunnel closed", "en")
            .await
            .map_err(|e| TunnelError::Connection(format!("Failed to disconnect from {}: {}", self.server, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_debug_redacts_password() {
        let auth = AuthMethod::password("hunter2");
        let rendered = format!("{:?}", auth);
        assert_eq!(rendered, "AuthMethod(password)");
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_key_file_missing_is_key_error() {
        let err = AuthMethod::key_file("/nonexistent/id_ed25519", None).unwrap_err();
        assert!(matches!(err, TunnelError::Key(_)), "unexpected error: {err}");
    }

    #[test]
    fn test_dialer_defaults_to_accept_all() {
        let dialer = SshDialer::new(AuthMethod::password("secret"));
        assert!(matches!(dialer.host_key_policy(), HostKeyPolicy::AcceptAll));
    }

    #[tokio::test]
    async fn test_dial_refused_is_connection_error() {
        // Bind then drop to get a port nothing listens on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let dialer = SshDialer::new(AuthMethod::password("secret"));
        let result = dialer.dial(&Endpoint::new("127.0.0.1", port)).await;
        assert!(matches!(result, Err(TunnelError::Connection(_))));
    }
}
