//! SSH Client implementation using russh

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle, KeyboardInteractiveAuthResponse};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use tracing::{debug, info, warn};

use super::auth::detect_keys;
use super::config::{AuthMode, ConnectTarget};
use super::error::SshError;
use super::transport::{Connector, Transport};
use crate::sftp::remote::RemoteFs;
use crate::sftp::session::SftpSession;

/// Keyboard-interactive rounds answered with the credential before giving up
const KBI_MAX_ROUNDS: usize = 2;

/// Connects with russh
#[derive(Debug, Default, Clone)]
pub struct RusshConnector;

impl RusshConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for RusshConnector {
    async fn connect(&self, target: &ConnectTarget) -> Result<Box<dyn Transport>, SshError> {
        let addr = target.address();
        info!("Connecting to SSH server at {}", addr);

        let socket_addr = tokio::net::lookup_host(&addr)
            .await
            .map_err(|e| SshError::ConnectionFailed(format!("Failed to resolve address: {}", e)))?
            .next()
            .ok_or_else(|| SshError::ConnectionFailed("No address found".to_string()))?;

        let ssh_config = client::Config {
            inactivity_timeout: None, // heartbeat keepalive handles liveness
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };

        let handler = ClientHandler::new(target.host.clone(), target.port);
        let mut handle = client::connect(Arc::new(ssh_config), socket_addr, handler)
            .await
            .map_err(|e| SshError::ConnectionFailed(e.to_string()))?;

        debug!("SSH handshake completed");

        authenticate(&mut handle, target).await?;

        info!("SSH authentication successful for {}@{}", target.username, target.host);
        Ok(Box::new(RusshTransport { handle }))
    }
}

/// One authentication attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthStep {
    /// Index into the detected keys
    PublicKey(usize),
    Password,
    KeyboardInteractive,
}

impl AuthStep {
    fn method_name(self) -> &'static str {
        match self {
            AuthStep::PublicKey(_) => "publickey",
            AuthStep::Password => "password",
            AuthStep::KeyboardInteractive => "keyboard-interactive",
        }
    }
}

/// Attempts in priority order: every detected key, then password, then
/// keyboard-interactive. Methods that need the credential are skipped when
/// it is empty.
fn auth_plan(
    mode: AuthMode,
    key_count: usize,
    credential: &str,
) -> Result<Vec<AuthStep>, SshError> {
    let mut plan = Vec::new();
    if mode.allows_public_key() {
        plan.extend((0..key_count).map(AuthStep::PublicKey));
    }
    if !credential.is_empty() {
        if mode.allows_password() {
            plan.push(AuthStep::Password);
        }
        if mode.allows_keyboard_interactive() {
            plan.push(AuthStep::KeyboardInteractive);
        }
    }

    if plan.is_empty() {
        return Err(SshError::UnknownAuthMethod(format!(
            "no key found and no credential given (mode {:?})",
            mode
        )));
    }
    Ok(plan)
}

async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    target: &ConnectTarget,
) -> Result<(), SshError> {
    let credential = target.credential.as_str();

    let keys = if target.auth.allows_public_key() {
        let passphrase = (!credential.is_empty()).then(|| credential.to_string());
        tokio::task::spawn_blocking(move || detect_keys(passphrase.as_deref()))
            .await
            .map_err(|e| SshError::KeyError(format!("Key detection task failed: {}", e)))?
    } else {
        Vec::new()
    };

    let plan = auth_plan(target.auth, keys.len(), credential).inspect_err(|_| {
        warn!("No authentication method available for {}@{}", target.username, target.host);
    })?;

    for step in &plan {
        let accepted = match *step {
            AuthStep::PublicKey(index) => {
                let Some(detected) = keys.get(index) else { continue };
                debug!("Offering key {:?}", detected.path);
                let key = PrivateKeyWithHashAlg::new(Arc::new(detected.key.clone()), None);
                handle
                    .authenticate_publickey(&target.username, key)
                    .await
                    .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
                    .success()
            }
            AuthStep::Password => handle
                .authenticate_password(&target.username, credential)
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
                .success(),
            AuthStep::KeyboardInteractive => keyboard_interactive(handle, target).await?,
        };
        if accepted {
            return Ok(());
        }
    }

    let mut attempted: Vec<&str> = plan.iter().map(|step| step.method_name()).collect();
    attempted.dedup();
    Err(SshError::AuthenticationFailed(format!(
        "server rejected {}",
        attempted.join(", ")
    )))
}

/// Answer every prompt with the credential.
async fn keyboard_interactive(
    handle: &mut Handle<ClientHandler>,
    target: &ConnectTarget,
) -> Result<bool, SshError> {
    let mut response = handle
        .authenticate_keyboard_interactive_start(&target.username, None::<String>)
        .await
        .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?;

    for round in 0..KBI_MAX_ROUNDS {
        match response {
            KeyboardInteractiveAuthResponse::Success => return Ok(true),
            KeyboardInteractiveAuthResponse::Failure { .. } => return Ok(false),
            KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => {
                debug!("KBI round {}: {} prompt(s)", round + 1, prompts.len());
                let answers = prompts.iter().map(|_| target.credential.clone()).collect();
                response = handle
                    .authenticate_keyboard_interactive_respond(answers)
                    .await
                    .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?;
            }
        }
    }

    Ok(matches!(response, KeyboardInteractiveAuthResponse::Success))
}

/// An authenticated russh connection
pub struct RusshTransport {
    handle: Handle<ClientHandler>,
}

#[async_trait]
impl Transport for RusshTransport {
    async fn probe(&self) -> Result<(), SshError> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| SshError::ChannelError(e.to_string()))?;
        if let Err(e) = channel.close().await {
            debug!("Probe channel close failed: {}", e);
        }
        Ok(())
    }

    async fn open_sftp(&self) -> Result<Arc<dyn RemoteFs>, SshError> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| SshError::ChannelError(e.to_string()))?;
        let sftp = SftpSession::open(channel).await?;
        Ok(Arc::new(sftp))
    }

    fn is_connected(&self) -> bool {
        !self.handle.is_closed()
    }

    async fn disconnect(&self) {
        if let Err(e) = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await
        {
            debug!("Disconnect failed: {}", e);
        }
    }
}

/// Client handler for russh callbacks
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
    type Error = SshError;

    // 主机密钥不做 known_hosts 校验，只记录
    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        info!(
            "Accepting {:?} host key for {}:{}",
            server_public_key.algorithm(),
            self.host,
            self.port
        );
        Ok(true)
    }
}
