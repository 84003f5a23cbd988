//! SSH connection target

use serde::{Deserialize, Serialize};

/// Which authentication methods a connect attempt may use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Public key auto-detection, then password, then keyboard-interactive
    #[default]
    Auto,
    PublicKey,
    Password,
    KeyboardInteractive,
}

impl AuthMode {
    pub fn allows_public_key(self) -> bool {
        matches!(self, AuthMode::Auto | AuthMode::PublicKey)
    }

    pub fn allows_password(self) -> bool {
        matches!(self, AuthMode::Auto | AuthMode::Password)
    }

    pub fn allows_keyboard_interactive(self) -> bool {
        matches!(self, AuthMode::Auto | AuthMode::KeyboardInteractive)
    }
}

/// Everything needed to (re)establish a pooled session
#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectTarget {
    /// Remote host address
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Password, or passphrase for auto-detected keys
    #[serde(default)]
    pub credential: String,

    #[serde(default)]
    pub auth: AuthMode,
}

impl ConnectTarget {
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            username: username.into(),
            credential: String::new(),
            auth: AuthMode::Auto,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = credential.into();
        self
    }

    pub fn with_auth(mut self, auth: AuthMode) -> Self {
        self.auth = auth;
        self
    }

    /// Pool key: sessions are shared per (host, user)
    pub fn matches(&self, host: &str, username: &str) -> bool {
        self.host == host && self.username == username
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// Never print the credential
impl std::fmt::Debug for ConnectTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("auth", &self.auth)
            .finish()
    }
}

fn default_port() -> u16 {
    22
}
