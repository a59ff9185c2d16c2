//! Process-wide defaults and environment driven settings.

use std::path::{Path, PathBuf};
use std::time::Duration;

use yup_oauth2::ApplicationSecret;

use crate::error::CredentialError;

pub const APP_NAME: &str = "gsend";

pub const GOOGLE_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/auth";
pub const GOOGLE_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
pub const GMAIL_API_BASE_URL: &str = "https://gmail.googleapis.com";

pub const SCOPE_GMAIL_SEND: &str = "https://www.googleapis.com/auth/gmail.send";
pub const SCOPE_GMAIL_READONLY: &str = "https://www.googleapis.com/auth/gmail.readonly";

pub const ENV_FLOW_HOST: &str = "GSEND_OAUTH_FLOW_HOST";
pub const ENV_FLOW_PORT: &str = "GSEND_OAUTH_FLOW_PORT";
pub const ENV_FLOW_BIND: &str = "GSEND_OAUTH_FLOW_BIND";

pub const DEFAULT_FLOW_HOST: &str = "localhost";
pub const DEFAULT_FLOW_PORT: u16 = 8080;

pub const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

pub fn default_scopes() -> Vec<String> {
    vec![SCOPE_GMAIL_SEND.to_string(), SCOPE_GMAIL_READONLY.to_string()]
}

// The client identity baked in at build time. Builds without it must be given
// a client secret file.
pub fn default_client_secret() -> ApplicationSecret {
    ApplicationSecret {
        client_id: option_env!("GSEND_CLIENT_ID").unwrap_or_default().to_string(),
        client_secret: option_env!("GSEND_CLIENT_SECRET")
            .unwrap_or_default()
            .to_string(),
        auth_uri: GOOGLE_AUTH_URI.to_string(),
        token_uri: GOOGLE_TOKEN_URI.to_string(),
        ..Default::default()
    }
}

/// Reads a Google client secret file (`{"installed": {...}}` or `{"web": {...}}`).
pub async fn load_client_secret(path: &Path) -> Result<ApplicationSecret, CredentialError> {
    yup_oauth2::read_application_secret(path)
        .await
        .map_err(|e| CredentialError::io(path, e))
}

pub fn default_credentials_path() -> PathBuf {
    match dirs::config_dir() {
        Some(dir) => dir.join(APP_NAME).join("credentials.json"),
        None => PathBuf::from("credentials.json"),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} must be a port number, got {value:?}")]
    InvalidPort { name: &'static str, value: String },
}

/// Where the local OAuth callback listener lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowConfig {
    /// Host used in the redirect URI.
    pub host: String,
    pub port: u16,
    /// Address to bind the listener to. Falls back to `host`.
    pub bind: Option<String>,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_FLOW_HOST.to_string(),
            port: DEFAULT_FLOW_PORT,
            bind: None,
        }
    }
}

impl FlowConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(host) = lookup(ENV_FLOW_HOST) {
            config.host = host;
        }
        if let Some(port) = lookup(ENV_FLOW_PORT) {
            config.port = port.trim().parse().map_err(|_| ConfigError::InvalidPort {
                name: ENV_FLOW_PORT,
                value: port.clone(),
            })?;
        }
        config.bind = lookup(ENV_FLOW_BIND).filter(|b| !b.is_empty());
        Ok(config)
    }

    pub fn bind_host(&self) -> &str {
        self.bind.as_deref().unwrap_or(&self.host)
    }
}
