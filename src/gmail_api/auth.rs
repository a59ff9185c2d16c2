use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::engine::Engine;
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use url::Url;
use yup_oauth2::ApplicationSecret;

use super::callback::{wait_for_callback, CallbackParams};
use super::credentials::Credential;
use super::token::request_token;
use crate::config::{ConfigError, FlowConfig, GOOGLE_AUTH_URI, GOOGLE_TOKEN_URI};
use crate::error::CredentialError;

// Define a trait for the interactive authorization to allow mocking
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(
        &self,
        client: &ApplicationSecret,
        scopes: &[String],
    ) -> Result<Credential, CredentialError>;
}

/// PKCE (RFC 7636) verifier and its S256 challenge.
#[derive(Debug, Clone)]
pub struct PkceChallenge {
    pub verifier: String,
    pub challenge: String,
}

impl PkceChallenge {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill(&mut bytes);
        Self::from_verifier(URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn from_verifier(verifier: String) -> Self {
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
        Self {
            verifier,
            challenge,
        }
    }
}

fn random_state() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(30)
        .map(char::from)
        .collect()
}

fn or_default<'a>(value: &'a str, default: &'a str) -> &'a str {
    if value.is_empty() {
        default
    } else {
        value
    }
}

pub fn authorization_url(
    client: &ApplicationSecret,
    redirect_uri: &str,
    scopes: &[String],
    state: &str,
    pkce: &PkceChallenge,
) -> Result<Url, CredentialError> {
    let auth_uri = or_default(&client.auth_uri, GOOGLE_AUTH_URI);
    let mut url = Url::parse(auth_uri).map_err(|e| {
        CredentialError::AuthorizationFailed(format!("invalid auth URI {:?}: {}", auth_uri, e))
    })?;
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", &client.client_id)
        .append_pair("redirect_uri", redirect_uri)
        .append_pair("scope", &scopes.join(" "))
        .append_pair("state", state)
        .append_pair("code_challenge", &pkce.challenge)
        .append_pair("code_challenge_method", "S256")
        .append_pair("access_type", "offline");
    Ok(url)
}

// Turns the redirect parameters into an authorization code.
pub fn verify_callback(params: CallbackParams, expected_state: &str) -> Result<String, CredentialError> {
    if let Some(error) = params.error {
        let description = params.error_description.unwrap_or_default();
        return Err(CredentialError::AuthorizationFailed(
            format!("{} {}", error, description).trim_end().to_string(),
        ));
    }
    if params.state.as_deref() != Some(expected_state) {
        return Err(CredentialError::AuthorizationFailed(
            "the OAuth state parameter does not match; the redirect was not ours".to_string(),
        ));
    }
    params
        .code
        .filter(|c| !c.is_empty())
        .ok_or_else(|| CredentialError::AuthorizationFailed("the redirect carried no code".to_string()))
}

pub async fn exchange_code(
    http: &reqwest::Client,
    client: &ApplicationSecret,
    scopes: &[String],
    code: &str,
    redirect_uri: &str,
    code_verifier: &str,
) -> Result<Credential, CredentialError> {
    let token_uri = or_default(&client.token_uri, GOOGLE_TOKEN_URI);
    let form = [
        ("grant_type", "authorization_code"),
        ("code", code),
        ("redirect_uri", redirect_uri),
        ("client_id", client.client_id.as_str()),
        ("client_secret", client.client_secret.as_str()),
        ("code_verifier", code_verifier),
    ];
    let response = request_token(http, token_uri, &form)
        .await
        .map_err(CredentialError::AuthorizationFailed)?;

    let expiry = response.expiry().map_err(CredentialError::AuthorizationFailed)?;
    Ok(Credential {
        expiry,
        access_token: Some(response.access_token),
        refresh_token: response.refresh_token,
        token_uri: token_uri.to_string(),
        client_id: client.client_id.clone(),
        client_secret: client.client_secret.clone(),
        scopes: scopes.to_vec(),
    })
}

/// Installed-app authorization through the browser and a local redirect listener.
pub struct LocalServerFlow {
    http: reqwest::Client,
    // A bad environment only matters once a browser authorization is needed.
    config: Result<FlowConfig, ConfigError>,
    open_browser: bool,
    timeout: Option<Duration>,
}

impl LocalServerFlow {
    pub fn new(http: reqwest::Client, config: FlowConfig) -> Self {
        Self::with_config(http, Ok(config))
    }

    /// Reads the listener settings from the environment.
    pub fn from_env(http: reqwest::Client) -> Self {
        Self::with_config(http, FlowConfig::from_env())
    }

    fn with_config(http: reqwest::Client, config: Result<FlowConfig, ConfigError>) -> Self {
        Self {
            http,
            config,
            open_browser: true,
            timeout: None,
        }
    }

    pub fn with_browser(mut self, open_browser: bool) -> Self {
        self.open_browser = open_browser;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn config(&self) -> Result<&FlowConfig, CredentialError> {
        self.config
            .as_ref()
            .map_err(|e| CredentialError::AuthorizationFailed(e.to_string()))
    }

    async fn bind(config: &FlowConfig) -> Result<TcpListener, CredentialError> {
        let bind_host = config.bind_host();
        TcpListener::bind((bind_host, config.port))
            .await
            .map_err(|e| {
                CredentialError::AuthorizationFailed(format!(
                    "failed to listen on {}:{} for the OAuth redirect: {}",
                    bind_host, config.port, e
                ))
            })
    }
}

#[async_trait]
impl Authorizer for LocalServerFlow {
    async fn authorize(
        &self,
        client: &ApplicationSecret,
        scopes: &[String],
    ) -> Result<Credential, CredentialError> {
        if client.client_id.is_empty() {
            return Err(CredentialError::AuthorizationFailed(
                "no OAuth client is configured; pass a client secret file".to_string(),
            ));
        }

        let config = self.config()?;
        let listener = Self::bind(config).await?;
        // Port 0 lets the OS pick; the redirect must name the real one.
        let port = listener
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(config.port);
        let redirect_uri = format!("http://{}:{}/", config.host, port);

        let pkce = PkceChallenge::generate();
        let state = random_state();
        let url = authorization_url(client, &redirect_uri, scopes, &state, &pkce)?;

        println!("Please visit this URL to authorize this application: {}", url);
        if self.open_browser {
            if let Err(e) = opener::open_browser(url.as_str()) {
                warn!("Could not open a browser: {}", e);
            }
        }

        info!("Waiting for the OAuth redirect on {}", redirect_uri);
        let params = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, wait_for_callback(listener))
                .await
                .map_err(|_| {
                    CredentialError::AuthorizationFailed(format!(
                        "timed out after {} seconds waiting for authorization",
                        limit.as_secs()
                    ))
                })??,
            None => wait_for_callback(listener).await?,
        };

        let code = verify_callback(params, &state)?;
        debug!("Received an authorization code, exchanging it for tokens");
        let credential =
            exchange_code(&self.http, client, scopes, &code, &redirect_uri, &pkce.verifier).await?;
        info!("Successfully obtained new credentials");
        Ok(credential)
    }
}
