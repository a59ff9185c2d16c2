use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use super::credentials::Credential;
use crate::error::CredentialError;

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
}

impl TokenResponse {
    /// Absolute expiry derived from `expires_in`; out-of-range lifetimes are an error.
    pub fn expiry(&self) -> Result<Option<chrono::DateTime<Utc>>, String> {
        let Some(secs) = self.expires_in else {
            return Ok(None);
        };
        Duration::try_seconds(secs)
            .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
            .map(Some)
            .ok_or_else(|| format!("expires_in out of range: {}", secs))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

impl std::fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.error_description {
            Some(description) => write!(f, "{}: {}", self.error, description),
            None => write!(f, "{}", self.error),
        }
    }
}

// Posts a form to the token endpoint. Errors are flattened into a reason
// string; callers wrap it in the variant that fits their grant.
pub async fn request_token(
    http: &reqwest::Client,
    token_uri: &str,
    form: &[(&str, &str)],
) -> Result<TokenResponse, String> {
    let response = http
        .post(token_uri)
        .form(form)
        .send()
        .await
        .map_err(|e| e.to_string())?;

    let status = response.status();
    if status.is_success() {
        return response
            .json::<TokenResponse>()
            .await
            .map_err(|e| format!("malformed token response: {}", e));
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    match serde_json::from_str::<ErrorResponse>(&body) {
        Ok(error) => Err(format!("{} ({})", error, status)),
        Err(_) => Err(format!("token endpoint returned {}: {}", status, body)),
    }
}

// Define a trait for the refresh exchange to allow mocking
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, credential: &Credential) -> Result<Credential, CredentialError>;
}

/// Performs the OAuth2 `refresh_token` grant against the credential's token URI.
pub struct HttpTokenRefresher {
    http: reqwest::Client,
}

impl HttpTokenRefresher {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self, credential: &Credential) -> Result<Credential, CredentialError> {
        let refresh_token = credential
            .refresh_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                CredentialError::RefreshFailed("the credentials have no refresh token".to_string())
            })?;
        if credential.client_id.is_empty() || credential.client_secret.is_empty() {
            return Err(CredentialError::RefreshFailed(
                "the credentials lack a client id or client secret".to_string(),
            ));
        }

        let scope = credential.scopes.join(" ");
        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("client_id", credential.client_id.as_str()),
            ("client_secret", credential.client_secret.as_str()),
            ("refresh_token", refresh_token),
        ];
        if !scope.is_empty() {
            form.push(("scope", scope.as_str()));
        }

        debug!("Requesting a new access token from {}", credential.token_uri);
        let response = request_token(&self.http, &credential.token_uri, &form)
            .await
            .map_err(CredentialError::RefreshFailed)?;

        if let Some(granted) = &response.scope {
            let granted: Vec<&str> = granted.split_whitespace().collect();
            let missing: Vec<&str> = credential
                .scopes
                .iter()
                .map(String::as_str)
                .filter(|s| !granted.contains(s))
                .collect();
            if !missing.is_empty() {
                warn!("The refreshed token lacks requested scopes: {}", missing.join(" "));
            }
        }

        let mut refreshed = credential.clone();
        refreshed.expiry = response.expiry().map_err(CredentialError::RefreshFailed)?;
        refreshed.access_token = Some(response.access_token);
        if let Some(rotated) = response.refresh_token.filter(|t| !t.is_empty()) {
            refreshed.refresh_token = Some(rotated);
        }
        Ok(refreshed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn http() -> reqwest::Client {
        reqwest::Client::builder().no_proxy().build().unwrap()
    }

    fn credential(token_uri: String) -> Credential {
        Credential {
            access_token: Some("old".to_string()),
            refresh_token: Some("r1".to_string()),
            token_uri,
            client_id: "client-id".to_string(),
            client_secret: "client-secret".to_string(),
            scopes: vec!["scope-a".to_string(), "scope-b".to_string()],
            expiry: Some(Utc::now() - Duration::minutes(10)),
        }
    }

    #[tokio::test]
    async fn test_refresh_replaces_access_token() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                Matcher::UrlEncoded("refresh_token".into(), "r1".into()),
                Matcher::UrlEncoded("client_id".into(), "client-id".into()),
                Matcher::UrlEncoded("client_secret".into(), "client-secret".into()),
                Matcher::UrlEncoded("scope".into(), "scope-a scope-b".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token": "new", "expires_in": 3600, "token_type": "Bearer"}"#)
            .expect(1)
            .create_async()
            .await;

        let refresher = HttpTokenRefresher::new(http());
        let cred = credential(format!("{}/token", server.url()));
        let refreshed = refresher.refresh(&cred).await.unwrap();

        mock.assert_async().await;
        assert_eq!(refreshed.access_token.as_deref(), Some("new"));
        assert_eq!(refreshed.refresh_token.as_deref(), Some("r1"));
        assert!(refreshed.is_valid());
        assert_eq!(refreshed.client_id, cred.client_id);
        assert_eq!(refreshed.scopes, cred.scopes);
    }

    #[tokio::test]
    async fn test_refresh_rotates_refresh_token() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token": "new", "expires_in": 60, "refresh_token": "r2"}"#)
            .create_async()
            .await;

        let refresher = HttpTokenRefresher::new(http());
        let refreshed = refresher
            .refresh(&credential(format!("{}/token", server.url())))
            .await
            .unwrap();
        assert_eq!(refreshed.refresh_token.as_deref(), Some("r2"));
    }

    #[tokio::test]
    async fn test_refresh_error_response() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(400)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error": "invalid_grant", "error_description": "Token has been expired or revoked."}"#)
            .create_async()
            .await;

        let refresher = HttpTokenRefresher::new(http());
        let err = refresher
            .refresh(&credential(format!("{}/token", server.url())))
            .await
            .unwrap_err();
        match err {
            CredentialError::RefreshFailed(reason) => {
                assert!(reason.contains("invalid_grant"));
                assert!(reason.contains("expired or revoked"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_refresh_without_client_secret_makes_no_request() {
        let mut server = Server::new_async().await;
        let mock = server.mock("POST", "/token").expect(0).create_async().await;

        let mut cred = credential(format!("{}/token", server.url()));
        cred.client_secret.clear();
        let refresher = HttpTokenRefresher::new(http());
        let err = refresher.refresh(&cred).await.unwrap_err();

        assert!(matches!(err, CredentialError::RefreshFailed(_)));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_unreachable_endpoint() {
        // Nothing listens on port 9 of the loopback interface.
        let refresher = HttpTokenRefresher::new(http());
        let err = refresher
            .refresh(&credential("http://127.0.0.1:9/token".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialError::RefreshFailed(_)));
    }

    #[tokio::test]
    async fn test_refresh_with_huge_expires_in_fails() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token": "new", "expires_in": 9223372036854775807}"#)
            .create_async()
            .await;

        let refresher = HttpTokenRefresher::new(http());
        let err = refresher
            .refresh(&credential(format!("{}/token", server.url())))
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialError::RefreshFailed(reason) if reason.contains("expires_in")));
    }

    #[test]
    fn test_expiry_bounds() {
        let response = |expires_in: Option<i64>| TokenResponse {
            access_token: "a".to_string(),
            expires_in,
            refresh_token: None,
            scope: None,
            token_type: None,
        };
        assert_eq!(response(None).expiry(), Ok(None));
        let expiry = response(Some(3600)).expiry().unwrap().unwrap();
        assert!(expiry > Utc::now() + Duration::minutes(59));
        assert!(response(Some(i64::MAX)).expiry().is_err());
        assert!(response(Some(i64::MIN)).expiry().is_err());
        assert!(response(Some(400_000 * 365 * 24 * 3600)).expiry().is_err());
    }

    #[test]
    fn test_error_response_display() {
        let error: ErrorResponse = serde_json::from_str(r#"{"error": "invalid_client"}"#).unwrap();
        assert_eq!(error.to_string(), "invalid_client");
    }
}
