//! Local HTTP listener that receives the OAuth redirect from the browser.
//!
//! Requests that carry neither `code` nor `error` (a favicon probe, a stray
//! reload) are answered with 404 and the listener keeps waiting.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;
use url::Url;

use crate::error::CredentialError;

const SUCCESS_HTML: &str = "<!DOCTYPE html><html><head><title>gsend</title></head>\
<body style=\"font-family: system-ui; text-align: center; padding: 60px 20px;\">\
<p>The authentication flow has completed. You may close this window.</p>\
</body></html>";

const MAX_REQUEST_BYTES: usize = 16 * 1024;
// Idle connections (browser preconnects) are dropped after this long.
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Query parameters of the OAuth redirect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

impl CallbackParams {
    fn from_target(target: &str) -> Option<Self> {
        let url = Url::parse("http://localhost/").ok()?.join(target).ok()?;
        let mut params = Self::default();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "code" => params.code = Some(value.into_owned()),
                "state" => params.state = Some(value.into_owned()),
                "error" => params.error = Some(value.into_owned()),
                "error_description" => params.error_description = Some(value.into_owned()),
                _ => {}
            }
        }
        Some(params)
    }

    fn is_redirect(&self) -> bool {
        self.code.is_some() || self.error.is_some()
    }
}

/// Accepts connections until one carries the OAuth redirect parameters.
pub async fn wait_for_callback(listener: TcpListener) -> Result<CallbackParams, CredentialError> {
    accept_redirect(listener, READ_TIMEOUT).await
}

async fn accept_redirect(
    listener: TcpListener,
    read_timeout: Duration,
) -> Result<CallbackParams, CredentialError> {
    loop {
        let (mut stream, peer) = listener.accept().await.map_err(|e| {
            CredentialError::AuthorizationFailed(format!("failed to accept the OAuth callback: {}", e))
        })?;
        debug!("OAuth callback connection from {}", peer);

        let request =
            match tokio::time::timeout(read_timeout, read_request_head(&mut stream)).await {
                Ok(Ok(request)) => request,
                Ok(Err(e)) => {
                    debug!("Ignoring unreadable callback request: {}", e);
                    continue;
                }
                Err(_) => {
                    debug!("Dropping idle callback connection from {}", peer);
                    continue;
                }
            };

        let mut parts = request.lines().next().unwrap_or("").split_whitespace();
        let (method, target) = (parts.next(), parts.next());
        let params = match (method, target) {
            (Some("GET"), Some(target)) => CallbackParams::from_target(target),
            _ => None,
        };

        match params {
            Some(params) if params.is_redirect() => {
                let _ = respond(&mut stream, "200 OK", SUCCESS_HTML).await;
                return Ok(params);
            }
            Some(_) => {
                let _ = respond(&mut stream, "404 Not Found", "").await;
            }
            None => {
                let _ = respond(&mut stream, "400 Bad Request", "").await;
            }
        }
    }
}

async fn read_request_head(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") || buf.len() >= MAX_REQUEST_BYTES {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

async fn respond(stream: &mut TcpStream, status: &str, body: &str) -> std::io::Result<()> {
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await
}
