//! Scoped credential acquisition.
//!
//! [`Session::run`] loads or creates a credential, hands it to a unit of work
//! and persists it only when that work succeeds. A failed unit of work leaves
//! the record on disk exactly as it was.

use std::future::Future;
use std::path::PathBuf;

use tracing::{info, warn};
use yup_oauth2::ApplicationSecret;

use super::auth::Authorizer;
use super::credentials::{self, Credential};
use super::token::TokenRefresher;
use crate::error::CredentialError;

/// Result of a successful unit of work.
#[derive(Debug)]
pub struct Completed<T> {
    pub output: T,
    /// Set when the work succeeded but the credential could not be saved.
    pub save_error: Option<CredentialError>,
}

pub struct Session<A, R> {
    path: PathBuf,
    scopes: Vec<String>,
    client: ApplicationSecret,
    authorizer: A,
    refresher: R,
}

impl<A, R> Session<A, R>
where
    A: Authorizer,
    R: TokenRefresher,
{
    pub fn new(
        path: impl Into<PathBuf>,
        scopes: Vec<String>,
        client: ApplicationSecret,
        authorizer: A,
        refresher: R,
    ) -> Self {
        Self {
            path: path.into(),
            scopes,
            client,
            authorizer,
            refresher,
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Returns a usable credential without persisting it.
    pub async fn acquire(&self) -> Result<Credential, CredentialError> {
        match credentials::load(&self.path, &self.scopes).await {
            Ok(credential) => credentials::validate_or_refresh(credential, &self.refresher).await,
            Err(e) if e.is_recoverable() => {
                match &e {
                    CredentialError::NotFound(path) => {
                        info!("No credentials at {}, starting a new authorization", path.display())
                    }
                    _ => warn!("Ignoring {}, starting a new authorization", e),
                }
                self.authorize().await
            }
            Err(e) => Err(e),
        }
    }

    async fn authorize(&self) -> Result<Credential, CredentialError> {
        self.authorizer.authorize(&self.client, &self.scopes).await
    }

    /// Runs `work` with a usable credential and saves it once `work` succeeds.
    ///
    /// Credential failures abort before `work` is called. A save failure after
    /// successful work is returned in [`Completed::save_error`], not as an error.
    pub async fn run<F, Fut, T, E>(&self, work: F) -> Result<Completed<T>, E>
    where
        F: FnOnce(Credential) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CredentialError>,
    {
        let credential = self.acquire().await?;
        let output = work(credential.clone()).await?;

        let save_error = match credentials::save(&credential, &self.path).await {
            Ok(()) => None,
            Err(e) => {
                warn!("Failed to save credentials: {}", e);
                Some(e)
            }
        };
        Ok(Completed { output, save_error })
    }
}
