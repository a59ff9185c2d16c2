//! Gmail API module split into logical submodules
//!
//! - credentials: the persisted OAuth2 record and its load/refresh/save cycle
//! - token: token endpoint exchanges
//! - auth: interactive local-server authorization
//! - callback: the loopback listener used by the authorization flow
//! - session: acquire a credential, run a unit of work, persist on success
//! - client: Gmail REST calls

pub mod auth;
pub mod callback;
pub mod client;
pub mod credentials;
pub mod session;
pub mod token;

pub use auth::{Authorizer, LocalServerFlow};
pub use client::{GmailClient, MailApi};
pub use credentials::Credential;
pub use session::{Completed, Session};
pub use token::{HttpTokenRefresher, TokenRefresher};

#[cfg(test)]
pub use auth::MockAuthorizer;
#[cfg(test)]
pub use client::MockMailApi;
#[cfg(test)]
pub use token::MockTokenRefresher;
