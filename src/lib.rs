pub mod cli;
pub mod compose;
pub mod config;
pub mod error;
pub mod gmail_api;
pub mod logging;
pub mod send;
pub mod text;
pub mod types;

pub use error::{ApiError, CredentialError, SendError};
pub use send::{deliver, send, SendOptions};
pub use text::TextType;
