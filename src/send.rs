use tracing::{debug, info};

use crate::compose::compose_html_message;
use crate::error::{CredentialError, SendError};
use crate::gmail_api::{Authorizer, Completed, GmailClient, MailApi, Session, TokenRefresher};
use crate::text::{render, TextType};
use crate::types::MessageQuery;

const SIGNATURE_SEPARATOR: &str = "<div>--</div>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOptions {
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
    pub text_type: TextType,
    /// Extra headers such as CC or BCC, appended in order.
    pub headers: Vec<(String, String)>,
    pub disallow_same_subjects: bool,
    /// Alias whose signature is used; the default alias when `None`.
    pub sendas_address: Option<String>,
    pub dry_run: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            recipients: Vec::new(),
            subject: String::new(),
            body: String::new(),
            text_type: TextType::Plain,
            headers: Vec::new(),
            disallow_same_subjects: false,
            sendas_address: None,
            dry_run: false,
        }
    }
}

pub fn subject_query(subject: &str) -> String {
    format!("in:sent subject:(\"{}\")", subject)
}

/// Composes the message and sends it unless `dry_run` is set.
///
/// Returns the id of the sent message, or `None` for a dry run.
pub async fn deliver<M>(api: &M, options: &SendOptions) -> Result<Option<String>, SendError>
where
    M: MailApi + ?Sized,
{
    if options.disallow_same_subjects {
        info!("Checking whether the subject has been already used");
        let sent = api
            .list_messages(&MessageQuery::search(subject_query(&options.subject)))
            .await?;
        if sent.result_size_estimate > 0 {
            return Err(SendError::SubjectUsed(options.subject.clone()));
        }
        info!("The subject is not used yet");
    }

    let send_as = api.get_send_as(options.sendas_address.clone()).await?;
    info!("Using the signature of {}", send_as.send_as_email);

    let mut html = render(&options.body, options.text_type);
    html.push_str(SIGNATURE_SEPARATOR);
    html.push_str(&send_as.signature);
    debug!("The HTML body is:\n{}", html);

    let to = options.recipients.join(",");
    let message = compose_html_message(&to, &options.subject, &html, &options.headers)?;

    if options.dry_run {
        info!("Dry run, the message to {} is not sent", to);
        return Ok(None);
    }

    let sent = api.send_message(&message).await?;
    info!("Sent message {} to {}", sent.id.as_deref().unwrap_or("(unknown id)"), to);
    Ok(sent.id)
}

/// Delivers through the Gmail API as the unit of work of `session`.
pub async fn send<A, R>(
    options: &SendOptions,
    session: &Session<A, R>,
    http: &reqwest::Client,
) -> Result<Completed<Option<String>>, SendError>
where
    A: Authorizer,
    R: TokenRefresher,
{
    send_with(options, session, |token| GmailClient::new(http.clone(), token)).await
}

// Like `send`, but `connect` builds the API client from the access token.
pub async fn send_with<A, R, M, F>(
    options: &SendOptions,
    session: &Session<A, R>,
    connect: F,
) -> Result<Completed<Option<String>>, SendError>
where
    A: Authorizer,
    R: TokenRefresher,
    M: MailApi,
    F: FnOnce(String) -> M,
{
    session
        .run(|credential| async move {
            let token = match credential.access_token.filter(|t| !t.is_empty()) {
                Some(token) => token,
                None => {
                    return Err(SendError::from(CredentialError::AuthorizationFailed(
                        "the credential carries no access token".to_string(),
                    )))
                }
            };
            let api = connect(token);
            deliver(&api, options).await
        })
        .await
}
