use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesResponse {
    pub messages: Option<Vec<MessageRef>>,
    pub next_page_token: Option<String>,
    pub result_size_estimate: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageRef {
    pub id: Option<String>,
    pub thread_id: Option<String>,
}

/// One page of `users.messages.list`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageList {
    pub messages: Vec<MessageRef>,
    /// Empty when there are no more pages.
    pub next_page_token: String,
    pub result_size_estimate: u64,
}

impl From<MessagesResponse> for MessageList {
    fn from(response: MessagesResponse) -> Self {
        Self {
            messages: response.messages.unwrap_or_default(),
            next_page_token: response.next_page_token.unwrap_or_default(),
            result_size_estimate: response.result_size_estimate.unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageQuery {
    /// Same syntax as the Gmail search box.
    pub query: String,
    pub max_results: u32,
    pub page_token: Option<String>,
    pub label_ids: Vec<String>,
    pub include_spam_trash: bool,
}

impl Default for MessageQuery {
    fn default() -> Self {
        Self {
            query: String::new(),
            max_results: 100,
            page_token: None,
            label_ids: Vec::new(),
            include_spam_trash: false,
        }
    }
}

impl MessageQuery {
    pub fn search(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageFormat {
    Minimal,
    Full,
    Raw,
    Metadata,
}

impl MessageFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageFormat::Minimal => "minimal",
            MessageFormat::Full => "full",
            MessageFormat::Raw => "raw",
            MessageFormat::Metadata => "metadata",
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Option<String>,
    pub thread_id: Option<String>,
    pub label_ids: Option<Vec<String>>,
    pub snippet: Option<String>,
    pub payload: Option<MessagePart>,
    pub raw: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessagePart {
    pub mime_type: Option<String>,
    pub headers: Option<Vec<Header>>,
    pub body: Option<MessagePartBody>,
    pub parts: Option<Vec<MessagePart>>,
}

impl MessagePart {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .as_ref()?
            .iter()
            .find(|h| h.name.as_deref().is_some_and(|n| n.eq_ignore_ascii_case(name)))
            .and_then(|h| h.value.as_deref())
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: Option<String>,
    pub value: Option<String>,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct MessagePartBody {
    pub data: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendAsListResponse {
    #[serde(default)]
    pub send_as: Vec<SendAs>,
}

/// A send-as alias and its signature.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SendAs {
    pub send_as_email: String,
    #[serde(default)]
    pub display_name: String,
    /// HTML signature, empty when none is configured.
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub is_primary: bool,
}
