// HTTP client for the messaging server's conversation routes.

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, Url};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::config::Config;
use crate::error::ApiError;
use crate::message::{ConversationHistory, ConversationSummary, MessageId, UserProfile};
use crate::normalize::parse_timestamp;
use crate::transport::ChatApi;

/// Default number of messages per history page.
pub const DEFAULT_PAGE_SIZE: u32 = 50;

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct HttpChatApi {
    http: reqwest::Client,
    base_url: Url,
    access_token: Option<String>,
    page_size: u32,
}

impl HttpChatApi {
    pub fn new(
        base_url: &str,
        access_token: Option<String>,
        page_size: u32,
    ) -> Result<Self, ApiError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| ApiError::Invalid(format!("bad base URL {base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ApiError::Invalid(format!("{base_url} cannot be a base URL")));
        }
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            access_token,
            page_size,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, ApiError> {
        Self::new(
            &config.server.base_url,
            config.credentials.access_token.clone(),
            config.chat.history_page_size,
        )
    }

    /// `{base}/api/messages/{segments...}`. Segments are percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::Invalid(format!("{} cannot be a base URL", self.base_url)))?
            .pop_if_empty()
            .extend(["api", "messages"])
            .extend(segments);
        Ok(url)
    }

    fn history_url(&self, remote_user_id: &str) -> Result<Url, ApiError> {
        let mut url = self.endpoint(&["conversation", remote_user_id])?;
        url.query_pairs_mut()
            .append_pair("limit", &self.page_size.to_string())
            .append_pair("offset", "0");
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.http.request(method, url);
        match &self.access_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn execute(&self, builder: RequestBuilder) -> Result<Response, ApiError> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(error_from_status(status.as_u16(), &body))
    }

    /// Everyone the local user has exchanged messages with, most recent
    /// first.
    pub async fn conversations(&self) -> Result<Vec<ConversationSummary>, ApiError> {
        let url = self.endpoint(&["conversations"])?;
        let page: ConversationsPage = self
            .execute(self.request(Method::GET, url))
            .await?
            .json()
            .await?;
        Ok(page.conversations.into_iter().map(SummaryWire::into_summary).collect())
    }

    /// Number of unread messages addressed to the local user.
    pub async fn unread_count(&self) -> Result<usize, ApiError> {
        let url = self.endpoint(&["unread", "count"])?;
        let body: UnreadCount = self
            .execute(self.request(Method::GET, url))
            .await?
            .json()
            .await?;
        Ok(body.unread_count)
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn fetch_history(&self, remote_user_id: &str) -> Result<ConversationHistory, ApiError> {
        let url = self.history_url(remote_user_id)?;
        debug!("GET {}", url);
        let history = self
            .execute(self.request(Method::GET, url))
            .await?
            .json()
            .await?;
        Ok(history)
    }

    async fn edit_message(&self, message_id: &MessageId, content: &str) -> Result<(), ApiError> {
        let url = self.endpoint(&[message_id.as_str()])?;
        let body = serde_json::json!({ "content": content });
        self.execute(self.request(Method::PATCH, url).json(&body))
            .await?;
        Ok(())
    }

    async fn delete_message(&self, message_id: &MessageId) -> Result<(), ApiError> {
        let url = self.endpoint(&[message_id.as_str()])?;
        self.execute(self.request(Method::DELETE, url)).await?;
        Ok(())
    }

    async fn clear_conversation(&self, remote_user_id: &str) -> Result<(), ApiError> {
        let url = self.endpoint(&["conversation", remote_user_id])?;
        self.execute(self.request(Method::DELETE, url)).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Response bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ConversationsPage {
    #[serde(default)]
    conversations: Vec<SummaryWire>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SummaryWire {
    user_id: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    last_message: Option<String>,
    #[serde(default)]
    last_message_time: Option<Value>,
    #[serde(default)]
    unread_count: usize,
}

impl SummaryWire {
    fn into_summary(self) -> ConversationSummary {
        let profile = UserProfile {
            id: self.user_id,
            email: self.email,
            first_name: self.first_name,
            last_name: self.last_name,
        };
        ConversationSummary {
            display_name: profile.display_name(),
            user_id: profile.id,
            role: self.role.unwrap_or_default(),
            last_message: self.last_message.unwrap_or_default(),
            last_message_time: self.last_message_time.as_ref().and_then(parse_timestamp),
            unread_count: self.unread_count,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UnreadCount {
    unread_count: usize,
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Map a non-2xx response to a typed error.
pub fn error_from_status(status: u16, body: &str) -> ApiError {
    let message = extract_message(body).unwrap_or_else(|| format!("HTTP {status}"));
    match status {
        400 => ApiError::Invalid(message),
        403 => ApiError::Forbidden(message),
        404 => ApiError::NotFound(message),
        _ => ApiError::Status { status, message },
    }
}

/// Pull a human-readable message out of an error body: `{"message": ..}` or
/// `{"error": ..}`, else the raw text if it is short.
fn extract_message(body: &str) -> Option<String> {
    let body = body.trim();
    if body.is_empty() {
        return None;
    }
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(body) {
        return ["message", "error"]
            .iter()
            .find_map(|k| map.get(*k).and_then(Value::as_str))
            .map(str::to_string);
    }
    (body.len() <= 200).then(|| body.to_string())
}
