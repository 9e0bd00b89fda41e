use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use super::{FetchedPage, MessageTransport};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};

/// REST client for the chat server's message API.
///
/// - `GET  {base}/api/messages/{chat_id}?page=&limit=`
/// - `POST {base}/api/messages`
///
/// Responses use the `{ success, message, data }` envelope.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default = "default_success")]
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: JsonValue,
}

fn default_success() -> bool {
    true
}

impl HttpTransport {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        timeout: std::time::Duration,
    ) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn from_config(config: &SyncConfig) -> SyncResult<Self> {
        Self::new(
            config.api_base_url.clone(),
            config.api_token.clone(),
            config.http_timeout,
        )
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn execute(&self, request: reqwest::RequestBuilder) -> SyncResult<JsonValue> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| SyncError::Network(format!("request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SyncError::Network(format!("failed to read response body: {e}")))?;

        if !status.is_success() {
            let error = classify_status(status, &body);
            warn!(status = %status, error = %error, "Message API returned error");
            return Err(error);
        }

        unwrap_envelope(&body)
    }
}

/// Map a non-success HTTP status to the sync error taxonomy.
pub(crate) fn classify_status(status: StatusCode, body: &str) -> SyncError {
    let reason = serde_json::from_str::<Envelope>(body)
        .ok()
        .and_then(|e| e.message)
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("unknown error")
                .to_string()
        });

    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        SyncError::Network(format!("{} {}", status.as_u16(), reason))
    } else {
        SyncError::Rejected(reason)
    }
}

/// Parse a success body and return its `data` member.
pub(crate) fn unwrap_envelope(body: &str) -> SyncResult<JsonValue> {
    let envelope: Envelope = serde_json::from_str(body)
        .map_err(|e| SyncError::Parse(format!("invalid response body: {e}")))?;

    if !envelope.success {
        return Err(SyncError::Rejected(
            envelope.message.unwrap_or_else(|| "request failed".to_string()),
        ));
    }
    Ok(envelope.data)
}

/// `data.messages` plus the optional `hasMore` flag (top level or under
/// `pagination`).
pub(crate) fn page_from_data(data: JsonValue) -> SyncResult<FetchedPage> {
    let has_more_hint = data
        .get("hasMore")
        .or_else(|| data.pointer("/pagination/hasMore"))
        .and_then(JsonValue::as_bool);

    let messages = match data {
        JsonValue::Object(mut object) => match object.remove("messages") {
            Some(JsonValue::Array(messages)) => messages,
            Some(other) => {
                return Err(SyncError::Parse(format!(
                    "expected messages array, got {other}"
                )))
            }
            None => return Err(SyncError::Parse("response without messages".to_string())),
        },
        JsonValue::Array(messages) => messages,
        other => {
            return Err(SyncError::Parse(format!(
                "unexpected response data: {other}"
            )))
        }
    };

    Ok(FetchedPage {
        messages,
        has_more_hint,
    })
}

#[async_trait]
impl MessageTransport for HttpTransport {
    async fn fetch_messages(
        &self,
        chat_id: &str,
        page: u32,
        page_size: u32,
    ) -> SyncResult<FetchedPage> {
        let url = format!("{}/api/messages/{}", self.base_url, chat_id);
        debug!(chat_id = %chat_id, page, page_size, "Fetching messages");

        let data = self
            .execute(
                self.client
                    .get(&url)
                    .query(&[("page", page), ("limit", page_size)]),
            )
            .await?;
        page_from_data(data)
    }

    async fn send_message(&self, payload: &JsonValue) -> SyncResult<JsonValue> {
        let url = format!("{}/api/messages", self.base_url);

        let data = self.execute(self.client.post(&url).json(payload)).await?;
        match data {
            JsonValue::Object(mut object) => object
                .remove("message")
                .ok_or_else(|| SyncError::Parse("send response without message".to_string())),
            other => Err(SyncError::Parse(format!(
                "unexpected send response: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_classification() {
        let blocked = r#"{"success":false,"message":"Messaging is blocked between these users"}"#;
        match classify_status(StatusCode::FORBIDDEN, blocked) {
            SyncError::Rejected(reason) => {
                assert_eq!(reason, "Messaging is blocked between these users")
            }
            other => panic!("expected rejection, got {other:?}"),
        }

        assert!(matches!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR, "<html>"),
            SyncError::Network(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            SyncError::Network(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::REQUEST_TIMEOUT, ""),
            SyncError::Network(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, "{}"),
            SyncError::Rejected(_)
        ));
    }

    #[test]
    fn test_envelope_handling() {
        let data = unwrap_envelope(r#"{"success":true,"data":{"messages":[]}}"#).unwrap();
        assert_eq!(data, json!({ "messages": [] }));

        assert!(matches!(
            unwrap_envelope(r#"{"success":false,"message":"nope"}"#),
            Err(SyncError::Rejected(_))
        ));
        assert!(matches!(
            unwrap_envelope("not json"),
            Err(SyncError::Parse(_))
        ));
    }

    #[test]
    fn test_page_extraction() {
        let page = page_from_data(json!({
            "messages": [{ "_id": "a" }, { "_id": "b" }],
            "chatInfo": { "id": "chat-1" }
        }))
        .unwrap();
        assert_eq!(page.messages.len(), 2);
        assert_eq!(page.has_more_hint, None);

        let page = page_from_data(json!({
            "messages": [],
            "pagination": { "hasMore": false }
        }))
        .unwrap();
        assert_eq!(page.has_more_hint, Some(false));

        assert!(page_from_data(json!({ "messages": "oops" })).is_err());
        assert!(page_from_data(json!(null)).is_err());
    }

    #[test]
    fn test_base_url_is_normalized() {
        let transport = HttpTransport::new(
            "http://localhost:5000/",
            None,
            std::time::Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(transport.base_url, "http://localhost:5000");
    }
}
