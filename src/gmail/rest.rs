use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{GmailError, GmailResult, HistoryPage, Mailbox, MessageSummary, SendOutcome, ThreadSummary};

const BASE_URL: &str = "https://gmail.googleapis.com/gmail/v1/users/me";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendResponse {
    id: String,
    #[serde(default)]
    thread_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InsertResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageDetail {
    #[serde(default)]
    id: String,
    #[serde(default)]
    thread_id: String,
    #[serde(default)]
    label_ids: Vec<String>,
    #[serde(default)]
    payload: Option<MessagePayload>,
    #[serde(default)]
    raw: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagePayload {
    #[serde(default)]
    headers: Vec<Header>,
}

#[derive(Debug, Deserialize)]
struct Header {
    #[serde(default)]
    name: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThreadDetail {
    #[serde(default)]
    messages: Vec<MessageDetail>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryResponse {
    #[serde(default)]
    history: Vec<HistoryRecord>,
    #[serde(default)]
    history_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryRecord {
    #[serde(default)]
    messages_added: Vec<HistoryMessage>,
    #[serde(default)]
    labels_added: Vec<HistoryMessage>,
}

#[derive(Debug, Deserialize)]
struct HistoryMessage {
    message: HistoryMessageRef,
}

#[derive(Debug, Deserialize)]
struct HistoryMessageRef {
    id: String,
}

impl From<MessageDetail> for MessageSummary {
    fn from(detail: MessageDetail) -> Self {
        MessageSummary {
            id: detail.id,
            thread_id: detail.thread_id,
            label_ids: detail.label_ids,
            headers: detail
                .payload
                .map(|payload| {
                    payload
                        .headers
                        .into_iter()
                        .map(|header| (header.name, header.value))
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

/// Gmail REST mailbox bound to one access token.
pub struct GmailMailbox {
    http: reqwest::Client,
    access_token: String,
}

impl GmailMailbox {
    pub fn new(http: reqwest::Client, access_token: String) -> Self {
        Self { http, access_token }
    }

    /// One transparent retry on 429/5xx before the error escalates to the
    /// job layer.
    async fn execute(&self, builder: reqwest::RequestBuilder) -> GmailResult<reqwest::Response> {
        let retry = builder.try_clone();
        let response = builder.send().await?;
        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            if let Some(retry) = retry {
                tokio::time::sleep(Duration::from_secs(1)).await;
                return Self::check(retry.send().await?).await;
            }
        }
        Self::check(response).await
    }

    async fn check(response: reqwest::Response) -> GmailResult<reqwest::Response> {
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(GmailError::TokenExpired);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(GmailError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl Mailbox for GmailMailbox {
    async fn send_message(&self, raw: &str, thread_id: Option<&str>) -> GmailResult<SendOutcome> {
        let mut body = json!({ "raw": raw });
        if let Some(thread_id) = thread_id {
            body["threadId"] = json!(thread_id);
        }

        let response = self
            .execute(
                self.http
                    .post(format!("{BASE_URL}/messages/send"))
                    .bearer_auth(&self.access_token)
                    .json(&body),
            )
            .await?;

        let sent: SendResponse = response.json().await?;
        Ok(SendOutcome {
            id: sent.id,
            thread_id: sent.thread_id,
        })
    }

    async fn get_message(&self, id: &str) -> GmailResult<MessageSummary> {
        let response = self
            .execute(
                self.http
                    .get(format!("{BASE_URL}/messages/{id}"))
                    .bearer_auth(&self.access_token)
                    .query(&[("format", "metadata")]),
            )
            .await?;

        let detail: MessageDetail = response.json().await?;
        Ok(detail.into())
    }

    async fn get_message_raw(&self, id: &str) -> GmailResult<String> {
        let response = self
            .execute(
                self.http
                    .get(format!("{BASE_URL}/messages/{id}"))
                    .bearer_auth(&self.access_token)
                    .query(&[("format", "raw")]),
            )
            .await?;

        let detail: MessageDetail = response.json().await?;
        detail.raw.ok_or(GmailError::Api {
            status: 200,
            message: "message response missing raw body".into(),
        })
    }

    async fn insert_message(
        &self,
        raw: &str,
        thread_id: Option<&str>,
        label_ids: &[&str],
    ) -> GmailResult<String> {
        let mut body = json!({ "raw": raw, "labelIds": label_ids });
        if let Some(thread_id) = thread_id {
            body["threadId"] = json!(thread_id);
        }

        let response = self
            .execute(
                self.http
                    .post(format!("{BASE_URL}/messages"))
                    .bearer_auth(&self.access_token)
                    .json(&body),
            )
            .await?;

        let inserted: InsertResponse = response.json().await?;
        Ok(inserted.id)
    }

    async fn delete_message(&self, id: &str) -> GmailResult<()> {
        self.execute(
            self.http
                .delete(format!("{BASE_URL}/messages/{id}"))
                .bearer_auth(&self.access_token),
        )
        .await?;
        Ok(())
    }

    async fn get_thread(&self, thread_id: &str) -> GmailResult<ThreadSummary> {
        let response = self
            .execute(
                self.http
                    .get(format!("{BASE_URL}/threads/{thread_id}"))
                    .bearer_auth(&self.access_token)
                    .query(&[("format", "metadata")]),
            )
            .await?;

        let detail: ThreadDetail = response.json().await?;
        Ok(ThreadSummary {
            messages: detail.messages.into_iter().map(Into::into).collect(),
        })
    }

    async fn list_history(&self, start_history_id: u64) -> GmailResult<HistoryPage> {
        let response = self
            .execute(
                self.http
                    .get(format!("{BASE_URL}/history"))
                    .bearer_auth(&self.access_token)
                    .query(&[
                        ("startHistoryId", start_history_id.to_string().as_str()),
                        ("historyTypes", "messageAdded"),
                        ("historyTypes", "labelAdded"),
                    ]),
            )
            .await?;

        let history: HistoryResponse = response.json().await?;
        let mut message_ids = Vec::new();
        for record in history.history {
            for added in record.messages_added.into_iter().chain(record.labels_added) {
                if !message_ids.contains(&added.message.id) {
                    message_ids.push(added.message.id);
                }
            }
        }
        Ok(HistoryPage {
            message_ids,
            history_id: history.history_id.and_then(|id| id.parse().ok()),
        })
    }
}
