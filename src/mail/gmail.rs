//! Gmail API v1 adapter.
//!
//! List → per-message fetch, with bodies decoded from the base64url payload
//! tree. When a message carries only an HTML part, the text form is derived
//! from it so downstream scoring always has plain text to work with.

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::auth::TokenProvider;
use super::{Attachment, MailError, MailMessage, MailSource};

const API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";

// ============================================================================
// API response types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageListResponse {
    #[serde(default)]
    messages: Vec<MessageStub>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageStub {
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
    snippet: String,
    #[serde(default)]
    payload: Option<MessagePart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagePart {
    #[serde(default)]
    part_id: String,
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    filename: String,
    #[serde(default)]
    headers: Vec<Header>,
    #[serde(default)]
    body: Option<PartBody>,
    #[serde(default)]
    parts: Vec<MessagePart>,
}

#[derive(Debug, Deserialize)]
struct Header {
    #[serde(default)]
    name: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartBody {
    #[serde(default)]
    attachment_id: Option<String>,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    data: Option<String>,
}

// ============================================================================
// Payload decoding
// ============================================================================

fn decode_body(data: &str) -> Option<String> {
    let engine = base64::engine::general_purpose::URL_SAFE;
    let no_pad = base64::engine::general_purpose::URL_SAFE_NO_PAD;
    let bytes = engine
        .decode(data)
        .or_else(|_| no_pad.decode(data))
        .ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

fn header_value<'a>(headers: &'a [Header], name: &str) -> &'a str {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
        .unwrap_or("")
}

/// Walk the part tree collecting the first text/plain and text/html bodies.
fn collect_bodies(part: &MessagePart, text: &mut String, html: &mut String) {
    if part.filename.is_empty() {
        if let Some(data) = part.body.as_ref().and_then(|b| b.data.as_deref()) {
            if part.mime_type == "text/plain" && text.is_empty() {
                if let Some(decoded) = decode_body(data) {
                    *text = decoded;
                }
            } else if part.mime_type == "text/html" && html.is_empty() {
                if let Some(decoded) = decode_body(data) {
                    *html = decoded;
                }
            }
        }
    }
    for child in &part.parts {
        collect_bodies(child, text, html);
    }
}

fn collect_attachments(part: &MessagePart, out: &mut Vec<Attachment>) {
    if !part.filename.is_empty() {
        if let Some(body) = &part.body {
            out.push(Attachment {
                id: body
                    .attachment_id
                    .clone()
                    .unwrap_or_else(|| part.part_id.clone()),
                filename: part.filename.clone(),
                mime_type: part.mime_type.clone(),
                size: body.size,
            });
        }
    }
    for child in &part.parts {
        collect_attachments(child, out);
    }
}

fn parse_date_header(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

fn detail_to_message(detail: MessageDetail) -> MailMessage {
    let payload = detail.payload.unwrap_or_default();

    let mut body_text = String::new();
    let mut body_html = String::new();
    collect_bodies(&payload, &mut body_text, &mut body_html);

    // HTML-only message: derive the text form
    if body_text.is_empty() && !body_html.is_empty() {
        body_text = html2text::from_read(body_html.as_bytes(), 80).unwrap_or_default();
    }

    MailMessage {
        id: detail.id,
        thread_id: detail.thread_id,
        from: header_value(&payload.headers, "From").to_string(),
        subject: header_value(&payload.headers, "Subject").to_string(),
        snippet: detail.snippet,
        date: parse_date_header(header_value(&payload.headers, "Date")),
        body_text,
        body_html,
    }
}

// ============================================================================
// Client
// ============================================================================

pub struct GmailClient {
    http: reqwest::Client,
    tokens: TokenProvider,
}

impl GmailClient {
    pub fn new(tokens: TokenProvider) -> Self {
        Self {
            http: reqwest::Client::new(),
            tokens,
        }
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, MailError> {
        let status = resp.status();
        match status.as_u16() {
            200..=299 => Ok(resp),
            401 => Err(MailError::AuthExpired),
            404 => Err(MailError::NotFound(resp.url().path().to_string())),
            429 => Err(MailError::RateLimited),
            code => {
                let message = resp.text().await.unwrap_or_default();
                Err(MailError::Api {
                    status: code,
                    message,
                })
            }
        }
    }

    async fn fetch_detail(&self, id: &str) -> Result<MessageDetail, MailError> {
        let token = self.tokens.access_token().await?;
        let resp = self
            .http
            .get(format!("{API_BASE}/messages/{id}"))
            .bearer_auth(&token)
            .query(&[("format", "full")])
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl MailSource for GmailClient {
    async fn list_message_ids(&self, query: &str, limit: u32) -> Result<Vec<String>, MailError> {
        let token = self.tokens.access_token().await?;
        let resp = self
            .http
            .get(format!("{API_BASE}/messages"))
            .bearer_auth(&token)
            .query(&[("q", query), ("maxResults", &limit.to_string())])
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        let list: MessageListResponse = resp.json().await?;
        Ok(list.messages.into_iter().map(|m| m.id).collect())
    }

    async fn get_message(&self, id: &str) -> Result<MailMessage, MailError> {
        let detail = self.fetch_detail(id).await?;
        Ok(detail_to_message(detail))
    }

    async fn get_attachments(&self, message: &MailMessage) -> Result<Vec<Attachment>, MailError> {
        let detail = self.fetch_detail(&message.id).await?;
        let mut attachments = Vec::new();
        if let Some(payload) = &detail.payload {
            collect_attachments(payload, &mut attachments);
        }
        Ok(attachments)
    }

    async fn forward(
        &self,
        message_id: &str,
        recipients: &[String],
        note: Option<&str>,
    ) -> Result<(), MailError> {
        let original = self.get_message(message_id).await?;
        let mut body = String::new();
        if let Some(note) = note {
            body.push_str(note);
            body.push_str("\n\n");
        }
        body.push_str("---------- Forwarded message ----------\n");
        body.push_str(&format!("From: {}\n", original.from));
        body.push_str(&format!("Subject: {}\n\n", original.subject));
        body.push_str(&original.body_text);

        let mime = format!(
            "To: {}\r\nSubject: Fwd: {}\r\nContent-Type: text/plain; charset=\"UTF-8\"\r\n\r\n{}",
            recipients.join(", "),
            original.subject,
            body
        );
        self.send_email(&mime).await
    }

    async fn send_email(&self, mime: &str) -> Result<(), MailError> {
        let token = self.tokens.access_token().await?;
        let raw = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(mime.as_bytes());
        let resp = self
            .http
            .post(format!("{API_BASE}/messages/send"))
            .bearer_auth(&token)
            .json(&serde_json::json!({ "raw": raw }))
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn apply_label(&self, message_id: &str, label: &str) -> Result<(), MailError> {
        let token = self.tokens.access_token().await?;
        let resp = self
            .http
            .post(format!("{API_BASE}/messages/{message_id}/modify"))
            .bearer_auth(&token)
            .json(&serde_json::json!({ "addLabelIds": [label] }))
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
