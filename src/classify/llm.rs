//! Stage B backend: Anthropic Messages API over raw HTTP.
//!
//! One request per item, strict JSON out. The caller owns the timeout and
//! the degradation path; this module only builds the prompt, makes the
//! call, and returns the model's text.

use async_trait::async_trait;
use serde::Deserialize;

use super::{ClassifierError, ItemTypeModel, ModelRequest};

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
const MODEL: &str = "claude-opus-5";
const MAX_TOKENS: u32 = 1024;

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type", default)]
    block_type: String,
    #[serde(default)]
    text: String,
}

pub struct AnthropicModel {
    http: reqwest::Client,
    api_key: String,
}

impl AnthropicModel {
    pub fn new(api_key: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
        }
    }
}

fn build_prompt(request: &ModelRequest) -> String {
    format!(
        "You classify one email from a family's \"{pack}\" stream. Family members: {members}.\n\
         \n\
         Subject: {subject}\n\
         From: {from}\n\
         Snippet: {snippet}\n\
         \n\
         Decide whether this email is an obligation (demands attendance or action, \
         possibly by a date) or an announcement (informational only). If an obligation \
         has an explicit calendar date, extract it.\n\
         \n\
         Respond with exactly one JSON object and nothing else:\n\
         {{\"itemType\": \"obligation\"|\"announcement\", \"obligationDate\": \"YYYY-MM-DD\"|null, \
         \"confidence\": 0.0-1.0, \"reasoning\": \"one short sentence\"}}",
        pack = request.pack_name,
        members = request.members.join(", "),
        subject = request.subject,
        from = request.from,
        snippet = request.snippet,
    )
}

#[async_trait]
impl ItemTypeModel for AnthropicModel {
    async fn classify(&self, request: &ModelRequest) -> Result<String, ClassifierError> {
        let body = serde_json::json!({
            "model": MODEL,
            "max_tokens": MAX_TOKENS,
            "messages": [{"role": "user", "content": build_prompt(request)}],
        });

        let resp = self
            .http
            .post(API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ClassifierError::Api(format!("HTTP {status}: {text}")));
        }

        let parsed: MessagesResponse = resp.json().await?;

        if parsed.stop_reason.as_deref() == Some("refusal") {
            return Err(ClassifierError::Api("request declined".into()));
        }

        let text = parsed
            .content
            .iter()
            .find(|b| b.block_type == "text")
            .map(|b| b.text.clone())
            .unwrap_or_default();

        Ok(text)
    }
}
