//! Access-token handling for the Gmail adapter.
//!
//! The OAuth consent flow is out of scope; this module mints short-lived
//! access tokens from the long-lived refresh token in the environment.
//! Refreshes are serialized behind an async mutex so concurrent workers
//! never race the token endpoint.

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::MailError;
use crate::config::EnvSettings;

const TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Consider a token expired when within this many seconds of its expiry.
const EXPIRY_SLACK_SECS: i64 = 60;

#[derive(Debug)]
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct TokenProvider {
    client_id: String,
    client_secret: String,
    refresh_token: String,
    http: reqwest::Client,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenProvider {
    /// Build from environment settings. All three Google variables are
    /// required; a missing one is a permanent (non-transient) error.
    pub fn from_env(env: &EnvSettings) -> Result<Self, MailError> {
        let require = |value: &Option<String>, name: &str| {
            value
                .clone()
                .ok_or_else(|| MailError::CredentialsMissing(name.to_string()))
        };
        Ok(Self {
            client_id: require(&env.google_client_id, "GOOGLE_CLIENT_ID")?,
            client_secret: require(&env.google_client_secret, "GOOGLE_CLIENT_SECRET")?,
            refresh_token: require(&env.google_refresh_token, "GOOGLE_REFRESH_TOKEN")?,
            http: reqwest::Client::new(),
            cached: Mutex::new(None),
        })
    }

    /// A valid access token, refreshed when missing or near expiry.
    pub async fn access_token(&self) -> Result<String, MailError> {
        let mut cached = self.cached.lock().await;

        if let Some(token) = cached.as_ref() {
            let slack = chrono::Duration::seconds(EXPIRY_SLACK_SECS);
            if token.expires_at > Utc::now() + slack {
                return Ok(token.access_token.clone());
            }
        }

        let refreshed = self.refresh().await?;
        let access_token = refreshed.access_token.clone();
        *cached = Some(refreshed);
        Ok(access_token)
    }

    async fn refresh(&self) -> Result<CachedToken, MailError> {
        let resp = self
            .http
            .post(TOKEN_URI)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", self.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            if status.as_u16() == 400 || status.as_u16() == 401 {
                return Err(MailError::AuthExpired);
            }
            return Err(MailError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let body: serde_json::Value = resp.json().await?;
        let access_token = body["access_token"]
            .as_str()
            .ok_or_else(|| MailError::Malformed("no access_token in refresh response".into()))?
            .to_string();
        let expires_in = body["expires_in"].as_i64().unwrap_or(3600);

        Ok(CachedToken {
            access_token,
            expires_at: Utc::now() + chrono::Duration::seconds(expires_in),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_credentials_is_permanent() {
        let env = EnvSettings::default();
        let err = TokenProvider::from_env(&env).unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("GOOGLE_CLIENT_ID"));
    }

    #[test]
    fn test_partial_credentials_name_the_gap() {
        let env = EnvSettings {
            google_client_id: Some("id".into()),
            google_client_secret: Some("secret".into()),
            ..Default::default()
        };
        let err = TokenProvider::from_env(&env).unwrap_err();
        assert!(err.to_string().contains("GOOGLE_REFRESH_TOKEN"));
    }
}
