//! Token exchange
//!
//! Exchanges stored username/password for a short-lived bearer token at the
//! account's token endpoint. The response encoding is owned by the endpoint;
//! only the access token and its expiry are consumed here.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use crate::error::{ExecutorError, Result};

use super::BasicCredential;

/// Successful token-exchange payload.
///
/// Servers report expiry either as `expiresIn` seconds from now or as an
/// `expiresAt` unix timestamp; both are accepted, along with snake_case
/// spellings of every field.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    #[serde(alias = "access_token", alias = "token")]
    pub access_token: String,
    #[serde(default, alias = "token_type")]
    pub token_type: Option<String>,
    #[serde(default, alias = "expires_in")]
    pub expires_in: Option<u64>,
    #[serde(default, alias = "expires_at")]
    pub expires_at: Option<i64>,
}

impl TokenResponse {
    /// Expiry instant for the obtained token, if the server reported one.
    pub fn expiry(&self) -> Option<SystemTime> {
        if let Some(at) = self.expires_at {
            let at = u64::try_from(at).ok()?;
            return Some(UNIX_EPOCH + Duration::from_secs(at));
        }
        self.expires_in
            .map(|seconds| SystemTime::now() + Duration::from_secs(seconds))
    }
}

/// Performs the token-exchange network call.
///
/// A seam so tests can substitute a double without standing up a server.
#[async_trait]
pub trait TokenExchanging: Send + Sync {
    async fn exchange(
        &self,
        token_url: &Url,
        username: &str,
        password: &str,
    ) -> Result<TokenResponse>;
}

/// Token exchange over HTTP: `POST <token_url>` with basic authorization.
pub struct HttpTokenExchange {
    client: reqwest::Client,
}

impl HttpTokenExchange {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TokenExchanging for HttpTokenExchange {
    async fn exchange(
        &self,
        token_url: &Url,
        username: &str,
        password: &str,
    ) -> Result<TokenResponse> {
        info!(url = token_url.as_str(), "Requesting token");

        let credential = BasicCredential {
            username: username.to_string(),
            password: password.to_string(),
        };
        let response = self
            .client
            .post(token_url.clone())
            .header(
                reqwest::header::USER_AGENT,
                crate::network::request::CUSTOM_USER_AGENT,
            )
            .header(reqwest::header::AUTHORIZATION, credential.authorization_header())
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() != 200 {
            let body = response.text().await.unwrap_or_default();
            debug!(status = status.as_u16(), body, "Token request rejected");
            return Err(ExecutorError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let token: TokenResponse = response.json().await?;
        info!(
            expires_in = token.expires_in,
            expires_at = token.expires_at,
            "Token obtained"
        );
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_camel_case_response() {
        let token: TokenResponse =
            serde_json::from_str(r#"{"accessToken": "abc", "tokenType": "Bearer", "expiresIn": 3600}"#)
                .unwrap();
        assert_eq!(token.access_token, "abc");
        assert_eq!(token.expires_in, Some(3600));
        let expiry = token.expiry().unwrap();
        assert!(expiry > SystemTime::now() + Duration::from_secs(3500));
    }

    #[test]
    fn test_decode_snake_case_response() {
        let token: TokenResponse =
            serde_json::from_str(r#"{"access_token": "abc", "expires_in": 60}"#).unwrap();
        assert_eq!(token.access_token, "abc");
        assert_eq!(token.expires_in, Some(60));
    }

    #[test]
    fn test_decode_expires_at_response() {
        let token: TokenResponse =
            serde_json::from_str(r#"{"token": "abc", "expiresAt": 4102444800}"#).unwrap();
        assert_eq!(
            token.expiry(),
            Some(UNIX_EPOCH + Duration::from_secs(4_102_444_800))
        );
    }

    #[test]
    fn test_missing_expiry_means_no_instant() {
        let token: TokenResponse = serde_json::from_str(r#"{"accessToken": "abc"}"#).unwrap();
        assert_eq!(token.expiry(), None);
    }
}
