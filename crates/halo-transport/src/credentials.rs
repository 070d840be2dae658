use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use halo_core::RealtimeError;

/// Injected capability that produces a bearer token for the transport
/// handshake. The connection layer never caches a token beyond a single
/// use: every (re)connection attempt asks the provider again.
#[async_trait]
pub trait CredentialProvider: Send + Sync + 'static {
    async fn access_token(&self) -> Result<SecretString, RealtimeError>;
}

/// Fixed token, for tests and hosts that manage refresh themselves.
pub struct StaticCredentials {
    token: SecretString,
}

impl StaticCredentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: SecretString::from(token.into()),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn access_token(&self) -> Result<SecretString, RealtimeError> {
        Ok(self.token.clone())
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Exchanges a long-lived refresh credential for a fresh access token by
/// POSTing to an external token endpoint. Owns no token storage: the
/// refresh credential is handed in at construction and the access token
/// goes straight into the next handshake.
pub struct RefreshingCredentials {
    http: reqwest::Client,
    token_url: String,
    refresh_token: SecretString,
}

impl RefreshingCredentials {
    pub fn new(token_url: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            token_url: token_url.into(),
            refresh_token: SecretString::from(refresh_token.into()),
        }
    }
}

#[async_trait]
impl CredentialProvider for RefreshingCredentials {
    async fn access_token(&self) -> Result<SecretString, RealtimeError> {
        let resp = self
            .http
            .post(&self.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", self.refresh_token.expose_secret()),
            ])
            .send()
            .await
            .map_err(|e| RealtimeError::RefreshFailed(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            if status.as_u16() == 401 || status.as_u16() == 403 {
                return Err(RealtimeError::CredentialRejected(body));
            }
            return Err(RealtimeError::RefreshFailed(format!("{status}: {body}")));
        }

        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| RealtimeError::RefreshFailed(e.to_string()))?;

        Ok(SecretString::from(body.access_token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_credentials_hand_back_the_token() {
        let creds = StaticCredentials::new("tok-abc");
        let token = creds.access_token().await.unwrap();
        assert_eq!(token.expose_secret(), "tok-abc");
    }

    #[test]
    fn token_response_parses_extra_fields() {
        let raw = r#"{"access_token": "at-1", "expires_in": 3600, "token_type": "bearer"}"#;
        let resp: TokenResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(resp.access_token, "at-1");
    }
}
