use reqwest::{Client, header};
use serde::Deserialize;
use time::{Duration, OffsetDateTime};
use tracing::debug;

use crate::{
    retry::{RetryPolicy, Transient, is_transient_status},
    types::{AccessToken, ClientCredentials, GraphEndpoints},
};

const DEFAULT_EXPIRY_SECS: i64 = 3600;

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("credential exchange failed: missing {0}")]
    MissingField(&'static str),
    #[error("credential exchange failed: token endpoint returned {status}: {body}")]
    Endpoint { status: u16, body: String },
    #[error("credential exchange failed: invalid token response: {0}")]
    InvalidResponse(String),
    #[error("credential exchange failed: transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl Transient for CredentialError {
    fn is_transient(&self) -> bool {
        match self {
            CredentialError::Transport(_) => true,
            CredentialError::Endpoint { status, .. } => is_transient_status(*status),
            CredentialError::MissingField(_) | CredentialError::InvalidResponse(_) => false,
        }
    }
}

/// Client-credentials grant against the Microsoft identity platform.
#[derive(Clone, Debug)]
pub struct CredentialExchange {
    http_client: Client,
    endpoints: GraphEndpoints,
    retry: RetryPolicy,
}

impl CredentialExchange {
    pub fn new(http_client: Client, endpoints: GraphEndpoints) -> Self {
        Self {
            http_client,
            endpoints,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Exchange app credentials for a Graph access token.
    pub async fn exchange(
        &self,
        credentials: &ClientCredentials,
    ) -> Result<AccessToken, CredentialError> {
        if credentials.tenant_id.trim().is_empty() {
            return Err(CredentialError::MissingField("tenant_id"));
        }
        if credentials.client_id.is_empty() || credentials.client_secret.is_empty() {
            return Err(CredentialError::MissingField("client_id/client_secret"));
        }

        self.retry
            .run("credential exchange", || self.request_token(credentials))
            .await
    }

    async fn request_token(
        &self,
        credentials: &ClientCredentials,
    ) -> Result<AccessToken, CredentialError> {
        let token_url = self.endpoints.token_url(credentials.tenant_id.trim());
        let scope = self.endpoints.default_scope();
        let form = [
            ("client_id", credentials.client_id.as_str()),
            ("scope", scope.as_str()),
            ("grant_type", "client_credentials"),
            ("client_secret", credentials.client_secret.as_str()),
        ];

        debug!(
            target: "onedrive.renewal",
            tenant = credentials.tenant_id.as_str(),
            client = credentials.client_id.as_str(),
            "requesting access token",
        );

        let response = self
            .http_client
            .post(&token_url)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(CredentialError::Endpoint {
                status: status.as_u16(),
                body,
            });
        }

        let payload: TokenResponse = serde_json::from_str(&body)
            .map_err(|err| CredentialError::InvalidResponse(err.to_string()))?;
        if payload.access_token.is_empty() {
            return Err(CredentialError::InvalidResponse(
                "missing access_token in token response".into(),
            ));
        }

        let now = OffsetDateTime::now_utc();
        let expires_in = payload.expires_in.unwrap_or(DEFAULT_EXPIRY_SECS);
        let expires_at = now
            .checked_add(Duration::seconds(expires_in.max(1)))
            .unwrap_or(now);

        Ok(AccessToken {
            access_token: payload.access_token,
            token_type: payload.token_type.unwrap_or_else(|| "Bearer".to_string()),
            expires_at,
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}
