use reqwest::{Client, header};
use time::{Duration, OffsetDateTime};
use tracing::debug;

use crate::{
    retry::{RetryPolicy, Transient},
    types::{AccessToken, GraphEndpoints, Subscription, SubscriptionRequest, format_timestamp},
};

/// Change types watched on every drive root.
pub const CHANGE_TYPES: &str = "created,updated,deleted";
pub const DEFAULT_LIFETIME: Duration = Duration::hours(1);
pub const DEFAULT_CLIENT_STATE: &str = "secretClientValue";

#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    #[error("renewal failed: graph returned {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("renewal failed: invalid subscription response: {0}")]
    InvalidResponse(String),
    #[error("renewal failed: transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Creating a subscription is not idempotent: only failures where Graph
/// cannot have accepted the request are retried.
impl Transient for SubscriptionError {
    fn is_transient(&self) -> bool {
        match self {
            SubscriptionError::Transport(err) => err.is_connect(),
            SubscriptionError::Rejected { status, .. } => matches!(status, 429 | 503),
            SubscriptionError::InvalidResponse(_) => false,
        }
    }
}

/// Fixed parts of every subscription payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionSettings {
    pub notification_url: String,
    pub client_state: String,
    pub lifetime: Duration,
}

impl SubscriptionSettings {
    pub fn new(notification_url: impl Into<String>) -> Self {
        Self {
            notification_url: notification_url.into(),
            client_state: DEFAULT_CLIENT_STATE.to_string(),
            lifetime: DEFAULT_LIFETIME,
        }
    }

    pub fn with_client_state(mut self, client_state: impl Into<String>) -> Self {
        self.client_state = client_state.into();
        self
    }

    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }
}

/// Creates drive-root change subscriptions through Microsoft Graph.
#[derive(Clone, Debug)]
pub struct SubscriptionClient {
    http_client: Client,
    endpoints: GraphEndpoints,
    settings: SubscriptionSettings,
    retry: RetryPolicy,
}

impl SubscriptionClient {
    pub fn new(
        http_client: Client,
        endpoints: GraphEndpoints,
        settings: SubscriptionSettings,
    ) -> Self {
        Self {
            http_client,
            endpoints,
            settings,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn settings(&self) -> &SubscriptionSettings {
        &self.settings
    }

    /// Build the payload for `principal`, expiring one lifetime after `now`.
    pub fn build_request(&self, principal: &str, now: OffsetDateTime) -> SubscriptionRequest {
        let expires_at = now.checked_add(self.settings.lifetime).unwrap_or(now);
        SubscriptionRequest {
            change_type: CHANGE_TYPES.to_string(),
            notification_url: self.settings.notification_url.clone(),
            resource: format!("/users/{principal}/drive/root"),
            expiration_date_time: format_timestamp(expires_at),
            client_state: self.settings.client_state.clone(),
        }
    }

    /// Create a fresh subscription on the principal's drive root.
    pub async fn create(
        &self,
        token: &AccessToken,
        principal: &str,
    ) -> Result<Subscription, SubscriptionError> {
        self.retry
            .run("subscription renewal", || async {
                let request = self.build_request(principal, OffsetDateTime::now_utc());
                self.send(token, &request).await
            })
            .await
    }

    async fn send(
        &self,
        token: &AccessToken,
        request: &SubscriptionRequest,
    ) -> Result<Subscription, SubscriptionError> {
        debug!(
            target: "onedrive.renewal",
            resource = request.resource.as_str(),
            expiration = request.expiration_date_time.as_str(),
            "creating subscription",
        );

        let response = self
            .http_client
            .post(self.endpoints.subscriptions_url())
            .header(header::AUTHORIZATION, token.bearer())
            .json(request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(SubscriptionError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_str(&body)
            .map_err(|err| SubscriptionError::InvalidResponse(err.to_string()))
    }
}
