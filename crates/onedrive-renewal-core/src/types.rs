use std::fmt;

use serde::{Deserialize, Serialize};
use time::{
    OffsetDateTime, UtcOffset, format_description::well_known::Rfc3339, macros::format_description,
};

/// Default Microsoft identity platform authority.
pub const DEFAULT_LOGIN_BASE_URL: &str = "https://login.microsoftonline.com";
/// Default Microsoft Graph API host.
pub const DEFAULT_GRAPH_BASE_URL: &str = "https://graph.microsoft.com";

/// Base URLs for the identity platform and the Graph API.
///
/// Both can be pointed at national clouds or at a local mock server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GraphEndpoints {
    login_base: String,
    graph_base: String,
}

impl GraphEndpoints {
    pub fn new(login_base: impl Into<String>, graph_base: impl Into<String>) -> Self {
        Self {
            login_base: trim_base(login_base.into()),
            graph_base: trim_base(graph_base.into()),
        }
    }

    /// Token endpoint for the given directory tenant.
    pub fn token_url(&self, tenant_id: &str) -> String {
        format!("{}/{tenant_id}/oauth2/v2.0/token", self.login_base)
    }

    /// App-only scope covering every Graph permission granted to the client.
    pub fn default_scope(&self) -> String {
        format!("{}/.default", self.graph_base)
    }

    pub fn subscriptions_url(&self) -> String {
        format!("{}/v1.0/subscriptions", self.graph_base)
    }
}

impl Default for GraphEndpoints {
    fn default() -> Self {
        Self::new(DEFAULT_LOGIN_BASE_URL, DEFAULT_GRAPH_BASE_URL)
    }
}

fn trim_base(value: String) -> String {
    value.trim_end_matches('/').to_string()
}

/// App registration credentials used for the client-credentials grant.
#[derive(Clone, PartialEq, Eq)]
pub struct ClientCredentials {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
}

impl ClientCredentials {
    pub fn new(
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

/// Bearer token issued by the identity platform.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub access_token: String,
    pub token_type: String,
    pub expires_at: OffsetDateTime,
}

impl AccessToken {
    /// Value for the `Authorization` header.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("access_token", &"<redacted>")
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Body of a Graph `POST /subscriptions` request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRequest {
    pub change_type: String,
    pub notification_url: String,
    pub resource: String,
    pub expiration_date_time: String,
    pub client_state: String,
}

/// Subscription resource echoed back by Graph.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub resource: String,
    #[serde(default)]
    pub change_type: String,
    #[serde(default)]
    pub expiration_date_time: Option<String>,
    #[serde(default)]
    pub notification_url: Option<String>,
    #[serde(default)]
    pub client_state: Option<String>,
}

impl Subscription {
    /// Expiration reported by Graph, if present and well-formed.
    pub fn expires_at(&self) -> Option<OffsetDateTime> {
        self.expiration_date_time
            .as_deref()
            .and_then(|value| parse_timestamp(value).ok())
    }
}

/// Render a timestamp as UTC with millisecond precision, e.g. `2024-05-01T10:00:00.000Z`.
pub fn format_timestamp(at: OffsetDateTime) -> String {
    let utc = at.to_offset(UtcOffset::UTC);
    utc.format(format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z"
    ))
    .or_else(|_| utc.format(&Rfc3339))
    .unwrap_or_default()
}

/// Parse any RFC 3339 timestamp, including Graph's seven-digit fractions.
pub fn parse_timestamp(value: &str) -> Result<OffsetDateTime, time::error::Parse> {
    OffsetDateTime::parse(value.trim(), &Rfc3339)
}
