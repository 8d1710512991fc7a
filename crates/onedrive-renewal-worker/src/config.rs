use std::{env, str::FromStr, time::Duration};

use url::Url;

use onedrive_renewal_core::{
    GraphEndpoints, RetryPolicy, SubscriptionSettings,
    subscriptions::DEFAULT_CLIENT_STATE,
    types::{DEFAULT_GRAPH_BASE_URL, DEFAULT_LOGIN_BASE_URL},
};

use crate::storage::{DEFAULT_INDEX_PREFIX, ElasticAuth, ExpiryCutoff};

const DEFAULT_ELASTICSEARCH_URL: &str = "http://localhost:9200";
const DEFAULT_INTERVAL_SECS: u64 = 300;
const DEFAULT_LIFETIME_SECS: u64 = 3600;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingEnv(&'static str),
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

/// Everything the renewal worker needs, resolved from the environment.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub notification_url: Url,
    pub client_state: String,
    pub subscription_lifetime: Duration,
    pub elasticsearch_url: Url,
    pub elasticsearch_auth: ElasticAuth,
    pub index_prefix: String,
    pub interval: Duration,
    pub lookahead: Duration,
    pub graph_endpoints: GraphEndpoints,
    pub http_timeout: Duration,
    pub max_attempts: u32,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Resolve configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let notification_url = var("NOTIFICATION_URL")
            .ok_or(ConfigError::MissingEnv("NOTIFICATION_URL"))
            .and_then(|raw| parse_url("NOTIFICATION_URL", &raw))?;
        let elasticsearch_url = parse_url(
            "ELASTICSEARCH_URL",
            &var("ELASTICSEARCH_URL").unwrap_or_else(|| DEFAULT_ELASTICSEARCH_URL.into()),
        )?;

        let elasticsearch_auth = match (
            var("ELASTICSEARCH_API_KEY"),
            var("ELASTICSEARCH_USERNAME"),
            var("ELASTICSEARCH_PASSWORD"),
        ) {
            (Some(key), _, _) => ElasticAuth::ApiKey(key),
            (None, Some(username), Some(password)) => ElasticAuth::Basic { username, password },
            (None, Some(_), None) => return Err(ConfigError::MissingEnv("ELASTICSEARCH_PASSWORD")),
            (None, None, Some(_)) => return Err(ConfigError::MissingEnv("ELASTICSEARCH_USERNAME")),
            (None, None, None) => ElasticAuth::None,
        };

        let login_base = var("GRAPH_LOGIN_BASE_URL").unwrap_or_else(|| DEFAULT_LOGIN_BASE_URL.into());
        let graph_base = var("GRAPH_API_BASE_URL").unwrap_or_else(|| DEFAULT_GRAPH_BASE_URL.into());
        parse_url("GRAPH_LOGIN_BASE_URL", &login_base)?;
        parse_url("GRAPH_API_BASE_URL", &graph_base)?;

        let interval_secs = parse_or(&var, "RENEWAL_INTERVAL_SECS", DEFAULT_INTERVAL_SECS)?;
        let lookahead_secs = parse_or(&var, "RENEWAL_LOOKAHEAD_SECS", 0u64)?;
        let lifetime_secs = parse_or(&var, "SUBSCRIPTION_LIFETIME_SECS", DEFAULT_LIFETIME_SECS)?;
        let timeout_secs = parse_or(&var, "HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT_SECS)?;
        let max_attempts = parse_or(&var, "RENEWAL_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?;

        if lifetime_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "SUBSCRIPTION_LIFETIME_SECS",
                reason: "must be greater than zero".into(),
            });
        }
        if lifetime_secs <= lookahead_secs {
            return Err(ConfigError::InvalidValue {
                key: "SUBSCRIPTION_LIFETIME_SECS",
                reason: format!(
                    "{lifetime_secs}s must exceed RENEWAL_LOOKAHEAD_SECS ({lookahead_secs}s)"
                ),
            });
        }

        Ok(Self {
            notification_url,
            client_state: var("SUBSCRIPTION_CLIENT_STATE")
                .unwrap_or_else(|| DEFAULT_CLIENT_STATE.into()),
            subscription_lifetime: Duration::from_secs(lifetime_secs),
            elasticsearch_url,
            elasticsearch_auth,
            index_prefix: var("RECORD_INDEX_PREFIX").unwrap_or_else(|| DEFAULT_INDEX_PREFIX.into()),
            interval: Duration::from_secs(interval_secs.max(1)),
            lookahead: Duration::from_secs(lookahead_secs),
            graph_endpoints: GraphEndpoints::new(login_base, graph_base),
            http_timeout: Duration::from_secs(timeout_secs.max(1)),
            max_attempts: max_attempts.max(1),
        })
    }

    pub fn subscription_settings(&self) -> SubscriptionSettings {
        let lifetime = time::Duration::try_from(self.subscription_lifetime)
            .unwrap_or(onedrive_renewal_core::subscriptions::DEFAULT_LIFETIME);
        SubscriptionSettings::new(self.notification_url.as_str())
            .with_client_state(self.client_state.clone())
            .with_lifetime(lifetime)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default().with_max_attempts(self.max_attempts)
    }

    pub fn cutoff(&self) -> ExpiryCutoff {
        ExpiryCutoff::with_lookahead(self.lookahead)
    }
}

fn parse_url(key: &'static str, raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw).map_err(|err| ConfigError::InvalidValue {
        key,
        reason: format!("`{raw}` is not a valid url ({err})"),
    })
}

fn parse_or<T, V>(var: &V, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    V: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(raw) => raw.parse::<T>().map_err(|err| ConfigError::InvalidValue {
            key,
            reason: format!("`{raw}`: {err}"),
        }),
        None => Ok(default),
    }
}
