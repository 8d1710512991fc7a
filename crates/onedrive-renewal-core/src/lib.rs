//! Microsoft Graph primitives for keeping OneDrive change subscriptions alive.

pub mod credentials;
pub mod retry;
pub mod subscriptions;
pub mod types;

pub use credentials::{CredentialError, CredentialExchange};
pub use retry::{RetryPolicy, Transient};
pub use subscriptions::{SubscriptionClient, SubscriptionError, SubscriptionSettings};
pub use types::{
    AccessToken, ClientCredentials, GraphEndpoints, Subscription, SubscriptionRequest,
    format_timestamp, parse_timestamp,
};
