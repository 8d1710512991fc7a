use std::fmt;

use serde::{Deserialize, Serialize};

use onedrive_renewal_core::ClientCredentials;

/// Connection document written by the onboarding flow for one watched drive.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRecord {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    /// Principal whose drive root is watched.
    pub user_name: String,
    #[serde(default)]
    pub expiration_date_time: Option<String>,
}

impl SubscriptionRecord {
    pub fn credentials(&self) -> ClientCredentials {
        ClientCredentials::new(&self.tenant_id, &self.client_id, &self.client_secret)
    }
}

impl fmt::Debug for SubscriptionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRecord")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("user_name", &self.user_name)
            .field("expiration_date_time", &self.expiration_date_time)
            .finish()
    }
}

/// A record together with the location it was read from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredRecord {
    pub index: String,
    pub doc_id: String,
    pub record: SubscriptionRecord,
}
