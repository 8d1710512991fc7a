use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;

use super::models::StoredRecord;

/// Index name prefix shared by every OneDrive connection collection.
pub const DEFAULT_INDEX_PREFIX: &str = "datasource_onedrive_connection_";

/// Field holding the subscription expiry in each connection document.
pub const EXPIRATION_FIELD: &str = "expirationDateTime";
pub const UPDATED_AT_FIELD: &str = "updatedAt";

/// Records expiring before `now + lookahead` are due for renewal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExpiryCutoff {
    lookahead: Duration,
}

impl ExpiryCutoff {
    pub fn now() -> Self {
        Self::default()
    }

    pub fn with_lookahead(lookahead: Duration) -> Self {
        Self { lookahead }
    }

    pub fn lookahead(&self) -> Duration {
        self.lookahead
    }

    /// Date-math expression evaluated server-side by the search engine.
    pub fn as_date_math(&self) -> String {
        match self.lookahead.as_secs() {
            0 => "now".to_string(),
            secs => format!("now+{secs}s"),
        }
    }

    /// Absolute cutoff instant relative to `now`.
    pub fn instant(&self, now: OffsetDateTime) -> OffsetDateTime {
        time::Duration::try_from(self.lookahead)
            .ok()
            .and_then(|lookahead| now.checked_add(lookahead))
            .unwrap_or(now)
    }
}

/// Access to stored subscription records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Every record in a prefixed collection whose expiration is before the cutoff,
    /// ordered by collection name and then by expiration.
    async fn list_expiring(&self, cutoff: &ExpiryCutoff) -> Result<Vec<StoredRecord>, StoreError>;

    /// Persist a new expiration and refresh `updatedAt`, leaving other fields alone.
    async fn apply_renewal(
        &self,
        index: &str,
        doc_id: &str,
        expires_at: OffsetDateTime,
    ) -> Result<(), StoreError>;
}

/// Errors arising from record store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to fetch stored records from {target}: {status}: {body}")]
    Fetch {
        target: String,
        status: u16,
        body: String,
    },
    #[error("failed to update {index}/{doc_id}: {status}: {body}")]
    Update {
        index: String,
        doc_id: String,
        status: u16,
        body: String,
    },
    #[error("record store transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("record store response could not be decoded: {0}")]
    Decode(String),
    #[error("record store unavailable: {0}")]
    Unavailable(String),
}
