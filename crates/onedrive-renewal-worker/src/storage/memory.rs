use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        PoisonError, RwLock,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use tracing::debug;

use onedrive_renewal_core::{format_timestamp, parse_timestamp};

use super::{
    models::{StoredRecord, SubscriptionRecord},
    record_store::{
        DEFAULT_INDEX_PREFIX, EXPIRATION_FIELD, ExpiryCutoff, RecordStore, StoreError,
        UPDATED_AT_FIELD,
    },
};

type Documents = BTreeMap<String, BTreeMap<String, Value>>;

/// Process-local record store holding raw JSON documents per index.
#[derive(Debug)]
pub struct InMemoryRecordStore {
    index_prefix: String,
    documents: RwLock<Documents>,
    rejected_updates: RwLock<BTreeSet<(String, String)>>,
    listing_fails: AtomicBool,
    update_calls: AtomicUsize,
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::with_index_prefix(DEFAULT_INDEX_PREFIX)
    }

    pub fn with_index_prefix(prefix: impl Into<String>) -> Self {
        Self {
            index_prefix: prefix.into(),
            documents: RwLock::new(BTreeMap::new()),
            rejected_updates: RwLock::new(BTreeSet::new()),
            listing_fails: AtomicBool::new(false),
            update_calls: AtomicUsize::new(0),
        }
    }

    /// Insert or replace a document.
    pub fn insert<T: Serialize>(
        &self,
        index: impl Into<String>,
        doc_id: impl Into<String>,
        document: &T,
    ) -> Result<(), StoreError> {
        let value =
            serde_json::to_value(document).map_err(|err| StoreError::Decode(err.to_string()))?;
        self.documents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(index.into())
            .or_default()
            .insert(doc_id.into(), value);
        Ok(())
    }

    /// Raw document as currently stored.
    pub fn document(&self, index: &str, doc_id: &str) -> Option<Value> {
        self.documents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(index)
            .and_then(|docs| docs.get(doc_id))
            .cloned()
    }

    /// Make every future update of this document fail.
    pub fn reject_updates_for(&self, index: impl Into<String>, doc_id: impl Into<String>) {
        self.rejected_updates
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((index.into(), doc_id.into()));
    }

    /// While set, `list_expiring` reports the store as unavailable.
    pub fn fail_listing(&self, fail: bool) {
        self.listing_fails.store(fail, Ordering::SeqCst);
    }

    /// Number of `apply_renewal` calls received, successful or not.
    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn list_expiring(&self, cutoff: &ExpiryCutoff) -> Result<Vec<StoredRecord>, StoreError> {
        if self.listing_fails.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("record listing disabled".into()));
        }
        let cutoff_at = cutoff.instant(OffsetDateTime::now_utc());
        let documents = self
            .documents
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        let mut expiring = Vec::new();
        for (index, docs) in documents.iter() {
            if !index.starts_with(&self.index_prefix) {
                continue;
            }

            let mut matches: Vec<(OffsetDateTime, StoredRecord)> = Vec::new();
            for (doc_id, value) in docs {
                let expires_at = match value
                    .get(EXPIRATION_FIELD)
                    .and_then(Value::as_str)
                    .map(parse_timestamp)
                {
                    Some(Ok(at)) => at,
                    _ => continue,
                };
                if expires_at >= cutoff_at {
                    continue;
                }
                match serde_json::from_value::<SubscriptionRecord>(value.clone()) {
                    Ok(record) => matches.push((
                        expires_at,
                        StoredRecord {
                            index: index.clone(),
                            doc_id: doc_id.clone(),
                            record,
                        },
                    )),
                    Err(err) => debug!(
                        target: "onedrive.renewal",
                        index = index.as_str(),
                        doc_id = doc_id.as_str(),
                        error = %err,
                        "skipping malformed connection document",
                    ),
                }
            }

            matches.sort_by_key(|(expires_at, _)| *expires_at);
            expiring.extend(matches.into_iter().map(|(_, stored)| stored));
        }

        Ok(expiring)
    }

    async fn apply_renewal(
        &self,
        index: &str,
        doc_id: &str,
        expires_at: OffsetDateTime,
    ) -> Result<(), StoreError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);

        let rejected = self
            .rejected_updates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&(index.to_string(), doc_id.to_string()));
        if rejected {
            return Err(StoreError::Update {
                index: index.to_string(),
                doc_id: doc_id.to_string(),
                status: 409,
                body: "version conflict".into(),
            });
        }

        let mut documents = self
            .documents
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let document = documents
            .get_mut(index)
            .and_then(|docs| docs.get_mut(doc_id))
            .and_then(Value::as_object_mut)
            .ok_or_else(|| StoreError::Update {
                index: index.to_string(),
                doc_id: doc_id.to_string(),
                status: 404,
                body: "document missing".into(),
            })?;

        document.insert(
            EXPIRATION_FIELD.to_string(),
            Value::String(format_timestamp(expires_at)),
        );
        document.insert(
            UPDATED_AT_FIELD.to_string(),
            Value::String(format_timestamp(OffsetDateTime::now_utc())),
        );
        Ok(())
    }
}
