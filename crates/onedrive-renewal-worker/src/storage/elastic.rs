use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use url::Url;

use onedrive_renewal_core::format_timestamp;

use super::{
    models::{StoredRecord, SubscriptionRecord},
    record_store::{
        DEFAULT_INDEX_PREFIX, EXPIRATION_FIELD, ExpiryCutoff, RecordStore, StoreError,
        UPDATED_AT_FIELD,
    },
};

const DEFAULT_PAGE_SIZE: usize = 500;
const PIT_KEEP_ALIVE: &str = "1m";

/// Credentials presented to the search cluster.
#[derive(Clone, Default, PartialEq, Eq)]
pub enum ElasticAuth {
    #[default]
    None,
    Basic {
        username: String,
        password: String,
    },
    ApiKey(String),
}

impl std::fmt::Debug for ElasticAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElasticAuth::None => f.write_str("None"),
            ElasticAuth::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            ElasticAuth::ApiKey(_) => f.write_str("ApiKey(<redacted>)"),
        }
    }
}

/// Record store backed by the Elasticsearch REST API.
#[derive(Clone, Debug)]
pub struct ElasticRecordStore {
    http_client: Client,
    base_url: Url,
    auth: ElasticAuth,
    index_prefix: String,
    page_size: usize,
}

impl ElasticRecordStore {
    pub fn new(http_client: Client, base_url: Url) -> Result<Self, StoreError> {
        if base_url.cannot_be_a_base() {
            return Err(StoreError::Unavailable(format!(
                "invalid record store url `{base_url}`"
            )));
        }
        Ok(Self {
            http_client,
            base_url,
            auth: ElasticAuth::None,
            index_prefix: DEFAULT_INDEX_PREFIX.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    pub fn with_auth(mut self, auth: ElasticAuth) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_index_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.index_prefix = prefix.into();
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, StoreError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| StoreError::Unavailable(format!("invalid base url `{}`", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            ElasticAuth::None => request,
            ElasticAuth::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
            ElasticAuth::ApiKey(key) => request.header("Authorization", format!("ApiKey {key}")),
        }
    }

    /// Names of every index carrying the connection prefix, sorted.
    pub async fn connection_indices(&self) -> Result<Vec<String>, StoreError> {
        let mut url = self.endpoint(&["_cat", "indices"])?;
        url.query_pairs_mut()
            .append_pair("format", "json")
            .append_pair("h", "index");

        let response = self.authorize(self.http_client.get(url)).send().await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(StoreError::Fetch {
                target: "_cat/indices".into(),
                status: status.as_u16(),
                body,
            });
        }

        let rows: Vec<CatIndex> =
            serde_json::from_str(&body).map_err(|err| StoreError::Decode(err.to_string()))?;
        let mut indices: Vec<String> = rows
            .into_iter()
            .map(|row| row.index)
            .filter(|name| name.starts_with(&self.index_prefix))
            .collect();
        indices.sort();
        indices.dedup();
        Ok(indices)
    }

    /// Open a point in time over `index`; `None` when the index is gone.
    async fn open_pit(&self, index: &str) -> Result<Option<String>, StoreError> {
        let mut url = self.endpoint(&[index, "_pit"])?;
        url.query_pairs_mut().append_pair("keep_alive", PIT_KEEP_ALIVE);

        let response = self.authorize(self.http_client.post(url)).send().await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::NOT_FOUND {
            debug!(target: "onedrive.renewal", index, "index disappeared before search");
            return Ok(None);
        }
        if !status.is_success() {
            return Err(StoreError::Fetch {
                target: index.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let opened: PitResponse =
            serde_json::from_str(&body).map_err(|err| StoreError::Decode(err.to_string()))?;
        Ok(Some(opened.id))
    }

    async fn close_pit(&self, pit_id: &str) {
        let Ok(url) = self.endpoint(&["_pit"]) else {
            return;
        };
        match self
            .authorize(self.http_client.delete(url))
            .json(&json!({ "id": pit_id }))
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => debug!(
                target: "onedrive.renewal",
                status = response.status().as_u16(),
                "point in time was not closed",
            ),
            Err(err) => debug!(
                target: "onedrive.renewal",
                error = %err,
                "failed to close point in time",
            ),
        }
    }

    async fn search_index(
        &self,
        index: &str,
        cutoff: &ExpiryCutoff,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let Some(mut pit_id) = self.open_pit(index).await? else {
            return Ok(Vec::new());
        };
        let result = self.page_expiring(index, cutoff, &mut pit_id).await;
        self.close_pit(&pit_id).await;
        result
    }

    /// Walk every expiring document in `index` with `search_after`.
    ///
    /// Sorting on `_shard_doc` after the expiration gives each hit a unique
    /// position inside the point in time, so pages never overlap.
    async fn page_expiring(
        &self,
        index: &str,
        cutoff: &ExpiryCutoff,
        pit_id: &mut String,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let url = self.endpoint(&["_search"])?;
        let cutoff_expr = cutoff.as_date_math();
        let mut records = Vec::new();
        let mut search_after: Option<Vec<Value>> = None;

        loop {
            let mut query = json!({
                "query": { "range": { EXPIRATION_FIELD: { "lt": cutoff_expr } } },
                "sort": [
                    { EXPIRATION_FIELD: { "order": "asc" } },
                    { "_shard_doc": "asc" },
                ],
                "size": self.page_size,
                "track_total_hits": false,
                "pit": { "id": pit_id.as_str(), "keep_alive": PIT_KEEP_ALIVE },
            });
            if let Some(after) = &search_after {
                query["search_after"] = Value::Array(after.clone());
            }

            let response = self
                .authorize(self.http_client.post(url.clone()))
                .json(&query)
                .send()
                .await?;
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            if !status.is_success() {
                return Err(StoreError::Fetch {
                    target: index.to_string(),
                    status: status.as_u16(),
                    body,
                });
            }

            let page: SearchResponse =
                serde_json::from_str(&body).map_err(|err| StoreError::Decode(err.to_string()))?;
            if let Some(next_id) = page.pit_id {
                *pit_id = next_id;
            }
            let hits = page.hits.hits;
            let fetched = hits.len();
            let last_sort = hits.last().map(|hit| hit.sort.clone());

            for hit in hits {
                match serde_json::from_value::<SubscriptionRecord>(hit.source) {
                    Ok(record) => records.push(StoredRecord {
                        index: index.to_string(),
                        doc_id: hit.id,
                        record,
                    }),
                    Err(err) => warn!(
                        target: "onedrive.renewal",
                        index,
                        doc_id = hit.id.as_str(),
                        error = %err,
                        "skipping malformed connection document",
                    ),
                }
            }

            if fetched < self.page_size {
                return Ok(records);
            }
            match last_sort {
                Some(sort) if !sort.is_empty() => search_after = Some(sort),
                _ => {
                    return Err(StoreError::Decode(format!(
                        "search page for `{index}` ended without sort values"
                    )));
                }
            }
        }
    }
}

#[async_trait]
impl RecordStore for ElasticRecordStore {
    async fn list_expiring(&self, cutoff: &ExpiryCutoff) -> Result<Vec<StoredRecord>, StoreError> {
        let indices = self.connection_indices().await?;
        info!(target: "onedrive.renewal", ?indices, "found connection indices");

        let mut expiring = Vec::new();
        for index in &indices {
            expiring.extend(self.search_index(index, cutoff).await?);
        }
        Ok(expiring)
    }

    async fn apply_renewal(
        &self,
        index: &str,
        doc_id: &str,
        expires_at: OffsetDateTime,
    ) -> Result<(), StoreError> {
        let url = self.endpoint(&[index, "_update", doc_id])?;
        let body = json!({
            "doc": {
                EXPIRATION_FIELD: format_timestamp(expires_at),
                UPDATED_AT_FIELD: format_timestamp(OffsetDateTime::now_utc()),
            }
        });

        let response = self
            .authorize(self.http_client.post(url))
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StoreError::Update {
                index: index.to_string(),
                doc_id: doc_id.to_string(),
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        info!(target: "onedrive.renewal", index, doc_id, "updated expirationDateTime");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct CatIndex {
    index: String,
}

#[derive(Debug, Deserialize)]
struct PitResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    pit_id: Option<String>,
    hits: SearchHits,
}

#[derive(Debug, Deserialize)]
struct SearchHits {
    #[serde(default)]
    hits: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_source", default)]
    source: Value,
    #[serde(default)]
    sort: Vec<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_escapes_path_segments() {
        let store = ElasticRecordStore::new(
            Client::new(),
            Url::parse("http://search.local:9200/").expect("url"),
        )
        .expect("store");
        let url = store
            .endpoint(&["datasource_onedrive_connection_a", "_update", "doc/1"])
            .expect("endpoint");
        assert_eq!(
            url.as_str(),
            "http://search.local:9200/datasource_onedrive_connection_a/_update/doc%2F1"
        );
    }

    #[test]
    fn auth_debug_hides_secrets() {
        let auth = ElasticAuth::Basic {
            username: "elastic".into(),
            password: "changeme".into(),
        };
        assert!(!format!("{auth:?}").contains("changeme"));
        assert_eq!(
            format!("{:?}", ElasticAuth::ApiKey("c2VjcmV0".into())),
            "ApiKey(<redacted>)"
        );
    }
}
