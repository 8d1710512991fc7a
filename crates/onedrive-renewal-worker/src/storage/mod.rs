pub mod elastic;
pub mod memory;
pub mod models;
pub mod record_store;

pub use elastic::{ElasticAuth, ElasticRecordStore};
pub use memory::InMemoryRecordStore;
pub use models::{StoredRecord, SubscriptionRecord};
pub use record_store::{DEFAULT_INDEX_PREFIX, ExpiryCutoff, RecordStore, StoreError};
