use std::{sync::Arc, time::Duration};

use time::OffsetDateTime;
use tokio::{
    sync::Mutex,
    time::{MissedTickBehavior, interval},
};
use tracing::{error, info, warn};

use onedrive_renewal_core::{
    CredentialError, CredentialExchange, SubscriptionClient, SubscriptionError, format_timestamp,
    parse_timestamp,
};

use crate::{
    config::WorkerConfig,
    storage::{ExpiryCutoff, RecordStore, StoreError, StoredRecord},
};

/// Failure that ends a whole tick.
#[derive(thiserror::Error, Debug)]
pub enum RenewalError {
    #[error("failed to list expiring records: {0}")]
    Listing(#[from] StoreError),
}

/// Failure confined to a single record.
#[derive(thiserror::Error, Debug)]
pub enum RecordError {
    #[error(transparent)]
    Credentials(#[from] CredentialError),
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),
    #[error("failed to persist renewal: {0}")]
    Store(#[from] StoreError),
    #[error("renewed expiration {proposed} does not extend stored expiration {previous}")]
    NotAdvanced { previous: String, proposed: String },
}

/// Counters for one completed tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub examined: usize,
    pub renewed: usize,
    pub failed: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    Completed(TickReport),
    /// Another tick still held the run guard.
    Skipped,
}

/// Renews every expiring subscription found in the record store.
pub struct RenewalJob {
    store: Arc<dyn RecordStore>,
    credentials: CredentialExchange,
    subscriptions: SubscriptionClient,
    cutoff: ExpiryCutoff,
    running: Mutex<()>,
}

impl RenewalJob {
    pub fn new(
        store: Arc<dyn RecordStore>,
        credentials: CredentialExchange,
        subscriptions: SubscriptionClient,
        cutoff: ExpiryCutoff,
    ) -> Self {
        Self {
            store,
            credentials,
            subscriptions,
            cutoff,
            running: Mutex::new(()),
        }
    }

    /// Wire the Graph clients from configuration around an existing store.
    pub fn from_config(
        config: &WorkerConfig,
        http_client: reqwest::Client,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        let retry = config.retry_policy();
        let credentials =
            CredentialExchange::new(http_client.clone(), config.graph_endpoints.clone())
                .with_retry(retry.clone());
        let subscriptions = SubscriptionClient::new(
            http_client,
            config.graph_endpoints.clone(),
            config.subscription_settings(),
        )
        .with_retry(retry);
        Self::new(store, credentials, subscriptions, config.cutoff())
    }

    /// Run one pass over the expiring records.
    ///
    /// Records are processed one after another; a failing record is logged and
    /// counted without stopping the rest. Only a failed listing aborts the tick.
    pub async fn run_tick(&self) -> Result<TickOutcome, RenewalError> {
        let Ok(_guard) = self.running.try_lock() else {
            warn!(target: "onedrive.renewal", "previous renewal tick still running; skipping");
            return Ok(TickOutcome::Skipped);
        };

        let records = self.store.list_expiring(&self.cutoff).await?;
        let mut report = TickReport {
            examined: records.len(),
            ..TickReport::default()
        };

        for stored in &records {
            match self.renew_record(stored).await {
                Ok(expires_at) => {
                    report.renewed += 1;
                    info!(
                        target: "onedrive.renewal",
                        index = stored.index.as_str(),
                        doc_id = stored.doc_id.as_str(),
                        user = stored.record.user_name.as_str(),
                        expires_at = %format_timestamp(expires_at),
                        "subscription recreated",
                    );
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(
                        target: "onedrive.renewal",
                        index = stored.index.as_str(),
                        doc_id = stored.doc_id.as_str(),
                        user = stored.record.user_name.as_str(),
                        error = %err,
                        "subscription renewal failed for record",
                    );
                }
            }
        }

        Ok(TickOutcome::Completed(report))
    }

    /// Run one tick, logging its outcome instead of returning errors.
    pub async fn run_logged(&self) {
        info!(target: "onedrive.renewal", "starting subscription renewal tick");
        match self.run_tick().await {
            Ok(TickOutcome::Completed(report)) => info!(
                target: "onedrive.renewal",
                examined = report.examined,
                renewed = report.renewed,
                failed = report.failed,
                "subscription renewal tick finished",
            ),
            Ok(TickOutcome::Skipped) => {}
            Err(err) => error!(
                target: "onedrive.renewal",
                error = %err,
                "subscription renewal tick failed",
            ),
        }
    }

    async fn renew_record(&self, stored: &StoredRecord) -> Result<OffsetDateTime, RecordError> {
        let token = self
            .credentials
            .exchange(&stored.record.credentials())
            .await?;
        let subscription = self
            .subscriptions
            .create(&token, &stored.record.user_name)
            .await?;

        let expires_at = subscription.expires_at().unwrap_or_else(|| {
            let now = OffsetDateTime::now_utc();
            now.checked_add(self.subscriptions.settings().lifetime)
                .unwrap_or(now)
        });

        if let Some(previous) = stored
            .record
            .expiration_date_time
            .as_deref()
            .and_then(|value| parse_timestamp(value).ok())
            && expires_at <= previous
        {
            return Err(RecordError::NotAdvanced {
                previous: format_timestamp(previous),
                proposed: format_timestamp(expires_at),
            });
        }

        self.store
            .apply_renewal(&stored.index, &stored.doc_id, expires_at)
            .await?;
        Ok(expires_at)
    }
}

/// Drive `job` on a fixed interval until the returned task is aborted.
///
/// The first tick fires immediately.
pub fn spawn_renewal_worker(
    job: Arc<RenewalJob>,
    period: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            job.run_logged().await;
        }
    })
}
