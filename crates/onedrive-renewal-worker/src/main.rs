use std::{process, sync::Arc};

use anyhow::Result;
use onedrive_renewal_worker::{
    RenewalJob, WorkerConfig, spawn_renewal_worker,
    storage::{ElasticRecordStore, RecordStore},
    telemetry::init_tracing,
};
use tokio::signal;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    init_tracing();

    if let Err(error) = run().await {
        tracing::error!("renewal worker shut down with error: {error}");
        process::exit(1);
    }
}

async fn run() -> Result<()> {
    let run_once = std::env::args().skip(1).any(|arg| arg == "--once");
    let config = WorkerConfig::from_env()?;

    let http_client = reqwest::Client::builder()
        .timeout(config.http_timeout)
        .build()?;
    let store: Arc<dyn RecordStore> = Arc::new(
        ElasticRecordStore::new(http_client.clone(), config.elasticsearch_url.clone())?
            .with_auth(config.elasticsearch_auth.clone())
            .with_index_prefix(config.index_prefix.clone()),
    );
    let job = Arc::new(RenewalJob::from_config(&config, http_client, store));

    if run_once {
        job.run_logged().await;
        return Ok(());
    }

    tracing::info!(
        interval_secs = config.interval.as_secs(),
        notification_url = config.notification_url.as_str(),
        "onedrive subscription renewal worker is running",
    );
    let worker = spawn_renewal_worker(job, config.interval);

    shutdown_signal().await;
    tracing::info!("shutdown signal received");
    worker.abort();

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::warn!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
