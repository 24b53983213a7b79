use etcd_coord_core::{Lease, WatchHandler, WatchSession};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

mod options;
mod store;

pub use options::Options;
pub use store::{EtcdStore, EtcdWatcher};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to connect to etcd")]
    Connect(#[source] etcd_client::Error),
    #[error(transparent)]
    Coordination(#[from] etcd_coord_core::Error),
    #[error("failed to listen for shutdown signal")]
    Signal(#[source] std::io::Error),
}

/// Logs the contents of a watched range and forwards terminal errors.
struct LogHandler {
    failures: mpsc::Sender<etcd_coord_core::Error>,
}

#[async_trait::async_trait]
impl WatchHandler for LogHandler {
    async fn on_reset_begin(&self) {
        info!("Watched range reset");
    }

    async fn on_put(&self, key: String, value: String) {
        info!(?key, ?value, "Put");
    }

    async fn on_delete(&self, key: String) {
        info!(?key, "Delete");
    }

    async fn on_reset_end(&self) {
        info!("Watched range in sync");
    }

    async fn on_error(&self, error: etcd_coord_core::Error) {
        if let Err(error) = self.failures.send(error).await {
            debug!(error=%error.0, "Dropping watch error, receiver closed");
        }
    }
}

/// Announce and watch keys as configured until interrupted or a lease is lost.
#[tracing::instrument(skip(options))]
pub async fn run(options: Options) -> Result<(), Error> {
    info!(?options, "Starting");
    let range = options.watch_range();
    let Options {
        endpoints,
        key,
        value,
        ttl,
        watch,
        prefix: _,
        log_filter: _,
        no_colour: _,
    } = options;

    if key.is_none() && watch.is_none() {
        warn!("Neither a key to announce nor a key to watch was given");
        return Ok(());
    }

    let store = EtcdStore::connect(&endpoints)
        .await
        .map_err(Error::Connect)?;
    info!(?endpoints, "Connected");

    let (failure_sender, mut failures) = mpsc::channel(2);

    let lease = match key {
        Some(key) => {
            let failure_sender = failure_sender.clone();
            let lease = Lease::new(store.clone(), key, value, ttl, move |error| {
                let _ = failure_sender.try_send(error);
            })
            .await?;
            info!(id = lease.id(), key = lease.key(), "Announced key");
            Some(lease)
        }
        None => None,
    };

    let session = watch.map(|watch| {
        let session = WatchSession::new(
            store.clone(),
            LogHandler {
                failures: failure_sender.clone(),
            },
            watch,
            range,
        );
        session.start();
        session
    });
    drop(failure_sender);

    let result = tokio::select! {
        signal = tokio::signal::ctrl_c() => signal.map_err(Error::Signal),
        Some(error) = failures.recv() => Err(error.into()),
    };

    info!("Shutting down");
    if let Some(session) = session {
        if let Err(error) = session.stop().await {
            warn!(%error, "Failed to stop watch session");
        }
    }
    if let Some(lease) = lease {
        lease.stop().await;
    }
    result
}
