use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use etcd_client::{
    Client, EventType as EtcdEventType, GetOptions, LeaseKeepAliveStream, LeaseKeeper, PutOptions,
    WatchOptions,
};
use etcd_coord_core::store::{
    Event, EventType, KeepAliveResponse, KeepAliveStream, KeyRange, KeyValue, LeaseId, Revision,
    Snapshot, Store, StoreError, WatchResponse, WatchStream, Watcher,
};
use futures::stream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

/// [`Store`] backed by an etcd cluster.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
    keep_alives: Arc<Mutex<HashMap<LeaseId, JoinHandle<()>>>>,
}

impl EtcdStore {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            keep_alives: Arc::default(),
        }
    }

    pub async fn connect(endpoints: &[String]) -> Result<Self, etcd_client::Error> {
        let client = Client::connect(endpoints, None).await?;
        Ok(Self::new(client))
    }
}

fn get_options(range: &KeyRange) -> Option<GetOptions> {
    match range {
        KeyRange::Single => None,
        KeyRange::Prefix => Some(GetOptions::new().with_prefix()),
        KeyRange::Range(end) => Some(GetOptions::new().with_range(end.as_str())),
        KeyRange::FromKey => Some(GetOptions::new().with_from_key()),
    }
}

fn watch_options(start_revision: Revision, range: &KeyRange) -> WatchOptions {
    let options = WatchOptions::new().with_start_revision(start_revision);
    match range {
        KeyRange::Single => options,
        KeyRange::Prefix => options.with_prefix(),
        KeyRange::Range(end) => options.with_range(end.as_str()),
        KeyRange::FromKey => options.with_from_key(),
    }
}

/// Renews every `ttl / 3` seconds.
fn renew_interval(ttl: i64) -> Duration {
    Duration::from_secs((ttl / 3).max(1) as u64)
}

/// The local expiry of a lease last renewed now with `ttl` seconds left.
fn lease_deadline(ttl: i64) -> Instant {
    Instant::now() + Duration::from_secs(ttl.max(0) as u64)
}

/// Wait for `response` unless the lease expires first.
async fn before_deadline<F: Future>(deadline: Instant, response: F) -> Option<F::Output> {
    tokio::time::timeout_at(deadline, response).await.ok()
}

async fn renew_lease(
    mut keeper: LeaseKeeper,
    mut responses: LeaseKeepAliveStream,
    ttl: i64,
    sender: mpsc::Sender<KeepAliveResponse>,
) -> Result<(), etcd_client::Error> {
    let id = keeper.id();
    let mut deadline = lease_deadline(ttl);
    loop {
        keeper.keep_alive().await?;
        let Some(response) = before_deadline(deadline, responses.message()).await else {
            warn!(?id, "No keep-alive response before the lease expired");
            return Ok(());
        };
        let Some(response) = response? else {
            debug!(?id, "Keep-alive response stream closed");
            return Ok(());
        };
        let ttl = response.ttl();
        if ttl <= 0 {
            debug!(?id, "Lease expired");
            return Ok(());
        }
        deadline = lease_deadline(ttl);
        if sender.send(KeepAliveResponse { id, ttl }).await.is_err() {
            return Ok(());
        }
        tokio::time::sleep(renew_interval(ttl)).await;
    }
}

fn convert_response(response: etcd_client::WatchResponse) -> Result<WatchResponse, StoreError> {
    let mut events = Vec::with_capacity(response.events().len());
    for event in response.events() {
        let Some(kv) = event.kv() else {
            continue;
        };
        let key = kv.key_str()?.to_owned();
        let typ = match event.event_type() {
            EtcdEventType::Put => EventType::Put(KeyValue::new(key, kv.value_str()?)),
            EtcdEventType::Delete => EventType::Delete(key),
        };
        events.push(Event {
            revision: kv.mod_revision(),
            typ,
        });
    }
    Ok(WatchResponse {
        canceled: response.canceled(),
        cancel_reason: response.cancel_reason().to_owned(),
        compact_revision: response.compact_revision(),
        events,
    })
}

#[async_trait::async_trait]
impl Store for EtcdStore {
    type Watcher = EtcdWatcher;

    async fn grant_lease(&self, ttl: i64) -> Result<LeaseId, StoreError> {
        let response = self.client.clone().lease_grant(ttl, None).await?;
        Ok(response.id())
    }

    async fn put(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
    ) -> Result<(), StoreError> {
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        self.client.clone().put(key, value, options).await?;
        Ok(())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream, StoreError> {
        let mut client = self.client.clone();
        let ttl = client.lease_time_to_live(lease, None).await?.ttl();
        let (keeper, responses) = client.lease_keep_alive(lease).await?;

        let (sender, receiver) = mpsc::channel(1);
        let handle = tokio::spawn(async move {
            if let Err(error) = renew_lease(keeper, responses, ttl, sender).await {
                warn!(%error, ?lease, "Lease renewal failed");
            }
        });
        if let Some(previous) = self.keep_alives.lock().await.insert(lease, handle) {
            previous.abort();
        }

        Ok(Box::pin(ReceiverStream::new(receiver)))
    }

    async fn close_lease(&self, lease: LeaseId) -> Result<(), StoreError> {
        if let Some(handle) = self.keep_alives.lock().await.remove(&lease) {
            handle.abort();
        }
        self.client.clone().lease_revoke(lease).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.client.clone().delete(key, None).await?;
        Ok(())
    }

    async fn get(&self, key: &str, range: &KeyRange) -> Result<Snapshot, StoreError> {
        let response = self.client.clone().get(key, get_options(range)).await?;
        let revision = response
            .header()
            .map(|header| header.revision())
            .unwrap_or_default();
        let mut kvs = Vec::with_capacity(response.kvs().len());
        for kv in response.kvs() {
            kvs.push(KeyValue::new(kv.key_str()?, kv.value_str()?));
        }
        Ok(Snapshot { revision, kvs })
    }

    fn watcher(&self) -> EtcdWatcher {
        EtcdWatcher {
            client: self.client.clone(),
            current: Mutex::default(),
            closed: AtomicBool::new(false),
        }
    }
}

/// The etcd watch of one session. Opening a new watch cancels the previous one.
pub struct EtcdWatcher {
    client: Client,
    current: Mutex<Option<etcd_client::Watcher>>,
    closed: AtomicBool,
}

async fn cancel_watch(mut watcher: etcd_client::Watcher) -> Result<(), etcd_client::Error> {
    let id = watcher.watch_id();
    watcher.cancel().await.map_err(|error| {
        debug!(%error, id, "Failed to cancel watch");
        error
    })
}

#[async_trait::async_trait]
impl Watcher for EtcdWatcher {
    async fn watch(
        &self,
        key: &str,
        start_revision: Revision,
        range: &KeyRange,
    ) -> Result<WatchStream, StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(Box::pin(stream::empty()));
        }
        let (watcher, responses) = self
            .client
            .clone()
            .watch(key, Some(watch_options(start_revision, range)))
            .await?;
        {
            let mut current = self.current.lock().await;
            if self.closed.load(Ordering::SeqCst) {
                // closed while opening
                let _ = cancel_watch(watcher).await;
                return Ok(Box::pin(stream::empty()));
            }
            if let Some(previous) = current.replace(watcher) {
                // usually already ended by its cancel response
                let _ = cancel_watch(previous).await;
            }
        }

        let key = key.to_owned();
        let stream = stream::unfold(Some(responses), move |responses| {
            let key = key.clone();
            async move {
                let mut responses = responses?;
                let response = match responses.message().await {
                    Ok(Some(response)) => match convert_response(response) {
                        Ok(response) => response,
                        Err(error) => WatchResponse::canceled(error.to_string()),
                    },
                    Ok(None) => return None,
                    Err(error) => {
                        warn!(%error, ?key, "Watch stream failed");
                        WatchResponse::canceled(error.to_string())
                    }
                };
                let next = if response.canceled {
                    None
                } else {
                    Some(responses)
                };
                Some((response, next))
            }
        });
        Ok(Box::pin(stream))
    }

    async fn close(&self) -> Result<(), StoreError> {
        let mut current = self.current.lock().await;
        self.closed.store(true, Ordering::SeqCst);
        if let Some(watcher) = current.take() {
            cancel_watch(watcher).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use futures::future;
    use pretty_assertions::assert_eq;
    use test_log::test;

    use super::*;

    #[test]
    fn renews_a_third_of_the_ttl() {
        assert_eq!(renew_interval(30), Duration::from_secs(10));
        assert_eq!(renew_interval(10), Duration::from_secs(3));
        assert_eq!(renew_interval(1), Duration::from_secs(1));
    }

    #[test(tokio::test)]
    async fn keep_alive_wait_ends_at_lease_expiry() {
        let deadline = Instant::now() + Duration::from_millis(50);
        assert_eq!(before_deadline(deadline, future::pending::<()>()).await, None);

        let deadline = lease_deadline(5);
        assert_eq!(before_deadline(deadline, future::ready(7)).await, Some(7));
    }

    #[test]
    fn expired_leases_have_no_time_left() {
        assert!(lease_deadline(-1) <= Instant::now());
    }

    #[test]
    fn single_key_reads_have_no_options() {
        assert!(get_options(&KeyRange::Single).is_none());
        assert!(get_options(&KeyRange::Prefix).is_some());
        assert!(get_options(&KeyRange::Range("b".to_owned())).is_some());
    }
}
