//! An in-process revisioned store.
//!
//! [`MemoryStore`] keeps the same revision, lease and watch semantics as etcd for the operations
//! in [`Store`], which makes it a stand-in for a real cluster in tests. Leases never expire by
//! themselves; use [`MemoryStore::revoke`] to simulate expiry, and the other control methods to
//! simulate compaction, canceled watches and unreachable servers.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use crate::store::{
    Event, EventType, KeepAliveResponse, KeepAliveStream, KeyRange, KeyValue, LeaseId, Revision,
    Snapshot, Store, StoreError, WatchResponse, WatchStream, Watcher,
};

type WatcherId = u64;

/// Store operations that can be made to fail with [`MemoryStore::inject_failure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    GrantLease,
    Put,
    KeepAlive,
    CloseLease,
    Delete,
    Get,
    Watch,
    CloseWatcher,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("store unavailable")]
    Unavailable,
    #[error("lease {0} not found")]
    LeaseNotFound(LeaseId),
    #[error("lease ttl must be positive, got {0}")]
    InvalidTtl(i64),
    #[error("revision {requested} is newer than the current revision {current}")]
    FutureRevision {
        requested: Revision,
        current: Revision,
    },
    #[error("injected failure for {0:?}")]
    Injected(Operation),
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    watcher_ids: Arc<AtomicU64>,
}

#[derive(Debug)]
struct State {
    revision: Revision,
    compact_revision: Revision,
    kvs: BTreeMap<String, StoredValue>,
    /// Events newer than the compacted revision, in revision order.
    history: Vec<Event>,
    leases: HashMap<LeaseId, StoredLease>,
    watches: Vec<ActiveWatch>,
    failures: HashSet<Operation>,
    unavailable: bool,
    next_lease_id: LeaseId,
}

impl Default for State {
    fn default() -> Self {
        Self {
            revision: 1,
            compact_revision: 0,
            kvs: BTreeMap::new(),
            history: Vec::new(),
            leases: HashMap::new(),
            watches: Vec::new(),
            failures: HashSet::new(),
            unavailable: false,
            next_lease_id: 1,
        }
    }
}

#[derive(Debug)]
struct StoredValue {
    value: String,
    lease: Option<LeaseId>,
}

#[derive(Debug)]
struct StoredLease {
    ttl: i64,
    keep_alives: Vec<mpsc::UnboundedSender<KeepAliveResponse>>,
}

#[derive(Debug)]
struct ActiveWatch {
    watcher: WatcherId,
    key: String,
    range: KeyRange,
    sender: mpsc::UnboundedSender<WatchResponse>,
}

impl State {
    fn check(&mut self, operation: Operation) -> Result<(), Error> {
        if self.unavailable {
            return Err(Error::Unavailable);
        }
        if self.failures.remove(&operation) {
            return Err(Error::Injected(operation));
        }
        Ok(())
    }

    /// Apply a set of changes as a single revision and notify matching watches.
    fn commit(&mut self, changes: Vec<EventType>) {
        if changes.is_empty() {
            return;
        }
        self.revision += 1;
        let revision = self.revision;
        let events: Vec<Event> = changes
            .into_iter()
            .map(|typ| Event { revision, typ })
            .collect();
        self.history.extend(events.iter().cloned());

        self.watches.retain(|watch| {
            let matching: Vec<Event> = events
                .iter()
                .filter(|event| watch.range.contains(&watch.key, event.typ.key()))
                .cloned()
                .collect();
            if matching.is_empty() {
                !watch.sender.is_closed()
            } else {
                watch.sender.send(WatchResponse::events(matching)).is_ok()
            }
        });
    }

    fn put(&mut self, key: &str, value: &str, lease: Option<LeaseId>) {
        self.kvs.insert(
            key.to_owned(),
            StoredValue {
                value: value.to_owned(),
                lease,
            },
        );
        self.commit(vec![EventType::Put(KeyValue::new(key, value))]);
    }

    fn delete(&mut self, key: &str) {
        if self.kvs.remove(key).is_some() {
            self.commit(vec![EventType::Delete(key.to_owned())]);
        }
    }

    /// Remove a lease and every key attached to it.
    fn revoke(&mut self, id: LeaseId) -> Result<(), Error> {
        // dropping the lease drops its keep-alive senders, ending the streams
        self.leases.remove(&id).ok_or(Error::LeaseNotFound(id))?;
        let keys: Vec<String> = self
            .kvs
            .iter()
            .filter(|(_, stored)| stored.lease == Some(id))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &keys {
            self.kvs.remove(key);
        }
        debug!(?id, ?keys, "Revoked lease");
        self.commit(keys.into_iter().map(EventType::Delete).collect());
        Ok(())
    }

    fn cancel_watches(&mut self, response: WatchResponse) {
        for watch in self.watches.drain(..) {
            let _ = watch.sender.send(response.clone());
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Revoke a lease as if it had expired.
    pub async fn revoke(&self, id: LeaseId) -> Result<(), Error> {
        self.state.lock().await.revoke(id)
    }

    /// Discard history before `revision`. Watches opened from an earlier revision are canceled.
    pub async fn compact(&self, revision: Revision) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        if revision > state.revision {
            return Err(Error::FutureRevision {
                requested: revision,
                current: state.revision,
            });
        }
        if revision > state.compact_revision {
            state.compact_revision = revision;
            state.history.retain(|event| event.revision >= revision);
        }
        Ok(())
    }

    /// Cancel every open watch as compacted, as a server does for watches that fell too far
    /// behind.
    pub async fn cancel_watches_compacted(&self) {
        let mut state = self.state.lock().await;
        let response = WatchResponse::compacted(state.compact_revision);
        state.cancel_watches(response);
    }

    /// Cancel every open watch with `reason`.
    pub async fn cancel_watches(&self, reason: &str) {
        self.state
            .lock()
            .await
            .cancel_watches(WatchResponse::canceled(reason));
    }

    /// End every open watch stream without a response, as a dropped connection does.
    pub async fn end_watches(&self) {
        self.state.lock().await.watches.clear();
    }

    /// Make every operation fail with [`Error::Unavailable`] while set.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    /// Make the next call of `operation` fail.
    pub async fn inject_failure(&self, operation: Operation) {
        self.state.lock().await.failures.insert(operation);
    }

    pub async fn value(&self, key: &str) -> Option<String> {
        self.state
            .lock()
            .await
            .kvs
            .get(key)
            .map(|stored| stored.value.clone())
    }

    pub async fn revision(&self) -> Revision {
        self.state.lock().await.revision
    }

    pub async fn lease_exists(&self, id: LeaseId) -> bool {
        self.state.lock().await.leases.contains_key(&id)
    }

    /// Number of watch streams still registered.
    pub async fn watch_count(&self) -> usize {
        let mut state = self.state.lock().await;
        state.watches.retain(|watch| !watch.sender.is_closed());
        state.watches.len()
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    type Watcher = MemoryWatcher;

    async fn grant_lease(&self, ttl: i64) -> Result<LeaseId, StoreError> {
        let mut state = self.state.lock().await;
        state.check(Operation::GrantLease)?;
        if ttl <= 0 {
            return Err(Error::InvalidTtl(ttl).into());
        }
        let id = state.next_lease_id;
        state.next_lease_id += 1;
        state.leases.insert(
            id,
            StoredLease {
                ttl,
                keep_alives: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn put(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.check(Operation::Put)?;
        if let Some(id) = lease {
            if !state.leases.contains_key(&id) {
                return Err(Error::LeaseNotFound(id).into());
            }
        }
        state.put(key, value, lease);
        Ok(())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream, StoreError> {
        let mut state = self.state.lock().await;
        state.check(Operation::KeepAlive)?;
        let stored = state
            .leases
            .get_mut(&lease)
            .ok_or(Error::LeaseNotFound(lease))?;
        let (sender, receiver) = mpsc::unbounded_channel();
        // the first renewal happens straight away
        let _ = sender.send(KeepAliveResponse {
            id: lease,
            ttl: stored.ttl,
        });
        stored.keep_alives.push(sender);
        Ok(Box::pin(UnboundedReceiverStream::new(receiver)))
    }

    async fn close_lease(&self, lease: LeaseId) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.check(Operation::CloseLease)?;
        state.revoke(lease)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.check(Operation::Delete)?;
        state.delete(key);
        Ok(())
    }

    async fn get(&self, key: &str, range: &KeyRange) -> Result<Snapshot, StoreError> {
        let mut state = self.state.lock().await;
        state.check(Operation::Get)?;
        let kvs = state
            .kvs
            .range::<str, _>((Bound::Included(key), Bound::Unbounded))
            .filter(|(candidate, _)| range.contains(key, candidate))
            .map(|(candidate, stored)| KeyValue::new(candidate.clone(), stored.value.clone()))
            .collect();
        Ok(Snapshot {
            revision: state.revision,
            kvs,
        })
    }

    fn watcher(&self) -> MemoryWatcher {
        MemoryWatcher {
            store: self.clone(),
            id: self.watcher_ids.fetch_add(1, Ordering::SeqCst),
            closed: AtomicBool::new(false),
        }
    }
}

/// A group of watch streams on a [`MemoryStore`] that are closed together.
pub struct MemoryWatcher {
    store: MemoryStore,
    id: WatcherId,
    closed: AtomicBool,
}

#[async_trait::async_trait]
impl Watcher for MemoryWatcher {
    async fn watch(
        &self,
        key: &str,
        start_revision: Revision,
        range: &KeyRange,
    ) -> Result<WatchStream, StoreError> {
        let mut state = self.store.state.lock().await;
        state.check(Operation::Watch)?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let stream = Box::pin(UnboundedReceiverStream::new(receiver));
        if self.closed.load(Ordering::SeqCst) {
            return Ok(stream);
        }

        if start_revision > 0 && start_revision < state.compact_revision {
            debug!(
                start_revision,
                compact_revision = state.compact_revision,
                "Watch start revision compacted"
            );
            let _ = sender.send(WatchResponse::compacted(state.compact_revision));
            return Ok(stream);
        }

        if start_revision > 0 {
            // replay history one revision per response
            let mut pending: Vec<Event> = Vec::new();
            for event in state.history.iter().filter(|event| {
                event.revision >= start_revision && range.contains(key, event.typ.key())
            }) {
                if pending
                    .last()
                    .map_or(false, |last| last.revision != event.revision)
                {
                    let _ = sender.send(WatchResponse::events(std::mem::take(&mut pending)));
                }
                pending.push(event.clone());
            }
            if !pending.is_empty() {
                let _ = sender.send(WatchResponse::events(pending));
            }
        }

        state.watches.push(ActiveWatch {
            watcher: self.id,
            key: key.to_owned(),
            range: range.clone(),
            sender,
        });
        Ok(stream)
    }

    async fn close(&self) -> Result<(), StoreError> {
        let mut state = self.store.state.lock().await;
        state.check(Operation::CloseWatcher)?;
        // set under the state lock so a concurrent watch cannot register afterwards
        self.closed.store(true, Ordering::SeqCst);
        let id = self.id;
        state.watches.retain(|watch| watch.watcher != id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use pretty_assertions::assert_eq;
    use test_log::test;

    use super::*;

    fn put(revision: Revision, key: &str, value: &str) -> Event {
        Event {
            revision,
            typ: EventType::Put(KeyValue::new(key, value)),
        }
    }

    fn delete(revision: Revision, key: &str) -> Event {
        Event {
            revision,
            typ: EventType::Delete(key.to_owned()),
        }
    }

    #[test(tokio::test)]
    async fn revisions_increase_per_mutation() {
        let store = MemoryStore::new();
        assert_eq!(store.revision().await, 1);

        store.put("a", "1", None).await.unwrap();
        store.put("a", "2", None).await.unwrap();
        assert_eq!(store.revision().await, 3);

        // deleting a missing key is not a mutation
        store.delete("missing").await.unwrap();
        assert_eq!(store.revision().await, 3);

        store.delete("a").await.unwrap();
        assert_eq!(store.revision().await, 4);
        assert_eq!(store.value("a").await, None);
    }

    #[test(tokio::test)]
    async fn get_respects_key_range() {
        let store = MemoryStore::new();
        for key in ["svc/a", "svc/b", "svcx", "other"] {
            store.put(key, key, None).await.unwrap();
        }

        let single = store.get("svc/a", &KeyRange::Single).await.unwrap();
        assert_eq!(single.kvs, vec![KeyValue::new("svc/a", "svc/a")]);

        let prefix = store.get("svc/", &KeyRange::Prefix).await.unwrap();
        assert_eq!(
            prefix,
            Snapshot {
                revision: 5,
                kvs: vec![
                    KeyValue::new("svc/a", "svc/a"),
                    KeyValue::new("svc/b", "svc/b"),
                ],
            }
        );

        let range = store
            .get("svc/b", &KeyRange::Range("svcy".to_owned()))
            .await
            .unwrap();
        assert_eq!(
            range.kvs,
            vec![KeyValue::new("svc/b", "svc/b"), KeyValue::new("svcx", "svcx")]
        );
    }

    #[test(tokio::test)]
    async fn revoking_a_lease_deletes_its_keys_and_ends_keep_alive() {
        let store = MemoryStore::new();
        let id = store.grant_lease(5).await.unwrap();
        store.put("a", "1", Some(id)).await.unwrap();
        store.put("b", "2", Some(id)).await.unwrap();
        store.put("c", "3", None).await.unwrap();

        let mut keep_alive = store.keep_alive(id).await.unwrap();
        assert_eq!(keep_alive.next().await, Some(KeepAliveResponse { id, ttl: 5 }));

        let mut stream = store
            .watcher()
            .watch("", 0, &KeyRange::Prefix)
            .await
            .unwrap();

        store.revoke(id).await.unwrap();
        assert_eq!(keep_alive.next().await, None);
        assert!(!store.lease_exists(id).await);
        assert_eq!(store.value("a").await, None);
        assert_eq!(store.value("c").await, Some("3".to_owned()));

        // both deletes happen in a single revision
        assert_eq!(
            stream.next().await,
            Some(WatchResponse::events(vec![delete(5, "a"), delete(5, "b")]))
        );

        assert_eq!(
            store.revoke(id).await,
            Err(Error::LeaseNotFound(id)),
        );
    }

    #[test(tokio::test)]
    async fn put_requires_existing_lease() {
        let store = MemoryStore::new();
        let error = store.put("a", "1", Some(42)).await.unwrap_err();
        assert_eq!(error.to_string(), "lease 42 not found");
        assert!(store.grant_lease(0).await.is_err());
    }

    #[test(tokio::test)]
    async fn watch_replays_history_from_start_revision() {
        let store = MemoryStore::new();
        store.put("k", "v1", None).await.unwrap();
        store.put("other", "x", None).await.unwrap();
        store.put("k", "v2", None).await.unwrap();
        store.delete("k").await.unwrap();

        let mut stream = store
            .watcher()
            .watch("k", 3, &KeyRange::Single)
            .await
            .unwrap();
        assert_eq!(
            stream.next().await,
            Some(WatchResponse::events(vec![put(4, "k", "v2")]))
        );
        assert_eq!(
            stream.next().await,
            Some(WatchResponse::events(vec![delete(5, "k")]))
        );

        store.put("k", "v3", None).await.unwrap();
        assert_eq!(
            stream.next().await,
            Some(WatchResponse::events(vec![put(6, "k", "v3")]))
        );
    }

    #[test(tokio::test)]
    async fn watch_before_compaction_is_canceled() {
        let store = MemoryStore::new();
        for value in ["1", "2", "3"] {
            store.put("k", value, None).await.unwrap();
        }
        assert!(matches!(
            store.compact(10).await,
            Err(Error::FutureRevision { requested: 10, current: 4 })
        ));
        store.compact(3).await.unwrap();

        let mut stream = store
            .watcher()
            .watch("k", 2, &KeyRange::Single)
            .await
            .unwrap();
        let response = stream.next().await.unwrap();
        assert!(response.is_compacted());
        assert_eq!(response.compact_revision, 3);
        assert_eq!(stream.next().await, None);

        let mut stream = store
            .watcher()
            .watch("k", 3, &KeyRange::Single)
            .await
            .unwrap();
        assert_eq!(
            stream.next().await,
            Some(WatchResponse::events(vec![put(3, "k", "2")]))
        );
    }

    #[test(tokio::test)]
    async fn closing_a_watcher_ends_its_streams() {
        let store = MemoryStore::new();
        let watcher = store.watcher();
        let other = store.watcher();
        let mut stream = watcher.watch("k", 0, &KeyRange::Single).await.unwrap();
        let _other_stream = other.watch("k", 0, &KeyRange::Single).await.unwrap();
        assert_eq!(store.watch_count().await, 2);

        watcher.close().await.unwrap();
        assert_eq!(stream.next().await, None);
        assert_eq!(store.watch_count().await, 1);

        let mut stream = watcher.watch("k", 0, &KeyRange::Single).await.unwrap();
        assert_eq!(stream.next().await, None);
        assert_eq!(store.watch_count().await, 1);
    }

    #[test(tokio::test)]
    async fn ended_watches_close_without_a_response() {
        let store = MemoryStore::new();
        let watcher = store.watcher();
        let mut stream = watcher.watch("k", 0, &KeyRange::Single).await.unwrap();

        store.end_watches().await;
        assert_eq!(stream.next().await, None);
        assert_eq!(store.watch_count().await, 0);

        // the watcher itself stays usable
        let mut stream = watcher.watch("k", 0, &KeyRange::Single).await.unwrap();
        store.put("k", "v", None).await.unwrap();
        assert_eq!(
            stream.next().await,
            Some(WatchResponse::events(vec![put(2, "k", "v")]))
        );
    }

    #[test(tokio::test)]
    async fn injected_failures_apply_once() {
        let store = MemoryStore::new();
        store.inject_failure(Operation::Get).await;
        let error = store.get("k", &KeyRange::Single).await.unwrap_err();
        assert_eq!(error.to_string(), "injected failure for Get");
        assert!(store.get("k", &KeyRange::Single).await.is_ok());

        store.set_unavailable(true).await;
        assert!(store.grant_lease(1).await.is_err());
        store.set_unavailable(false).await;
        assert!(store.grant_lease(1).await.is_ok());
    }
}
