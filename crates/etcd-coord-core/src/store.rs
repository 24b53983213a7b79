use std::pin::Pin;

use futures::Stream;

/// Store-wide mutation counter.
pub type Revision = i64;

pub type LeaseId = i64;

/// Opaque error returned by a store client, passed through to callers untouched.
pub type StoreError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Cancel reason reported by etcd when a watch asks for history that has been compacted away.
pub const COMPACTED_REASON: &str = "mvcc: required revision has been compacted";

pub type KeepAliveStream = Pin<Box<dyn Stream<Item = KeepAliveResponse> + Send + 'static>>;

pub type WatchStream = Pin<Box<dyn Stream<Item = WatchResponse> + Send + 'static>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A consistent read of a key or key range.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Snapshot {
    /// The store revision the read was served at.
    pub revision: Revision,
    pub kvs: Vec<KeyValue>,
}

/// Which keys an operation on `key` applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum KeyRange {
    /// Only `key` itself.
    #[default]
    Single,
    /// Every key starting with `key`.
    Prefix,
    /// Keys in `[key, end)`.
    Range(String),
    /// Every key greater than or equal to `key`.
    FromKey,
}

impl KeyRange {
    pub fn contains(&self, key: &str, candidate: &str) -> bool {
        match self {
            Self::Single => candidate == key,
            Self::Prefix => candidate.starts_with(key),
            Self::Range(end) => key <= candidate && candidate < end.as_str(),
            Self::FromKey => candidate >= key,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    Put(KeyValue),
    Delete(String),
}

impl EventType {
    pub fn key(&self) -> &str {
        match self {
            EventType::Put(kv) => &kv.key,
            EventType::Delete(key) => key,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Event {
    /// Revision of the mutation that produced this event.
    pub revision: Revision,
    pub typ: EventType,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WatchResponse {
    pub canceled: bool,
    pub cancel_reason: String,
    /// Set when the watch was canceled because its start revision was compacted.
    pub compact_revision: Revision,
    pub events: Vec<Event>,
}

impl WatchResponse {
    pub fn events(events: Vec<Event>) -> Self {
        Self {
            events,
            ..Default::default()
        }
    }

    pub fn canceled(reason: impl Into<String>) -> Self {
        Self {
            canceled: true,
            cancel_reason: reason.into(),
            ..Default::default()
        }
    }

    pub fn compacted(compact_revision: Revision) -> Self {
        Self {
            canceled: true,
            cancel_reason: COMPACTED_REASON.to_owned(),
            compact_revision,
            events: Vec::new(),
        }
    }

    pub fn is_compacted(&self) -> bool {
        self.canceled && (self.compact_revision > 0 || self.cancel_reason == COMPACTED_REASON)
    }
}

/// Acknowledgement of a single lease renewal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveResponse {
    pub id: LeaseId,
    /// Remaining ttl in seconds as reported by the store.
    pub ttl: i64,
}

/// The operations the coordination primitives need from a revisioned key-value store.
#[async_trait::async_trait]
pub trait Store: Clone + Send + Sync + 'static {
    type Watcher: Watcher;

    async fn grant_lease(&self, ttl: i64) -> Result<LeaseId, StoreError>;

    /// Write `key = value`, attaching it to `lease` when given.
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>)
        -> Result<(), StoreError>;

    /// Start renewing `lease`. The returned stream ends once the lease can no longer be renewed.
    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream, StoreError>;

    /// Stop renewing `lease` and release it early.
    async fn close_lease(&self, lease: LeaseId) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    async fn get(&self, key: &str, range: &KeyRange) -> Result<Snapshot, StoreError>;

    /// Create a watcher owning its own set of watch streams.
    fn watcher(&self) -> Self::Watcher;
}

#[async_trait::async_trait]
pub trait Watcher: Send + Sync + 'static {
    /// Stream changes to `key`/`range` starting at `start_revision` (inclusive).
    ///
    /// Once the watcher is closed this returns a stream that has already ended.
    async fn watch(
        &self,
        key: &str,
        start_revision: Revision,
        range: &KeyRange,
    ) -> Result<WatchStream, StoreError>;

    /// End every stream opened through this watcher.
    async fn close(&self) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn key_range_contains() {
        assert!(KeyRange::Single.contains("a", "a"));
        assert!(!KeyRange::Single.contains("a", "ab"));

        assert!(KeyRange::Prefix.contains("svc/", "svc/one"));
        assert!(!KeyRange::Prefix.contains("svc/", "svc"));
        assert!(KeyRange::Prefix.contains("", "anything"));

        let range = KeyRange::Range("c".to_owned());
        assert!(range.contains("a", "a"));
        assert!(range.contains("a", "bzz"));
        assert!(!range.contains("a", "c"));

        assert!(KeyRange::FromKey.contains("m", "z"));
        assert!(!KeyRange::FromKey.contains("m", "l"));
    }

    #[test]
    fn compaction_is_detected_from_reason_or_revision() {
        assert!(WatchResponse::compacted(4).is_compacted());

        let mut by_reason = WatchResponse::canceled(COMPACTED_REASON);
        assert_eq!(by_reason.compact_revision, 0);
        assert!(by_reason.is_compacted());

        by_reason.canceled = false;
        assert!(!by_reason.is_compacted());

        assert!(!WatchResponse::canceled("permission denied").is_compacted());
    }
}
