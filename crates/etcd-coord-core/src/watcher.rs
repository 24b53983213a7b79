use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::store::{EventType, KeyRange, Store, Watcher};
use crate::{Error, Result};

/// Receives the events of a [`WatchSession`].
///
/// Calls for one session are made sequentially from a single task. Every
/// `on_reset_begin`..`on_reset_end` burst carries the full contents of the watched range and
/// replaces whatever the handler built from earlier events.
#[async_trait::async_trait]
pub trait WatchHandler: Send + Sync + 'static {
    async fn on_reset_begin(&self);

    async fn on_put(&self, key: String, value: String);

    /// Only delivered for live changes, never as part of a reset burst.
    async fn on_delete(&self, key: String);

    async fn on_reset_end(&self);

    /// Terminal: no further calls follow.
    async fn on_error(&self, error: Error);
}

#[async_trait::async_trait]
impl WatchHandler for () {
    async fn on_reset_begin(&self) {}
    async fn on_put(&self, _key: String, _value: String) {}
    async fn on_delete(&self, _key: String) {}
    async fn on_reset_end(&self) {}
    async fn on_error(&self, _error: Error) {}
}

/// The calls made on a [`WatchHandler`], as values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    ResetBegin,
    Put { key: String, value: String },
    Delete { key: String },
    ResetEnd,
    /// The rendered terminal error.
    Error(String),
}

impl WatchEvent {
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self::Delete { key: key.into() }
    }
}

#[async_trait::async_trait]
impl WatchHandler for mpsc::UnboundedSender<WatchEvent> {
    async fn on_reset_begin(&self) {
        forward_unbounded(self, WatchEvent::ResetBegin);
    }

    async fn on_put(&self, key: String, value: String) {
        forward_unbounded(self, WatchEvent::Put { key, value });
    }

    async fn on_delete(&self, key: String) {
        forward_unbounded(self, WatchEvent::Delete { key });
    }

    async fn on_reset_end(&self) {
        forward_unbounded(self, WatchEvent::ResetEnd);
    }

    async fn on_error(&self, error: Error) {
        forward_unbounded(self, WatchEvent::Error(error.to_string()));
    }
}

fn forward_unbounded(sender: &mpsc::UnboundedSender<WatchEvent>, event: WatchEvent) {
    if let Err(error) = sender.send(event) {
        debug!(event=?error.0, "Dropping watch event, receiver closed");
    }
}

#[async_trait::async_trait]
impl WatchHandler for mpsc::Sender<WatchEvent> {
    async fn on_reset_begin(&self) {
        forward(self, WatchEvent::ResetBegin).await;
    }

    async fn on_put(&self, key: String, value: String) {
        forward(self, WatchEvent::Put { key, value }).await;
    }

    async fn on_delete(&self, key: String) {
        forward(self, WatchEvent::Delete { key }).await;
    }

    async fn on_reset_end(&self) {
        forward(self, WatchEvent::ResetEnd).await;
    }

    async fn on_error(&self, error: Error) {
        forward(self, WatchEvent::Error(error.to_string())).await;
    }
}

async fn forward(sender: &mpsc::Sender<WatchEvent>, event: WatchEvent) {
    if let Err(error) = sender.send(event).await {
        debug!(event=?error.0, "Dropping watch event, receiver closed");
    }
}

/// Keeps a handler in sync with a key or key range.
///
/// The session first replays a snapshot of the range as a reset burst and then streams every
/// change made after the snapshot's revision. When the store cancels the stream because the
/// needed history was compacted, the session takes a new snapshot and carries on; the handler
/// only sees another reset burst.
///
/// Clones share the same session, so a handler may keep one to stop the session from inside a
/// callback.
pub struct WatchSession<S: Store, H> {
    inner: Arc<Inner<S, H>>,
}

impl<S: Store, H> Clone for WatchSession<S, H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<S: Store, H> {
    store: S,
    watcher: S::Watcher,
    handler: H,
    key: String,
    range: KeyRange,
    started: AtomicBool,
    stopped: AtomicBool,
}

const STREAM_CLOSED: &str = "watch stream closed";

enum Outcome {
    /// The stream was canceled because its history was compacted.
    Resync,
    Done,
}

impl<S: Store, H: WatchHandler> WatchSession<S, H> {
    /// Create an idle session. No requests are made until [`WatchSession::start`].
    pub fn new(store: S, handler: H, key: impl Into<String>, range: KeyRange) -> Self {
        let watcher = store.watcher();
        Self {
            inner: Arc::new(Inner {
                store,
                watcher,
                handler,
                key: key.into(),
                range,
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Spawn the session's task. Calls after the first do nothing.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        if self
            .inner
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let session = self.clone();
            tokio::spawn(async move { session.run().await });
        }
    }

    /// Close the session's watch streams. Calls after the first do nothing.
    ///
    /// Does not wait for the session's task, so it can be called from the handler.
    pub async fn stop(&self) -> Result<()> {
        if self.transition_to_stopped() {
            self.close().await
        } else {
            Ok(())
        }
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn range(&self) -> &KeyRange {
        &self.inner.range
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    fn transition_to_stopped(&self) -> bool {
        self.inner
            .stopped
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    async fn close(&self) -> Result<()> {
        debug!(key=?self.inner.key, "Closing watch session");
        self.inner.watcher.close().await.map_err(Error::Close)
    }

    #[tracing::instrument(skip(self), fields(key = %self.inner.key, range = ?self.inner.range))]
    async fn run(self) {
        loop {
            match self.sync().await {
                Outcome::Resync => {
                    info!("Watch history compacted, resynchronizing");
                }
                Outcome::Done => break,
            }
        }
        debug!("Watch session finished");
    }

    /// Deliver one snapshot and then stream changes until the stream ends or is canceled.
    async fn sync(&self) -> Outcome {
        let Inner {
            store,
            watcher,
            handler,
            key,
            range,
            ..
        } = &*self.inner;

        let snapshot = match store.get(key, range).await {
            Ok(snapshot) => snapshot,
            Err(source) => {
                self.fail(Error::Snapshot {
                    key: key.clone(),
                    source,
                })
                .await;
                return Outcome::Done;
            }
        };
        if self.is_stopped() {
            return Outcome::Done;
        }

        debug!(revision = snapshot.revision, count = snapshot.kvs.len(), "Replaying snapshot");
        handler.on_reset_begin().await;
        for kv in snapshot.kvs {
            if self.is_stopped() {
                return Outcome::Done;
            }
            handler.on_put(kv.key, kv.value).await;
        }
        if self.is_stopped() {
            return Outcome::Done;
        }
        handler.on_reset_end().await;

        let mut stream = match watcher.watch(key, snapshot.revision + 1, range).await {
            Ok(stream) => stream,
            Err(source) => {
                self.fail(Error::Watch {
                    key: key.clone(),
                    source,
                })
                .await;
                return Outcome::Done;
            }
        };

        while let Some(response) = stream.next().await {
            if self.is_stopped() {
                return Outcome::Done;
            }
            if response.canceled {
                if response.is_compacted() {
                    debug!(
                        compact_revision = response.compact_revision,
                        "Watch canceled by compaction"
                    );
                    return Outcome::Resync;
                }
                self.fail(Error::Canceled {
                    key: key.clone(),
                    reason: response.cancel_reason,
                })
                .await;
                return Outcome::Done;
            }
            for event in response.events {
                if self.is_stopped() {
                    return Outcome::Done;
                }
                match event.typ {
                    EventType::Put(kv) => handler.on_put(kv.key, kv.value).await,
                    EventType::Delete(key) => handler.on_delete(key).await,
                }
            }
        }

        // ended without a cancel, so no further updates would ever arrive
        if !self.is_stopped() {
            self.fail(Error::Canceled {
                key: key.clone(),
                reason: STREAM_CLOSED.to_owned(),
            })
            .await;
        }
        Outcome::Done
    }

    /// Stop the session and report `error`, unless it was already stopped.
    async fn fail(&self, error: Error) {
        if !self.transition_to_stopped() {
            debug!(%error, "Ignoring error after stop");
            return;
        }
        if let Err(close_error) = self.close().await {
            warn!(%close_error, "Failed to close watcher after error");
        }
        warn!(%error, "Watch session failed");
        self.inner.handler.on_error(error).await;
    }
}

impl<S: Store, H> std::fmt::Debug for WatchSession<S, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchSession")
            .field("key", &self.inner.key)
            .field("range", &self.inner.range)
            .field("started", &self.inner.started.load(Ordering::SeqCst))
            .field("stopped", &self.inner.stopped.load(Ordering::SeqCst))
            .finish()
    }
}
