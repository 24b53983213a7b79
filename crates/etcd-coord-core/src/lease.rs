use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, trace, warn};

use crate::store::{KeepAliveStream, LeaseId, Store};
use crate::{Error, Result};

/// A key attached to a lease that is kept alive in the background.
///
/// The key lives as long as the lease is renewed. If renewal stops without [`Lease::stop`] having
/// been called the key is removed and the `on_error` callback given to [`Lease::new`] is called
/// with [`Error::LeaseInterrupted`].
///
/// Dropping the handle does not stop the lease; call [`Lease::stop`] to release it.
#[derive(Clone)]
pub struct Lease<S> {
    inner: Arc<Inner<S>>,
}

struct Inner<S> {
    store: S,
    id: LeaseId,
    key: String,
    value: String,
    ttl: i64,
    stopped: AtomicBool,
}

impl<S: Store> Lease<S> {
    /// Grant a lease with `ttl` seconds, write `key = value` under it and start renewing it.
    ///
    /// None of the setup steps are retried. If writing the key fails the granted lease is left
    /// for the store to expire.
    pub async fn new<F>(
        store: S,
        key: impl Into<String>,
        value: impl Into<String>,
        ttl: i64,
        on_error: F,
    ) -> Result<Self>
    where
        F: FnOnce(Error) + Send + 'static,
    {
        let key = key.into();
        let value = value.into();
        if ttl <= 0 {
            return Err(Error::InvalidTtl(ttl));
        }

        let id = store.grant_lease(ttl).await.map_err(Error::Grant)?;
        debug!(?id, ?ttl, "Granted lease");

        store
            .put(&key, &value, Some(id))
            .await
            .map_err(|source| Error::Write {
                key: key.clone(),
                source,
            })?;

        let keep_alive = store
            .keep_alive(id)
            .await
            .map_err(|source| Error::KeepAlive { id, source })?;

        let lease = Self {
            inner: Arc::new(Inner {
                store,
                id,
                key,
                value,
                ttl,
                stopped: AtomicBool::new(false),
            }),
        };

        let background = lease.clone();
        tokio::spawn(async move {
            background.renew(keep_alive, on_error).await;
        });

        Ok(lease)
    }

    #[tracing::instrument(skip_all, fields(id = self.inner.id, key = %self.inner.key))]
    async fn renew<F>(self, mut keep_alive: KeepAliveStream, on_error: F)
    where
        F: FnOnce(Error) + Send + 'static,
    {
        while let Some(response) = keep_alive.next().await {
            trace!(ttl = response.ttl, "Lease renewed");
        }

        if self.release().await {
            warn!("Keep-alive stream closed while the lease was active");
            on_error(Error::LeaseInterrupted);
        } else {
            debug!("Keep-alive stream closed after stop");
        }
    }

    /// Delete the key and close the lease. Only the first call has any effect.
    pub async fn stop(&self) {
        self.release().await;
    }

    /// Returns whether this call performed the transition to stopped.
    async fn release(&self) -> bool {
        if self
            .inner
            .stopped
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        let Inner { store, id, key, .. } = &*self.inner;
        debug!(?id, ?key, "Stopping lease");
        // closing the lease removes the key too, once the store notices
        if let Err(error) = store.delete(key).await {
            warn!(%error, ?key, "Failed to delete leased key");
        }
        if let Err(error) = store.close_lease(*id).await {
            warn!(%error, ?id, "Failed to close lease");
        }
        true
    }

    pub fn id(&self) -> LeaseId {
        self.inner.id
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn value(&self) -> &str {
        &self.inner.value
    }

    pub fn ttl(&self) -> i64 {
        self.inner.ttl
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }
}

impl<S> std::fmt::Debug for Lease<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.inner.id)
            .field("key", &self.inner.key)
            .field("ttl", &self.inner.ttl)
            .field("stopped", &self.inner.stopped.load(Ordering::SeqCst))
            .finish()
    }
}
