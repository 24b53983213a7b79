use crate::store::{LeaseId, StoreError};

pub type Result<O> = std::result::Result<O, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("lease ttl must be a positive number of seconds, got {0}")]
    InvalidTtl(i64),
    #[error("failed to grant lease")]
    Grant(#[source] StoreError),
    #[error("failed to write leased key {key:?}")]
    Write {
        key: String,
        #[source]
        source: StoreError,
    },
    #[error("failed to open keep-alive stream for lease {id}")]
    KeepAlive {
        id: LeaseId,
        #[source]
        source: StoreError,
    },
    /// The keep-alive stream ended although the lease was never stopped.
    #[error("lease interrupted")]
    LeaseInterrupted,
    #[error("failed to read snapshot of {key:?}")]
    Snapshot {
        key: String,
        #[source]
        source: StoreError,
    },
    #[error("failed to open watch on {key:?}")]
    Watch {
        key: String,
        #[source]
        source: StoreError,
    },
    #[error("watch on {key:?} canceled: {reason}")]
    Canceled { key: String, reason: String },
    #[error("failed to close watcher")]
    Close(#[source] StoreError),
}
