use std::time::Duration;

use etcd_coord_core::WatchEvent;
use tokio::sync::mpsc::UnboundedReceiver;

const TIMEOUT: Duration = Duration::from_secs(5);

pub async fn next_event(events: &mut UnboundedReceiver<WatchEvent>) -> WatchEvent {
    tokio::time::timeout(TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for watch event")
        .expect("handler dropped before the expected event")
}

pub async fn take_events(events: &mut UnboundedReceiver<WatchEvent>, n: usize) -> Vec<WatchEvent> {
    let mut taken = Vec::with_capacity(n);
    for _ in 0..n {
        taken.push(next_event(events).await);
    }
    taken
}

/// Collect everything still delivered until every handler clone is dropped.
pub async fn drain(events: &mut UnboundedReceiver<WatchEvent>) -> Vec<WatchEvent> {
    let mut rest = Vec::new();
    loop {
        match tokio::time::timeout(TIMEOUT, events.recv()).await {
            Ok(Some(event)) => rest.push(event),
            Ok(None) => return rest,
            Err(_) => panic!("timed out waiting for the watch session to finish"),
        }
    }
}
