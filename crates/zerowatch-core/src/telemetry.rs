//! Liveness and boot accounting written to the shared store

use alloc::string::ToString;

use embassy_time::{Duration, Instant};
use log::{debug, warn};

use crate::config::parse_lenient;
use crate::store::{
    BOOTCOUNT_SUFFIX, HEARTBEAT_SUFFIX, KeyValueStore, PUBLISH_LOGS_SUFFIX, StoreError,
    device_key,
};

/// A heartbeat disappears this long after the last write
pub const HEARTBEAT_EXPIRY: Duration = Duration::from_secs(60);

/// Write uptime in microseconds to `<id>:heartbeat` and let it expire.
///
/// The key vanishing is how the backend notices the device went away.
pub async fn heartbeat<S: KeyValueStore>(
    store: &mut S,
    identity: &str,
    uptime: Instant,
    expiry: Duration,
) -> Result<(), StoreError> {
    let key = device_key(identity, HEARTBEAT_SUFFIX);
    store.set(&key, &uptime.as_micros().to_string()).await?;
    if !store.expire(&key, expiry).await? {
        warn!("telemetry: {} vanished before expiry was set", key);
    }
    Ok(())
}

/// Bump `<id>:bootcount` and return the new value.
///
/// With `reset` the counter restarts at one. A missing or unparsable
/// counter counts as zero.
pub async fn increment_bootcount<S: KeyValueStore>(
    store: &mut S,
    identity: &str,
    reset: bool,
) -> Result<i64, StoreError> {
    let key = device_key(identity, BOOTCOUNT_SUFFIX);
    let previous = if reset {
        0
    } else {
        let current = store.get(&key).await?;
        parse_lenient(current.as_deref()) as i64
    };
    let count = previous + 1;

    store.set(&key, &count.to_string()).await?;
    debug!("telemetry: bootcount {}", count);
    Ok(count)
}

/// Publish a log line on `<id>:info:publishLogs`.
pub async fn publish_log<S: KeyValueStore>(
    store: &mut S,
    identity: &str,
    line: &str,
) -> Result<u32, StoreError> {
    store
        .publish(&device_key(identity, PUBLISH_LOGS_SUFFIX), line)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use alloc::string::String;
    use embassy_futures::block_on;

    #[test]
    fn test_heartbeat_sets_uptime_with_expiry() {
        let mut store = MemoryStore::new();

        block_on(heartbeat(
            &mut store,
            "ezero",
            Instant::from_secs(125),
            HEARTBEAT_EXPIRY,
        ))
        .unwrap();

        assert_eq!(store.value("ezero:heartbeat"), Some("125000000"));
        assert_eq!(store.ttl("ezero:heartbeat"), Some(HEARTBEAT_EXPIRY));
    }

    #[test]
    fn test_heartbeat_expires() {
        let mut store = MemoryStore::new();
        block_on(heartbeat(
            &mut store,
            "ezero",
            Instant::from_secs(1),
            HEARTBEAT_EXPIRY,
        ))
        .unwrap();

        store.advance(Duration::from_secs(61));
        assert_eq!(store.value("ezero:heartbeat"), None);
    }

    #[test]
    fn test_bootcount() {
        let mut store = MemoryStore::new();

        assert_eq!(block_on(increment_bootcount(&mut store, "ezero", false)), Ok(1));
        assert_eq!(block_on(increment_bootcount(&mut store, "ezero", false)), Ok(2));
        assert_eq!(store.value("ezero:bootcount"), Some("2"));

        assert_eq!(block_on(increment_bootcount(&mut store, "ezero", true)), Ok(1));
        assert_eq!(store.value("ezero:bootcount"), Some("1"));
    }

    #[test]
    fn test_bootcount_garbage_counts_as_zero() {
        let mut store = MemoryStore::new();
        store.insert("ezero:bootcount", "nope");

        assert_eq!(block_on(increment_bootcount(&mut store, "ezero", false)), Ok(1));
    }

    #[test]
    fn test_publish_log() {
        let mut store = MemoryStore::new();

        block_on(publish_log(&mut store, "ezero", "booted")).unwrap();

        assert_eq!(
            store.published(),
            &[(
                String::from("ezero:info:publishLogs"),
                String::from("booted")
            )]
        );
    }
}
