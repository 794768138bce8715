//! Asynchronous CDN cache invalidation.
//!
//! Writers and deleters enqueue keys; a fixed pool of background workers
//! drains the shared bounded queue and issues one best-effort refresh
//! call per key. Worker failures are logged and counted, never retried
//! and never reported back to the producer. When the queue is full the
//! enqueue call itself blocks the producer until a worker frees a slot.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use metrics::counter;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::config::InvalidationConfig;
use crate::errors::DriverError;
use crate::metrics::{INVALIDATIONS_ENQUEUED_TOTAL, INVALIDATION_FAILURES_TOTAL};
use crate::remote::sign::Credential;

/// Queue slots before enqueue blocks the producer.
pub const DEFAULT_CAPACITY: usize = 100;

/// Background worker count.
pub const DEFAULT_WORKERS: usize = 10;

/// One CDN refresh call. Implementations must be safe for concurrent use.
pub trait CacheRefresher: Send + Sync + 'static {
    fn refresh(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), DriverError>> + Send + '_>>;
}

/// Producer handle to the invalidation queue. Cheap to clone; the worker
/// pool exits once every handle is dropped.
#[derive(Clone)]
pub struct CacheInvalidator {
    tx: mpsc::Sender<String>,
}

impl CacheInvalidator {
    /// Spawn the worker pool with default capacity and width.
    pub fn spawn(refresher: Arc<dyn CacheRefresher>) -> CacheInvalidator {
        CacheInvalidator::spawn_with(refresher, DEFAULT_CAPACITY, DEFAULT_WORKERS)
    }

    /// Spawn the worker pool with explicit queue capacity and worker
    /// count. Capacity bounds how far invalidation may lag before the
    /// write path starts blocking.
    pub fn spawn_with(
        refresher: Arc<dyn CacheRefresher>,
        capacity: usize,
        workers: usize,
    ) -> CacheInvalidator {
        let (tx, rx) = mpsc::channel::<String>(capacity);
        let rx = Arc::new(Mutex::new(rx));
        for worker in 0..workers {
            tokio::spawn(worker_loop(worker, rx.clone(), refresher.clone()));
        }
        CacheInvalidator { tx }
    }

    /// Queue `key` for refresh. Blocks while the queue is full; a key is
    /// only dropped if the worker pool itself has stopped.
    pub async fn enqueue(&self, key: String) {
        counter!(INVALIDATIONS_ENQUEUED_TOTAL).increment(1);
        if self.tx.send(key).await.is_err() {
            warn!("invalidation pool stopped, dropping refresh request");
        }
    }
}

async fn worker_loop(
    worker: usize,
    rx: Arc<Mutex<mpsc::Receiver<String>>>,
    refresher: Arc<dyn CacheRefresher>,
) {
    loop {
        // Hold the receiver lock only while dequeuing, so slow refresh
        // calls on one worker never stall the others.
        let key = { rx.lock().await.recv().await };
        match key {
            Some(key) => {
                if let Err(err) = refresher.refresh(&key).await {
                    counter!(INVALIDATION_FAILURES_TOTAL).increment(1);
                    warn!(worker, key, %err, "cache refresh failed");
                }
            }
            None => break,
        }
    }
}

// -- Refreshers --------------------------------------------------------------

/// Refresher hitting the provider's cache-refresh endpoint with the
/// administrative credential.
pub struct HttpCacheRefresher {
    http: reqwest::Client,
    cred: Credential,
    refresh_url: String,
    tenant_id: u64,
    bucket: String,
}

impl HttpCacheRefresher {
    pub fn new(config: &InvalidationConfig, bucket: impl Into<String>) -> Result<HttpCacheRefresher, DriverError> {
        Ok(HttpCacheRefresher {
            http: reqwest::Client::builder().build()?,
            cred: Credential::new(&config.admin_access_key, &config.admin_secret_key),
            refresh_url: config.refresh_url.trim_end_matches('/').to_string(),
            tenant_id: config.tenant_id,
            bucket: bucket.into(),
        })
    }

    /// Cache key addressed by the refresh endpoint:
    /// `io:{tenant_base36}:{bucket}:{key}`, URL-safe base64 encoded.
    fn encoded_cache_key(&self, key: &str) -> String {
        let cache_key = format!("io:{}:{}:{}", to_base36(self.tenant_id), self.bucket, key);
        URL_SAFE.encode(cache_key.as_bytes())
    }
}

impl CacheRefresher for HttpCacheRefresher {
    fn refresh(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), DriverError>> + Send + '_>> {
        let encoded = self.encoded_cache_key(key);
        Box::pin(async move {
            let url = format!("{}/{}", self.refresh_url, encoded);
            let auth = self
                .cred
                .authorization(crate::remote::http::path_and_query(&url), None);
            let resp = self
                .http
                .get(&url)
                .header("Authorization", auth)
                .send()
                .await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(DriverError::Provider {
                    code: status.as_u16(),
                    message: resp.text().await.unwrap_or_default(),
                });
            }
            Ok(())
        })
    }
}

/// No-op refresher used when invalidation is not configured.
pub struct DisabledRefresher;

impl CacheRefresher for DisabledRefresher {
    fn refresh(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), DriverError>> + Send + '_>> {
        debug!(key, "invalidation disabled, skipping refresh");
        Box::pin(async { Ok(()) })
    }
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).expect("base36 digits are ASCII")
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::Semaphore;
    use tokio::time::timeout;

    /// Records refreshed keys; each call waits for a gate permit first.
    struct GatedRefresher {
        gate: Semaphore,
        seen: std::sync::Mutex<Vec<String>>,
        fail: bool,
    }

    impl GatedRefresher {
        fn open(fail: bool) -> Arc<GatedRefresher> {
            Arc::new(GatedRefresher {
                gate: Semaphore::new(Semaphore::MAX_PERMITS),
                seen: std::sync::Mutex::new(Vec::new()),
                fail,
            })
        }

        fn gated() -> Arc<GatedRefresher> {
            Arc::new(GatedRefresher {
                gate: Semaphore::new(0),
                seen: std::sync::Mutex::new(Vec::new()),
                fail: false,
            })
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl CacheRefresher for GatedRefresher {
        fn refresh(
            &self,
            key: &str,
        ) -> Pin<Box<dyn Future<Output = Result<(), DriverError>> + Send + '_>> {
            let key = key.to_string();
            Box::pin(async move {
                self.gate.acquire().await.expect("gate open").forget();
                self.seen.lock().unwrap().push(key.clone());
                if self.fail {
                    return Err(DriverError::Provider { code: 500, message: "cdn down".into() });
                }
                Ok(())
            })
        }
    }

    async fn drained(refresher: &GatedRefresher, want: usize) {
        for _ in 0..100 {
            if refresher.seen().len() == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("only {} of {want} keys refreshed", refresher.seen().len());
    }

    #[tokio::test]
    async fn drains_every_enqueued_key() {
        let refresher = GatedRefresher::open(false);
        let invalidator = CacheInvalidator::spawn_with(refresher.clone(), 4, 2);
        for i in 0..8 {
            invalidator.enqueue(format!("key-{i}")).await;
        }
        drained(&refresher, 8).await;
    }

    #[tokio::test]
    async fn failures_do_not_stop_the_pool() {
        let refresher = GatedRefresher::open(true);
        let invalidator = CacheInvalidator::spawn_with(refresher.clone(), 4, 1);
        invalidator.enqueue("a".into()).await;
        invalidator.enqueue("b".into()).await;
        drained(&refresher, 2).await;
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_blocks_the_producer_until_drained() {
        let refresher = GatedRefresher::gated();
        let invalidator = CacheInvalidator::spawn_with(refresher.clone(), 1, 1);

        // First key is picked up by the worker and parks at the gate;
        // second key fills the single queue slot.
        invalidator.enqueue("a".into()).await;
        invalidator.enqueue("b".into()).await;

        // Third enqueue must block on the full queue.
        let blocked = timeout(Duration::from_millis(50), invalidator.enqueue("c".into())).await;
        assert!(blocked.is_err(), "enqueue completed despite a full queue");

        // Opening the gate drains a slot and unblocks the producer.
        refresher.gate.add_permits(Semaphore::MAX_PERMITS);
        timeout(Duration::from_secs(1), invalidator.enqueue("c".into()))
            .await
            .expect("enqueue still blocked after drain");

        drained(&refresher, 3).await;
        assert_eq!(refresher.seen(), ["a", "b", "c"]);
    }

    #[test]
    fn base36_encoding() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(to_base36(1_295), "zz");
    }

    #[test]
    fn cache_key_round_trips_through_base64() {
        let refresher = HttpCacheRefresher::new(
            &InvalidationConfig {
                admin_access_key: "admin".into(),
                admin_secret_key: "shhh".into(),
                tenant_id: 42,
                refresh_url: "https://refresh.example.com".into(),
            },
            "bkt",
        )
        .unwrap();
        let decoded = URL_SAFE.decode(refresher.encoded_cache_key("dir/blob")).unwrap();
        assert_eq!(decoded, b"io:16:bkt:dir/blob");
    }
}
