//! In-memory object store.
//!
//! Implements the full [`ObjectStore`] contract over a sorted map:
//! marker-paginated listing with delimiter grouping, copy-segment
//! resolution for segmented puts, and the provider's not-found
//! semantics. Used by the test suite and for local development.
//!
//! Two knobs exist purely for exercising callers:
//! - [`with_page_limit`](MemoryObjectStore::with_page_limit) clamps every
//!   listing page, the way a real provider caps `limit`;
//! - [`fail_next`](MemoryObjectStore::fail_next) queues an error to be
//!   returned by the next call of a given operation.

use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use md5::{Digest, Md5};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::ops::Bound;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

use super::{ByteStream, ListPage, ObjectEntry, ObjectStore, Segment};
use crate::errors::DriverError;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    put_time: i64,
}

/// In-memory [`ObjectStore`] implementation.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<String, StoredObject>>,
    faults: Mutex<HashMap<&'static str, VecDeque<DriverError>>>,
    page_limit: Option<usize>,
}

impl MemoryObjectStore {
    pub fn new() -> MemoryObjectStore {
        MemoryObjectStore::default()
    }

    /// Clamp every listing page to at most `limit` results, regardless of
    /// what the caller asks for.
    pub fn with_page_limit(mut self, limit: usize) -> MemoryObjectStore {
        self.page_limit = Some(limit);
        self
    }

    /// Queue `err` to be returned by the next `op` call
    /// (`"put"`, `"put_parts"`, `"read"`, `"delete"`, `"move"`, `"list"`).
    pub async fn fail_next(&self, op: &'static str, err: DriverError) {
        self.faults.lock().await.entry(op).or_default().push_back(err);
    }

    async fn take_fault(&self, op: &'static str) -> Result<(), DriverError> {
        if let Some(queue) = self.faults.lock().await.get_mut(op) {
            if let Some(err) = queue.pop_front() {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Raw bytes of `key`, if present. Test helper.
    pub async fn object(&self, key: &str) -> Option<Bytes> {
        self.objects.read().await.get(key).map(|o| o.data.clone())
    }

    /// Number of stored objects. Test helper.
    pub async fn object_count(&self) -> usize {
        self.objects.read().await.len()
    }

    fn now_ticks() -> i64 {
        // 100-nanosecond ticks, the provider's put_time unit.
        Utc::now().timestamp_nanos_opt().unwrap_or_default() / 100
    }
}

/// Resolve a copy segment against the stored map.
fn resolve_copy(
    objects: &BTreeMap<String, StoredObject>,
    source_key: &str,
    from: u64,
    to: i64,
) -> Result<Bytes, DriverError> {
    let source = objects
        .get(source_key)
        .ok_or_else(|| DriverError::NotFound { path: source_key.to_string() })?;
    let len = source.data.len() as u64;
    let end = if to == -1 { len } else { (to as u64).min(len) };
    let start = from.min(end);
    Ok(source.data.slice(start as usize..end as usize))
}

impl ObjectStore for MemoryObjectStore {
    fn put_object(
        &self,
        key: &str,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = Result<(), DriverError>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            self.take_fault("put").await?;
            self.objects.write().await.insert(
                key,
                StoredObject { data, put_time: Self::now_ticks() },
            );
            Ok(())
        })
    }

    fn put_parts(
        &self,
        key: &str,
        segments: Vec<Segment>,
    ) -> Pin<Box<dyn Future<Output = Result<(), DriverError>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            self.take_fault("put_parts").await?;
            for segment in &segments {
                segment.validate()?;
            }

            let mut assembled = Vec::new();
            for segment in segments {
                match segment {
                    Segment::Copy { source_key, from, to } => {
                        let objects = self.objects.read().await;
                        assembled.extend_from_slice(&resolve_copy(&objects, &source_key, from, to)?);
                    }
                    Segment::Direct { mut stream, checksum } => {
                        let mut direct = Vec::new();
                        while let Some(chunk) = stream.next().await {
                            direct.extend_from_slice(&chunk?);
                        }
                        if let Some(expected) = checksum {
                            let digest = hex::encode(Md5::digest(&direct));
                            if digest != expected {
                                return Err(DriverError::Provider {
                                    code: 406,
                                    message: format!(
                                        "checksum mismatch: got {digest}, want {expected}"
                                    ),
                                });
                            }
                        }
                        assembled.extend_from_slice(&direct);
                    }
                }
            }

            self.objects.write().await.insert(
                key,
                StoredObject { data: Bytes::from(assembled), put_time: Self::now_ticks() },
            );
            Ok(())
        })
    }

    fn read_from(
        &self,
        key: &str,
        offset: u64,
    ) -> Pin<Box<dyn Future<Output = Result<ByteStream, DriverError>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            self.take_fault("read").await?;
            let objects = self.objects.read().await;
            let stored = objects
                .get(&key)
                .ok_or(DriverError::NotFound { path: key.clone() })?;
            if offset > stored.data.len() as u64 {
                return Err(DriverError::Provider {
                    code: 416,
                    message: format!("offset {offset} beyond object size {}", stored.data.len()),
                });
            }
            let body = stored.data.slice(offset as usize..);
            let stream: ByteStream = Box::pin(futures::stream::once(async move { Ok(body) }));
            Ok(stream)
        })
    }

    fn delete_object(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), DriverError>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            self.take_fault("delete").await?;
            match self.objects.write().await.remove(&key) {
                Some(_) => Ok(()),
                None => Err(DriverError::NotFound { path: key }),
            }
        })
    }

    fn move_object(
        &self,
        src: &str,
        dst: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), DriverError>> + Send + '_>> {
        let src = src.to_string();
        let dst = dst.to_string();
        Box::pin(async move {
            self.take_fault("move").await?;
            let mut objects = self.objects.write().await;
            let stored = objects
                .remove(&src)
                .ok_or(DriverError::NotFound { path: src })?;
            objects.insert(dst, stored);
            Ok(())
        })
    }

    fn list_page(
        &self,
        prefix: &str,
        delimiter: &str,
        marker: &str,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<ListPage, DriverError>> + Send + '_>> {
        let prefix = prefix.to_string();
        let delimiter = delimiter.to_string();
        let marker = marker.to_string();
        Box::pin(async move {
            self.take_fault("list").await?;
            let limit = match self.page_limit {
                Some(clamp) => limit.min(clamp),
                None => limit,
            };

            let objects = self.objects.read().await;
            let start: Bound<String> = if marker.is_empty() {
                Bound::Included(prefix.clone())
            } else {
                Bound::Excluded(marker)
            };

            let mut page = ListPage::default();
            let mut count = 0usize;
            let mut last_group: Option<String> = None;
            let mut last_consumed = String::new();

            for (key, stored) in objects.range((start, Bound::<String>::Unbounded)) {
                if !key.starts_with(&prefix) {
                    break;
                }

                let rest = &key[prefix.len()..];
                let group = if delimiter.is_empty() {
                    None
                } else {
                    rest.find(&delimiter)
                        .map(|pos| key[..prefix.len() + pos + delimiter.len()].to_string())
                };

                match group {
                    Some(group) => {
                        // Keys of one group are contiguous in sorted
                        // order, so skipping them keeps the marker exact.
                        if last_group.as_ref() == Some(&group) {
                            last_consumed = key.clone();
                            continue;
                        }
                        if count == limit {
                            page.marker = last_consumed;
                            return Ok(page);
                        }
                        page.common_prefixes.push(group.clone());
                        last_group = Some(group);
                    }
                    None => {
                        if count == limit {
                            page.marker = last_consumed;
                            return Ok(page);
                        }
                        page.entries.push(ObjectEntry {
                            key: key.clone(),
                            size: stored.data.len() as u64,
                            put_time: stored.put_time,
                        });
                    }
                }
                count += 1;
                last_consumed = key.clone();
            }

            Ok(page)
        })
    }

    fn sign_download_url(&self, base_url: &str, key: &str, _ttl: Duration) -> String {
        format!("{base_url}{key}?e=0&token=memory")
    }
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    async fn seed(store: &MemoryObjectStore, keys: &[&str]) {
        for key in keys {
            store
                .put_object(key, Bytes::from_static(b"x"))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn list_pages_continue_from_marker() {
        let store = MemoryObjectStore::new();
        seed(&store, &["d/a", "d/b", "d/c", "d/d", "d/e"]).await;

        let first = store.list_page("d/", "", "", 2).await.unwrap();
        assert_eq!(first.entries.len(), 2);
        assert_eq!(first.marker, "d/b");

        let second = store.list_page("d/", "", &first.marker, 2).await.unwrap();
        assert_eq!(second.entries.len(), 2);

        let third = store.list_page("d/", "", &second.marker, 2).await.unwrap();
        assert_eq!(third.entries.len(), 1);
        assert!(third.marker.is_empty());
    }

    #[tokio::test]
    async fn delimiter_groups_are_not_repeated_across_pages() {
        let store = MemoryObjectStore::new();
        seed(&store, &["d/sub/1", "d/sub/2", "d/sub/3", "d/z"]).await;

        let first = store.list_page("d/", "/", "", 1).await.unwrap();
        assert_eq!(first.common_prefixes, vec!["d/sub/"]);
        assert!(first.entries.is_empty());
        assert_eq!(first.marker, "d/sub/3");

        let second = store.list_page("d/", "/", &first.marker, 1).await.unwrap();
        assert!(second.common_prefixes.is_empty());
        assert_eq!(second.entries[0].key, "d/z");
        assert!(second.marker.is_empty());
    }

    #[tokio::test]
    async fn page_limit_clamps_large_requests() {
        let store = MemoryObjectStore::new().with_page_limit(2);
        seed(&store, &["d/a", "d/b", "d/c"]).await;
        let page = store.list_page("d/", "", "", 1000).await.unwrap();
        assert_eq!(page.entries.len(), 2);
        assert!(!page.marker.is_empty());
    }

    #[tokio::test]
    async fn put_parts_resolves_copy_then_direct() {
        let store = MemoryObjectStore::new();
        store
            .put_object("k", Bytes::from_static(b"hello "))
            .await
            .unwrap();

        let direct: ByteStream =
            Box::pin(futures::stream::once(async { Ok(Bytes::from_static(b"world")) }));
        store
            .put_parts(
                "k",
                vec![Segment::copy("k", 0, -1), Segment::direct(direct)],
            )
            .await
            .unwrap();

        assert_eq!(store.object("k").await.unwrap(), "hello world");
    }

    #[tokio::test]
    async fn copy_from_missing_source_is_not_found() {
        let store = MemoryObjectStore::new();
        let err = store
            .put_parts("k", vec![Segment::copy("missing", 0, -1)])
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn checksum_mismatch_is_rejected() {
        let store = MemoryObjectStore::new();
        let stream: ByteStream =
            Box::pin(futures::stream::once(async { Ok(Bytes::from_static(b"data")) }));
        let err = store
            .put_parts(
                "k",
                vec![Segment::Direct { stream, checksum: Some("0000".into()) }],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Provider { code: 406, .. }));
    }

    #[tokio::test]
    async fn read_from_honors_offset() {
        let store = MemoryObjectStore::new();
        store
            .put_object("k", Bytes::from_static(b"0123456789"))
            .await
            .unwrap();
        let mut stream = store.read_from("k", 4).await.unwrap();
        let chunk = stream.next().await.unwrap().unwrap();
        assert_eq!(chunk, "456789");
    }

    #[tokio::test]
    async fn injected_fault_fires_once() {
        let store = MemoryObjectStore::new();
        store
            .fail_next("list", DriverError::Transient { code: 599, message: "retry".into() })
            .await;
        assert!(store.list_page("", "", "", 10).await.unwrap_err().is_transient());
        assert!(store.list_page("", "", "", 10).await.is_ok());
    }
}
