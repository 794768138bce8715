//! Paginated listing with bounded transient retry.
//!
//! The remote listing call is marker-paginated and occasionally answers
//! with a retry-safe failure. [`list_page_with_retry`] re-issues the same
//! page a bounded number of times; [`collect_prefix`] drives the marker
//! loop until exhaustion. Entries and prefixes keep backend order.

use metrics::counter;
use tracing::warn;

use crate::errors::DriverError;
use crate::metrics::LIST_RETRIES_TOTAL;
use crate::remote::{ListPage, ObjectEntry, ObjectStore};

/// Default page size for full enumerations.
pub const LIST_MAX: usize = 1000;

/// Attempts per page; two is enough for the provider's transient blips.
const PAGE_ATTEMPTS: usize = 2;

/// Fetch one page, retrying the identical call on a transient failure.
///
/// Anything that is not [`DriverError::Transient`] propagates on the
/// first attempt; a transient failure on the last attempt propagates too.
pub async fn list_page_with_retry(
    store: &dyn ObjectStore,
    prefix: &str,
    delimiter: &str,
    marker: &str,
    limit: usize,
) -> Result<ListPage, DriverError> {
    let mut last = None;
    for attempt in 1..=PAGE_ATTEMPTS {
        match store.list_page(prefix, delimiter, marker, limit).await {
            Err(err) if err.is_transient() && attempt < PAGE_ATTEMPTS => {
                counter!(LIST_RETRIES_TOTAL).increment(1);
                warn!(prefix, marker, attempt, %err, "transient list failure, retrying page");
                last = Some(err);
            }
            other => return other,
        }
    }
    // PAGE_ATTEMPTS >= 1, so the loop either returned or stored an error.
    Err(last.expect("retry loop exhausted without an error"))
}

/// Enumerate every entry and common prefix under `prefix`, issuing as
/// many pages as the markers demand.
pub async fn collect_prefix(
    store: &dyn ObjectStore,
    prefix: &str,
    delimiter: &str,
    limit: usize,
) -> Result<(Vec<ObjectEntry>, Vec<String>), DriverError> {
    let mut entries = Vec::new();
    let mut prefixes = Vec::new();
    let mut marker = String::new();

    loop {
        let page = list_page_with_retry(store, prefix, delimiter, &marker, limit).await?;
        entries.extend(page.entries);
        prefixes.extend(page.common_prefixes);
        if page.marker.is_empty() {
            break;
        }
        marker = page.marker;
    }

    Ok((entries, prefixes))
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::memory::MemoryObjectStore;
    use bytes::Bytes;

    async fn seed(store: &MemoryObjectStore, keys: &[&str]) {
        for key in keys {
            store
                .put_object(key, Bytes::from_static(b"x"))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn collects_across_multiple_pages() {
        let store = MemoryObjectStore::new();
        seed(&store, &["d/1", "d/2", "d/3", "d/4", "d/5"]).await;

        let (entries, prefixes) = collect_prefix(&store, "d/", "/", 2).await.unwrap();
        let keys: Vec<_> = entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, ["d/1", "d/2", "d/3", "d/4", "d/5"]);
        assert!(prefixes.is_empty());
    }

    #[tokio::test]
    async fn groups_stay_distinct_from_leaves() {
        let store = MemoryObjectStore::new();
        seed(&store, &["d/a", "d/sub/1", "d/sub/2", "d/z"]).await;

        let (entries, prefixes) = collect_prefix(&store, "d/", "/", 2).await.unwrap();
        let keys: Vec<_> = entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, ["d/a", "d/z"]);
        assert_eq!(prefixes, ["d/sub/"]);
    }

    #[tokio::test]
    async fn one_transient_failure_is_retried() {
        let store = MemoryObjectStore::new();
        seed(&store, &["d/1"]).await;
        store
            .fail_next("list", DriverError::Transient { code: 599, message: "retry".into() })
            .await;

        let (entries, _) = collect_prefix(&store, "d/", "", LIST_MAX).await.unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn retry_exhaustion_surfaces_transient() {
        let store = MemoryObjectStore::new();
        seed(&store, &["d/1"]).await;
        for _ in 0..2 {
            store
                .fail_next("list", DriverError::Transient { code: 599, message: "retry".into() })
                .await;
        }

        let err = collect_prefix(&store, "d/", "", LIST_MAX).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn non_transient_failures_are_not_retried() {
        let store = MemoryObjectStore::new();
        store
            .fail_next("list", DriverError::Provider { code: 500, message: "down".into() })
            .await;
        // A second injected fault would fire if the lister retried.
        store
            .fail_next("list", DriverError::Provider { code: 500, message: "down again".into() })
            .await;

        let err = collect_prefix(&store, "d/", "", LIST_MAX).await.unwrap_err();
        assert!(matches!(err, DriverError::Provider { code: 500, .. }));
        assert!(err.to_string().contains("down"));
        assert!(!err.to_string().contains("again"));
    }
}
