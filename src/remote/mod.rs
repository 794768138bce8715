//! Remote object-store seam.
//!
//! The [`ObjectStore`] trait is the driver's only view of the Nimbus API.
//! [`http::HttpObjectStore`] speaks the real wire protocol;
//! [`memory::MemoryObjectStore`] implements the same semantics in memory
//! for tests and local development.

pub mod http;
pub mod memory;
pub mod sign;

use bytes::Bytes;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::errors::DriverError;

/// Default signed-URL lifetime.
pub const DEFAULT_URL_TTL: Duration = Duration::from_secs(3600);

/// A streamed object body. Chunk order is byte order.
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// One entry of a listing page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    /// Full backend key.
    pub key: String,
    /// Object size in bytes.
    pub size: u64,
    /// Store time in 100-nanosecond ticks since the Unix epoch.
    pub put_time: i64,
}

/// One page of a marker-paginated listing.
///
/// An empty `marker` signals the final page; a non-empty marker must be
/// passed back verbatim to fetch the next page.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub entries: Vec<ObjectEntry>,
    pub common_prefixes: Vec<String>,
    pub marker: String,
}

/// One part of a segmented upload, assembled in order by the store.
pub enum Segment {
    /// A byte range of an already-stored object. `to == -1` means "to the
    /// end of the object"; otherwise `to > from` is required (`[from, to)`).
    Copy {
        source_key: String,
        from: u64,
        to: i64,
    },
    /// Freshly streamed bytes with an optional MD5 hex checksum.
    Direct {
        stream: ByteStream,
        checksum: Option<String>,
    },
}

impl Segment {
    pub fn copy(source_key: impl Into<String>, from: u64, to: i64) -> Segment {
        Segment::Copy { source_key: source_key.into(), from, to }
    }

    pub fn direct(stream: ByteStream) -> Segment {
        Segment::Direct { stream, checksum: None }
    }

    /// Check the copy-range invariant.
    pub fn validate(&self) -> Result<(), DriverError> {
        if let Segment::Copy { from, to, .. } = self {
            if *to != -1 && (*to as u64) <= *from {
                return Err(DriverError::Provider {
                    code: 400,
                    message: format!("invalid copy range [{from}, {to})"),
                });
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Segment::Copy { source_key, from, to } => f
                .debug_struct("Copy")
                .field("source_key", source_key)
                .field("from", from)
                .field("to", to)
                .finish(),
            Segment::Direct { checksum, .. } => {
                f.debug_struct("Direct").field("checksum", checksum).finish()
            }
        }
    }
}

/// Async contract against the remote store.
///
/// Every method surfaces failures already translated through
/// [`DriverError::from_provider`]; callers never see raw provider codes.
pub trait ObjectStore: Send + Sync + 'static {
    /// Store `data` at `key` in a single call. Overwrites.
    fn put_object(
        &self,
        key: &str,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = Result<(), DriverError>> + Send + '_>>;

    /// Assemble `segments` in order into the object at `key`, streaming
    /// direct segments without materializing them.
    fn put_parts(
        &self,
        key: &str,
        segments: Vec<Segment>,
    ) -> Pin<Box<dyn Future<Output = Result<(), DriverError>> + Send + '_>>;

    /// Open a download stream at `key` starting at byte `offset`.
    fn read_from(
        &self,
        key: &str,
        offset: u64,
    ) -> Pin<Box<dyn Future<Output = Result<ByteStream, DriverError>> + Send + '_>>;

    /// Delete the object at `key`.
    fn delete_object(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), DriverError>> + Send + '_>>;

    /// Move `src` to `dst`, overwriting any existing destination.
    fn move_object(
        &self,
        src: &str,
        dst: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), DriverError>> + Send + '_>>;

    /// Fetch one listing page for `prefix`, grouping on `delimiter` when
    /// non-empty, continuing from `marker`, with at most `limit` results.
    fn list_page(
        &self,
        prefix: &str,
        delimiter: &str,
        marker: &str,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<ListPage, DriverError>> + Send + '_>>;

    /// Build a signed private download URL for `key` under `base_url`,
    /// valid for `ttl`. Deterministic for a fixed deadline.
    fn sign_download_url(&self, base_url: &str, key: &str, ttl: Duration) -> String;
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_segment_range_invariant() {
        assert!(Segment::copy("k", 0, -1).validate().is_ok());
        assert!(Segment::copy("k", 0, 10).validate().is_ok());
        assert!(Segment::copy("k", 10, 10).validate().is_err());
        assert!(Segment::copy("k", 10, 5).validate().is_err());
    }

    #[test]
    fn direct_segment_always_validates() {
        let stream: ByteStream = Box::pin(futures::stream::empty());
        assert!(Segment::direct(stream).validate().is_ok());
    }
}
