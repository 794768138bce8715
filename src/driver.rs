//! Driver facade implementing the uniform blob-storage contract.
//!
//! [`NimbusDriver`] translates external slash-separated paths into
//! backend keys under the configured root prefix and dispatches to the
//! remote client, the paginated lister, resumable write sessions and the
//! cache invalidator.
//!
//! Because the backend is a flat key-value namespace, directories are an
//! abstraction: `stat` reports a synthetic directory whenever the first
//! key under a prefix differs from the requested key, and directory
//! entries carry neither size nor modification time.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::DriverConfig;
use crate::errors::DriverError;
use crate::invalidator::{CacheInvalidator, CacheRefresher, DisabledRefresher, HttpCacheRefresher};
use crate::lister::{self, LIST_MAX};
use crate::remote::http::HttpObjectStore;
use crate::remote::{ByteStream, ObjectStore, DEFAULT_URL_TTL};
use crate::writer::BlobWriter;

/// Metadata for one stored path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// The external path this entry was resolved for.
    pub path: String,
    /// Object size in bytes; 0 for synthetic directories.
    pub size: u64,
    /// Store time; withheld for synthetic directories.
    pub mod_time: Option<DateTime<Utc>>,
    /// Whether the path names a directory-like grouping.
    pub is_dir: bool,
}

/// Options for [`NimbusDriver::url_for`].
#[derive(Debug, Clone, Default)]
pub struct UrlOptions {
    /// Absolute expiry for the signed URL; defaults to one hour from now.
    pub expiry: Option<DateTime<Utc>>,
    /// Host hint matched (by substring) against the redirect table.
    pub host: Option<String>,
}

/// Storage driver for the Nimbus object store.
///
/// Configuration is immutable for the life of the driver; the underlying
/// client and the invalidation queue are safe for concurrent use.
pub struct NimbusDriver {
    config: DriverConfig,
    store: Arc<dyn ObjectStore>,
    invalidator: CacheInvalidator,
}

impl NimbusDriver {
    /// Build a driver speaking the real wire API.
    ///
    /// Must be called from within a Tokio runtime: the invalidation
    /// worker pool is spawned here.
    pub fn new(config: DriverConfig) -> Result<NimbusDriver, DriverError> {
        let config = config.validate()?;
        let store: Arc<dyn ObjectStore> = Arc::new(HttpObjectStore::new(&config)?);
        let refresher: Arc<dyn CacheRefresher> = match &config.invalidation {
            Some(inv) => Arc::new(HttpCacheRefresher::new(inv, &config.bucket)?),
            None => Arc::new(DisabledRefresher),
        };
        NimbusDriver::with_store(config, store, refresher)
    }

    /// Build a driver over an arbitrary [`ObjectStore`] and refresher.
    /// Used by tests and embedders with their own transport.
    pub fn with_store(
        config: DriverConfig,
        store: Arc<dyn ObjectStore>,
        refresher: Arc<dyn CacheRefresher>,
    ) -> Result<NimbusDriver, DriverError> {
        let config = config.validate()?;
        info!(
            bucket = config.bucket,
            root = config.root_directory,
            "nimbus driver initialized"
        );
        Ok(NimbusDriver {
            config,
            store,
            invalidator: CacheInvalidator::spawn(refresher),
        })
    }

    /// Backend key for an external path: root prefix joined and stripped
    /// of leading slashes. The empty key addresses the root itself.
    fn key_of(&self, path: &str) -> String {
        format!("{}{}", self.config.root_directory, path)
            .trim_start_matches('/')
            .to_string()
    }

    /// Read the full object at `path`.
    pub async fn get_content(&self, path: &str) -> Result<Vec<u8>, DriverError> {
        let mut stream = self.reader(path, 0).await?;
        let mut content = Vec::new();
        while let Some(chunk) = stream.next().await {
            content.extend_from_slice(&chunk?);
        }
        Ok(content)
    }

    /// Store `content` at `path` in one non-resuming put and queue a CDN
    /// invalidation.
    pub async fn put_content(&self, path: &str, content: Bytes) -> Result<(), DriverError> {
        let key = self.key_of(path);
        self.store
            .put_object(&key, content)
            .await
            .map_err(|err| err.with_path(path))?;
        self.invalidator.enqueue(key).await;
        Ok(())
    }

    /// Open a download stream at `path`, starting at byte `offset`.
    pub async fn reader(&self, path: &str, offset: u64) -> Result<ByteStream, DriverError> {
        self.store
            .read_from(&self.key_of(path), offset)
            .await
            .map_err(|err| err.with_path(path))
    }

    /// Open a write session for `path`.
    ///
    /// With `append`, an existing object's size becomes the resume base
    /// so its bytes are server-side copied into the final assembly; a
    /// missing object silently degrades to a fresh write.
    pub async fn writer(&self, path: &str, append: bool) -> Result<BlobWriter, DriverError> {
        let mut from = 0;
        if append {
            match self.stat(path).await {
                Ok(info) => from = info.size,
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(BlobWriter::new(
            self.store.clone(),
            self.invalidator.clone(),
            self.key_of(path),
            from,
        ))
    }

    /// Resolve metadata for `path` from a single listing probe.
    pub async fn stat(&self, path: &str) -> Result<FileInfo, DriverError> {
        let key = self.key_of(path);
        let page = lister::list_page_with_retry(self.store.as_ref(), &key, "", "", 1)
            .await
            .map_err(|err| err.with_path(path))?;

        let entry = match page.entries.first() {
            Some(entry) => entry,
            None => return Err(DriverError::NotFound { path: path.to_string() }),
        };

        if entry.key != key {
            // Some key continues past the requested one: a directory.
            return Ok(FileInfo {
                path: path.to_string(),
                size: 0,
                mod_time: None,
                is_dir: true,
            });
        }

        Ok(FileInfo {
            path: path.to_string(),
            size: entry.size,
            mod_time: Some(DateTime::from_timestamp_nanos(
                entry.put_time.saturating_mul(100),
            )),
            is_dir: false,
        })
    }

    /// List the direct children of `path`, files before directories, in
    /// backend order.
    pub async fn list(&self, path: &str) -> Result<Vec<String>, DriverError> {
        let mut prefix_path = path.to_string();
        if prefix_path != "/" && !prefix_path.ends_with('/') {
            prefix_path.push('/');
        }

        // With an empty root there is no prefix to strip, so results get
        // an explicit leading slash to stay valid external paths.
        let root_key = self.key_of("");
        let replacement = if root_key.is_empty() { "/" } else { "" };

        let (entries, groups) =
            lister::collect_prefix(self.store.as_ref(), &self.key_of(&prefix_path), "/", LIST_MAX)
                .await
                .map_err(|err| err.with_path(path))?;

        let externalize = |key: &str| -> String {
            match key.strip_prefix(&root_key) {
                Some(rest) => format!("{replacement}{rest}"),
                None => key.to_string(),
            }
        };

        let mut children: Vec<String> = entries.iter().map(|e| externalize(&e.key)).collect();
        let directories: Vec<String> = groups
            .iter()
            .map(|group| externalize(group.trim_end_matches('/')))
            .collect();

        if path != "/" && children.is_empty() && directories.is_empty() {
            return Err(DriverError::NotFound { path: path.to_string() });
        }

        children.extend(directories);
        Ok(children)
    }

    /// Move the object at `source` to `dest`, overwriting. A missing
    /// source reports NotFound for the source path.
    pub async fn mv(&self, source: &str, dest: &str) -> Result<(), DriverError> {
        self.store
            .move_object(&self.key_of(source), &self.key_of(dest))
            .await
            .map_err(|err| err.with_path(source))
    }

    /// Recursively delete everything under `path`, queueing a CDN
    /// invalidation per removed key. A key already gone (a concurrent
    /// delete won) is skipped, not an error.
    pub async fn delete(&self, path: &str) -> Result<(), DriverError> {
        let key = self.key_of(path);
        let mut marker = String::new();
        let mut matched = 0usize;

        loop {
            let page =
                lister::list_page_with_retry(self.store.as_ref(), &key, "", &marker, LIST_MAX)
                    .await?;
            matched += page.entries.len();

            for entry in &page.entries {
                match self.store.delete_object(&entry.key).await {
                    Ok(()) => self.invalidator.enqueue(entry.key.clone()).await,
                    Err(err) if err.is_not_found() => {
                        debug!(key = entry.key, "already deleted by a concurrent actor");
                    }
                    Err(err) => return Err(err),
                }
            }

            if page.marker.is_empty() {
                break;
            }
            marker = page.marker;
        }

        if matched == 0 {
            return Err(DriverError::NotFound { path: path.to_string() });
        }
        Ok(())
    }

    /// Signed download URL for `path`.
    ///
    /// A host hint matching the redirect table swaps the base URL for
    /// the configured alternate (CDN edge redirection); the expiry
    /// option overrides the default one-hour TTL when it lies in the
    /// future.
    pub fn url_for(&self, path: &str, options: &UrlOptions) -> String {
        let key = self.key_of(path);
        let ttl = options
            .expiry
            .and_then(|at| (at - Utc::now()).to_std().ok())
            .filter(|ttl| ttl.as_secs() > 0)
            .unwrap_or(DEFAULT_URL_TTL);

        if let Some(host) = &options.host {
            for (needle, base) in &self.config.redirect {
                if host.contains(needle.as_str()) {
                    debug!(host, needle, "redirecting signed URL to alternate base");
                    return self.store.sign_download_url(base, &key, ttl);
                }
            }
        }
        self.store.sign_download_url(&self.config.base_url, &key, ttl)
    }
}

// -- Tests -------------------------------------------------------------------
