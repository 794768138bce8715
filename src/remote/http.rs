//! HTTP client for the Nimbus wire API.
//!
//! Host layout:
//!   `rs`   metadata plane (delete, move)
//!   `rsf`  listing plane (marker pagination)
//!   `up`   upload plane (single put, segmented put)
//!   `io`   download plane (signed private URLs)
//!
//! Each plane has a per-zone default, overridable from configuration.
//! Segmented puts are posted as streamed `multipart/form-data`: a JSON
//! `parts` descriptor array plus one streamed file field per direct
//! segment, so new bytes are never fully materialized in memory.

use bytes::Bytes;
use futures::StreamExt;
use metrics::counter;
use reqwest::multipart::{Form, Part};
use reqwest::Body;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::debug;

use super::sign::{deadline_after, encoded_entry, Credential};
use super::{ByteStream, ListPage, ObjectEntry, ObjectStore, Segment, DEFAULT_URL_TTL};
use crate::config::DriverConfig;
use crate::errors::DriverError;
use crate::metrics::REMOTE_CALLS_TOTAL;

/// Connection timeout for every API call.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolved API hosts for one zone.
#[derive(Debug, Clone)]
struct Hosts {
    rs: String,
    rsf: String,
    up: String,
    io: String,
}

fn zone_defaults(zone: &str) -> Hosts {
    let suffix = match zone {
        "z1" | "z2" => zone,
        _ => "z0",
    };
    Hosts {
        rs: format!("https://rs-{suffix}.nimbuskv.com"),
        rsf: format!("https://rsf-{suffix}.nimbuskv.com"),
        up: format!("https://up-{suffix}.nimbuskv.com"),
        io: String::new(),
    }
}

/// Client speaking the Nimbus wire protocol.
///
/// Credentials and host layout are fixed at construction; the underlying
/// connection pool is safe for concurrent use.
pub struct HttpObjectStore {
    http: reqwest::Client,
    bucket: String,
    /// Download base; `io` host override or the public base URL.
    download_base: String,
    cred: Credential,
    hosts: Hosts,
}

impl HttpObjectStore {
    pub fn new(config: &DriverConfig) -> Result<HttpObjectStore, DriverError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        let mut hosts = zone_defaults(&config.zone);
        if !config.rs_host.is_empty() {
            hosts.rs = config.rs_host.trim_end_matches('/').to_string();
        }
        if !config.rsf_host.is_empty() {
            hosts.rsf = config.rsf_host.trim_end_matches('/').to_string();
        }
        if let Some(first) = config.up_hosts.first() {
            hosts.up = first.trim_end_matches('/').to_string();
        }
        if !config.io_host.is_empty() {
            hosts.io = config.io_host.trim_end_matches('/').to_string();
        }

        let download_base = if hosts.io.is_empty() {
            config.base_url.clone()
        } else {
            format!("{}/", hosts.io)
        };

        Ok(HttpObjectStore {
            http,
            bucket: config.bucket.clone(),
            download_base,
            cred: Credential::new(&config.access_key, &config.secret_key),
            hosts,
        })
    }

    /// Signed POST to a management URI (rs/rsf planes).
    async fn signed_post(&self, url: &str, key: &str, op: &'static str) -> Result<(), DriverError> {
        let auth = self.cred.authorization(path_and_query(url), None);
        debug!(op, url, "nimbus management call");
        let resp = self
            .http
            .post(url)
            .header("Authorization", auth)
            .send()
            .await
            .map_err(|e| observe(op, e.into()))?;
        check(op, key, resp).await?;
        Ok(())
    }
}

/// Strip scheme and host from a URL, leaving the request target that the
/// signature covers.
pub(crate) fn path_and_query(url: &str) -> &str {
    let after_scheme = match url.find("://") {
        Some(pos) => &url[pos + 3..],
        None => url,
    };
    match after_scheme.find('/') {
        Some(pos) => &after_scheme[pos..],
        None => "/",
    }
}

/// Count the outcome and hand the error back for propagation.
fn observe(op: &'static str, err: DriverError) -> DriverError {
    counter!(REMOTE_CALLS_TOTAL, "op" => op, "outcome" => "err").increment(1);
    err
}

/// Turn a non-2xx response into a classified error; count the call.
async fn check(
    op: &'static str,
    key: &str,
    resp: reqwest::Response,
) -> Result<reqwest::Response, DriverError> {
    let status = resp.status();
    if status.is_success() {
        counter!(REMOTE_CALLS_TOTAL, "op" => op, "outcome" => "ok").increment(1);
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<WireError>(&body)
        .map(|w| w.error)
        .unwrap_or(body);
    Err(observe(op, DriverError::from_provider(key, status.as_u16(), message)))
}

// -- Wire types --------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WireError {
    error: String,
}

#[derive(Debug, Deserialize)]
struct WireListPage {
    #[serde(default)]
    items: Vec<WireListItem>,
    #[serde(default)]
    common_prefixes: Vec<String>,
    #[serde(default)]
    marker: String,
}

#[derive(Debug, Deserialize)]
struct WireListItem {
    key: String,
    #[serde(default)]
    fsize: u64,
    #[serde(default)]
    put_time: i64,
}

/// Descriptor entry of the `parts` form field. Direct entries reference
/// the streamed file fields by position.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum WirePart<'a> {
    Copy { source: &'a str, from: u64, to: i64 },
    Direct { checksum: Option<&'a str> },
}

// -- Trait implementation ----------------------------------------------------

impl ObjectStore for HttpObjectStore {
    fn put_object(
        &self,
        key: &str,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = Result<(), DriverError>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let token = self
                .cred
                .upload_token(&self.bucket, &key, deadline_after(DEFAULT_URL_TTL));
            let url = format!(
                "{}/put/{}",
                self.hosts.up,
                encoded_entry(&self.bucket, &key)
            );
            debug!(key, size = data.len(), "nimbus put_object");
            let resp = self
                .http
                .post(&url)
                .header("Authorization", format!("NIMBUS-UPLOAD {token}"))
                .body(data)
                .send()
                .await
                .map_err(|e| observe("put_object", e.into()))?;
            check("put_object", &key, resp).await?;
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
            for segment in &segments {
                segment.validate()?;
            }

            // Split metadata from the streams so the descriptor can be
            // serialized up front while the bodies stream lazily.
            let mut descriptors = Vec::with_capacity(segments.len());
            let mut streams = Vec::new();
            for segment in &segments {
                match segment {
                    Segment::Copy { source_key, from, to } => {
                        descriptors.push(WirePart::Copy { source: source_key, from: *from, to: *to });
                    }
                    Segment::Direct { checksum, .. } => {
                        descriptors.push(WirePart::Direct { checksum: checksum.as_deref() });
                    }
                }
            }
            let parts_json = serde_json::to_string(&descriptors)
                .map_err(|e| DriverError::Transport(e.to_string()))?;
            for segment in segments {
                if let Segment::Direct { stream, .. } = segment {
                    streams.push(stream);
                }
            }

            let token = self
                .cred
                .upload_token(&self.bucket, &key, deadline_after(DEFAULT_URL_TTL));
            let mut form = Form::new()
                .text("token", token)
                .text("key", key.clone())
                .text("parts", parts_json);
            for (i, stream) in streams.into_iter().enumerate() {
                form = form.part(
                    format!("part-{i}"),
                    Part::stream(Body::wrap_stream(stream)).file_name(format!("part-{i}")),
                );
            }

            let url = format!("{}/parts", self.hosts.up);
            debug!(key, "nimbus put_parts");
            let resp = self
                .http
                .post(&url)
                .multipart(form)
                .send()
                .await
                .map_err(|e| observe("put_parts", e.into()))?;
            check("put_parts", &key, resp).await?;
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
            let url = self
                .cred
                .private_url(&self.download_base, &key, DEFAULT_URL_TTL);
            debug!(key, offset, "nimbus read_from");
            let mut req = self.http.get(&url);
            if offset > 0 {
                req = req.header("Range", format!("bytes={offset}-"));
            }
            let resp = req.send().await.map_err(|e| observe("read_from", e.into()))?;

            // The download plane is plain HTTP; its 404 is this key's
            // not-found signal and the body is dropped.
            if resp.status() == reqwest::StatusCode::NOT_FOUND {
                return Err(observe(
                    "read_from",
                    DriverError::NotFound { path: key.clone() },
                ));
            }
            let resp = check("read_from", &key, resp).await?;

            let stream: ByteStream = Box::pin(
                resp.bytes_stream()
                    .map(|chunk| chunk.map_err(std::io::Error::other)),
            );
            Ok(stream)
        })
    }

    fn delete_object(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), DriverError>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            let url = format!(
                "{}/delete/{}",
                self.hosts.rs,
                encoded_entry(&self.bucket, &key)
            );
            self.signed_post(&url, &key, "delete_object").await
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
            let url = format!(
                "{}/move/{}/{}/force/true",
                self.hosts.rs,
                encoded_entry(&self.bucket, &src),
                encoded_entry(&self.bucket, &dst)
            );
            self.signed_post(&url, &src, "move_object").await
        })
    }

    fn list_page(
        &self,
        prefix: &str,
        delimiter: &str,
        marker: &str,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<ListPage, DriverError>> + Send + '_>> {
        let url = list_url(&self.hosts.rsf, &self.bucket, prefix, delimiter, marker, limit);
        let prefix = prefix.to_string();
        Box::pin(async move {
            let auth = self.cred.authorization(path_and_query(&url), None);
            debug!(prefix, url, "nimbus list_page");
            let resp = self
                .http
                .get(&url)
                .header("Authorization", auth)
                .send()
                .await
                .map_err(|e| observe("list_page", e.into()))?;
            let resp = check("list_page", &prefix, resp).await?;

            let wire: WireListPage = resp
                .json()
                .await
                .map_err(|e| observe("list_page", DriverError::Transport(e.to_string())))?;
            Ok(ListPage {
                entries: wire
                    .items
                    .into_iter()
                    .map(|item| ObjectEntry {
                        key: item.key,
                        size: item.fsize,
                        put_time: item.put_time,
                    })
                    .collect(),
                common_prefixes: wire.common_prefixes,
                marker: wire.marker,
            })
        })
    }

    fn sign_download_url(&self, base_url: &str, key: &str, ttl: Duration) -> String {
        self.cred.private_url(base_url, key, ttl)
    }
}

/// Build the listing URL. Query values are percent-encoded; the marker is
/// passed back verbatim (it is already URL-safe base64).
fn list_url(
    rsf_host: &str,
    bucket: &str,
    prefix: &str,
    delimiter: &str,
    marker: &str,
    limit: usize,
) -> String {
    use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
    format!(
        "{rsf_host}/list?bucket={}&prefix={}&delimiter={}&marker={marker}&limit={limit}",
        utf8_percent_encode(bucket, NON_ALPHANUMERIC),
        utf8_percent_encode(prefix, NON_ALPHANUMERIC),
        utf8_percent_encode(delimiter, NON_ALPHANUMERIC),
    )
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_defaults_fall_back_to_z0() {
        assert_eq!(zone_defaults("z1").rs, "https://rs-z1.nimbuskv.com");
        assert_eq!(zone_defaults("unknown").rs, "https://rs-z0.nimbuskv.com");
        assert_eq!(zone_defaults("").up, "https://up-z0.nimbuskv.com");
    }

    #[test]
    fn path_and_query_strips_scheme_and_host() {
        assert_eq!(
            path_and_query("https://rsf-z0.nimbuskv.com/list?bucket=b&limit=1"),
            "/list?bucket=b&limit=1"
        );
        assert_eq!(path_and_query("https://rs-z0.nimbuskv.com"), "/");
    }

    #[test]
    fn list_url_encodes_prefix_and_delimiter() {
        let url = list_url(
            "https://rsf-z0.nimbuskv.com",
            "bkt",
            "dir/sub",
            "/",
            "mark",
            100,
        );
        assert_eq!(
            url,
            "https://rsf-z0.nimbuskv.com/list?bucket=bkt&prefix=dir%2Fsub&delimiter=%2F&marker=mark&limit=100"
        );
    }

    #[test]
    fn wire_parts_serialize_tagged() {
        let parts = vec![
            WirePart::Copy { source: "k", from: 0, to: -1 },
            WirePart::Direct { checksum: Some("abc") },
        ];
        let json = serde_json::to_string(&parts).unwrap();
        assert_eq!(
            json,
            r#"[{"type":"copy","source":"k","from":0,"to":-1},{"type":"direct","checksum":"abc"}]"#
        );
    }

    #[test]
    fn wire_list_page_tolerates_missing_fields() {
        let wire: WireListPage =
            serde_json::from_str(r#"{"items":[{"key":"a/b"}]}"#).unwrap();
        assert_eq!(wire.items.len(), 1);
        assert_eq!(wire.items[0].fsize, 0);
        assert!(wire.marker.is_empty());
        assert!(wire.common_prefixes.is_empty());
    }
}
