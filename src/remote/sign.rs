//! Request, token and URL signing for the Nimbus API.
//!
//! All signatures are HMAC-SHA256 over a canonical string, encoded with
//! URL-safe base64:
//! 1. management calls sign `"{path}?{query}\n"` (plus the form body for
//!    POSTs) and send `Authorization: NIMBUS {ak}:{sig}`;
//! 2. upload tokens sign an encoded put policy scoped to `bucket:key`
//!    with a deadline;
//! 3. private download URLs append `e={deadline}` and sign the whole URL.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

/// Characters percent-encoded inside a key path segment. Slashes are kept
/// so keys stay hierarchical in URLs.
const KEY_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'?')
    .add(b'<')
    .add(b'>')
    .add(b'[')
    .add(b']')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// An access/secret key pair. Immutable, shared read-only.
#[derive(Debug, Clone)]
pub struct Credential {
    access_key: String,
    secret_key: String,
}

impl Credential {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Credential {
        Credential {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
        }
    }

    pub fn access_key(&self) -> &str {
        &self.access_key
    }

    /// URL-safe base64 HMAC-SHA256 of `data`.
    pub fn sign(&self, data: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret_key.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(data);
        URL_SAFE.encode(mac.finalize().into_bytes())
    }

    /// `Authorization` header value for a management call.
    ///
    /// `path_and_query` is the request target (path plus query string);
    /// `body` is included for form POSTs, as the provider requires.
    pub fn authorization(&self, path_and_query: &str, body: Option<&[u8]>) -> String {
        let mut data = Vec::with_capacity(path_and_query.len() + 1);
        data.extend_from_slice(path_and_query.as_bytes());
        data.push(b'\n');
        if let Some(body) = body {
            data.extend_from_slice(body);
        }
        format!("NIMBUS {}:{}", self.access_key, self.sign(&data))
    }

    /// Upload token scoped to `bucket:key`, expiring at `deadline`
    /// (seconds since epoch).
    pub fn upload_token(&self, bucket: &str, key: &str, deadline: u64) -> String {
        let policy = format!(r#"{{"scope":"{bucket}:{key}","deadline":{deadline}}}"#);
        let encoded = URL_SAFE.encode(policy.as_bytes());
        let sig = self.sign(encoded.as_bytes());
        format!("{}:{}:{}", self.access_key, sig, encoded)
    }

    /// Turn `base_url + key` into a signed private download URL expiring
    /// at `deadline` (seconds since epoch).
    pub fn private_url_at(&self, base_url: &str, key: &str, deadline: u64) -> String {
        let encoded_key = utf8_percent_encode(key, KEY_ENCODE_SET);
        let sep = if base_url.contains('?') { '&' } else { '?' };
        let unsigned = format!("{base_url}{encoded_key}{sep}e={deadline}");
        let token = format!("{}:{}", self.access_key, self.sign(unsigned.as_bytes()));
        format!("{unsigned}&token={token}")
    }

    /// [`private_url_at`](Credential::private_url_at) with a deadline of
    /// now + `ttl`.
    pub fn private_url(&self, base_url: &str, key: &str, ttl: Duration) -> String {
        self.private_url_at(base_url, key, deadline_after(ttl))
    }
}

/// Seconds since epoch, `ttl` from now.
pub fn deadline_after(ttl: Duration) -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        + ttl.as_secs()
}

/// Encode `bucket:key` the way the provider addresses entries in
/// management URIs.
pub fn encoded_entry(bucket: &str, key: &str) -> String {
    URL_SAFE.encode(format!("{bucket}:{key}").as_bytes())
}

// -- Tests -------------------------------------------------------------------
