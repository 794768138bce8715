//! Driver configuration.
//!
//! Configuration is a plain serde structure so embedders can deserialize
//! it from whatever format they use (a YAML loader is provided for
//! convenience). The driver treats it as immutable after construction.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::errors::DriverError;

/// Complete driver configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DriverConfig {
    /// Backing bucket name.
    pub bucket: String,

    /// Public base URL for downloads, e.g. `https://cdn.example.com/`.
    /// A trailing slash is added during validation if missing.
    pub base_url: String,

    /// Access key for data-plane signing.
    pub access_key: String,

    /// Secret key for data-plane signing.
    pub secret_key: String,

    /// Prefix prepended to every external path when deriving a backend
    /// key. Trailing slashes are trimmed during validation.
    #[serde(default)]
    pub root_directory: String,

    /// Storage zone selector; picks the default host set.
    #[serde(default = "default_zone")]
    pub zone: String,

    /// Override for the metadata host (delete/move/stat).
    #[serde(default)]
    pub rs_host: String,

    /// Override for the listing host.
    #[serde(default)]
    pub rsf_host: String,

    /// Override for the download host (accelerated IO).
    #[serde(default)]
    pub io_host: String,

    /// Upload endpoint hosts; the first entry is used.
    #[serde(default)]
    pub up_hosts: Vec<String>,

    /// CDN invalidation settings. Absent means invalidation is disabled;
    /// when present every field is required.
    #[serde(default)]
    pub invalidation: Option<InvalidationConfig>,

    /// Host-substring to alternate-base-URL redirect table, consulted by
    /// `url_for` when the caller supplies a host hint.
    #[serde(default)]
    pub redirect: HashMap<String, String>,
}

/// CDN cache-invalidation settings. All-or-nothing.
#[derive(Debug, Clone, Deserialize)]
pub struct InvalidationConfig {
    /// Administrative access key used to sign refresh calls.
    pub admin_access_key: String,

    /// Administrative secret key.
    pub admin_secret_key: String,

    /// Numeric tenant identifier embedded in the refresh cache key.
    pub tenant_id: u64,

    /// Cache-refresh endpoint URL.
    pub refresh_url: String,
}

fn default_zone() -> String {
    "z0".to_string()
}

impl DriverConfig {
    /// Check required fields and normalize `base_url` / `root_directory`.
    pub fn validate(mut self) -> Result<DriverConfig, DriverError> {
        if self.bucket.is_empty() {
            return Err(DriverError::Config("no bucket provided".into()));
        }
        if self.base_url.is_empty() {
            return Err(DriverError::Config("no base_url provided".into()));
        }
        if self.access_key.is_empty() || self.secret_key.is_empty() {
            return Err(DriverError::Config("no access/secret key pair provided".into()));
        }
        if let Some(inv) = &self.invalidation {
            if inv.admin_access_key.is_empty()
                || inv.admin_secret_key.is_empty()
                || inv.refresh_url.is_empty()
            {
                return Err(DriverError::Config(
                    "invalidation requires admin_access_key, admin_secret_key, \
                     tenant_id and refresh_url together"
                        .into(),
                ));
            }
        }

        if !self.base_url.ends_with('/') {
            self.base_url.push('/');
        }
        self.root_directory = self.root_directory.trim_end_matches('/').to_string();

        Ok(self)
    }
}

/// Load and validate a [`DriverConfig`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<DriverConfig> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: DriverConfig = serde_yaml::from_str(&contents)?;
    Ok(config.validate()?)
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
bucket: registry
base_url: https://cdn.example.com
access_key: ak
secret_key: sk
"#
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config: DriverConfig = serde_yaml::from_str(minimal_yaml()).unwrap();
        let config = config.validate().unwrap();
        assert_eq!(config.zone, "z0");
        assert_eq!(config.base_url, "https://cdn.example.com/");
        assert!(config.root_directory.is_empty());
        assert!(config.invalidation.is_none());
        assert!(config.redirect.is_empty());
    }

    #[test]
    fn missing_bucket_is_rejected() {
        let config: DriverConfig = serde_yaml::from_str(
            r#"
bucket: ""
base_url: https://cdn.example.com
access_key: ak
secret_key: sk
"#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("bucket"));
    }

    #[test]
    fn root_directory_trailing_slash_is_trimmed() {
        let mut config: DriverConfig = serde_yaml::from_str(minimal_yaml()).unwrap();
        config.root_directory = "registry/v2/".into();
        let config = config.validate().unwrap();
        assert_eq!(config.root_directory, "registry/v2");
    }

    #[test]
    fn invalidation_group_is_all_or_nothing() {
        let config: DriverConfig = serde_yaml::from_str(
            r#"
bucket: registry
base_url: https://cdn.example.com
access_key: ak
secret_key: sk
invalidation:
  admin_access_key: admin
  admin_secret_key: ""
  tenant_id: 42
  refresh_url: https://refresh.example.com
"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn full_invalidation_group_is_accepted() {
        let config: DriverConfig = serde_yaml::from_str(
            r#"
bucket: registry
base_url: https://cdn.example.com
access_key: ak
secret_key: sk
invalidation:
  admin_access_key: admin
  admin_secret_key: shhh
  tenant_id: 42
  refresh_url: https://refresh.example.com
redirect:
  internal.example.com: https://edge.example.com/
"#,
        )
        .unwrap();
        let config = config.validate().unwrap();
        let inv = config.invalidation.unwrap();
        assert_eq!(inv.tenant_id, 42);
        assert_eq!(config.redirect.len(), 1);
    }
}
