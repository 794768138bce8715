//! Storage driver for the Nimbus object store.
//!
//! The crate maps a uniform blob-storage contract (content get/put,
//! streamed reads, resumable write sessions, stat, hierarchical listing,
//! move, recursive delete, signed download URLs) onto Nimbus's segmented
//! key-value API: multipart assembly from copy and direct segments,
//! marker-paginated listing, and asynchronous CDN cache invalidation
//! after every mutation.
//!
//! [`NimbusDriver`] is the entry point; build one from a [`DriverConfig`]
//! loaded via [`config::load_config`] or constructed in code.

pub mod config;
pub mod driver;
pub mod errors;
pub mod invalidator;
pub mod lister;
pub mod metrics;
pub mod remote;
pub mod writer;

pub use config::{load_config, DriverConfig, InvalidationConfig};
pub use driver::{FileInfo, NimbusDriver, UrlOptions};
pub use errors::DriverError;
pub use writer::BlobWriter;
