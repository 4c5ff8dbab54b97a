//! Content-addressable storage for fetched objects.
//!
//! # Layout
//!
//! ```text
//! content/
//! ├── blobs/sha256/<hex>          (object bytes, verified on write and read)
//! ├── labels/sha256/<hex>.json    (label set, updatable without touching bytes)
//! ├── ingest/                     (in-flight writes, renamed into blobs/)
//! └── leases/<id>.json            (persisted leases)
//! ```

pub mod digest;
pub mod lease;
pub mod registrar;
pub mod store;

use std::collections::BTreeMap;

pub use digest::Digest;
pub use lease::{Lease, LeaseManager};
pub use registrar::{ContentRegistrar, Ensured};
pub use store::{ContentInfo, ContentStore};

/// Label set attached to a content object or snapshot.
pub type Labels = BTreeMap<String, String>;
