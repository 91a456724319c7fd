//! Cache primitives shared by the session and bridge layers

pub mod metrics;
pub mod ttl;

pub use metrics::{BucketStats, CacheMetrics, BRIDGE_BUCKET, SESSIONS_BUCKET};
pub use ttl::{CacheEntry, TtlCache};
