//! Page viewer cache library
//!
//! Decoded-resource cache with session tagging and explicit handle release,
//! plus time-bounded request deduplication.

pub mod config;
pub mod dedup;
pub mod ram;
pub mod resource;
pub mod session;

pub use config::{CacheConfig, CacheConfigError, DedupConfig};
pub use dedup::{DedupPolicy, DedupStats, Deduplicator};
pub use ram::{CacheEntry, ResourceCache, ResourceCacheStats};
pub use resource::{DecodedBuffer, OwnedResource, ResourceHandle};
pub use session::SessionId;
