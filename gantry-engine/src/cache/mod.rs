// Cache Module
// Persistent dependency cache keyed by environment version and lockfile hash

pub mod key;
pub mod store;

pub use key::{hash_bytes, hash_lockfile, CacheKey};
pub use store::{CacheEntry, CacheStore};
