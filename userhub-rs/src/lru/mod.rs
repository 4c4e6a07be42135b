//! Provides a size constrained LRU cache with per entry expiration.
//!
//! The [LRUCache] is the plain data structure: a linked hash map which keeps its keys in the
//! order of their last use, evicts from the front once **capacity** is exceeded and treats
//! entries as stale once they outlived their TTL. It is neither thread safe nor aware of time,
//! which makes it easy to reason about and to test.
//!
//! The [Cache] wraps an [LRUCache] in a mutex, asks the injected [Clock](crate::clock::Clock)
//! for the current time and keeps some metrics. This is what the
//! [UserService](crate::service::UserService) uses to keep user records around. All operations
//! hold the lock only for the duration of a few map operations and never perform any I/O.
//!
//! Note that stale entries are dropped lazily when they are read and eagerly by a periodic
//! sweep (see [maintenance](crate::maintenance)). Inserting into a full cache always evicts
//! the least recently used entry, even if some other entry might already be stale.
pub mod cache;
mod lru_cache;

pub use cache::{Cache, CacheStats, CacheStatus, SweepReport};
pub use lru_cache::LRUCache;
