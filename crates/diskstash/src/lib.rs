//! Persistent on-disk object cache.
//!
//! `diskstash` durably associates opaque binary payloads with string
//! keys in one directory per cache instance, bounded by a configurable
//! byte budget and an optional per-entry age limit, with concurrent
//! access from many threads.
//!
//! # Architecture
//!
//! ```text
//! Public API (sync + callback async)
//!     │
//!     ├── lock core: one mutex, two one-way latches
//!     │     (disk_writable, disk_state_known)
//!     ├── metadata index: key → {modification date, size}
//!     ├── eviction: by size, by date, by size-ordered-by-date, by TTL
//!     ├── trash: rename now, delete later on a serial thread
//!     └── operation queue: priorities + trim coalescing (injected)
//! ```
//!
//! At construction the backing directory is created and scanned on a
//! background thread; callers never block on construction, only on the
//! latches the bootstrap sets. Deletions rename into a process-wide
//! trash directory and the trash is emptied off the hot path.
//!
//! # Example
//!
//! ```no_run
//! use diskstash::CacheBuilder;
//!
//! let cache = CacheBuilder::new("thumbnails").build();
//! cache.set("sunset", &vec![0x01, 0x02])?;
//! assert_eq!(cache.get("sunset")?, Some(vec![0x01, 0x02]));
//! # Ok::<(), diskstash::CacheError>(())
//! ```

pub mod builder;
pub mod cache;
pub mod codec;
pub mod error;
pub mod index;
pub mod trash;

pub use builder::{CacheBuilder, DEFAULT_AGE_LIMIT, DEFAULT_BYTE_LIMIT};
pub use cache::{CacheCallback, DiskCache, KeyCallback, TrimCommand};
pub use codec::{Deserializer, KeyDecoder, KeyEncoder, Serializer};
pub use error::CacheError;
pub use index::Entry;
pub use trash::Trash;

// Re-export the queue types the builder accepts for injection.
pub use diskstash_opqueue::{OperationQueue, Priority};
