//! Construction surface for [`DiskCache`] instances.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use diskstash_opqueue::OperationQueue;

use crate::cache::{CacheCallback, DiskCache, KeyCallback, LifecycleCallbacks, TrimCommand};
use crate::codec::{
    default_deserializer, default_key_decoder, default_key_encoder, default_serializer,
    Deserializer, KeyDecoder, KeyEncoder, Serializer,
};
use crate::error::CacheError;
use crate::trash::Trash;

/// Default total byte budget: 50 MiB.
pub const DEFAULT_BYTE_LIMIT: u64 = 50 * 1024 * 1024;

/// Default per-entry age budget: 30 days.
pub const DEFAULT_AGE_LIMIT: Duration = Duration::from_secs(60 * 60 * 24 * 30);

/// Builder for a cache instance.
///
/// The instance is identified by `(prefix, name)`; its backing directory
/// is `<root>/<prefix>.<name>`. Every collaborator (codecs, operation
/// queue, trash service) can be injected; omitted ones fall back to the
/// defaults.
///
/// # Example
///
/// ```no_run
/// use diskstash::CacheBuilder;
///
/// let cache = CacheBuilder::new("thumbnails")
///     .with_byte_limit(10 * 1024 * 1024)
///     .build();
/// cache.set("a", &vec![1, 2, 3]).unwrap();
/// ```
pub struct CacheBuilder<T = Vec<u8>> {
    pub(crate) name: String,
    pub(crate) prefix: String,
    pub(crate) root: PathBuf,
    pub(crate) serializer: Serializer<T>,
    pub(crate) deserializer: Deserializer<T>,
    pub(crate) key_encoder: KeyEncoder,
    pub(crate) key_decoder: KeyDecoder,
    pub(crate) byte_limit: u64,
    pub(crate) age_limit: Duration,
    pub(crate) ttl_cache: bool,
    pub(crate) file_mode: Option<u32>,
    pub(crate) callbacks: LifecycleCallbacks,
    pub(crate) queue: Option<Arc<OperationQueue<TrimCommand>>>,
    pub(crate) trash: Option<Arc<Trash>>,
}

impl CacheBuilder<Vec<u8>> {
    /// Start a builder for a raw-byte cache with the default codecs.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_codec_slots(name, default_serializer(), default_deserializer())
    }
}

impl<T> CacheBuilder<T> {
    /// Start a builder for a typed cache with an explicit payload codec.
    ///
    /// # Arguments
    /// * `name` - Cache name (must not be empty)
    /// * `serializer` - Value-to-bytes conversion, parameterized by key
    /// * `deserializer` - Bytes-to-value conversion, parameterized by key
    pub fn with_codec(
        name: impl Into<String>,
        serializer: impl Fn(&T, &str) -> Result<Vec<u8>, CacheError> + Send + Sync + 'static,
        deserializer: impl Fn(&[u8], &str) -> Result<T, CacheError> + Send + Sync + 'static,
    ) -> Self {
        Self::with_codec_slots(name, Arc::new(serializer), Arc::new(deserializer))
    }

    fn with_codec_slots(
        name: impl Into<String>,
        serializer: Serializer<T>,
        deserializer: Deserializer<T>,
    ) -> Self {
        Self {
            name: name.into(),
            prefix: "diskstash".to_string(),
            root: std::env::temp_dir(),
            serializer,
            deserializer,
            key_encoder: default_key_encoder(),
            key_decoder: default_key_decoder(),
            byte_limit: DEFAULT_BYTE_LIMIT,
            age_limit: DEFAULT_AGE_LIMIT,
            ttl_cache: false,
            file_mode: None,
            callbacks: LifecycleCallbacks::default(),
            queue: None,
            trash: None,
        }
    }

    /// Directory-name prefix distinguishing cache families under one
    /// root.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Parent directory of the backing directory.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    /// Total byte budget; 0 disables size-driven eviction.
    pub fn with_byte_limit(mut self, byte_limit: u64) -> Self {
        self.byte_limit = byte_limit;
        self
    }

    /// Per-entry age budget; zero disables the TTL.
    pub fn with_age_limit(mut self, age_limit: Duration) -> Self {
        self.age_limit = age_limit;
        self
    }

    /// Make reads honor the age limit instead of refreshing dates.
    pub fn with_ttl_cache(mut self, ttl_cache: bool) -> Self {
        self.ttl_cache = ttl_cache;
        self
    }

    /// Unix permission bits for written cache files (masked to
    /// `0o7777`); ignored elsewhere.
    pub fn with_file_mode(mut self, mode: u32) -> Self {
        self.file_mode = Some(mode);
        self
    }

    /// Replace the filename escaping pair.
    pub fn with_key_codec(
        mut self,
        encoder: impl Fn(&str) -> String + Send + Sync + 'static,
        decoder: impl Fn(&str) -> String + Send + Sync + 'static,
    ) -> Self {
        self.key_encoder = Arc::new(encoder);
        self.key_decoder = Arc::new(decoder);
        self
    }

    /// Inject the operation queue used by asynchronous variants.
    pub fn with_operation_queue(mut self, queue: Arc<OperationQueue<TrimCommand>>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Inject the trash service used for deletions.
    pub fn with_trash(mut self, trash: Arc<Trash>) -> Self {
        self.trash = Some(trash);
        self
    }

    pub fn with_will_add(mut self, callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.callbacks.will_add = Some(Arc::new(callback) as KeyCallback);
        self
    }

    pub fn with_did_add(mut self, callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.callbacks.did_add = Some(Arc::new(callback) as KeyCallback);
        self
    }

    pub fn with_will_remove(mut self, callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.callbacks.will_remove = Some(Arc::new(callback) as KeyCallback);
        self
    }

    pub fn with_did_remove(mut self, callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.callbacks.did_remove = Some(Arc::new(callback) as KeyCallback);
        self
    }

    pub fn with_will_remove_all(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.callbacks.will_remove_all = Some(Arc::new(callback) as CacheCallback);
        self
    }

    pub fn with_did_remove_all(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.callbacks.did_remove_all = Some(Arc::new(callback) as CacheCallback);
        self
    }
}

impl<T: Send + 'static> CacheBuilder<T> {
    /// Construct the cache and start its bootstrap.
    ///
    /// The backing directory is created and scanned asynchronously;
    /// operations needing it block on the instance latches, never on
    /// this call.
    ///
    /// # Panics
    /// Panics when the name is empty.
    pub fn build(self) -> DiskCache<T> {
        DiskCache::from_builder(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let root = TempDir::new().unwrap();
        let cache: DiskCache = CacheBuilder::new("defaults").with_root(root.path()).build();
        assert_eq!(cache.byte_limit(), DEFAULT_BYTE_LIMIT);
        assert_eq!(cache.age_limit(), DEFAULT_AGE_LIMIT);
        assert!(!cache.is_ttl_cache());
        assert_eq!(cache.name(), "defaults");
        assert_eq!(cache.prefix(), "diskstash");
    }

    #[test]
    fn test_backing_directory_naming() {
        let root = TempDir::new().unwrap();
        let cache: DiskCache = CacheBuilder::new("thumbs")
            .with_prefix("myapp")
            .with_root(root.path())
            .build();
        assert_eq!(cache.cache_path(), root.path().join("myapp.thumbs"));
    }

    #[test]
    fn test_custom_key_codec_is_used() {
        let root = TempDir::new().unwrap();
        let cache: DiskCache = CacheBuilder::new("custom-keys")
            .with_root(root.path())
            .with_key_codec(
                |key| format!("k_{key}"),
                |name| name.strip_prefix("k_").unwrap_or(name).to_string(),
            )
            .build();

        cache.set("abc", &vec![1]).unwrap();
        assert!(cache.cache_path().join("k_abc").is_file());
    }

    #[test]
    fn test_typed_codec_round_trip() {
        let root = TempDir::new().unwrap();
        let cache: DiskCache<String> = CacheBuilder::with_codec(
            "typed",
            |value: &String, _key| Ok(value.as_bytes().to_vec()),
            |bytes, key| {
                String::from_utf8(bytes.to_vec()).map_err(|e| CacheError::Deserialize {
                    key: key.to_string(),
                    message: e.to_string(),
                })
            },
        )
        .with_root(root.path())
        .build();

        cache.set("greeting", &"hello".to_string()).unwrap();
        assert_eq!(cache.get("greeting").unwrap().as_deref(), Some("hello"));
    }
}
