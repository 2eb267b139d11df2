//! The disk cache engine.
//!
//! A [`DiskCache`] owns one backing directory with one regular file per
//! key and an in-memory metadata index over it. A single mutex guards
//! the index and configuration; two condition variables latch one-way
//! from false to true as the instance bootstraps:
//!
//! - `disk_writable`: the backing directory exists (or creation failed,
//!   which still latches so writers cannot deadlock).
//! - `disk_state_known`: the startup scan has reconciled the directory
//!   with the index.
//!
//! Writers wait on the first latch, operations that need the complete
//! index (enumeration, TTL reads) wait on the second. User-supplied
//! callbacks and codecs always run with the mutex released; the code
//! re-acquires and re-checks afterwards.
//!
//! Every operation has a synchronous form and a callback-taking `_async`
//! twin that schedules onto the injected operation queue. Asynchronous
//! trims coalesce through reserved identifiers so a burst of submissions
//! yields a single eviction pass.

use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, SystemTime};
use std::{fs, io, thread};

use diskstash_opqueue::{OperationQueue, Priority};
use parking_lot::{Condvar, Mutex, MutexGuard};
use tempfile::NamedTempFile;

use crate::builder::CacheBuilder;
use crate::codec::{Deserializer, KeyDecoder, KeyEncoder, Serializer};
use crate::error::CacheError;
use crate::index::Index;
use crate::trash::Trash;

/// Callback observing a single-key mutation. Invoked without the cache
/// mutex held.
pub type KeyCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Callback observing a whole-cache mutation. Invoked without the cache
/// mutex held.
pub type CacheCallback = Arc<dyn Fn() + Send + Sync>;

/// The six lifecycle observation slots.
#[derive(Default)]
pub(crate) struct LifecycleCallbacks {
    pub(crate) will_add: Option<KeyCallback>,
    pub(crate) did_add: Option<KeyCallback>,
    pub(crate) will_remove: Option<KeyCallback>,
    pub(crate) did_remove: Option<KeyCallback>,
    pub(crate) will_remove_all: Option<CacheCallback>,
    pub(crate) did_remove_all: Option<CacheCallback>,
}

/// Coalescing payload of an asynchronous trim submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrimCommand {
    /// Target byte count for size-driven trims.
    Size(u64),
    /// Cut-off date for date-driven trims.
    Date(SystemTime),
}

impl TrimCommand {
    /// Merge two pending targets: the larger size or the later date
    /// wins.
    pub fn merge(first: TrimCommand, second: TrimCommand) -> TrimCommand {
        match (first, second) {
            (TrimCommand::Size(a), TrimCommand::Size(b)) => TrimCommand::Size(a.max(b)),
            (TrimCommand::Date(a), TrimCommand::Date(b)) => TrimCommand::Date(a.max(b)),
            (first, _) => first,
        }
    }
}

const TRIM_TO_SIZE_IDENTIFIER: &str = "trim_to_size";
const TRIM_TO_DATE_IDENTIFIER: &str = "trim_to_date";
const TRIM_TO_SIZE_BY_DATE_IDENTIFIER: &str = "trim_to_size_by_date";

struct State {
    index: Index,
    disk_writable: bool,
    disk_state_known: bool,
    byte_limit: u64,
    age_limit: Duration,
    ttl_cache: bool,
    file_mode: Option<u32>,
    callbacks: LifecycleCallbacks,
}

pub(crate) struct Inner<T> {
    name: String,
    prefix: String,
    cache_dir: PathBuf,
    serializer: Serializer<T>,
    deserializer: Deserializer<T>,
    key_encoder: KeyEncoder,
    key_decoder: KeyDecoder,
    queue: Arc<OperationQueue<TrimCommand>>,
    trash: Arc<Trash>,
    state: Mutex<State>,
    disk_writable: Condvar,
    disk_state_known: Condvar,
    janitor: Arc<Janitor>,
}

impl<T> Inner<T> {
    fn path_for_key(&self, key: &str) -> PathBuf {
        self.cache_dir.join((self.key_encoder)(key))
    }

    /// Acquire the mutex, waiting until the backing directory exists.
    fn lock_for_writing(&self) -> MutexGuard<'_, State> {
        let mut state = self.state.lock();
        while !state.disk_writable {
            self.disk_writable.wait(&mut state);
        }
        state
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        self.janitor.stop();
    }
}

/// Persistent on-disk object cache.
///
/// Cheap to clone; clones share the same backing directory, index and
/// configuration. The payload type defaults to raw bytes; other types
/// plug in through [`CacheBuilder::with_codec`].
pub struct DiskCache<T = Vec<u8>> {
    pub(crate) inner: Arc<Inner<T>>,
}

impl<T> Clone for DiskCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl DiskCache<Vec<u8>> {
    /// The lazily-initialized process-wide instance.
    pub fn shared() -> &'static DiskCache<Vec<u8>> {
        static SHARED: OnceLock<DiskCache<Vec<u8>>> = OnceLock::new();
        SHARED.get_or_init(|| CacheBuilder::new("shared").build())
    }
}

/// The operation queue caches fall back to when none is injected.
pub(crate) fn shared_queue() -> Arc<OperationQueue<TrimCommand>> {
    static QUEUE: OnceLock<Arc<OperationQueue<TrimCommand>>> = OnceLock::new();
    Arc::clone(QUEUE.get_or_init(|| Arc::new(OperationQueue::with_default_concurrency())))
}

impl<T: Send + 'static> DiskCache<T> {
    pub(crate) fn from_builder(builder: CacheBuilder<T>) -> Self {
        assert!(!builder.name.is_empty(), "cache name must not be empty");

        let cache_dir: PathBuf = builder
            .root
            .join(format!("{}.{}", builder.prefix, builder.name));
        let inner: Arc<Inner<T>> = Arc::new(Inner {
            name: builder.name,
            prefix: builder.prefix,
            cache_dir,
            serializer: builder.serializer,
            deserializer: builder.deserializer,
            key_encoder: builder.key_encoder,
            key_decoder: builder.key_decoder,
            queue: builder.queue.unwrap_or_else(shared_queue),
            trash: builder
                .trash
                .unwrap_or_else(|| Arc::clone(Trash::global())),
            state: Mutex::new(State {
                index: Index::new(),
                disk_writable: false,
                disk_state_known: false,
                byte_limit: builder.byte_limit,
                age_limit: builder.age_limit,
                ttl_cache: builder.ttl_cache,
                file_mode: builder.file_mode,
                callbacks: builder.callbacks,
            }),
            disk_writable: Condvar::new(),
            disk_state_known: Condvar::new(),
            janitor: Arc::new(Janitor::new()),
        });
        let cache = DiskCache { inner };

        // Bootstrap runs on its own thread, never on the operation
        // queue: queued operations may wait on the latches this thread
        // is about to set.
        let boot: DiskCache<T> = cache.clone();
        thread::Builder::new()
            .name(format!("diskstash-bootstrap-{}", cache.inner.name))
            .spawn(move || boot.bootstrap())
            .expect("Failed to spawn bootstrap thread");

        let weak: Weak<Inner<T>> = Arc::downgrade(&cache.inner);
        let janitor: Arc<Janitor> = Arc::clone(&cache.inner.janitor);
        thread::Builder::new()
            .name(format!("diskstash-janitor-{}", cache.inner.name))
            .spawn(move || janitor_loop(weak, janitor))
            .expect("Failed to spawn janitor thread");

        cache
    }

    // ------------------------------------------------------------------
    // Accessors and configuration
    // ------------------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn prefix(&self) -> &str {
        &self.inner.prefix
    }

    /// Absolute path of the backing directory.
    pub fn cache_path(&self) -> &Path {
        &self.inner.cache_dir
    }

    /// Sum of all indexed entry sizes in bytes.
    pub fn byte_count(&self) -> u64 {
        self.inner.state.lock().index.byte_count()
    }

    /// Total byte budget; 0 means unlimited.
    pub fn byte_limit(&self) -> u64 {
        self.inner.state.lock().byte_limit
    }

    /// Change the byte budget. A non-zero limit schedules an immediate
    /// high-priority date-ordered trim to the new budget.
    pub fn set_byte_limit(&self, limit: u64) {
        {
            self.inner.state.lock().byte_limit = limit;
        }
        if limit > 0 {
            self.schedule_trim_to_size_by_date(limit, Priority::High, None);
        }
    }

    /// Per-entry age budget; zero means no TTL.
    pub fn age_limit(&self) -> Duration {
        self.inner.state.lock().age_limit
    }

    /// Change the age budget and arm the recurring age sweep. One sweep
    /// is also scheduled immediately.
    pub fn set_age_limit(&self, age_limit: Duration) {
        {
            self.inner.state.lock().age_limit = age_limit;
        }
        self.inner.janitor.rearm(age_limit);
        let this: DiskCache<T> = self.clone();
        self.inner
            .queue
            .schedule(Priority::Low, move || this.trim_to_age_limit());
    }

    /// Whether reads honor the age limit (expired entries miss) and
    /// skip refreshing modification dates.
    pub fn is_ttl_cache(&self) -> bool {
        self.inner.state.lock().ttl_cache
    }

    pub fn set_ttl_cache(&self, ttl_cache: bool) {
        self.inner.state.lock().ttl_cache = ttl_cache;
    }

    /// Enqueued form of [`DiskCache::set_byte_limit`].
    pub fn set_byte_limit_async(&self, limit: u64) {
        let this: DiskCache<T> = self.clone();
        self.inner
            .queue
            .schedule(Priority::High, move || this.set_byte_limit(limit));
    }

    /// Enqueued form of [`DiskCache::set_age_limit`].
    pub fn set_age_limit_async(&self, age_limit: Duration) {
        let this: DiskCache<T> = self.clone();
        self.inner
            .queue
            .schedule(Priority::High, move || this.set_age_limit(age_limit));
    }

    /// Enqueued form of [`DiskCache::set_ttl_cache`].
    pub fn set_ttl_cache_async(&self, ttl_cache: bool) {
        let this: DiskCache<T> = self.clone();
        self.inner
            .queue
            .schedule(Priority::High, move || this.set_ttl_cache(ttl_cache));
    }

    /// Unix permission bits applied to written cache files (masked to
    /// `0o7777`); ignored on other platforms.
    pub fn set_file_mode(&self, mode: Option<u32>) {
        self.inner.state.lock().file_mode = mode;
    }

    // ------------------------------------------------------------------
    // Lifecycle callbacks (slot writes are enqueued at high priority)
    // ------------------------------------------------------------------

    pub fn set_will_add(&self, callback: Option<KeyCallback>) {
        let inner: Arc<Inner<T>> = Arc::clone(&self.inner);
        self.inner.queue.schedule(Priority::High, move || {
            inner.state.lock().callbacks.will_add = callback;
        });
    }

    pub fn set_did_add(&self, callback: Option<KeyCallback>) {
        let inner: Arc<Inner<T>> = Arc::clone(&self.inner);
        self.inner.queue.schedule(Priority::High, move || {
            inner.state.lock().callbacks.did_add = callback;
        });
    }

    pub fn set_will_remove(&self, callback: Option<KeyCallback>) {
        let inner: Arc<Inner<T>> = Arc::clone(&self.inner);
        self.inner.queue.schedule(Priority::High, move || {
            inner.state.lock().callbacks.will_remove = callback;
        });
    }

    pub fn set_did_remove(&self, callback: Option<KeyCallback>) {
        let inner: Arc<Inner<T>> = Arc::clone(&self.inner);
        self.inner.queue.schedule(Priority::High, move || {
            inner.state.lock().callbacks.did_remove = callback;
        });
    }

    pub fn set_will_remove_all(&self, callback: Option<CacheCallback>) {
        let inner: Arc<Inner<T>> = Arc::clone(&self.inner);
        self.inner.queue.schedule(Priority::High, move || {
            inner.state.lock().callbacks.will_remove_all = callback;
        });
    }

    pub fn set_did_remove_all(&self, callback: Option<CacheCallback>) {
        let inner: Arc<Inner<T>> = Arc::clone(&self.inner);
        self.inner.queue.schedule(Priority::High, move || {
            inner.state.lock().callbacks.did_remove_all = callback;
        });
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Whether a file for `key` exists.
    ///
    /// Once the startup scan has completed, absent index entries answer
    /// negatively without touching the filesystem.
    pub fn contains(&self, key: &str) -> bool {
        self.locate(key, false).is_some()
    }

    /// Path of the file backing `key`, if it exists.
    ///
    /// Refreshes the file's modification date asynchronously unless
    /// this is a TTL cache.
    pub fn file_path(&self, key: &str) -> Option<PathBuf> {
        self.locate(key, true)
    }

    /// Fetch and decode the payload stored for `key`.
    ///
    /// On a TTL cache this waits for the startup scan (the entry date
    /// must be authoritative) and treats entries older than the age
    /// limit as misses without deleting them. On a non-TTL cache a hit
    /// refreshes the file's modification date asynchronously.
    ///
    /// # Errors
    /// Returns [`CacheError::Deserialize`] when the payload codec
    /// rejects the stored bytes; the offending file is deleted first.
    pub fn get(&self, key: &str) -> Result<Option<T>, CacheError> {
        if key.is_empty() {
            return Ok(None);
        }
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if state.disk_state_known && !state.index.contains(key) {
            return Ok(None);
        }
        if state.ttl_cache {
            while !state.disk_state_known {
                inner.disk_state_known.wait(&mut state);
            }
        }

        let ttl_cache: bool = state.ttl_cache;
        let age_limit: Duration = state.age_limit;
        if ttl_cache && !age_limit.is_zero() {
            let fresh: bool = match state.index.get(key) {
                Some(entry) => SystemTime::now()
                    .duration_since(entry.modified)
                    .map_or(true, |age| age < age_limit),
                None => false,
            };
            if !fresh {
                return Ok(None);
            }
        }

        let path: PathBuf = inner.path_for_key(key);
        let bytes: Vec<u8> = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                tracing::error!("Failed to read {}: {}", path.display(), e);
                return Err(e.into());
            }
        };
        drop(state);

        // The codec may be slow or panicky third-party code; it never
        // runs under the mutex.
        let decoded: Result<T, CacheError> = (inner.deserializer)(&bytes, key);

        let state = inner.state.lock();
        match decoded {
            Ok(value) => {
                drop(state);
                if !ttl_cache {
                    self.schedule_touch(key);
                }
                Ok(Some(value))
            }
            Err(fault) => {
                // The stored bytes are garbage; doom the file. The index
                // entry stays until the next bootstrap reconciles it.
                if let Err(e) = fs::remove_file(&path) {
                    tracing::warn!("Failed to delete undecodable {}: {}", path.display(), e);
                }
                drop(state);
                Err(fault)
            }
        }
    }

    /// Visit every entry as `(key, file path)`.
    ///
    /// Waits for the startup scan. On a TTL cache, expired entries are
    /// skipped. The visitor runs without the cache mutex held and may
    /// return [`ControlFlow::Break`] to stop early.
    pub fn enumerate<F>(&self, mut f: F)
    where
        F: FnMut(&str, &Path) -> ControlFlow<()>,
    {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        while !state.disk_state_known {
            inner.disk_state_known.wait(&mut state);
        }

        let ttl_cache: bool = state.ttl_cache;
        let age_limit: Duration = state.age_limit;
        let now: SystemTime = SystemTime::now();
        let mut items: Vec<(String, PathBuf)> = Vec::with_capacity(state.index.len());
        for (key, entry) in state.index.iter() {
            if ttl_cache && !age_limit.is_zero() {
                let expired: bool = now
                    .duration_since(entry.modified)
                    .map_or(false, |age| age >= age_limit);
                if expired {
                    continue;
                }
            }
            items.push((key.clone(), inner.path_for_key(key)));
        }
        drop(state);

        for (key, path) in items {
            if f(&key, &path).is_break() {
                break;
            }
        }
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Encode and store a payload for `key`.
    ///
    /// The write goes through a temp file plus rename. A payload larger
    /// than a non-zero byte limit is skipped without error: it would be
    /// evicted by the very trim it triggers. Exceeding the limit with a
    /// payload that fits schedules an asynchronous date-ordered trim.
    ///
    /// # Errors
    /// Serializer rejections and filesystem failures; in both cases no
    /// index entry is recorded.
    pub fn set(&self, key: &str, value: &T) -> Result<(), CacheError> {
        if key.is_empty() {
            return Ok(());
        }
        let bytes: Vec<u8> = (self.inner.serializer)(value, key)?;
        self.set_bytes(key, bytes)
    }

    fn set_bytes(&self, key: &str, bytes: Vec<u8>) -> Result<(), CacheError> {
        let inner = &self.inner;
        let limit: u64 = inner.state.lock().byte_limit;
        if limit > 0 && bytes.len() as u64 > limit {
            tracing::debug!(
                "Payload for key {} ({} bytes) exceeds the byte limit; not writing",
                key,
                bytes.len()
            );
            return Ok(());
        }

        let mut state = inner.lock_for_writing();
        if let Some(callback) = state.callbacks.will_add.clone() {
            drop(state);
            callback(key);
            state = inner.lock_for_writing();
        }

        let path: PathBuf = inner.path_for_key(key);
        let mode: Option<u32> = state.file_mode;
        if let Err(e) = write_atomic(&inner.cache_dir, &path, &bytes, mode) {
            tracing::error!("Failed to write {}: {}", path.display(), e);
            return Err(e);
        }

        match fs::metadata(&path) {
            Ok(metadata) => {
                let modified: SystemTime =
                    metadata.modified().unwrap_or_else(|_| SystemTime::now());
                state
                    .index
                    .insert_or_replace(key.to_string(), modified, metadata.len());
            }
            Err(e) => {
                tracing::error!("Failed to stat fresh {}: {}", path.display(), e);
            }
        }

        let byte_limit: u64 = state.byte_limit;
        if byte_limit > 0 && state.index.byte_count() > byte_limit {
            self.schedule_trim_to_size_by_date(byte_limit, Priority::Low, None);
        }

        if let Some(callback) = state.callbacks.did_add.clone() {
            drop(state);
            callback(key);
        }
        Ok(())
    }

    /// Remove the entry for `key` through the trash.
    ///
    /// Returns false when no file exists or the trash rename fails (the
    /// index is then left untouched).
    pub fn remove(&self, key: &str) -> bool {
        if key.is_empty() {
            return false;
        }
        let inner = &self.inner;
        let mut state = inner.lock_for_writing();
        let path: PathBuf = inner.path_for_key(key);
        if !path.is_file() {
            return false;
        }

        if let Some(callback) = state.callbacks.will_remove.clone() {
            drop(state);
            callback(key);
            state = inner.lock_for_writing();
        }

        if !inner.trash.move_to_trash(&path) {
            return false;
        }
        inner.trash.empty();
        state.index.remove(key);

        if let Some(callback) = state.callbacks.did_remove.clone() {
            drop(state);
            callback(key);
        }
        true
    }

    /// Remove every entry by trashing the whole backing directory and
    /// recreating it empty.
    pub fn remove_all(&self) {
        let inner = &self.inner;
        let mut state = inner.lock_for_writing();
        if let Some(callback) = state.callbacks.will_remove_all.clone() {
            drop(state);
            callback();
            state = inner.lock_for_writing();
        }

        if inner.cache_dir.exists() {
            if !inner.trash.move_to_trash(&inner.cache_dir) {
                tracing::error!(
                    "Failed to trash cache directory {}",
                    inner.cache_dir.display()
                );
                return;
            }
            inner.trash.empty();
        }
        if let Err(e) = fs::create_dir_all(&inner.cache_dir) {
            tracing::error!(
                "Failed to recreate cache directory {}: {}",
                inner.cache_dir.display(),
                e
            );
        }
        state.index.clear();

        if let Some(callback) = state.callbacks.did_remove_all.clone() {
            drop(state);
            callback();
        }
    }

    // ------------------------------------------------------------------
    // Trims
    // ------------------------------------------------------------------

    /// Evict largest-first until the byte count is at most `limit`.
    /// A zero limit removes everything.
    pub fn trim_to_size(&self, limit: u64) {
        if limit == 0 {
            self.remove_all();
            return;
        }
        let keys: Vec<String> = {
            let state = self.inner.state.lock();
            if state.index.byte_count() <= limit {
                return;
            }
            state.index.keys_by_size_desc()
        };
        for key in keys {
            // The mutex is held only across index reads; removal
            // re-locks internally, so concurrent writes can move the
            // target mid-sweep and the re-check stays correct.
            {
                let state = self.inner.state.lock();
                if state.index.byte_count() <= limit {
                    break;
                }
            }
            self.remove(&key);
        }
    }

    /// Evict oldest-first until the byte count is at most `limit`.
    /// A zero limit removes everything.
    pub fn trim_to_size_by_date(&self, limit: u64) {
        if limit == 0 {
            self.remove_all();
            return;
        }
        let keys: Vec<String> = {
            let state = self.inner.state.lock();
            if state.index.byte_count() <= limit {
                return;
            }
            state.index.keys_by_date_asc()
        };
        for key in keys {
            {
                let state = self.inner.state.lock();
                if state.index.byte_count() <= limit {
                    break;
                }
            }
            self.remove(&key);
        }
    }

    /// Evict every entry modified before `date`, oldest first, stopping
    /// at the first entry at or past the cut-off. The distant-past
    /// sentinel [`SystemTime::UNIX_EPOCH`] removes everything.
    pub fn trim_to_date(&self, date: SystemTime) {
        if date == SystemTime::UNIX_EPOCH {
            self.remove_all();
            return;
        }
        let keys: Vec<String> = self.inner.state.lock().index.keys_by_date_asc();
        for key in keys {
            let expired: bool = {
                let state = self.inner.state.lock();
                match state.index.get(&key) {
                    Some(entry) => entry.modified < date,
                    // Removed by a concurrent writer mid-sweep.
                    None => continue,
                }
            };
            if !expired {
                break;
            }
            self.remove(&key);
        }
    }

    /// One age-limit sweep; a no-op while the age limit is zero.
    fn trim_to_age_limit(&self) {
        let age_limit: Duration = self.inner.state.lock().age_limit;
        if age_limit.is_zero() {
            return;
        }
        let Some(cutoff) = SystemTime::now().checked_sub(age_limit) else {
            return;
        };
        if cutoff <= SystemTime::UNIX_EPOCH {
            return;
        }
        self.trim_to_date(cutoff);
    }

    // ------------------------------------------------------------------
    // Asynchronous variants
    // ------------------------------------------------------------------

    pub fn contains_async(&self, key: &str, completion: impl FnOnce(bool) + Send + 'static) {
        let this: DiskCache<T> = self.clone();
        let key: String = key.to_string();
        self.inner
            .queue
            .schedule(Priority::Default, move || completion(this.contains(&key)));
    }

    pub fn file_path_async(
        &self,
        key: &str,
        completion: impl FnOnce(Option<PathBuf>) + Send + 'static,
    ) {
        let this: DiskCache<T> = self.clone();
        let key: String = key.to_string();
        self.inner
            .queue
            .schedule(Priority::Default, move || completion(this.file_path(&key)));
    }

    pub fn get_async(
        &self,
        key: &str,
        completion: impl FnOnce(Result<Option<T>, CacheError>) + Send + 'static,
    ) {
        let this: DiskCache<T> = self.clone();
        let key: String = key.to_string();
        self.inner
            .queue
            .schedule(Priority::Default, move || completion(this.get(&key)));
    }

    pub fn set_async(
        &self,
        key: &str,
        value: T,
        completion: impl FnOnce(Result<(), CacheError>) + Send + 'static,
    ) {
        let this: DiskCache<T> = self.clone();
        let key: String = key.to_string();
        self.inner.queue.schedule(Priority::Default, move || {
            completion(this.set(&key, &value));
        });
    }

    pub fn remove_async(&self, key: &str, completion: impl FnOnce(bool) + Send + 'static) {
        let this: DiskCache<T> = self.clone();
        let key: String = key.to_string();
        self.inner
            .queue
            .schedule(Priority::Default, move || completion(this.remove(&key)));
    }

    pub fn remove_all_async(&self, completion: impl FnOnce() + Send + 'static) {
        let this: DiskCache<T> = self.clone();
        self.inner.queue.schedule(Priority::Default, move || {
            this.remove_all();
            completion();
        });
    }

    pub fn enumerate_async<F>(&self, f: F, completion: impl FnOnce() + Send + 'static)
    where
        F: FnMut(&str, &Path) -> ControlFlow<()> + Send + 'static,
    {
        let this: DiskCache<T> = self.clone();
        self.inner.queue.schedule(Priority::Default, move || {
            this.enumerate(f);
            completion();
        });
    }

    /// Coalescing form of [`DiskCache::trim_to_size`]. Pending
    /// submissions sharing the identifier merge to the larger target;
    /// every completion fires when the merged pass finishes.
    pub fn trim_to_size_async(&self, limit: u64, completion: impl FnOnce() + Send + 'static) {
        let this: DiskCache<T> = self.clone();
        self.inner.queue.schedule_coalescing(
            Priority::Low,
            TRIM_TO_SIZE_IDENTIFIER,
            TrimCommand::Size(limit),
            TrimCommand::merge,
            move |command| {
                if let TrimCommand::Size(limit) = command {
                    this.trim_to_size(limit);
                }
            },
            Some(Box::new(completion)),
        );
    }

    /// Coalescing form of [`DiskCache::trim_to_size_by_date`].
    pub fn trim_to_size_by_date_async(
        &self,
        limit: u64,
        completion: impl FnOnce() + Send + 'static,
    ) {
        self.schedule_trim_to_size_by_date(limit, Priority::Low, Some(Box::new(completion)));
    }

    /// Coalescing form of [`DiskCache::trim_to_date`]; pending
    /// submissions merge to the later cut-off.
    pub fn trim_to_date_async(
        &self,
        date: SystemTime,
        completion: impl FnOnce() + Send + 'static,
    ) {
        let this: DiskCache<T> = self.clone();
        self.inner.queue.schedule_coalescing(
            Priority::Low,
            TRIM_TO_DATE_IDENTIFIER,
            TrimCommand::Date(date),
            TrimCommand::merge,
            move |command| {
                if let TrimCommand::Date(date) = command {
                    this.trim_to_date(date);
                }
            },
            Some(Box::new(completion)),
        );
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn locate(&self, key: &str, refresh: bool) -> Option<PathBuf> {
        if key.is_empty() {
            return None;
        }
        let inner = &self.inner;
        let state = inner.state.lock();
        if state.disk_state_known && !state.index.contains(key) {
            return None;
        }
        let path: PathBuf = inner.path_for_key(key);
        if !path.is_file() {
            return None;
        }
        let refresh_wanted: bool = refresh && !state.ttl_cache;
        drop(state);
        if refresh_wanted {
            self.schedule_touch(key);
        }
        Some(path)
    }

    fn schedule_touch(&self, key: &str) {
        let this: DiskCache<T> = self.clone();
        let key: String = key.to_string();
        self.inner.queue.schedule(Priority::Low, move || {
            if let Err(e) = this.touch_file(&key) {
                tracing::debug!("Failed to refresh modification date for {}: {}", key, e);
            }
        });
    }

    fn touch_file(&self, key: &str) -> Result<(), CacheError> {
        let inner = &self.inner;
        let mut state = inner.lock_for_writing();
        let path: PathBuf = inner.path_for_key(key);
        let now: SystemTime = SystemTime::now();
        let file: fs::File = fs::OpenOptions::new().append(true).open(&path)?;
        file.set_modified(now)?;
        state.index.touch(key, now);
        Ok(())
    }

    fn schedule_trim_to_size_by_date(
        &self,
        limit: u64,
        priority: Priority,
        completion: Option<Box<dyn FnOnce() + Send>>,
    ) {
        let this: DiskCache<T> = self.clone();
        self.inner.queue.schedule_coalescing(
            priority,
            TRIM_TO_SIZE_BY_DATE_IDENTIFIER,
            TrimCommand::Size(limit),
            TrimCommand::merge,
            move |command| {
                if let TrimCommand::Size(limit) = command {
                    this.trim_to_size_by_date(limit);
                }
            },
            completion,
        );
    }

    fn bootstrap(&self) {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock();
            if let Err(e) = fs::create_dir_all(&inner.cache_dir) {
                // Latch anyway so writers fail fast instead of
                // deadlocking on a directory that will never appear.
                tracing::error!(
                    "Failed to create cache directory {}: {}",
                    inner.cache_dir.display(),
                    e
                );
            }
            state.disk_writable = true;
            inner.disk_writable.notify_all();
        }

        match fs::read_dir(&inner.cache_dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let file_name = entry.file_name();
                    let Some(name) = file_name.to_str() else {
                        continue;
                    };
                    if name.starts_with('.') {
                        continue;
                    }
                    let Ok(metadata) = entry.metadata() else {
                        continue;
                    };
                    if !metadata.is_file() {
                        continue;
                    }
                    let key: String = (inner.key_decoder)(name);
                    let modified: SystemTime =
                        metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                    // Locked per file so early readers interleave with
                    // the scan.
                    let mut state = inner.state.lock();
                    state.index.insert_or_replace(key, modified, metadata.len());
                }
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to scan cache directory {}: {}",
                    inner.cache_dir.display(),
                    e
                );
            }
        }

        let over_limit: Option<u64> = {
            let state = inner.state.lock();
            (state.byte_limit > 0 && state.index.byte_count() > state.byte_limit)
                .then_some(state.byte_limit)
        };
        if let Some(limit) = over_limit {
            self.schedule_trim_to_size_by_date(limit, Priority::Low, None);
        }

        let mut state = inner.state.lock();
        state.disk_state_known = true;
        inner.disk_state_known.notify_all();
        tracing::debug!(
            "Cache {} restored {} entries ({} bytes)",
            inner.name,
            state.index.len(),
            state.index.byte_count()
        );
    }
}

fn write_atomic(
    dir: &Path,
    path: &Path,
    bytes: &[u8],
    mode: Option<u32>,
) -> Result<(), CacheError> {
    use std::io::Write;

    let mut tmp: NamedTempFile = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(mode & 0o7777))?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    tmp.persist(path).map(|_| ()).map_err(|e| CacheError::Persist {
        path: path.display().to_string(),
        source: e.error,
    })
}

// ----------------------------------------------------------------------
// TTL janitor
// ----------------------------------------------------------------------

/// Re-arming timer behind the recurring age-limit sweep.
///
/// One long-lived thread per cache sleeps for the configured interval
/// between sweeps; reconfiguring wakes it so the new interval takes
/// effect immediately, and it starts dormant until the first arming.
pub(crate) struct Janitor {
    state: Mutex<JanitorState>,
    changed: Condvar,
}

struct JanitorState {
    interval: Duration,
    shutdown: bool,
}

impl Janitor {
    fn new() -> Self {
        Self {
            state: Mutex::new(JanitorState {
                interval: Duration::ZERO,
                shutdown: false,
            }),
            changed: Condvar::new(),
        }
    }

    pub(crate) fn rearm(&self, interval: Duration) {
        let mut state = self.state.lock();
        state.interval = interval;
        self.changed.notify_all();
    }

    fn stop(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        self.changed.notify_all();
    }
}

fn janitor_loop<T: Send + 'static>(inner: Weak<Inner<T>>, janitor: Arc<Janitor>) {
    loop {
        {
            let mut state = janitor.state.lock();
            loop {
                if state.shutdown {
                    return;
                }
                let interval: Duration = state.interval;
                if interval.is_zero() {
                    janitor.changed.wait(&mut state);
                    continue;
                }
                if janitor.changed.wait_for(&mut state, interval).timed_out() {
                    break;
                }
                // Woken by a reconfigure; re-read the interval.
            }
            if state.shutdown {
                return;
            }
        }
        // Holding only a weak reference lets the cache drop while the
        // janitor sleeps; the sweep borrows it back briefly.
        match inner.upgrade() {
            Some(inner) => DiskCache { inner }.trim_to_age_limit(),
            None => return,
        }
    }
}
