//! Process-wide trash service for safe, off-hot-path deletion.
//!
//! Deleting a file (or an entire cache directory) is done in two steps:
//! a rename into a trash directory, which is cheap and effectively
//! atomic, followed by an asynchronous deletion of the trash on a serial
//! background thread. A crash between the two steps leaks only temp-dir
//! contents, never half-deleted cache state.
//!
//! Emptying detaches the current trash root before deleting it, so a
//! concurrent [`Trash::move_to_trash`] never renames into a tree that is
//! being torn down; it lazily creates a fresh root instead.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::{fs, thread};

use parking_lot::Mutex;
use uuid::Uuid;

type Job = Box<dyn FnOnce() + Send>;

/// Trash directory manager with a serial deletion thread.
///
/// One process-wide instance usually suffices ([`Trash::global`]);
/// separate instances with their own base directory exist for tests and
/// embedders that need isolation.
pub struct Trash {
    /// Parent directory under which trash roots are created.
    base: PathBuf,
    /// Current trash root; `None` until something is trashed, and reset
    /// to `None` again when an empty detaches it.
    root: Arc<Mutex<Option<PathBuf>>>,
    jobs: Mutex<Option<Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Trash {
    /// Create a trash service whose roots live under `base`.
    pub fn new_in(base: impl Into<PathBuf>) -> Self {
        let (jobs, queue) = channel::<Job>();
        let worker: JoinHandle<()> = thread::Builder::new()
            .name("diskstash-trash".to_string())
            .spawn(move || {
                for job in queue {
                    job();
                }
            })
            .expect("Failed to spawn trash thread");

        Self {
            base: base.into(),
            root: Arc::new(Mutex::new(None)),
            jobs: Mutex::new(Some(jobs)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// The shared process-wide trash under the system temp directory.
    pub fn global() -> &'static Arc<Trash> {
        static GLOBAL: OnceLock<Arc<Trash>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(Trash::new_in(std::env::temp_dir())))
    }

    /// Rename `path` into the trash under a fresh unique name.
    ///
    /// Lazily creates the trash root. Returns false if the root cannot
    /// be created or the rename fails; the source is left in place.
    pub fn move_to_trash(&self, path: &Path) -> bool {
        let mut root = self.root.lock();
        let root_dir: PathBuf = match root.as_ref() {
            Some(dir) => dir.clone(),
            None => {
                let dir: PathBuf = self.base.join(format!("diskstash-trash-{}", Uuid::new_v4()));
                if let Err(e) = fs::create_dir_all(&dir) {
                    tracing::error!("Failed to create trash root {}: {}", dir.display(), e);
                    return false;
                }
                *root = Some(dir.clone());
                dir
            }
        };

        let destination: PathBuf = root_dir.join(Uuid::new_v4().to_string());
        match fs::rename(path, &destination) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    "Failed to move {} to trash: {}",
                    path.display(),
                    e
                );
                false
            }
        }
    }

    /// Asynchronously delete the current trash contents.
    ///
    /// The root is detached under the trash lock first, so movers racing
    /// with the deletion start a new root instead of renaming into the
    /// doomed one. Deletion itself runs on the serial trash thread.
    pub fn empty(&self) {
        let root: Arc<Mutex<Option<PathBuf>>> = Arc::clone(&self.root);
        self.submit(move || {
            let detached: Option<PathBuf> = root.lock().take();
            if let Some(dir) = detached {
                if let Err(e) = fs::remove_dir_all(&dir) {
                    tracing::warn!("Failed to delete trash {}: {}", dir.display(), e);
                }
            }
        });
    }

    /// Block until every deletion submitted so far has finished.
    pub fn flush(&self) {
        let (tx, rx) = channel::<()>();
        self.submit(move || {
            let _ = tx.send(());
        });
        let _ = rx.recv();
    }

    fn submit(&self, job: impl FnOnce() + Send + 'static) {
        let jobs = self.jobs.lock();
        if let Some(sender) = jobs.as_ref() {
            // Send fails only after shutdown; the job is then dropped.
            let _ = sender.send(Box::new(job));
        }
    }
}

impl Drop for Trash {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain and exit.
        self.jobs.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_move_to_trash_removes_source() {
        let base = TempDir::new().unwrap();
        let trash = Trash::new_in(base.path());

        let victim: PathBuf = base.path().join("victim");
        fs::write(&victim, b"doomed").unwrap();

        assert!(trash.move_to_trash(&victim));
        assert!(!victim.exists());
    }

    #[test]
    fn test_empty_deletes_trash_root() {
        let base = TempDir::new().unwrap();
        let trash = Trash::new_in(base.path());

        let victim: PathBuf = base.path().join("victim");
        fs::write(&victim, b"doomed").unwrap();
        assert!(trash.move_to_trash(&victim));

        trash.empty();
        trash.flush();

        // The trash root itself is gone, not just its contents.
        let leftovers: Vec<_> = fs::read_dir(base.path()).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_move_after_empty_starts_fresh_root() {
        let base = TempDir::new().unwrap();
        let trash = Trash::new_in(base.path());

        let first: PathBuf = base.path().join("first");
        fs::write(&first, b"1").unwrap();
        assert!(trash.move_to_trash(&first));
        trash.empty();
        trash.flush();

        let second: PathBuf = base.path().join("second");
        fs::write(&second, b"2").unwrap();
        assert!(trash.move_to_trash(&second));
        assert!(!second.exists());

        trash.empty();
        trash.flush();
        let leftovers: Vec<_> = fs::read_dir(base.path()).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_move_missing_file_fails() {
        let base = TempDir::new().unwrap();
        let trash = Trash::new_in(base.path());
        assert!(!trash.move_to_trash(&base.path().join("absent")));
    }

    #[test]
    fn test_trash_whole_directory() {
        let base = TempDir::new().unwrap();
        let trash = Trash::new_in(base.path());

        let dir: PathBuf = base.path().join("cache-dir");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("a"), b"a").unwrap();
        fs::write(dir.join("b"), b"b").unwrap();

        assert!(trash.move_to_trash(&dir));
        assert!(!dir.exists());

        trash.empty();
        trash.flush();
        let leftovers: Vec<_> = fs::read_dir(base.path()).unwrap().collect();
        assert!(leftovers.is_empty());
    }
}
