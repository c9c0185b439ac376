//! Per-record exclusive locks backed by `create_new` lock files.
//!
//! Creating `<id>.lock` with `O_CREAT|O_EXCL` succeeds for exactly one caller
//! at a time, across threads and processes sharing the filesystem. Each lock
//! file carries a holder token; the holder removes the file on drop only while
//! the token is still its own. A lock file older than [`LOCK_STALE_AFTER`]
//! belongs to a holder that died mid-update and is broken by renaming it to a
//! tombstone, which only one breaker can do.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, warn};

use crate::error::StoreError;

/// Critical sections are a read and a rename; anything this old is abandoned.
pub const LOCK_STALE_AFTER: Duration = Duration::from_secs(30);

/// How long blocking writers wait before giving up.
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(10);

const LOCK_POLL: Duration = Duration::from_millis(5);

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(0);

#[derive(Debug)]
pub struct RecordLock {
    path: PathBuf,
    token: String,
}

impl RecordLock {
    /// Take the lock if it is free. `None` means another holder owns it.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        match create_lock_file(path) {
            Ok(lock) => Ok(Some(lock)),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                if !break_if_abandoned(path)? {
                    return Ok(None);
                }
                match create_lock_file(path) {
                    Ok(lock) => Ok(Some(lock)),
                    Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(None),
                    Err(err) => {
                        Err(err).with_context(|| format!("create lock {}", path.display()))
                    }
                }
            }
            Err(err) => Err(err).with_context(|| format!("create lock {}", path.display())),
        }
    }

    /// Wait up to `wait` for the lock.
    pub fn acquire(path: &Path, wait: Duration) -> Result<Self> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(lock) = Self::try_acquire(path)? {
                return Ok(lock);
            }
            if Instant::now() >= deadline {
                return Err(StoreError::Locked(path.display().to_string()).into());
            }
            thread::sleep(LOCK_POLL);
        }
    }
}

impl Drop for RecordLock {
    fn drop(&mut self) {
        match fs::read_to_string(&self.path) {
            Ok(holder) if holder == self.token => {}
            Ok(_) => {
                warn!(path = %self.path.display(), "lock was broken and retaken, leaving it");
                return;
            }
            Err(err) if err.kind() == ErrorKind::NotFound => return,
            Err(err) => {
                warn!(path = %self.path.display(), err = %err, "failed to read lock file");
                return;
            }
        }
        if let Err(err) = fs::remove_file(&self.path)
            && err.kind() != ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), err = %err, "failed to remove lock file");
        }
    }
}

fn next_token() -> String {
    format!(
        "{} {} {}\n",
        std::process::id(),
        Utc::now().to_rfc3339(),
        NEXT_TOKEN.fetch_add(1, Ordering::Relaxed)
    )
}

fn create_lock_file(path: &Path) -> std::io::Result<RecordLock> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    let token = next_token();
    if let Err(err) = file.write_all(token.as_bytes()) {
        drop(file);
        let _ = fs::remove_file(path);
        return Err(err);
    }
    Ok(RecordLock {
        path: path.to_path_buf(),
        token,
    })
}

/// A lock file as seen at one moment: who held it, and since when.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Holder {
    token: String,
    modified: SystemTime,
}

fn inspect(path: &Path) -> std::io::Result<Holder> {
    let modified = fs::metadata(path)?.modified()?;
    let token = fs::read_to_string(path)?;
    Ok(Holder { token, modified })
}

fn break_if_abandoned(path: &Path) -> Result<bool> {
    let observed = match inspect(path) {
        Ok(holder) => holder,
        // Released between our create attempt and now.
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(true),
        Err(err) => {
            return Err(err).with_context(|| format!("inspect lock {}", path.display()));
        }
    };
    let age = SystemTime::now()
        .duration_since(observed.modified)
        .unwrap_or(Duration::ZERO);
    if age <= LOCK_STALE_AFTER {
        return Ok(false);
    }
    warn!(path = %path.display(), age_secs = age.as_secs(), "breaking abandoned lock");
    break_observed(path, &observed)
}

/// Remove the lock file at `path` only if it is still the one `observed`.
///
/// The file is first renamed to a unique tombstone, so it cannot be replaced
/// underneath us. If the tombstone turns out to be a newer lock (the observed
/// one was broken and retaken in the meantime), it is linked back in place.
fn break_observed(path: &Path, observed: &Holder) -> Result<bool> {
    let tombstone = tombstone_path(path);
    match fs::rename(path, &tombstone) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(true),
        Err(err) => {
            return Err(err).with_context(|| format!("break lock {}", path.display()));
        }
    }
    let taken = inspect(&tombstone);
    let is_observed = taken.as_ref().is_ok_and(|holder| holder == observed);
    if !is_observed {
        debug!(path = %path.display(), "lock changed hands before it was broken, restoring");
        match fs::hard_link(&tombstone, path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                warn!(path = %path.display(), "lock retaken while restoring");
            }
            Err(err) => {
                let _ = fs::remove_file(&tombstone);
                return Err(err).with_context(|| format!("restore lock {}", path.display()));
            }
        }
    }
    if let Err(err) = fs::remove_file(&tombstone) {
        warn!(path = %tombstone.display(), err = %err, "failed to remove lock tombstone");
    }
    Ok(is_observed)
}

fn tombstone_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(
        "{name}.{}-{}.broken",
        std::process::id(),
        NEXT_TOKEN.fetch_add(1, Ordering::Relaxed)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn second_holder_is_refused_until_drop() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("a.lock");

        let first = RecordLock::try_acquire(&path).expect("try").expect("free");
        assert!(RecordLock::try_acquire(&path).expect("try").is_none());
        drop(first);
        assert!(!path.exists());
        assert!(RecordLock::try_acquire(&path).expect("try").is_some());
    }

    #[test]
    fn acquire_times_out_with_locked_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("a.lock");
        let _held = RecordLock::try_acquire(&path).expect("try").expect("free");

        let err = RecordLock::acquire(&path, Duration::from_millis(20)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::Locked(_))
        ));
    }

    fn age(path: &Path) {
        let file = OpenOptions::new().write(true).open(path).expect("open lock");
        file.set_modified(SystemTime::now() - Duration::from_secs(120))
            .expect("age lock");
    }

    #[test]
    fn abandoned_lock_is_broken() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("a.lock");
        fs::write(&path, "4242 2020-01-01T00:00:00+00:00 0\n").expect("write");
        age(&path);

        let lock = RecordLock::try_acquire(&path).expect("try").expect("broken");
        assert_eq!(fs::read_to_string(&path).expect("read"), lock.token);
        drop(lock);
        assert!(!path.exists());
        assert_eq!(fs::read_dir(temp.path()).expect("dir").count(), 0);
    }

    #[test]
    fn late_breaker_restores_lock_retaken_by_another() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("a.lock");
        fs::write(&path, "4242 2020-01-01T00:00:00+00:00 0\n").expect("write");
        age(&path);

        // Two claimers look at the same abandoned lock; the first breaks and
        // retakes it before the second acts on what it saw.
        let seen_by_late = inspect(&path).expect("inspect");
        let first = RecordLock::try_acquire(&path).expect("try").expect("broken");

        assert!(!break_observed(&path, &seen_by_late).expect("break"));
        assert_eq!(fs::read_to_string(&path).expect("read"), first.token);
        assert!(RecordLock::try_acquire(&path).expect("try").is_none());

        drop(first);
        assert!(!path.exists());
        assert_eq!(fs::read_dir(temp.path()).expect("dir").count(), 0);
    }

    #[test]
    fn drop_leaves_lock_owned_by_someone_else() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("a.lock");
        let stolen = RecordLock::try_acquire(&path).expect("try").expect("free");

        fs::remove_file(&path).expect("remove");
        let current = RecordLock::try_acquire(&path).expect("try").expect("free");
        drop(stolen);
        assert_eq!(fs::read_to_string(&path).expect("read"), current.token);

        drop(current);
        assert!(!path.exists());
    }

    #[test]
    fn concurrent_try_acquire_admits_one_holder() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = Arc::new(temp.path().join("race.lock"));
        let winners = Arc::new(AtomicUsize::new(0));
        let start = Arc::new(std::sync::Barrier::new(8));
        let tried = Arc::new(std::sync::Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let path = Arc::clone(&path);
                let winners = Arc::clone(&winners);
                let start = Arc::clone(&start);
                let tried = Arc::clone(&tried);
                thread::spawn(move || {
                    start.wait();
                    let lock = RecordLock::try_acquire(&path).expect("try");
                    if lock.is_some() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                    // Hold until everyone has tried.
                    tried.wait();
                    drop(lock);
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }
        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }
}
