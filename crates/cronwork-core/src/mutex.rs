// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Advisory locks over named resources.
//!
//! Cross-process safety in cronwork comes only from these locks, taken on
//! the specific resource being mutated (a log file path). There is no
//! global lock. [`FileMutex`] hands out [`MutexClaim`] guards that release
//! exactly once on every exit path.

use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};
use uuid::Uuid;

/// Advisory lock failures. Contention is not a failure.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MutexError {
    /// Lock storage could not be read or written.
    #[error("Lock I/O error for '{key}': {source}")]
    Io {
        /// Resource key.
        key: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// A cooperative, named lock that every participating process honours.
#[async_trait]
pub trait AdvisoryLock: Send + Sync {
    /// Try to take `key`, waiting up to `timeout`. `Ok(false)` means another
    /// holder kept it for the whole wait.
    async fn acquire(&self, key: &str, timeout: Duration) -> Result<bool, MutexError>;

    /// Give `key` back. Synchronous so guards can release from `Drop`.
    fn release(&self, key: &str) -> Result<(), MutexError>;
}

/// Lock files under a directory, one per key.
///
/// A lock is held while `<dir>/<name>.lock` exists. The file is created with
/// exclusive-create semantics and holds an owner token (pid plus a random
/// id). Files older than `stale_after` are treated as left behind by a dead
/// process and taken over.
///
/// A lock file is only ever removed after it has been renamed aside and its
/// token checked, so a holder whose lock was broken as stale cannot delete
/// the file of the process that took over.
#[derive(Debug, Clone)]
pub struct LockFileMutex {
    dir: PathBuf,
    stale_after: Option<Duration>,
    poll_interval: Duration,
    owned: Arc<Mutex<HashMap<String, String>>>,
}

impl LockFileMutex {
    /// Lock files live in `dir`, created on first acquire.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            stale_after: None,
            poll_interval: Duration::from_millis(50),
            owned: Arc::default(),
        }
    }

    /// Break lock files older than `age`.
    pub fn with_stale_after(mut self, age: Duration) -> Self {
        self.stale_after = Some(age);
        self
    }

    /// How often a contended lock is retried.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Lock file for `key`.
    ///
    /// Keys are usually paths, so the file name is a readable tail plus a
    /// digest of the full key.
    pub fn lock_path(&self, key: &str) -> PathBuf {
        let tail: String = Path::new(key)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| key.to_string())
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .take(64)
            .collect();
        let digest = format!("{:x}", Sha256::digest(key.as_bytes()));
        self.dir.join(format!("{}-{}.lock", tail, &digest[..16]))
    }

    /// Token this instance wrote for `key`, if it holds it.
    pub fn owner_token(&self, key: &str) -> Option<String> {
        self.owned().get(key).cloned()
    }

    fn owned(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.owned.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_create(&self, key: &str, path: &Path) -> Result<bool, MutexError> {
        let io_err = |source| MutexError::Io {
            key: key.to_string(),
            source,
        };

        if self.create_owned(key, path).map_err(io_err)? {
            return Ok(true);
        }

        let Some(seen) = self.stale_token(path) else {
            return Ok(false);
        };
        warn!(key = %key, path = %path.display(), owner = %seen, "Breaking stale lock file");

        match take_aside(path).map_err(io_err)? {
            // Another process broke it first
            None => Ok(false),
            Some((aside, token)) if token != seen => {
                // Renamed a fresh lock that replaced the stale one; put it back
                restore(&aside, path);
                Ok(false)
            }
            Some((aside, _)) => {
                if let Err(e) = std::fs::remove_file(&aside) {
                    debug!(path = %aside.display(), error = %e, "Failed to remove broken lock file");
                }
                self.create_owned(key, path).map_err(io_err)
            }
        }
    }

    /// Exclusive-create the lock file and record our token. `Ok(false)` when
    /// the file already exists.
    fn create_owned(&self, key: &str, path: &Path) -> std::io::Result<bool> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                let token = format!("{} {}", std::process::id(), Uuid::new_v4());
                file.write_all(token.as_bytes())?;
                file.sync_all()?;
                self.owned().insert(key.to_string(), token);
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Owner token of a lock file older than `stale_after`.
    fn stale_token(&self, path: &Path) -> Option<String> {
        let stale_after = self.stale_after?;
        let age = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()?
            .elapsed()
            .ok()?;
        if age <= stale_after {
            return None;
        }
        std::fs::read_to_string(path).ok()
    }
}

/// Atomically move the lock file to a unique name and read its token.
/// `None` when there is no lock file.
fn take_aside(path: &Path) -> std::io::Result<Option<(PathBuf, String)>> {
    let mut aside = path.as_os_str().to_owned();
    aside.push(format!(".{}.aside", Uuid::new_v4().simple()));
    let aside = PathBuf::from(aside);

    match std::fs::rename(path, &aside) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    }
    let token = std::fs::read_to_string(&aside)?;
    Ok(Some((aside, token)))
}

/// Move a renamed lock file back unless a new holder already took `path`.
fn restore(aside: &Path, path: &Path) {
    if let Err(e) = std::fs::hard_link(aside, path)
        && e.kind() != ErrorKind::AlreadyExists
    {
        warn!(path = %path.display(), error = %e, "Failed to restore lock file");
    }
    if let Err(e) = std::fs::remove_file(aside) {
        debug!(path = %aside.display(), error = %e, "Failed to remove aside lock file");
    }
}

#[async_trait]
impl AdvisoryLock for LockFileMutex {
    async fn acquire(&self, key: &str, timeout: Duration) -> Result<bool, MutexError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| MutexError::Io {
                key: key.to_string(),
                source,
            })?;

        let path = self.lock_path(key);
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_create(key, &path)? {
                debug!(key = %key, path = %path.display(), "Lock acquired");
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    fn release(&self, key: &str) -> Result<(), MutexError> {
        let Some(token) = self.owned().remove(key) else {
            warn!(key = %key, "Release of a lock this process does not hold");
            return Ok(());
        };
        let path = self.lock_path(key);

        match take_aside(&path) {
            Ok(None) => {
                warn!(key = %key, "Lock file already gone on release");
                Ok(())
            }
            Ok(Some((aside, found))) if found != token => {
                warn!(key = %key, owner = %found, "Lock was taken over, leaving it to its new owner");
                restore(&aside, &path);
                Ok(())
            }
            Ok(Some((aside, _))) => std::fs::remove_file(&aside).map_err(|source| MutexError::Io {
                key: key.to_string(),
                source,
            }),
            Err(source) => Err(MutexError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }
}

#[derive(Debug, Default)]
struct MemoryMutexState {
    held: HashSet<String>,
    acquired: HashMap<String, usize>,
    released: HashMap<String, usize>,
}

/// Process-local advisory lock. Counts acquires and releases per key.
#[derive(Debug, Default)]
pub struct MemoryMutex {
    state: Mutex<MemoryMutexState>,
    poll_interval: Duration,
}

impl MemoryMutex {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self {
            state: Mutex::default(),
            poll_interval: Duration::from_millis(10),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryMutexState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark `key` as held by someone else.
    pub fn hold(&self, key: &str) {
        self.state().held.insert(key.to_string());
    }

    /// Whether `key` is currently held.
    pub fn is_held(&self, key: &str) -> bool {
        self.state().held.contains(key)
    }

    /// Successful acquires of `key`.
    pub fn acquire_count(&self, key: &str) -> usize {
        self.state().acquired.get(key).copied().unwrap_or(0)
    }

    /// Releases of `key`, including releases of a key nobody held.
    pub fn release_count(&self, key: &str) -> usize {
        self.state().released.get(key).copied().unwrap_or(0)
    }
}

#[async_trait]
impl AdvisoryLock for MemoryMutex {
    async fn acquire(&self, key: &str, timeout: Duration) -> Result<bool, MutexError> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut state = self.state();
                if state.held.insert(key.to_string()) {
                    *state.acquired.entry(key.to_string()).or_default() += 1;
                    return Ok(true);
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            sleep(self.poll_interval.max(Duration::from_millis(1)).min(deadline - now)).await;
        }
    }

    fn release(&self, key: &str) -> Result<(), MutexError> {
        let mut state = self.state();
        state.held.remove(key);
        *state.released.entry(key.to_string()).or_default() += 1;
        Ok(())
    }
}

/// Hands out scoped claims on an [`AdvisoryLock`].
#[derive(Clone)]
pub struct FileMutex {
    lock: Arc<dyn AdvisoryLock>,
    timeout: Duration,
}

impl FileMutex {
    /// Claims wait up to `timeout`.
    pub fn new(lock: Arc<dyn AdvisoryLock>, timeout: Duration) -> Self {
        Self { lock, timeout }
    }

    /// Claim `key`. `Ok(None)` is contention: someone else is handling it.
    pub async fn claim(&self, key: impl Into<String>) -> Result<Option<MutexClaim>, MutexError> {
        let key = key.into();
        if !self.lock.acquire(&key, self.timeout).await? {
            debug!(key = %key, "Lock busy");
            return Ok(None);
        }
        Ok(Some(MutexClaim {
            lock: Arc::clone(&self.lock),
            key,
            released: false,
        }))
    }
}

impl std::fmt::Debug for FileMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileMutex")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// A held advisory lock. Released by [`MutexClaim::release`] or on drop,
/// never both.
#[must_use = "dropping the claim releases the lock immediately"]
pub struct MutexClaim {
    lock: Arc<dyn AdvisoryLock>,
    key: String,
    released: bool,
}

impl MutexClaim {
    /// Claimed resource key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release now, surfacing any error.
    pub fn release(mut self) -> Result<(), MutexError> {
        self.released = true;
        self.lock.release(&self.key)
    }
}

impl Drop for MutexClaim {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.lock.release(&self.key) {
            warn!(key = %self.key, error = %e, "Failed to release lock");
        }
    }
}

impl std::fmt::Debug for MutexClaim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutexClaim")
            .field("key", &self.key)
            .field("released", &self.released)
            .finish()
    }
}
