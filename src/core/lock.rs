//! Cross-process state lock
//!
//! Every read-modify-write of the credential store or the Git configuration
//! happens while a [`StateLock`] is held. The lock is a file created with
//! `create_new`, so only one process can own it; dropping the guard removes
//! it on every exit path. A lock file left behind by a crashed process is
//! reclaimed once it is older than [`STALE_AFTER`].
//!
//! Each acquisition writes a unique nonce into the file. Reclaiming moves the
//! stale file aside first and deletes it only if it still carries the nonce
//! that was seen when it was judged stale; a live lock moved aside by a
//! competing reclaimer is linked back into place.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

use crate::error::{FnosError, Result};

/// Lock file name inside the configuration directory
pub const LOCK_FILE: &str = "state.lock";

/// Age after which an abandoned lock file is reclaimed
pub const STALE_AFTER: Duration = Duration::from_secs(60);

/// Default time to wait for a competing process
pub const DEFAULT_WAIT: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Exclusive lock over the persisted state, released on drop
#[derive(Debug)]
pub struct StateLock {
    path: PathBuf,
    owner: String,
}

impl StateLock {
    /// Acquire the lock in `dir`, waiting up to `wait`
    pub fn acquire(dir: &Path, wait: Duration) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(LOCK_FILE);
        let started = SystemTime::now();

        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    // Owner pid helps when a user has to clean up by hand
                    let owner = format!("{} {:016x}", std::process::id(), rand::random::<u64>());
                    if let Err(e) = writeln!(file, "{}", owner).and_then(|_| file.sync_all()) {
                        let _ = fs::remove_file(&path);
                        return Err(e.into());
                    }
                    debug!(path = %path.display(), "acquired state lock");
                    return Ok(Self { path, owner });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if let Some(observed) = Self::stale_contents(&path) {
                        if Self::reclaim(&path, &observed) {
                            warn!(path = %path.display(), "reclaimed stale state lock");
                        }
                        continue;
                    }

                    let waited = started.elapsed().unwrap_or_default();
                    if waited >= wait {
                        return Err(FnosError::LockTimeout(path));
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Contents of the lock file if it is older than [`STALE_AFTER`]
    fn stale_contents(path: &Path) -> Option<String> {
        let contents = fs::read_to_string(path).ok()?;
        let stale = fs::metadata(path)
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .is_some_and(|age| age > STALE_AFTER);
        stale.then_some(contents)
    }

    /// Remove the lock file if it still holds `observed`
    ///
    /// Returns whether a stale lock was removed.
    fn reclaim(path: &Path, observed: &str) -> bool {
        let parked = path.with_extension(format!("reclaim-{:016x}", rand::random::<u64>()));
        if fs::rename(path, &parked).is_err() {
            // Already released or reclaimed by someone else
            return false;
        }

        let parked_contents = fs::read_to_string(&parked).unwrap_or_default();
        if parked_contents == observed {
            let _ = fs::remove_file(&parked);
            return true;
        }

        // A fresh lock was moved aside; put it back without clobbering a newer one
        if let Err(e) = fs::hard_link(&parked, path) {
            warn!(path = %path.display(), error = %e, "could not restore a live state lock");
        }
        let _ = fs::remove_file(&parked);
        false
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let ours = fs::read_to_string(&self.path)
            .map(|contents| contents.trim_end() == self.owner)
            .unwrap_or(false);
        if !ours {
            warn!(path = %self.path.display(), "state lock was taken over, leaving it in place");
            return;
        }
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to release state lock");
        }
    }
}
