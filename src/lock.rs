//! Single-file mutual exclusion between update runs.
//!
//! The marker file holds the decimal pid of its owner. It is written to a
//! private temp file first and published with `link(2)`, so the marker never
//! exists without its content. A marker whose pid is not alive is stale and
//! gets replaced. A marker without a readable pid counts as held until it is
//! older than [`UNREADABLE_GRACE`].
//!
//! Every inspection, replacement and removal of the marker happens under an
//! `flock(2)` on a sibling `.gate` file. The gate file is never removed, and
//! the kernel drops the `flock` when its holder dies.

use crate::core::{Result, StockError};
use crate::process::is_alive;
use nix::fcntl::{Flock, FlockArg};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

const ACQUIRE_ATTEMPTS: usize = 3;

/// How long a marker without a pid is assumed to belong to a live writer.
pub const UNREADABLE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum LockAttempt {
    Acquired(UpdateLockGuard),
    /// Another run owns the lock. `pid` is 0 when the marker carries no
    /// readable pid yet.
    Held { pid: i32 },
}

/// Owner of the lock file; dropping it removes the file.
#[derive(Debug)]
pub struct UpdateLockGuard {
    path: PathBuf,
    pid: i32,
    released: bool,
}

impl UpdateLockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Removes the lock file now, reporting failures instead of only
    /// logging them as `Drop` does.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        remove_marker(&self.path, self.pid)
    }
}

impl Drop for UpdateLockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = remove_marker(&self.path, self.pid) {
            warn!(error = %err, "update lock could not be released");
        }
    }
}

/// Exclusive `flock` on the gate file next to `path`, held until dropped.
fn enter_gate(path: &Path) -> Result<Flock<File>> {
    let mut name: OsString = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(".gate");
    let gate = path.with_file_name(name);
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&gate)
        .map_err(|err| StockError::io("open", &gate, err))?;
    Flock::lock(file, FlockArg::LockExclusive)
        .map_err(|(_, errno)| StockError::resource("flock", gate.display(), errno))
}

/// Removes the marker only while it still names `pid`.
fn remove_marker(path: &Path, pid: i32) -> Result<()> {
    let _gate = enter_gate(path)?;
    match read_holder(path) {
        Some(holder) if holder == pid => {}
        None if !path.exists() => return Ok(()),
        holder => {
            warn!(lock = %path.display(), ?holder, pid, "update lock was taken over, leaving it");
            return Ok(());
        }
    }
    match fs::remove_file(path) {
        Ok(()) => {
            info!(lock = %path.display(), "update lock released");
            Ok(())
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(StockError::io("remove", path, err)),
    }
}

/// Reads the owner pid; `None` when the file is gone or unparsable.
pub fn read_holder(path: &Path) -> Option<i32> {
    parse_pid(&fs::read_to_string(path).ok()?)
}

fn parse_pid(content: &str) -> Option<i32> {
    content.trim().parse().ok().filter(|pid| *pid > 0)
}

/// What an existing marker says about its owner.
struct Marker {
    holder: Option<i32>,
    age: Duration,
}

impl Marker {
    /// `Ok(None)` when the marker vanished before it could be read.
    fn inspect(path: &Path) -> Result<Option<Self>> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StockError::io("read", path, err)),
        };
        let age = fs::metadata(path)
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .unwrap_or_default();
        Ok(Some(Self {
            holder: parse_pid(&content),
            age,
        }))
    }

    /// The pid that keeps the lock, if the marker is not stale.
    fn live_holder(&self) -> Option<i32> {
        match self.holder {
            Some(pid) if is_alive(pid) => Some(pid),
            Some(_) => None,
            None if self.age < UNREADABLE_GRACE => Some(0),
            None => None,
        }
    }
}

fn lock_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Writes `pid` to a temp file and links it to `path`.
///
/// Returns `false` when a marker already exists.
fn publish(path: &Path, dir: &Path, pid: i32) -> Result<bool> {
    let mut temp = tempfile::Builder::new()
        .prefix(".updater-lock.")
        .tempfile_in(dir)
        .map_err(|err| StockError::io("create temp file in", dir, err))?;
    temp.write_all(pid.to_string().as_bytes())
        .and_then(|_| temp.as_file().sync_all())
        .map_err(|err| StockError::io("write", temp.path(), err))?;

    match fs::hard_link(temp.path(), path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(StockError::io("publish", path, err)),
    }
}

fn discard_stale(path: &Path, stale: &Marker) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            warn!(lock = %path.display(), holder = ?stale.holder, "removed stale update lock");
            Ok(())
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(StockError::io("remove stale lock", path, err)),
    }
}

pub struct UpdateLock;

impl UpdateLock {
    /// Claims the lock at `path` for the current process.
    pub fn acquire(path: &Path) -> Result<LockAttempt> {
        let pid = i32::try_from(std::process::id())
            .map_err(|err| StockError::resource("identify", "current process", err))?;
        Self::acquire_as(path, pid)
    }

    /// Claims the lock at `path` on behalf of `pid`.
    pub fn acquire_as(path: &Path, pid: i32) -> Result<LockAttempt> {
        let dir = lock_dir(path);
        fs::create_dir_all(&dir).map_err(|err| StockError::io("create directory", &dir, err))?;
        let _gate = enter_gate(path)?;

        for _ in 0..ACQUIRE_ATTEMPTS {
            if publish(path, &dir, pid)? {
                info!(lock = %path.display(), pid, "update lock acquired");
                return Ok(LockAttempt::Acquired(UpdateLockGuard {
                    path: path.to_path_buf(),
                    pid,
                    released: false,
                }));
            }

            let Some(marker) = Marker::inspect(path)? else {
                continue;
            };
            if let Some(holder) = marker.live_holder() {
                return Ok(LockAttempt::Held { pid: holder });
            }
            discard_stale(path, &marker)?;
        }

        Err(StockError::resource(
            "acquire",
            path.display(),
            "lock file kept reappearing",
        ))
    }
}
