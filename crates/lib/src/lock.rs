//! Advisory lock on a project's state directory.
//!
//! Builds hold the lock exclusively so two `kiln` processes never write the
//! provenance ledger at once; read-only commands take it shared. The holder
//! writes a small JSON record into the lock file so a blocked process can say
//! who is in the way.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::consts::LOCK_FILENAME;

/// Readers share the state directory; builds hold it alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
  Shared,
  Exclusive,
}

/// Who holds an exclusive lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
  pub pid: u32,
  pub command: String,
  /// Seconds since the Unix epoch.
  pub started_at_unix: u64,
}

#[derive(Debug, Error)]
pub enum StateLockError {
  #[error(
    "build state is locked by `{}` (PID {}, started at unix time {})\n\
     if no kiln process is running, remove {}",
    .holder.command, .holder.pid, .holder.started_at_unix, .lock_path.display()
  )]
  Held { holder: LockHolder, lock_path: PathBuf },

  #[error("build state is locked by another process\nif no kiln process is running, remove {}", .lock_path.display())]
  HeldUnknown { lock_path: PathBuf },

  #[error("failed to create state directory {}", .path.display())]
  CreateDir {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to open lock file {}", .path.display())]
  Open {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to record lock holder")]
  WriteHolder(#[source] io::Error),

  #[error("failed to lock {}", .path.display())]
  Lock {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// Held until dropped; the OS releases the lock with the file handle.
#[derive(Debug)]
pub struct StateLock {
  file: File,
  lock_path: PathBuf,
  mode: LockMode,
}

impl StateLock {
  /// Lock `state_dir`, creating it if needed. Never blocks: contention is
  /// reported as [`StateLockError::Held`].
  pub fn acquire(state_dir: &Path, mode: LockMode, command: &str) -> Result<Self, StateLockError> {
    std::fs::create_dir_all(state_dir).map_err(|source| StateLockError::CreateDir {
      path: state_dir.to_path_buf(),
      source,
    })?;
    let lock_path = state_dir.join(LOCK_FILENAME);

    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(&lock_path)
      .map_err(|source| StateLockError::Open {
        path: lock_path.clone(),
        source,
      })?;

    match try_lock(&file, mode) {
      Ok(()) => {}
      Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Err(contention(&lock_path)),
      Err(source) => {
        return Err(StateLockError::Lock {
          path: lock_path,
          source,
        });
      }
    }

    let lock = StateLock { file, lock_path, mode };
    if mode == LockMode::Exclusive {
      lock.write_holder(command).map_err(StateLockError::WriteHolder)?;
    }
    debug!(path = %lock.lock_path.display(), ?mode, "state lock acquired");
    Ok(lock)
  }

  fn write_holder(&self, command: &str) -> io::Result<()> {
    let holder = LockHolder {
      pid: std::process::id(),
      command: command.to_string(),
      started_at_unix: SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs(),
    };
    self.file.set_len(0)?;
    let mut file = &self.file;
    file.seek(SeekFrom::Start(0))?;
    serde_json::to_writer(&mut file, &holder).map_err(io::Error::other)?;
    file.flush()
  }

  /// The holder record, read through the held handle.
  pub fn holder(&self) -> io::Result<LockHolder> {
    let mut file = &self.file;
    file.seek(SeekFrom::Start(0))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    serde_json::from_str(&contents).map_err(io::Error::other)
  }

  pub fn mode(&self) -> LockMode {
    self.mode
  }

  pub fn lock_path(&self) -> &Path {
    &self.lock_path
  }
}

fn contention(lock_path: &Path) -> StateLockError {
  let holder = std::fs::read_to_string(lock_path)
    .ok()
    .and_then(|contents| serde_json::from_str::<LockHolder>(&contents).ok());
  match holder {
    Some(holder) => StateLockError::Held {
      holder,
      lock_path: lock_path.to_path_buf(),
    },
    None => StateLockError::HeldUnknown {
      lock_path: lock_path.to_path_buf(),
    },
  }
}

#[cfg(unix)]
fn try_lock(file: &File, mode: LockMode) -> io::Result<()> {
  use rustix::fs::{FlockOperation, flock};
  use std::os::unix::io::AsFd;

  let operation = match mode {
    LockMode::Shared => FlockOperation::NonBlockingLockShared,
    LockMode::Exclusive => FlockOperation::NonBlockingLockExclusive,
  };
  flock(file.as_fd(), operation).map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}

#[cfg(windows)]
fn try_lock(file: &File, mode: LockMode) -> io::Result<()> {
  use std::os::windows::io::AsRawHandle;
  use windows_sys::Win32::Foundation::HANDLE;
  use windows_sys::Win32::Storage::FileSystem::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, LockFileEx};

  let handle = file.as_raw_handle() as HANDLE;
  let flags = match mode {
    LockMode::Shared => LOCKFILE_FAIL_IMMEDIATELY,
    LockMode::Exclusive => LOCKFILE_FAIL_IMMEDIATELY | LOCKFILE_EXCLUSIVE_LOCK,
  };

  // SAFETY: a zeroed OVERLAPPED is valid and `handle` is owned by `file`.
  let result = unsafe {
    let mut overlapped = std::mem::zeroed();
    LockFileEx(handle, flags, 0, 1, 0, &mut overlapped)
  };
  if result == 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn exclusive_lock_records_holder() {
    let dir = TempDir::new().unwrap();
    let lock = StateLock::acquire(dir.path(), LockMode::Exclusive, "kiln build").unwrap();
    assert!(lock.lock_path().exists());
    let holder = lock.holder().unwrap();
    assert_eq!(holder.command, "kiln build");
    assert_eq!(holder.pid, std::process::id());
  }

  #[test]
  fn creates_missing_state_dir() {
    let dir = TempDir::new().unwrap();
    let state = dir.path().join("nested/.kiln");
    let lock = StateLock::acquire(&state, LockMode::Shared, "kiln explain").unwrap();
    assert_eq!(lock.lock_path(), state.join(LOCK_FILENAME));
    assert_eq!(lock.mode(), LockMode::Shared);
  }

  #[test]
  fn shared_locks_coexist() {
    let dir = TempDir::new().unwrap();
    let _a = StateLock::acquire(dir.path(), LockMode::Shared, "a").unwrap();
    let _b = StateLock::acquire(dir.path(), LockMode::Shared, "b").unwrap();
  }

  #[cfg(unix)]
  #[test]
  fn second_exclusive_lock_reports_holder() {
    let dir = TempDir::new().unwrap();
    let _held = StateLock::acquire(dir.path(), LockMode::Exclusive, "kiln build").unwrap();
    match StateLock::acquire(dir.path(), LockMode::Exclusive, "kiln forget") {
      Err(StateLockError::Held { holder, .. }) => assert_eq!(holder.command, "kiln build"),
      other => panic!("expected contention, got {other:?}"),
    }
  }

  #[test]
  fn released_on_drop() {
    let dir = TempDir::new().unwrap();
    drop(StateLock::acquire(dir.path(), LockMode::Exclusive, "first").unwrap());
    let lock = StateLock::acquire(dir.path(), LockMode::Exclusive, "second").unwrap();
    assert_eq!(lock.holder().unwrap().command, "second");
  }
}
