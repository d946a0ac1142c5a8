//! Session configuration and on-disk locations.

use std::num::NonZeroUsize;
use std::path::PathBuf;

/// Knobs for one [`crate::session::BuildSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
  /// Maximum number of recipes executing at once.
  pub parallelism: usize,
  /// Working directory for recipes that do not choose one.
  pub workdir: Option<PathBuf>,
}

impl Default for SessionConfig {
  fn default() -> Self {
    SessionConfig {
      parallelism: std::thread::available_parallelism().map(NonZeroUsize::get).unwrap_or(1),
      workdir: None,
    }
  }
}

impl SessionConfig {
  pub fn with_parallelism(mut self, parallelism: usize) -> Self {
    self.parallelism = parallelism.max(1);
    self
  }

  pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
    self.workdir = Some(workdir.into());
    self
  }
}

/// Where a project keeps its build state.
///
/// ```text
/// {root}/.kiln/            # or $KILN_STATE_DIR
/// ├── .lock                # StateLock
/// └── provenance.json      # FileProvenance
/// ```
pub mod paths {
  use std::path::{Path, PathBuf};

  use crate::consts::{LOCK_FILENAME, PROVENANCE_FILENAME, STATE_DIR_ENV, STATE_DIR_NAME};

  /// `$KILN_STATE_DIR` (relative values are taken from `root`), else `<root>/.kiln`.
  pub fn state_dir(root: &Path) -> PathBuf {
    match std::env::var_os(STATE_DIR_ENV) {
      Some(dir) if !dir.is_empty() => root.join(dir),
      _ => root.join(STATE_DIR_NAME),
    }
  }

  pub fn provenance_path(root: &Path) -> PathBuf {
    state_dir(root).join(PROVENANCE_FILENAME)
  }

  pub fn lock_path(root: &Path) -> PathBuf {
    state_dir(root).join(LOCK_FILENAME)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::consts::STATE_DIR_ENV;
  use serial_test::serial;
  use std::path::Path;

  #[test]
  fn parallelism_is_at_least_one() {
    assert!(SessionConfig::default().parallelism >= 1);
    assert_eq!(SessionConfig::default().with_parallelism(0).parallelism, 1);
  }

  #[test]
  #[serial]
  fn state_dir_defaults_under_root() {
    temp_env::with_var_unset(STATE_DIR_ENV, || {
      assert_eq!(paths::state_dir(Path::new("/proj")), Path::new("/proj/.kiln"));
      assert_eq!(
        paths::provenance_path(Path::new("/proj")),
        Path::new("/proj/.kiln/provenance.json")
      );
    });
  }

  #[test]
  #[serial]
  fn state_dir_env_override() {
    temp_env::with_var(STATE_DIR_ENV, Some("build-state"), || {
      assert_eq!(paths::state_dir(Path::new("/proj")), Path::new("/proj/build-state"));
    });
    #[cfg(unix)]
    temp_env::with_var(STATE_DIR_ENV, Some("/var/kiln"), || {
      assert_eq!(paths::lock_path(Path::new("/proj")), Path::new("/var/kiln/.lock"));
    });
  }
}
