use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use super::{ArtifactRow, FactBatch, Ledger, ProvenanceError, ProvenanceStore};
use crate::artifact::{ArtifactKey, Version};
use crate::consts::PROVENANCE_FORMAT_VERSION;
use crate::rule::RuleKey;

/// A ledger persisted as one JSON file.
///
/// The whole ledger is loaded on open and rewritten on every change, via a
/// temp file and rename so a crash never leaves a torn file behind.
#[derive(Debug)]
pub struct FileProvenance {
  path: PathBuf,
  ledger: Mutex<Ledger>,
}

impl FileProvenance {
  /// Open the ledger at `path`, starting empty if the file does not exist.
  pub fn open(path: impl Into<PathBuf>) -> Result<Self, ProvenanceError> {
    let path = path.into();
    let ledger = load(&path)?;
    Ok(FileProvenance {
      path,
      ledger: Mutex::new(ledger),
    })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  fn lock(&self) -> MutexGuard<'_, Ledger> {
    self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Apply `change` to a copy of the ledger and persist it; the in-memory
  /// ledger is only replaced once the file is written.
  fn update<T>(
    &self,
    change: impl FnOnce(&mut Ledger) -> Result<T, ProvenanceError>,
    changed: impl FnOnce(&T) -> bool,
  ) -> Result<T, ProvenanceError> {
    let mut guard = self.lock();
    let mut next = guard.clone();
    let result = change(&mut next)?;
    if changed(&result) {
      save(&self.path, &next)?;
      *guard = next;
    }
    Ok(result)
  }
}

fn load(path: &Path) -> Result<Ledger, ProvenanceError> {
  let content = match fs::read_to_string(path) {
    Ok(content) => content,
    Err(e) if e.kind() == io::ErrorKind::NotFound => {
      debug!(path = %path.display(), "no provenance ledger yet, starting empty");
      return Ok(Ledger::default());
    }
    Err(source) => {
      return Err(ProvenanceError::Read {
        path: path.to_path_buf(),
        source,
      });
    }
  };

  let ledger: Ledger = serde_json::from_str(&content).map_err(|source| ProvenanceError::Parse {
    path: path.to_path_buf(),
    source,
  })?;

  if ledger.version != PROVENANCE_FORMAT_VERSION {
    return Err(ProvenanceError::UnsupportedVersion {
      path: path.to_path_buf(),
      found: ledger.version,
      expected: PROVENANCE_FORMAT_VERSION,
    });
  }
  Ok(ledger)
}

fn save(path: &Path, ledger: &Ledger) -> Result<(), ProvenanceError> {
  let write_err = |source| ProvenanceError::Write {
    path: path.to_path_buf(),
    source,
  };
  if let Some(parent) = path.parent() {
    fs::create_dir_all(parent).map_err(write_err)?;
  }
  let temp_path = path.with_extension("json.tmp");
  let content = serde_json::to_string_pretty(ledger).map_err(ProvenanceError::Serialize)?;
  fs::write(&temp_path, content).map_err(write_err)?;
  fs::rename(&temp_path, path).map_err(write_err)?;
  debug!(path = %path.display(), "provenance ledger saved");
  Ok(())
}

impl ProvenanceStore for FileProvenance {
  fn record(&self, batch: &FactBatch) -> Result<(), ProvenanceError> {
    if batch.is_empty() {
      return Ok(());
    }
    self.update(|ledger| ledger.apply(batch), |_| true)
  }

  fn version_sources(
    &self,
    target: &ArtifactKey,
    version: &Version,
  ) -> Result<Vec<(ArtifactKey, Version)>, ProvenanceError> {
    Ok(self.lock().version_sources(target, version))
  }

  fn rule_sources(&self, rule: &RuleKey) -> Result<Vec<ArtifactKey>, ProvenanceError> {
    Ok(self.lock().rule_sources(rule))
  }

  fn rule_outputs(&self, rule: &RuleKey) -> Result<Vec<ArtifactKey>, ProvenanceError> {
    Ok(self.lock().rule_outputs(rule))
  }

  fn producer_of(&self, target: &ArtifactKey, version: &Version) -> Result<Option<RuleKey>, ProvenanceError> {
    Ok(self.lock().producer_of(target, version))
  }

  fn recorded_versions(&self, target: &ArtifactKey) -> Result<Vec<Version>, ProvenanceError> {
    Ok(self.lock().recorded_versions(target))
  }

  fn retract_rule(&self, rule: &RuleKey) -> Result<usize, ProvenanceError> {
    self.update(|ledger| Ok(ledger.retract_rule(rule)), |n| *n > 0)
  }

  fn retract_target(&self, target: &ArtifactKey) -> Result<usize, ProvenanceError> {
    self.update(|ledger| Ok(ledger.retract_target(target)), |n| *n > 0)
  }

  fn artifact_row(&self, key: &ArtifactKey) -> Result<Option<ArtifactRow>, ProvenanceError> {
    Ok(self.lock().artifact_row(key))
  }

  fn prune_artifacts(&self) -> Result<usize, ProvenanceError> {
    self.update(|ledger| Ok(ledger.prune_artifacts()), |n| *n > 0)
  }
}
