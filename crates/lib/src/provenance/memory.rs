use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{ArtifactRow, FactBatch, Ledger, ProvenanceError, ProvenanceStore};
use crate::artifact::{ArtifactKey, Version};
use crate::rule::RuleKey;

/// A ledger that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryProvenance {
  ledger: Mutex<Ledger>,
}

impl MemoryProvenance {
  pub fn new() -> Self {
    Self::default()
  }

  /// Copy of the current tables.
  pub fn snapshot(&self) -> Ledger {
    self.lock().clone()
  }

  fn lock(&self) -> MutexGuard<'_, Ledger> {
    self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

impl ProvenanceStore for MemoryProvenance {
  fn record(&self, batch: &FactBatch) -> Result<(), ProvenanceError> {
    self.lock().apply(batch)
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
    Ok(self.lock().retract_rule(rule))
  }

  fn retract_target(&self, target: &ArtifactKey) -> Result<usize, ProvenanceError> {
    Ok(self.lock().retract_target(target))
  }

  fn artifact_row(&self, key: &ArtifactKey) -> Result<Option<ArtifactRow>, ProvenanceError> {
    Ok(self.lock().artifact_row(key))
  }

  fn prune_artifacts(&self) -> Result<usize, ProvenanceError> {
    Ok(self.lock().prune_artifacts())
  }
}
