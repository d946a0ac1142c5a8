//! The durable provenance ledger.
//!
//! A fact states that version `V` of target `T` was produced by rule `R`
//! while relying on version `S` of source `A`. The build session consults
//! these facts to decide whether a rule is up to date and records new ones
//! after every recipe execution.
//!
//! # Storage Layout
//!
//! ```text
//! {state_dir}/
//! └── provenance.json   # Ledger: artifact rows + productions, format-versioned
//! ```

mod file;
mod ledger;
mod memory;

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use file::FileProvenance;
pub use ledger::Ledger;
pub use memory::MemoryProvenance;

use crate::artifact::{Artifact, ArtifactKey, Version};
use crate::rule::RuleKey;

/// What the ledger remembers about an artifact so it can be re-interned later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRow {
  pub kind: String,
  pub identity: String,
}

impl ArtifactRow {
  pub fn of(artifact: &Artifact) -> Self {
    ArtifactRow {
      kind: artifact.kind().to_string(),
      identity: artifact.identity().to_string(),
    }
  }

  /// Reference that re-parses to the same artifact.
  pub fn reference(&self) -> String {
    format!("{}:{}", self.kind, self.identity)
  }
}

/// `rule` produced `target` at `target_version` while relying on `source`
/// at `source_version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fact {
  pub target: ArtifactKey,
  pub target_version: Version,
  pub rule: RuleKey,
  pub source: ArtifactKey,
  pub source_version: Version,
}

/// Artifact rows and facts written in one atomic [`ProvenanceStore::record`] call.
#[derive(Debug, Clone, Default)]
pub struct FactBatch {
  /// Identities of every artifact the facts mention.
  pub artifacts: BTreeMap<ArtifactKey, ArtifactRow>,
  pub facts: Vec<Fact>,
}

impl FactBatch {
  pub fn add_artifact(&mut self, artifact: &Artifact) {
    self.artifacts.insert(artifact.key().clone(), ArtifactRow::of(artifact));
  }

  pub fn add_fact(&mut self, fact: Fact) {
    self.facts.push(fact);
  }

  pub fn is_empty(&self) -> bool {
    self.artifacts.is_empty() && self.facts.is_empty()
  }
}

#[derive(Debug, thiserror::Error)]
pub enum ProvenanceError {
  #[error("version {version} of `{target}` is already recorded as produced by rule {existing}, not {incoming}")]
  ConflictingProducer {
    target: String,
    version: Version,
    existing: RuleKey,
    incoming: RuleKey,
  },

  #[error("failed to read provenance ledger {path}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to write provenance ledger {path}")]
  Write {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse provenance ledger {path}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("failed to serialize provenance ledger")]
  Serialize(#[source] serde_json::Error),

  #[error("provenance ledger {path} has format version {found}, expected {expected}")]
  UnsupportedVersion { path: PathBuf, found: u32, expected: u32 },
}

/// Query and update contract of the provenance ledger.
///
/// Implementations serialize their own writes; every method may be called
/// concurrently from many jobs.
pub trait ProvenanceStore: Send + Sync {
  /// Atomically upsert artifact rows and facts. Facts are keyed by
  /// (target, target version, source); re-recording one updates its source
  /// version. A different producing rule for an existing (target, version)
  /// rejects the whole batch.
  fn record(&self, batch: &FactBatch) -> Result<(), ProvenanceError>;

  /// Sources and their versions recorded for one version of a target.
  fn version_sources(
    &self,
    target: &ArtifactKey,
    version: &Version,
  ) -> Result<Vec<(ArtifactKey, Version)>, ProvenanceError>;

  /// Every source ever recorded for any output of `rule`.
  fn rule_sources(&self, rule: &RuleKey) -> Result<Vec<ArtifactKey>, ProvenanceError>;

  /// Every target ever recorded as produced by `rule`.
  fn rule_outputs(&self, rule: &RuleKey) -> Result<Vec<ArtifactKey>, ProvenanceError>;

  fn producer_of(&self, target: &ArtifactKey, version: &Version) -> Result<Option<RuleKey>, ProvenanceError>;

  /// All versions of `target` with recorded facts.
  fn recorded_versions(&self, target: &ArtifactKey) -> Result<Vec<Version>, ProvenanceError>;

  /// Drop every fact produced by `rule`. Returns the number of target versions removed.
  fn retract_rule(&self, rule: &RuleKey) -> Result<usize, ProvenanceError>;

  /// Drop every fact about `target`. Returns the number of target versions removed.
  fn retract_target(&self, target: &ArtifactKey) -> Result<usize, ProvenanceError>;

  fn artifact_row(&self, key: &ArtifactKey) -> Result<Option<ArtifactRow>, ProvenanceError>;

  /// Drop artifact rows no fact refers to. Returns the number removed.
  fn prune_artifacts(&self) -> Result<usize, ProvenanceError>;
}
