use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::{ArtifactRow, FactBatch, ProvenanceError};
use crate::artifact::{ArtifactKey, Version};
use crate::consts::PROVENANCE_FORMAT_VERSION;
use crate::rule::RuleKey;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Production {
  rule: RuleKey,
  sources: BTreeMap<ArtifactKey, Version>,
}

/// In-memory image of the provenance tables.
///
/// `productions` is indexed target → target version → producing rule and its
/// sources; this is also the on-disk layout of [`super::FileProvenance`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ledger {
  pub version: u32,
  artifacts: BTreeMap<ArtifactKey, ArtifactRow>,
  productions: BTreeMap<ArtifactKey, BTreeMap<Version, Production>>,
}

impl Default for Ledger {
  fn default() -> Self {
    Ledger {
      version: PROVENANCE_FORMAT_VERSION,
      artifacts: BTreeMap::new(),
      productions: BTreeMap::new(),
    }
  }
}

impl Ledger {
  /// Validate a batch against the current tables and apply it. On error the
  /// ledger is left untouched.
  pub fn apply(&mut self, batch: &FactBatch) -> Result<(), ProvenanceError> {
    let mut incoming: BTreeMap<(&ArtifactKey, &Version), &RuleKey> = BTreeMap::new();
    for fact in &batch.facts {
      let slot = (&fact.target, &fact.target_version);
      let existing = incoming.get(&slot).copied().or_else(|| {
        self
          .productions
          .get(&fact.target)
          .and_then(|versions| versions.get(&fact.target_version))
          .map(|p| &p.rule)
      });
      if let Some(existing) = existing
        && existing != &fact.rule
      {
        return Err(ProvenanceError::ConflictingProducer {
          target: self.describe(&fact.target, batch),
          version: fact.target_version.clone(),
          existing: existing.clone(),
          incoming: fact.rule.clone(),
        });
      }
      incoming.insert(slot, &fact.rule);
    }

    for (key, row) in &batch.artifacts {
      self.artifacts.insert(key.clone(), row.clone());
    }
    for fact in &batch.facts {
      let production = self
        .productions
        .entry(fact.target.clone())
        .or_default()
        .entry(fact.target_version.clone())
        .or_insert_with(|| Production {
          rule: fact.rule.clone(),
          sources: BTreeMap::new(),
        });
      production.sources.insert(fact.source.clone(), fact.source_version.clone());
    }
    Ok(())
  }

  fn describe(&self, key: &ArtifactKey, batch: &FactBatch) -> String {
    batch
      .artifacts
      .get(key)
      .or_else(|| self.artifacts.get(key))
      .map(ArtifactRow::reference)
      .unwrap_or_else(|| key.to_string())
  }

  pub fn version_sources(&self, target: &ArtifactKey, version: &Version) -> Vec<(ArtifactKey, Version)> {
    self
      .production(target, version)
      .map(|p| p.sources.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
      .unwrap_or_default()
  }

  pub fn rule_sources(&self, rule: &RuleKey) -> Vec<ArtifactKey> {
    let sources: BTreeSet<&ArtifactKey> = self
      .productions_of(rule)
      .flat_map(|(_, p)| p.sources.keys())
      .collect();
    sources.into_iter().cloned().collect()
  }

  pub fn rule_outputs(&self, rule: &RuleKey) -> Vec<ArtifactKey> {
    let targets: BTreeSet<&ArtifactKey> = self.productions_of(rule).map(|(target, _)| target).collect();
    targets.into_iter().cloned().collect()
  }

  pub fn producer_of(&self, target: &ArtifactKey, version: &Version) -> Option<RuleKey> {
    self.production(target, version).map(|p| p.rule.clone())
  }

  pub fn recorded_versions(&self, target: &ArtifactKey) -> Vec<Version> {
    self
      .productions
      .get(target)
      .map(|versions| versions.keys().cloned().collect())
      .unwrap_or_default()
  }

  pub fn retract_rule(&mut self, rule: &RuleKey) -> usize {
    let mut removed = 0;
    self.productions.retain(|_, versions| {
      let before = versions.len();
      versions.retain(|_, p| &p.rule != rule);
      removed += before - versions.len();
      !versions.is_empty()
    });
    removed
  }

  pub fn retract_target(&mut self, target: &ArtifactKey) -> usize {
    self.productions.remove(target).map(|versions| versions.len()).unwrap_or(0)
  }

  pub fn artifact_row(&self, key: &ArtifactKey) -> Option<ArtifactRow> {
    self.artifacts.get(key).cloned()
  }

  pub fn prune_artifacts(&mut self) -> usize {
    let mut referenced: BTreeSet<ArtifactKey> = BTreeSet::new();
    for (target, versions) in &self.productions {
      referenced.insert(target.clone());
      for production in versions.values() {
        referenced.extend(production.sources.keys().cloned());
      }
    }
    let before = self.artifacts.len();
    self.artifacts.retain(|key, _| referenced.contains(key));
    before - self.artifacts.len()
  }

  fn production(&self, target: &ArtifactKey, version: &Version) -> Option<&Production> {
    self.productions.get(target).and_then(|versions| versions.get(version))
  }

  fn productions_of<'a>(&'a self, rule: &'a RuleKey) -> impl Iterator<Item = (&'a ArtifactKey, &'a Production)> + 'a {
    self.productions.iter().flat_map(move |(target, versions)| {
      versions
        .values()
        .filter(move |p| &p.rule == rule)
        .map(move |p| (target, p))
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::provenance::Fact;

  fn key(name: &str) -> ArtifactKey {
    ArtifactKey::of("internal", name)
  }

  fn fact(target: &str, tv: &str, rule: &str, source: &str, sv: &str) -> Fact {
    Fact {
      target: key(target),
      target_version: Version::new(tv),
      rule: RuleKey::of(rule),
      source: key(source),
      source_version: Version::new(sv),
    }
  }

  fn batch(facts: Vec<Fact>) -> FactBatch {
    let mut batch = FactBatch::default();
    for f in &facts {
      for (k, name) in [(&f.target, "t"), (&f.source, "s")] {
        batch.artifacts.insert(
          k.clone(),
          ArtifactRow {
            kind: "internal".into(),
            identity: format!("{name}-{k}"),
          },
        );
      }
    }
    batch.facts = facts;
    batch
  }

  #[test]
  fn records_and_queries_sources() {
    let mut ledger = Ledger::default();
    ledger
      .apply(&batch(vec![fact("o", "1", "r", "a", "x"), fact("o", "1", "r", "b", "y")]))
      .unwrap();

    let sources = ledger.version_sources(&key("o"), &Version::new("1"));
    assert_eq!(sources.len(), 2);
    assert!(sources.contains(&(key("a"), Version::new("x"))));
    assert_eq!(ledger.producer_of(&key("o"), &Version::new("1")), Some(RuleKey::of("r")));
    assert_eq!(ledger.producer_of(&key("o"), &Version::new("2")), None);
    assert_eq!(ledger.rule_outputs(&RuleKey::of("r")), vec![key("o")]);
    assert_eq!(ledger.rule_sources(&RuleKey::of("r")).len(), 2);
  }

  #[test]
  fn upsert_updates_source_version() {
    let mut ledger = Ledger::default();
    ledger.apply(&batch(vec![fact("o", "1", "r", "a", "x")])).unwrap();
    ledger.apply(&batch(vec![fact("o", "1", "r", "a", "z")])).unwrap();
    assert_eq!(
      ledger.version_sources(&key("o"), &Version::new("1")),
      vec![(key("a"), Version::new("z"))]
    );
  }

  #[test]
  fn conflicting_producer_rejects_whole_batch() {
    let mut ledger = Ledger::default();
    ledger.apply(&batch(vec![fact("o", "1", "r", "a", "x")])).unwrap();
    let snapshot = ledger.clone();

    let err = ledger
      .apply(&batch(vec![fact("p", "1", "q", "a", "x"), fact("o", "1", "q", "a", "x")]))
      .unwrap_err();
    assert!(matches!(err, ProvenanceError::ConflictingProducer { .. }));
    assert_eq!(ledger, snapshot);

    let err = Ledger::default()
      .apply(&batch(vec![fact("o", "1", "r", "a", "x"), fact("o", "1", "q", "a", "x")]))
      .unwrap_err();
    assert!(matches!(err, ProvenanceError::ConflictingProducer { .. }));
  }

  #[test]
  fn retraction_and_pruning() {
    let mut ledger = Ledger::default();
    ledger
      .apply(&batch(vec![
        fact("o", "1", "r", "a", "x"),
        fact("o", "2", "r", "a", "y"),
        fact("p", "1", "q", "o", "1"),
      ]))
      .unwrap();

    assert_eq!(ledger.recorded_versions(&key("o")).len(), 2);
    assert_eq!(ledger.retract_rule(&RuleKey::of("r")), 2);
    assert!(ledger.rule_outputs(&RuleKey::of("r")).is_empty());
    assert!(ledger.version_sources(&key("o"), &Version::new("1")).is_empty());

    // `a` is no longer referenced; `o` still is, as a source of `p`.
    assert_eq!(ledger.prune_artifacts(), 1);
    assert!(ledger.artifact_row(&key("a")).is_none());
    assert!(ledger.artifact_row(&key("o")).is_some());

    assert_eq!(ledger.retract_target(&key("p")), 1);
    assert_eq!(ledger.prune_artifacts(), 2);
  }
}
