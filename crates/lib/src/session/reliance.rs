use std::collections::{BTreeMap, BTreeSet};

use dashmap::DashMap;

use crate::artifact::{Artifact, ArtifactKey, Version};
use crate::error::BuildError;
use crate::rule::{Rule, RuleKey};

/// Which rules relied on which version of an artifact during one session.
#[derive(Debug, Default)]
pub struct RelianceTable {
  by_artifact: DashMap<ArtifactKey, BTreeMap<Version, BTreeSet<String>>>,
  by_rule: DashMap<(RuleKey, ArtifactKey), Version>,
}

impl RelianceTable {
  /// Note that `rule` observed `version` of `artifact`.
  ///
  /// Fails when another rule already relied on a different version.
  pub fn record(&self, rule: &Rule, artifact: &Artifact, version: &Version) -> Result<(), BuildError> {
    let mut versions = self.by_artifact.entry(artifact.key().clone()).or_default();
    let conflict = versions
      .iter()
      .any(|(v, rules)| v != version && rules.iter().any(|r| r != rule.id()));
    if conflict {
      let mut relied: Vec<(Version, Vec<String>)> = versions
        .iter()
        .map(|(v, rules)| (v.clone(), rules.iter().cloned().collect()))
        .collect();
      match relied.iter_mut().find(|(v, _)| v == version) {
        Some((_, rules)) => rules.push(rule.id().to_string()),
        None => relied.push((version.clone(), vec![rule.id().to_string()])),
      }
      return Err(BuildError::RelianceConflict {
        artifact: artifact.to_string(),
        relied,
      });
    }
    versions.entry(version.clone()).or_default().insert(rule.id().to_string());
    drop(versions);

    self
      .by_rule
      .insert((rule.key().clone(), artifact.key().clone()), version.clone());
    Ok(())
  }

  /// The version `rule` relied upon for `artifact` in this session.
  pub fn relied_version(&self, rule: &RuleKey, artifact: &ArtifactKey) -> Option<Version> {
    self
      .by_rule
      .get(&(rule.clone(), artifact.clone()))
      .map(|v| v.value().clone())
  }

  /// Every version of `artifact` relied upon so far, with the relying rule ids.
  pub fn reliers(&self, artifact: &ArtifactKey) -> BTreeMap<Version, BTreeSet<String>> {
    self
      .by_artifact
      .get(artifact)
      .map(|v| v.value().clone())
      .unwrap_or_default()
  }
}
