//! Build failures and their cause chains.
//!
//! [`BuildError`] is what a rule (or a whole build request) fails with.
//! Failures of prerequisite rules are wrapped in [`BuildError::RuleFailed`]
//! so the chain reads from the requested rule down to the root cause:
//!
//! ```text
//! `app` failed to build
//! because `lib` failed to build
//! because No rule to build required `file:lib/missing.c`
//! ```
//!
//! [`InternalError`] marks logic bugs in the engine or its callers. It is
//! never downgraded or retried.

use std::error::Error as _;
use std::sync::Arc;

use crate::artifact::{ArtifactError, Version};
use crate::provenance::ProvenanceError;
use crate::rule::GraphError;

/// Logic bugs. Never user errors.
#[derive(Debug, thiserror::Error)]
pub enum InternalError {
  #[error("rule `{rule}` already has a recipe")]
  RecipeAlreadySet { rule: String },

  #[error("`{artifact}` is both declared and recorded with conflicting absence policies")]
  ConflictingPolicies { artifact: String },

  #[error("a different job for rule `{rule}` is already in this job set")]
  DuplicateJob { rule: String },

  #[error("rule key `{key}` is referenced but not part of the graph")]
  UnknownRuleKey { key: String },

  #[error("no reliance recorded for `{artifact}` by `{rule}`")]
  MissingReliance { rule: String, artifact: String },

  #[error("the build session was dropped while `{rule}` was running")]
  SessionDropped { rule: String },

  #[error("recipe of `{rule}` was used before it was concretized")]
  RecipeNotConcretized { rule: String },

  #[error("the job permit pool was closed")]
  PermitsClosed,

  #[error("malformed recipe spec: {0}")]
  MalformedSpec(String),
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
  #[error("`{rule}` failed to build")]
  RuleFailed {
    rule: String,
    #[source]
    cause: Arc<BuildError>,
  },

  /// A failure shared from another job; renders as the failure itself.
  #[error(transparent)]
  Prerequisite(Arc<BuildError>),

  #[error("No rule named `{rule}`")]
  UnknownRule { rule: String },

  #[error("No rule to build required `{artifact}`")]
  NoRuleToBuild { artifact: String },

  #[error("`{producer}` did not create required `{artifact}`")]
  NotCreated { producer: String, artifact: String },

  #[error("Build conflict: `{artifact}` was relied upon at different versions ({})", describe_reliers(.relied))]
  RelianceConflict {
    artifact: String,
    relied: Vec<(Version, Vec<String>)>,
  },

  #[error(
    "`{rule}` rewrote `{artifact}` to version {version} after it was used ({})",
    describe_reliers(.stale)
  )]
  RewriteAfterUse {
    rule: String,
    artifact: String,
    version: Version,
    stale: Vec<(Version, Vec<String>)>,
  },

  #[error("dependency cycle detected: {}", .path.join(" -> "))]
  Cycle { path: Vec<String> },

  #[error("command `{command}` exited with status {code}")]
  RecipeExit { command: String, code: i32 },

  #[error("command `{command}` was terminated by signal {signal}")]
  RecipeSignal { command: String, signal: i32 },

  #[error("recipe failed: {0}")]
  Recipe(String),

  #[error(transparent)]
  Artifact(#[from] ArtifactError),

  #[error(transparent)]
  Provenance(#[from] ProvenanceError),

  #[error(transparent)]
  Graph(#[from] GraphError),

  #[error("I/O error while {context}")]
  Io {
    context: String,
    #[source]
    source: std::io::Error,
  },

  #[error("internal error: {0}")]
  Internal(#[from] InternalError),
}

fn describe_reliers(relied: &[(Version, Vec<String>)]) -> String {
  relied
    .iter()
    .map(|(version, rules)| {
      let rules: Vec<String> = rules.iter().map(|r| format!("`{r}`")).collect();
      format!("version {version} by {}", rules.join(", "))
    })
    .collect::<Vec<_>>()
    .join("; ")
}

impl BuildError {
  /// Render the whole cause chain, one cause per line.
  pub fn trace(&self) -> String {
    let mut out = self.to_string();
    let mut source = self.source();
    while let Some(err) = source {
      out.push_str("\nbecause ");
      out.push_str(&err.to_string());
      source = err.source();
    }
    out
  }

  /// Whether an [`InternalError`] appears anywhere in the chain.
  pub fn is_internal(&self) -> bool {
    match self {
      BuildError::Internal(_) => true,
      BuildError::RuleFailed { cause, .. } => cause.is_internal(),
      BuildError::Prerequisite(inner) => inner.is_internal(),
      _ => false,
    }
  }

  /// Wrap `self` as the failure of `rule`, unwrapping shared prerequisite
  /// failures so they are not counted twice in the chain.
  pub fn in_rule(self, rule: &str) -> BuildError {
    let cause = match self {
      BuildError::Prerequisite(shared) => shared,
      other => Arc::new(other),
    };
    BuildError::RuleFailed {
      rule: rule.to_string(),
      cause,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn trace_walks_rule_chain() {
    let root = BuildError::NoRuleToBuild {
      artifact: "file:lib/missing.c".into(),
    };
    let lib = root.in_rule("lib");
    let app = BuildError::Prerequisite(Arc::new(lib)).in_rule("app");
    assert_eq!(
      app.trace(),
      "`app` failed to build\nbecause `lib` failed to build\nbecause No rule to build required `file:lib/missing.c`"
    );
  }

  #[test]
  fn internal_errors_are_found_through_the_chain() {
    let err = BuildError::from(InternalError::PermitsClosed).in_rule("a").in_rule("b");
    assert!(err.is_internal());
    assert!(!BuildError::Recipe("boom".into()).in_rule("a").is_internal());
  }

  #[test]
  fn conflict_names_every_version_and_rule() {
    let err = BuildError::RelianceConflict {
      artifact: "internal:x".into(),
      relied: vec![
        (Version::new("v1"), vec!["a".into()]),
        (Version::new("v2"), vec!["b".into(), "c".into()]),
      ],
    };
    let message = err.to_string();
    assert!(message.contains("version v1 by `a`"), "{message}");
    assert!(message.contains("version v2 by `b`, `c`"), "{message}");
  }
}
