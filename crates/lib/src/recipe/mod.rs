//! Recipes: how a rule turns its dependencies into its outputs.
//!
//! A recipe first concretizes a [`RecipeSpec`] for a job, a JSON document
//! holding everything that determines what the recipe will do (the rendered
//! command, its environment, nested recipe specs). The hash of that spec is
//! the version of the rule's `recipe:` artifact, so editing a recipe makes its
//! rule stale exactly like editing an input does.

mod shell;
mod wrap;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use shell::ShellRecipe;
pub use wrap::{DelayRecipe, WrapRecipe};

use crate::artifact::Version;
use crate::error::{BuildError, InternalError};
use crate::job::Job;
use crate::util::hash::json_hash;

/// The concrete description of one recipe invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecipeSpec(pub serde_json::Value);

impl RecipeSpec {
  pub fn new(value: serde_json::Value) -> Self {
    RecipeSpec(value)
  }

  pub fn value(&self) -> &serde_json::Value {
    &self.0
  }

  /// The nested spec at a JSON pointer, e.g. `/before/0`.
  pub fn part(&self, pointer: &str) -> Result<RecipeSpec, BuildError> {
    self
      .0
      .pointer(pointer)
      .cloned()
      .map(RecipeSpec)
      .ok_or_else(|| InternalError::MalformedSpec(format!("missing `{pointer}` in {}", self.0)).into())
  }

  pub fn str_field(&self, field: &str) -> Result<&str, BuildError> {
    self
      .0
      .get(field)
      .and_then(|v| v.as_str())
      .ok_or_else(|| InternalError::MalformedSpec(format!("missing string field `{field}` in {}", self.0)).into())
  }
}

#[async_trait]
pub trait Recipe: Send + Sync + fmt::Debug {
  /// Describe what this recipe will do for `job`. Must not touch any artifact;
  /// the job memoizes the result.
  async fn concretize_spec_for(&self, job: &Job) -> Result<RecipeSpec, BuildError>;

  /// Stable fingerprint of a spec.
  fn hash_spec(&self, spec: &RecipeSpec) -> Version {
    Version::new(json_hash(spec.value()).0)
  }

  /// Run the recipe. May register dynamic outputs and dependencies on `job`.
  async fn execute_for(&self, job: &Job, spec: &RecipeSpec) -> Result<(), BuildError>;
}
