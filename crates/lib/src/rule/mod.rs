//! Rules and the dependency graph they form.
//!
//! A [`Rule`] maps declared dependencies to outputs through exactly one
//! recipe. Rules are assembled in a [`GraphBuilder`] and become immutable
//! once [`GraphBuilder::finalize`] produces a [`Graph`].

mod graph;

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub use graph::{Graph, GraphBuilder, GraphError};

use crate::artifact::{Artifact, ArtifactKey};
use crate::error::InternalError;
use crate::recipe::Recipe;
use crate::util::hash::key_hash;

/// Stable key of a rule: hash of its id string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleKey(pub String);

impl RuleKey {
  pub fn of(id: &str) -> Self {
    RuleKey(key_hash(&[id]))
  }
}

impl fmt::Display for RuleKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// What a missing dependency means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AbsencePolicy {
  /// A missing dependency fails the job.
  #[default]
  Violation,
  /// Absence is a recordable state; the job proceeds.
  RecordedState,
}

/// An artifact a rule reads, with what its absence means.
#[derive(Clone)]
pub struct Dependency {
  pub artifact: Arc<Artifact>,
  pub policy: AbsencePolicy,
}

impl Dependency {
  pub fn new(artifact: Arc<Artifact>, policy: AbsencePolicy) -> Self {
    Dependency { artifact, policy }
  }
}

impl fmt::Debug for Dependency {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} ({:?})", self.artifact, self.policy)
  }
}

/// How to produce a set of outputs from a set of dependencies.
pub struct Rule {
  module: String,
  name: String,
  id: String,
  key: RuleKey,
  outputs: IndexMap<ArtifactKey, Arc<Artifact>>,
  dependencies: IndexMap<ArtifactKey, Dependency>,
  after_refs: Vec<String>,
  also_refs: Vec<String>,
  after: Vec<RuleKey>,
  also: Vec<RuleKey>,
  always: bool,
  recipe: Option<Arc<dyn Recipe>>,
}

impl Rule {
  /// An empty rule; the module may be empty for the root module.
  pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
    let module = module.into();
    let name = name.into();
    let id = if module.is_empty() {
      name.clone()
    } else {
      format!("{module}+{name}")
    };
    let key = RuleKey::of(&id);
    Rule {
      module,
      name,
      id,
      key,
      outputs: IndexMap::new(),
      dependencies: IndexMap::new(),
      after_refs: Vec::new(),
      also_refs: Vec::new(),
      after: Vec::new(),
      also: Vec::new(),
      always: false,
      recipe: None,
    }
  }

  pub fn module(&self) -> &str {
    &self.module
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// `module+name`, or just `name` in the root module.
  pub fn id(&self) -> &str {
    &self.id
  }

  /// `RuleKey::of(id)`.
  pub fn key(&self) -> &RuleKey {
    &self.key
  }

  /// Declare an output. The first registration of a key wins.
  pub fn add_output(&mut self, artifact: Arc<Artifact>) {
    self.outputs.entry(artifact.key().clone()).or_insert(artifact);
  }

  /// Declare a dependency.
  ///
  /// An existing entry for the same artifact is replaced only when the new
  /// policy is [`AbsencePolicy::RecordedState`] or the existing one already was.
  pub fn add_dependency(&mut self, artifact: Arc<Artifact>, policy: AbsencePolicy) {
    let key = artifact.key().clone();
    match self.dependencies.get(&key) {
      Some(existing)
        if policy != AbsencePolicy::RecordedState && existing.policy != AbsencePolicy::RecordedState => {}
      _ => {
        self.dependencies.insert(key, Dependency::new(artifact, policy));
      }
    }
  }

  /// Order-only prerequisite: `rule` runs to completion first.
  pub fn add_after(&mut self, rule: impl Into<String>) {
    self.after_refs.push(rule.into());
  }

  /// Co-scheduled rule, started once this one has finished.
  pub fn add_also(&mut self, rule: impl Into<String>) {
    self.also_refs.push(rule.into());
  }

  pub fn set_always(&mut self, always: bool) {
    self.always = always;
  }

  /// Attach the recipe. A rule has exactly one.
  pub fn set_recipe(&mut self, recipe: Arc<dyn Recipe>) -> Result<(), InternalError> {
    if self.recipe.is_some() {
      return Err(InternalError::RecipeAlreadySet { rule: self.id.clone() });
    }
    self.recipe = Some(recipe);
    Ok(())
  }

  pub fn outputs(&self) -> impl Iterator<Item = &Arc<Artifact>> {
    self.outputs.values()
  }

  /// Whether `key` is a declared output.
  pub fn produces(&self, key: &ArtifactKey) -> bool {
    self.outputs.contains_key(key)
  }

  /// Declared dependencies in declaration order.
  pub fn dependencies(&self) -> impl Iterator<Item = &Dependency> {
    self.dependencies.values()
  }

  /// Resolved `after` rules. Empty until the graph is finalized.
  pub fn after(&self) -> &[RuleKey] {
    &self.after
  }

  /// Resolved `also` rules. Empty until the graph is finalized.
  pub fn also(&self) -> &[RuleKey] {
    &self.also
  }

  /// Whether the rule is rebuilt every session.
  pub fn always(&self) -> bool {
    self.always
  }

  pub fn recipe(&self) -> Option<&Arc<dyn Recipe>> {
    self.recipe.as_ref()
  }

  /// Reference of this rule's synthetic recipe artifact.
  pub fn recipe_reference(&self) -> String {
    format!("{}:{}", crate::consts::RECIPE_KIND, self.id)
  }
}

impl fmt::Debug for Rule {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Rule")
      .field("id", &self.id)
      .field("outputs", &self.outputs.len())
      .field("dependencies", &self.dependencies.len())
      .field("always", &self.always)
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::artifact::ArtifactManager;

  fn manager() -> ArtifactManager {
    ArtifactManager::with_defaults("/project").unwrap()
  }

  #[test]
  fn id_includes_module_when_present() {
    assert_eq!(Rule::new("", "app").id(), "app");
    assert_eq!(Rule::new("net", "compile").id(), "net+compile");
    assert_ne!(Rule::new("", "net+compile").key(), Rule::new("net", "other").key());
    assert_eq!(Rule::new("", "net+compile").key(), Rule::new("net", "compile").key());
  }

  #[test]
  fn dependency_replacement_rules() {
    let m = manager();
    let a = m.get("a.c").unwrap();
    let mut rule = Rule::new("", "r");

    rule.add_dependency(Arc::clone(&a), AbsencePolicy::Violation);
    rule.add_dependency(Arc::clone(&a), AbsencePolicy::Violation);
    assert_eq!(rule.dependencies().count(), 1);

    rule.add_dependency(Arc::clone(&a), AbsencePolicy::RecordedState);
    assert_eq!(rule.dependencies().next().unwrap().policy, AbsencePolicy::RecordedState);

    rule.add_dependency(Arc::clone(&a), AbsencePolicy::Violation);
    assert_eq!(rule.dependencies().next().unwrap().policy, AbsencePolicy::Violation);
  }

  #[test]
  fn first_output_registration_wins() {
    let m = manager();
    let mut rule = Rule::new("", "r");
    rule.add_output(m.get("out.o").unwrap());
    rule.add_output(m.get("./out.o").unwrap());
    assert_eq!(rule.outputs().count(), 1);
  }

  #[test]
  fn recipe_can_only_be_set_once() {
    let mut rule = Rule::new("", "r");
    rule.set_recipe(Arc::new(crate::recipe::ShellRecipe::new("true"))).unwrap();
    let err = rule.set_recipe(Arc::new(crate::recipe::ShellRecipe::new("true"))).unwrap_err();
    assert!(matches!(err, InternalError::RecipeAlreadySet { rule } if rule == "r"));
  }
}
