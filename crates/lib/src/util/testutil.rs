//! Recipes and fixtures for unit tests of the build engine.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::json;

use crate::artifact::{Artifact, ArtifactManager};
use crate::error::BuildError;
use crate::job::Job;
use crate::recipe::{Recipe, RecipeSpec};
use crate::rule::{AbsencePolicy, Rule};

/// Writes `tag` followed by the contents of every declared input to every
/// declared output, counting its runs.
#[derive(Debug, Default)]
pub struct ConcatRecipe {
  tag: String,
  runs: AtomicUsize,
}

impl ConcatRecipe {
  pub fn new(tag: &str) -> Arc<Self> {
    Arc::new(ConcatRecipe {
      tag: tag.to_string(),
      runs: AtomicUsize::new(0),
    })
  }

  pub fn runs(&self) -> usize {
    self.runs.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl Recipe for ConcatRecipe {
  async fn concretize_spec_for(&self, job: &Job) -> Result<RecipeSpec, BuildError> {
    let rule = job.rule();
    Ok(RecipeSpec::new(json!({
      "type": "concat",
      "tag": self.tag,
      "inputs": rule.dependencies().map(|d| d.artifact.reference()).collect::<Vec<_>>(),
      "outputs": rule.outputs().map(|a| a.reference()).collect::<Vec<_>>(),
    })))
  }

  async fn execute_for(&self, job: &Job, _spec: &RecipeSpec) -> Result<(), BuildError> {
    self.runs.fetch_add(1, Ordering::SeqCst);
    let mut content = self.tag.clone().into_bytes();
    for dep in job.rule().dependencies() {
      content.extend(dep.artifact.read().await?.unwrap_or_default());
    }
    for output in job.rule().outputs() {
      output.write(&content).await?;
    }
    Ok(())
  }
}

/// Overwrites `target` with `content`, optionally declaring it as a dynamic
/// output of the running job.
#[derive(Debug)]
pub struct OverwriteRecipe {
  pub target: Arc<Artifact>,
  pub content: Vec<u8>,
  pub declare: bool,
}

#[async_trait]
impl Recipe for OverwriteRecipe {
  async fn concretize_spec_for(&self, _job: &Job) -> Result<RecipeSpec, BuildError> {
    Ok(RecipeSpec::new(json!({
      "type": "overwrite",
      "target": self.target.reference(),
      "content": String::from_utf8_lossy(&self.content),
      "declare": self.declare,
    })))
  }

  async fn execute_for(&self, job: &Job, _spec: &RecipeSpec) -> Result<(), BuildError> {
    self.target.write(&self.content).await?;
    if self.declare {
      job.add_dynamic_output(Arc::clone(&self.target));
    }
    Ok(())
  }
}

/// A rule in the root module with internal inputs and outputs.
pub fn rule(manager: &ArtifactManager, name: &str, inputs: &[&str], outputs: &[&str], recipe: Arc<dyn Recipe>) -> Rule {
  let mut rule = Rule::new("", name);
  for input in inputs {
    rule.add_dependency(internal(manager, input), AbsencePolicy::Violation);
  }
  for output in outputs {
    rule.add_output(internal(manager, output));
  }
  rule.set_recipe(recipe).unwrap();
  rule
}

pub fn internal(manager: &ArtifactManager, name: &str) -> Arc<Artifact> {
  manager.get(&format!("internal:{name}")).unwrap()
}
