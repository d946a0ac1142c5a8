use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use super::{Recipe, RecipeSpec};
use crate::error::BuildError;
use crate::job::Job;

/// Sleeps, then runs the inner recipe.
#[derive(Debug, Clone)]
pub struct DelayRecipe {
  delay: Duration,
  inner: Arc<dyn Recipe>,
}

impl DelayRecipe {
  pub fn new(delay: Duration, inner: Arc<dyn Recipe>) -> Self {
    DelayRecipe { delay, inner }
  }
}

#[async_trait]
impl Recipe for DelayRecipe {
  async fn concretize_spec_for(&self, job: &Job) -> Result<RecipeSpec, BuildError> {
    let inner = self.inner.concretize_spec_for(job).await?;
    Ok(RecipeSpec::new(json!({
      "type": "delay",
      "millis": millis(self.delay),
      "inner": inner.0,
    })))
  }

  async fn execute_for(&self, job: &Job, spec: &RecipeSpec) -> Result<(), BuildError> {
    debug!(rule = %job.rule().id(), delay = ?self.delay, "delaying recipe");
    tokio::time::sleep(self.delay).await;
    self.inner.execute_for(job, &spec.part("/inner")?).await
  }
}

/// Whole milliseconds of `delay`, saturating at `u64::MAX`.
fn millis(delay: Duration) -> u64 {
  u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

/// Runs `before` recipes, the main recipe, then `after` recipes, in order.
/// The first failure stops the sequence.
#[derive(Debug, Clone)]
pub struct WrapRecipe {
  before: Vec<Arc<dyn Recipe>>,
  main: Arc<dyn Recipe>,
  after: Vec<Arc<dyn Recipe>>,
}

impl WrapRecipe {
  pub fn new(main: Arc<dyn Recipe>) -> Self {
    WrapRecipe {
      before: Vec::new(),
      main,
      after: Vec::new(),
    }
  }

  pub fn before(mut self, recipe: Arc<dyn Recipe>) -> Self {
    self.before.push(recipe);
    self
  }

  pub fn after(mut self, recipe: Arc<dyn Recipe>) -> Self {
    self.after.push(recipe);
    self
  }

  fn steps(&self) -> impl Iterator<Item = (String, &Arc<dyn Recipe>)> {
    let before = self.before.iter().enumerate().map(|(i, r)| (format!("/before/{i}"), r));
    let after = self.after.iter().enumerate().map(|(i, r)| (format!("/after/{i}"), r));
    before.chain(std::iter::once(("/main".to_string(), &self.main))).chain(after)
  }
}

#[async_trait]
impl Recipe for WrapRecipe {
  async fn concretize_spec_for(&self, job: &Job) -> Result<RecipeSpec, BuildError> {
    let mut before = Vec::with_capacity(self.before.len());
    for recipe in &self.before {
      before.push(recipe.concretize_spec_for(job).await?.0);
    }
    let main = self.main.concretize_spec_for(job).await?;
    let mut after = Vec::with_capacity(self.after.len());
    for recipe in &self.after {
      after.push(recipe.concretize_spec_for(job).await?.0);
    }
    Ok(RecipeSpec::new(json!({
      "type": "wrap",
      "before": before,
      "main": main.0,
      "after": after,
    })))
  }

  async fn execute_for(&self, job: &Job, spec: &RecipeSpec) -> Result<(), BuildError> {
    for (pointer, recipe) in self.steps() {
      recipe.execute_for(job, &spec.part(&pointer)?).await?;
    }
    Ok(())
  }
}
