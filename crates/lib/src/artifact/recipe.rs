use std::sync::Arc;

use async_trait::async_trait;

use super::{Aid, ArtifactBackend, ArtifactError, ArtifactFactory, Capabilities, Version};
use crate::consts::RECIPE_KIND;

/// Factory for the synthetic `recipe:<rule id>` artifacts.
#[derive(Debug, Default, Clone)]
pub struct RecipeFactory;

impl ArtifactFactory for RecipeFactory {
  fn normalize(&self, aid: Aid) -> Result<Aid, ArtifactError> {
    Ok(Aid {
      kind: Some(RECIPE_KIND.to_string()),
      ..aid
    })
  }

  fn resolve(&self, aid: &Aid) -> Result<String, ArtifactError> {
    Ok(aid.identity())
  }

  fn create(&self, _aid: &Aid) -> Result<Arc<dyn ArtifactBackend>, ArtifactError> {
    Ok(Arc::new(RecipeBackend))
  }
}

/// Backend of a rule's recipe artifact.
///
/// A recipe's version depends on the job that concretizes it, so it is held
/// by that job (see `Job::recipe_version`). Outside a job the artifact reads
/// as nonexistent.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecipeBackend;

#[async_trait]
impl ArtifactBackend for RecipeBackend {
  async fn version(&self) -> Result<Version, ArtifactError> {
    Ok(Version::nonexistent())
  }

  async fn remove(&self) -> Result<(), ArtifactError> {
    Err(ArtifactError::Unsupported {
      artifact: RECIPE_KIND.to_string(),
      operation: "removal",
    })
  }

  async fn write(&self, _content: &[u8]) -> Result<(), ArtifactError> {
    Err(ArtifactError::Unsupported {
      artifact: RECIPE_KIND.to_string(),
      operation: "writing",
    })
  }

  async fn read(&self) -> Result<Option<Vec<u8>>, ArtifactError> {
    Ok(None)
  }

  fn capabilities(&self) -> Capabilities {
    Capabilities::default()
  }
}
