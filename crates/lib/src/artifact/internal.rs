use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use super::{Aid, ArtifactBackend, ArtifactError, ArtifactFactory, Capabilities, Version};
use crate::consts::INTERNAL_KIND;
use crate::util::hash::hash_bytes;

/// Factory for `internal:` artifacts: named values living in this process.
#[derive(Debug, Default, Clone)]
pub struct InternalFactory;

impl ArtifactFactory for InternalFactory {
  fn normalize(&self, aid: Aid) -> Result<Aid, ArtifactError> {
    Ok(Aid {
      kind: Some(INTERNAL_KIND.to_string()),
      ..aid
    })
  }

  fn resolve(&self, aid: &Aid) -> Result<String, ArtifactError> {
    Ok(aid.identity())
  }

  fn create(&self, _aid: &Aid) -> Result<Arc<dyn ArtifactBackend>, ArtifactError> {
    Ok(Arc::new(InternalBackend::default()))
  }
}

/// In-memory value cell. Version is the SHA-256 of the current value.
#[derive(Debug, Default)]
pub struct InternalBackend {
  value: RwLock<Option<Vec<u8>>>,
}

impl InternalBackend {
  fn get(&self) -> Option<Vec<u8>> {
    self.value.read().unwrap_or_else(PoisonError::into_inner).clone()
  }

  fn set(&self, value: Option<Vec<u8>>) {
    *self.value.write().unwrap_or_else(PoisonError::into_inner) = value;
  }
}

#[async_trait]
impl ArtifactBackend for InternalBackend {
  async fn version(&self) -> Result<Version, ArtifactError> {
    Ok(match self.get() {
      Some(value) => Version::new(hash_bytes(&value).0),
      None => Version::nonexistent(),
    })
  }

  async fn remove(&self) -> Result<(), ArtifactError> {
    self.set(None);
    Ok(())
  }

  async fn write(&self, content: &[u8]) -> Result<(), ArtifactError> {
    self.set(Some(content.to_vec()));
    Ok(())
  }

  async fn read(&self) -> Result<Option<Vec<u8>>, ArtifactError> {
    Ok(self.get())
  }

  fn capabilities(&self) -> Capabilities {
    Capabilities {
      can_write: true,
      can_remove: true,
      can_build: true,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn value_cell_versions() {
    let cell = InternalBackend::default();
    assert!(!cell.exists().await.unwrap());

    cell.write(b"a").await.unwrap();
    let a = cell.version().await.unwrap();
    cell.write(b"b").await.unwrap();
    assert_ne!(a, cell.version().await.unwrap());
    cell.write(b"a").await.unwrap();
    assert_eq!(a, cell.version().await.unwrap());

    cell.remove().await.unwrap();
    assert_eq!(cell.read().await.unwrap(), None);
  }
}
