use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use super::{Aid, ArtifactBackend, ArtifactError, ArtifactFactory, Capabilities, Version};
use crate::consts::FILE_KIND;
use crate::util::hash::{hash_directory, hash_file};

/// Maps `file:` references onto paths under a project root.
///
/// Module `a.b` lives in directory `<root>/a/b`.
#[derive(Debug, Clone)]
pub struct FileFactory {
  root: PathBuf,
}

impl FileFactory {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    FileFactory { root: root.into() }
  }

  fn path_for(&self, aid: &Aid) -> PathBuf {
    let reference = Path::new(&aid.reference);
    if reference.is_absolute() {
      return reference.to_path_buf();
    }
    let mut path = self.root.clone();
    if let Some(module) = &aid.module {
      path.extend(module.split('.'));
    }
    path.join(reference)
  }
}

/// Lexically clean a relative path, rejecting anything that climbs above its base.
fn clean_reference(input: &str, reference: &str) -> Result<String, ArtifactError> {
  let absolute = Path::new(reference).is_absolute();
  let mut parts: Vec<String> = Vec::new();
  for component in Path::new(reference).components() {
    match component {
      Component::CurDir => {}
      Component::ParentDir => {
        if parts.pop().is_none() {
          return Err(ArtifactError::InvalidReference {
            input: input.to_string(),
            reason: "path escapes its module root".to_string(),
          });
        }
      }
      Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
      Component::RootDir | Component::Prefix(_) => {}
    }
  }
  if parts.is_empty() {
    return Err(ArtifactError::InvalidReference {
      input: input.to_string(),
      reason: "path names no file".to_string(),
    });
  }
  let joined = parts.join("/");
  if !absolute {
    return Ok(joined);
  }
  // Keep the original root/prefix of absolute paths untouched.
  let root: PathBuf = Path::new(reference)
    .components()
    .take_while(|c| matches!(c, Component::RootDir | Component::Prefix(_)))
    .collect();
  Ok(root.join(joined).to_string_lossy().into_owned())
}

impl ArtifactFactory for FileFactory {
  fn normalize(&self, aid: Aid) -> Result<Aid, ArtifactError> {
    let input = aid.to_string();
    let reference = clean_reference(&input, &aid.reference.replace('\\', "/"))?;
    Ok(Aid {
      kind: Some(FILE_KIND.to_string()),
      module: aid.module,
      reference,
    })
  }

  fn resolve(&self, aid: &Aid) -> Result<String, ArtifactError> {
    Ok(self.path_for(aid).to_string_lossy().into_owned())
  }

  fn create(&self, aid: &Aid) -> Result<Arc<dyn ArtifactBackend>, ArtifactError> {
    Ok(Arc::new(FileBackend::new(self.path_for(aid))))
  }
}

/// A file or directory on disk. Version is the SHA-256 of its content.
#[derive(Debug)]
pub struct FileBackend {
  path: PathBuf,
}

impl FileBackend {
  pub fn new(path: PathBuf) -> Self {
    FileBackend { path }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  fn io_error(&self, operation: &'static str, source: std::io::Error) -> ArtifactError {
    ArtifactError::Io {
      artifact: self.path.display().to_string(),
      operation,
      source,
    }
  }
}

#[async_trait]
impl ArtifactBackend for FileBackend {
  async fn version(&self) -> Result<Version, ArtifactError> {
    let path = self.path.clone();
    let artifact = path.display().to_string();
    let hashed = tokio::task::spawn_blocking(move || {
      let meta = match std::fs::metadata(&path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => {
          return Err(ArtifactError::Io {
            artifact: path.display().to_string(),
            operation: "stat",
            source: e,
          });
        }
      };
      let hash = if meta.is_dir() {
        hash_directory(&path)
      } else {
        hash_file(&path)
      };
      hash.map(Some).map_err(|source| ArtifactError::Fingerprint {
        artifact: path.display().to_string(),
        source,
      })
    })
    .await
    .map_err(|e| ArtifactError::Task {
      artifact,
      message: e.to_string(),
    })??;

    Ok(match hashed {
      Some(hash) => Version::new(hash.0),
      None => Version::nonexistent(),
    })
  }

  async fn exists(&self) -> Result<bool, ArtifactError> {
    tokio::fs::try_exists(&self.path)
      .await
      .map_err(|e| self.io_error("stat", e))
  }

  async fn remove(&self) -> Result<(), ArtifactError> {
    let meta = match tokio::fs::symlink_metadata(&self.path).await {
      Ok(meta) => meta,
      Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
      Err(e) => return Err(self.io_error("stat", e)),
    };
    let result = if meta.is_dir() {
      tokio::fs::remove_dir_all(&self.path).await
    } else {
      tokio::fs::remove_file(&self.path).await
    };
    match result {
      Err(e) if e.kind() != ErrorKind::NotFound => Err(self.io_error("remove", e)),
      _ => Ok(()),
    }
  }

  async fn write(&self, content: &[u8]) -> Result<(), ArtifactError> {
    if let Some(parent) = self.path.parent() {
      tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| self.io_error("create parent of", e))?;
    }
    tokio::fs::write(&self.path, content)
      .await
      .map_err(|e| self.io_error("write", e))
  }

  async fn read(&self) -> Result<Option<Vec<u8>>, ArtifactError> {
    match tokio::fs::read(&self.path).await {
      Ok(bytes) => Ok(Some(bytes)),
      Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
      Err(e) => Err(self.io_error("read", e)),
    }
  }

  fn capabilities(&self) -> Capabilities {
    Capabilities {
      can_write: true,
      can_remove: true,
      can_build: true,
    }
  }
}
