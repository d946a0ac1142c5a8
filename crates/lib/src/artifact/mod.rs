//! Artifact identity, versioning and interning.
//!
//! An [`Artifact`] is anything a rule can consume or produce: a file, an
//! in-process value, or the synthetic recipe artifact every rule depends on.
//! Artifacts are identified by `(kind, identity)` and keyed by a truncated
//! hash of that pair. Their version is a live content fingerprint queried from
//! the backing [`ArtifactBackend`] on every call.

mod aid;
mod file;
mod internal;
mod manager;
mod recipe;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use aid::Aid;
pub use file::{FileBackend, FileFactory};
pub use internal::{InternalBackend, InternalFactory};
pub use manager::{ArtifactFactory, ArtifactManager};
pub use recipe::{RecipeBackend, RecipeFactory};

use crate::util::hash::key_hash;

/// Stable, content-independent key of an artifact: `hash(kind, identity)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactKey(pub String);

impl ArtifactKey {
  pub fn of(kind: &str, identity: &str) -> Self {
    ArtifactKey(key_hash(&[kind, identity]))
  }
}

impl fmt::Display for ArtifactKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

const NONEXISTENT: &str = "<nonexistent>";

/// Content fingerprint of an artifact at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(String);

impl Version {
  pub fn new(fingerprint: impl Into<String>) -> Self {
    Version(fingerprint.into())
  }

  /// Sentinel reported for artifacts that do not currently exist.
  pub fn nonexistent() -> Self {
    Version(NONEXISTENT.to_string())
  }

  /// Whether this is the version of an artifact that does not exist.
  pub fn is_nonexistent(&self) -> bool {
    self.0 == NONEXISTENT
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for Version {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
  /// Recipes may write the artifact.
  pub can_write: bool,
  /// Stale outputs may be removed before a rebuild.
  pub can_remove: bool,
  /// Whether rules may declare this artifact as an output.
  pub can_build: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
  #[error("invalid artifact reference `{input}`: {reason}")]
  InvalidReference { input: String, reason: String },

  #[error("no artifact factory registered for type `{kind}`")]
  UnknownKind { kind: String },

  #[error("artifact factory for type `{kind}` is already registered")]
  DuplicateFactory { kind: String },

  #[error("`{artifact}` does not support {operation}")]
  Unsupported { artifact: String, operation: &'static str },

  #[error("failed to {operation} `{artifact}`")]
  Io {
    artifact: String,
    operation: &'static str,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to fingerprint `{artifact}`")]
  Fingerprint {
    artifact: String,
    #[source]
    source: crate::util::hash::ContentHashError,
  },

  #[error("background task for `{artifact}` failed: {message}")]
  Task { artifact: String, message: String },
}

/// Storage behind one artifact kind.
///
/// Backends never cache versions; every call observes the current state.
#[async_trait]
pub trait ArtifactBackend: Send + Sync + fmt::Debug {
  async fn version(&self) -> Result<Version, ArtifactError>;

  async fn exists(&self) -> Result<bool, ArtifactError> {
    Ok(!self.version().await?.is_nonexistent())
  }

  async fn remove(&self) -> Result<(), ArtifactError>;

  async fn write(&self, content: &[u8]) -> Result<(), ArtifactError>;

  async fn read(&self) -> Result<Option<Vec<u8>>, ArtifactError>;

  fn capabilities(&self) -> Capabilities;
}

/// An interned artifact. Obtain through [`ArtifactManager::get`].
pub struct Artifact {
  kind: String,
  identity: String,
  key: ArtifactKey,
  backend: Arc<dyn ArtifactBackend>,
}

impl Artifact {
  pub fn new(kind: impl Into<String>, identity: impl Into<String>, backend: Arc<dyn ArtifactBackend>) -> Self {
    let kind = kind.into();
    let identity = identity.into();
    let key = ArtifactKey::of(&kind, &identity);
    Artifact {
      kind,
      identity,
      key,
      backend,
    }
  }

  pub fn kind(&self) -> &str {
    &self.kind
  }

  pub fn identity(&self) -> &str {
    &self.identity
  }

  pub fn key(&self) -> &ArtifactKey {
    &self.key
  }

  /// Fully qualified reference (`kind:identity`) that re-parses to this artifact.
  pub fn reference(&self) -> String {
    format!("{}:{}", self.kind, self.identity)
  }

  pub fn capabilities(&self) -> Capabilities {
    self.backend.capabilities()
  }

  /// Current content fingerprint.
  pub async fn version(&self) -> Result<Version, ArtifactError> {
    self.backend.version().await
  }

  pub async fn exists(&self) -> Result<bool, ArtifactError> {
    self.backend.exists().await
  }

  /// Delete the artifact. Removing a missing artifact succeeds.
  pub async fn remove(&self) -> Result<(), ArtifactError> {
    if !self.capabilities().can_remove {
      return Err(self.unsupported("removal"));
    }
    self.backend.remove().await
  }

  pub async fn write(&self, content: &[u8]) -> Result<(), ArtifactError> {
    if !self.capabilities().can_write {
      return Err(self.unsupported("writing"));
    }
    self.backend.write(content).await
  }

  /// Current content, or `None` when the artifact does not exist.
  pub async fn read(&self) -> Result<Option<Vec<u8>>, ArtifactError> {
    self.backend.read().await
  }

  fn unsupported(&self, operation: &'static str) -> ArtifactError {
    ArtifactError::Unsupported {
      artifact: self.reference(),
      operation,
    }
  }
}

impl fmt::Display for Artifact {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.kind, self.identity)
  }
}

impl fmt::Debug for Artifact {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Artifact")
      .field("kind", &self.kind)
      .field("identity", &self.identity)
      .field("key", &self.key.0)
      .finish()
  }
}
