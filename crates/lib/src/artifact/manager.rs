use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use super::{
  Aid, Artifact, ArtifactBackend, ArtifactError, ArtifactKey, FileFactory, InternalFactory, RecipeFactory,
};
use crate::consts::{DEFAULT_ARTIFACT_KIND, FILE_KIND, INTERNAL_KIND, RECIPE_KIND};

/// Per-kind hooks used by the [`ArtifactManager`].
pub trait ArtifactFactory: Send + Sync {
  /// Canonicalize a parsed reference. The result must be a fixed point.
  fn normalize(&self, aid: Aid) -> Result<Aid, ArtifactError> {
    Ok(aid)
  }

  /// External identifier of a normalized reference, e.g. a filesystem path.
  fn resolve(&self, aid: &Aid) -> Result<String, ArtifactError>;

  fn create(&self, aid: &Aid) -> Result<Arc<dyn ArtifactBackend>, ArtifactError>;
}

/// Interns artifacts so every normalized identity maps to one `Arc<Artifact>`.
pub struct ArtifactManager {
  default_kind: String,
  factories: DashMap<String, Arc<dyn ArtifactFactory>>,
  interned: DashMap<ArtifactKey, Arc<Artifact>>,
}

impl ArtifactManager {
  /// An empty manager with no factories registered.
  pub fn new(default_kind: impl Into<String>) -> Self {
    ArtifactManager {
      default_kind: default_kind.into(),
      factories: DashMap::new(),
      interned: DashMap::new(),
    }
  }

  /// A manager with the `file`, `internal` and `recipe` kinds registered,
  /// resolving files relative to `root`.
  pub fn with_defaults(root: impl Into<PathBuf>) -> Result<Self, ArtifactError> {
    let manager = ArtifactManager::new(DEFAULT_ARTIFACT_KIND);
    manager.register(FILE_KIND, Arc::new(FileFactory::new(root)))?;
    manager.register(INTERNAL_KIND, Arc::new(InternalFactory))?;
    manager.register(RECIPE_KIND, Arc::new(RecipeFactory))?;
    Ok(manager)
  }

  /// Install the factory for `kind`. One factory per kind.
  pub fn register(&self, kind: &str, factory: Arc<dyn ArtifactFactory>) -> Result<(), ArtifactError> {
    match self.factories.entry(kind.to_string()) {
      Entry::Occupied(_) => Err(ArtifactError::DuplicateFactory { kind: kind.to_string() }),
      Entry::Vacant(slot) => {
        slot.insert(factory);
        Ok(())
      }
    }
  }

  /// Parse and normalize a reference, returning the normalized form and its factory.
  fn normalize(&self, aid: Aid) -> Result<(Aid, Arc<dyn ArtifactFactory>), ArtifactError> {
    let kind = aid.kind.clone().unwrap_or_else(|| self.default_kind.clone());
    let factory = self
      .factories
      .get(&kind)
      .map(|f| Arc::clone(f.value()))
      .ok_or_else(|| ArtifactError::UnknownKind { kind: kind.clone() })?;
    let normalized = factory.normalize(Aid {
      kind: Some(kind.clone()),
      ..aid
    })?;
    Ok((
      Aid {
        kind: Some(kind),
        ..normalized
      },
      factory,
    ))
  }

  /// Parse, normalize and intern a reference.
  pub fn get(&self, reference: &str) -> Result<Arc<Artifact>, ArtifactError> {
    self.get_aid(Aid::parse(reference)?)
  }

  /// Intern an already parsed reference.
  pub fn get_aid(&self, aid: Aid) -> Result<Arc<Artifact>, ArtifactError> {
    let (aid, factory) = self.normalize(aid)?;
    let kind = aid.kind.clone().unwrap_or_default();
    let identity = aid.identity();
    let key = ArtifactKey::of(&kind, &identity);

    let entry = self.interned.entry(key).or_try_insert_with(|| {
      debug!(artifact = %aid, "interning artifact");
      let backend = factory.create(&aid)?;
      Ok::<_, ArtifactError>(Arc::new(Artifact::new(kind, identity, backend)))
    })?;
    Ok(Arc::clone(entry.value()))
  }

  /// Lookup without interning. Malformed references are still errors.
  pub fn find(&self, reference: &str) -> Result<Option<Arc<Artifact>>, ArtifactError> {
    let (aid, _) = self.normalize(Aid::parse(reference)?)?;
    let key = ArtifactKey::of(aid.kind.as_deref().unwrap_or_default(), &aid.identity());
    Ok(self.get_by_key(&key))
  }

  /// An already interned artifact.
  pub fn get_by_key(&self, key: &ArtifactKey) -> Option<Arc<Artifact>> {
    self.interned.get(key).map(|a| Arc::clone(a.value()))
  }

  /// What the reference names outside kiln, e.g. a filesystem path.
  pub fn resolve_to_external_identifier(&self, reference: &str) -> Result<String, ArtifactError> {
    let (aid, factory) = self.normalize(Aid::parse(reference)?)?;
    factory.resolve(&aid)
  }
}

impl std::fmt::Debug for ArtifactManager {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ArtifactManager")
      .field("default_kind", &self.default_kind)
      .field("interned", &self.interned.len())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn manager() -> ArtifactManager {
    ArtifactManager::with_defaults("/project").unwrap()
  }

  #[test]
  fn equivalent_references_intern_to_one_artifact() {
    let m = manager();
    let a = m.get("src/main.c").unwrap();
    let b = m.get("file:./src/../src/main.c").unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.reference(), "file:src/main.c");
  }

  #[test]
  fn kinds_do_not_collide() {
    let m = manager();
    let file = m.get("file:x").unwrap();
    let internal = m.get("internal:x").unwrap();
    assert!(!Arc::ptr_eq(&file, &internal));
    assert_ne!(file.key(), internal.key());
  }

  #[test]
  fn find_does_not_intern() {
    let m = manager();
    assert!(m.find("a.txt").unwrap().is_none());
    let a = m.get("a.txt").unwrap();
    let found = m.find("./a.txt").unwrap().unwrap();
    assert!(Arc::ptr_eq(&a, &found));
    assert!(Arc::ptr_eq(&a, &m.get_by_key(a.key()).unwrap()));
  }

  #[test]
  fn find_still_reports_parse_errors() {
    assert!(manager().find("").is_err());
  }

  #[test]
  fn unknown_kind_is_an_error() {
    let err = manager().get("http:example").unwrap_err();
    assert!(matches!(err, ArtifactError::UnknownKind { kind } if kind == "http"));
  }

  #[test]
  fn duplicate_registration_is_rejected() {
    let m = manager();
    let err = m.register(FILE_KIND, Arc::new(FileFactory::new("/other"))).unwrap_err();
    assert!(matches!(err, ArtifactError::DuplicateFactory { .. }));
  }

  #[test]
  fn reference_round_trips_through_get() {
    let m = manager();
    let a = m.get("recipe:net+compile").unwrap();
    assert!(Arc::ptr_eq(&a, &m.get(&a.reference()).unwrap()));
  }

  #[cfg(unix)]
  #[test]
  fn file_references_resolve_to_paths() {
    let m = manager();
    assert_eq!(m.resolve_to_external_identifier("net+a/b.c").unwrap(), "/project/net/a/b.c");
    assert_eq!(m.resolve_to_external_identifier("internal:x").unwrap(), "x");
  }
}
