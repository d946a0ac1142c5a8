mod build;
mod explain;
mod forget;
mod prune;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

use kiln_lib::artifact::ArtifactManager;
use kiln_lib::config::paths;
use kiln_lib::lock::{LockMode, StateLock};
use kiln_lib::manifest::ManifestDef;
use kiln_lib::provenance::FileProvenance;
use kiln_lib::rule::Graph;

pub use build::cmd_build;
pub use explain::cmd_explain;
pub use forget::cmd_forget;
pub use prune::cmd_prune;

/// A loaded manifest and the state directory next to it.
pub struct Workspace {
  pub root: PathBuf,
  pub manager: Arc<ArtifactManager>,
  pub graph: Arc<Graph>,
  pub store: Arc<FileProvenance>,
  _lock: StateLock,
}

impl Workspace {
  /// Load `manifest` and lock its state directory. The project root is the
  /// directory containing the manifest.
  pub fn open(manifest: &Path, mode: LockMode, command: &str) -> Result<Self> {
    let manifest = dunce::canonicalize(manifest)
      .with_context(|| format!("Manifest not found: {}", manifest.display()))?;
    let root = manifest
      .parent()
      .map(Path::to_path_buf)
      .context("Manifest has no parent directory")?;

    let lock = StateLock::acquire(&paths::state_dir(&root), mode, command)?;

    let manager = Arc::new(ArtifactManager::with_defaults(&root)?);
    let graph = ManifestDef::load(&manifest)?
      .into_graph(&manager)
      .with_context(|| format!("Failed to load {}", manifest.display()))?;
    let store = FileProvenance::open(paths::provenance_path(&root)).context("Failed to open provenance ledger")?;

    Ok(Workspace {
      root,
      manager,
      graph: Arc::new(graph),
      store: Arc::new(store),
      _lock: lock,
    })
  }

  /// Id of the rule behind `key`, or the key itself for rules no longer in
  /// the manifest.
  pub fn rule_name(&self, key: &kiln_lib::rule::RuleKey) -> String {
    self
      .graph
      .rule(key)
      .map(|rule| rule.id().to_string())
      .unwrap_or_else(|| key.to_string())
  }
}
