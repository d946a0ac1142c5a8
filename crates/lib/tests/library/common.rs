//! Shared helpers for library integration tests.

use std::path::PathBuf;
use std::sync::Arc;

use kiln_lib::artifact::ArtifactManager;
use kiln_lib::config::{SessionConfig, paths};
use kiln_lib::manifest::ManifestDef;
use kiln_lib::provenance::FileProvenance;
use kiln_lib::session::{BuildReport, BuildSession};
use tempfile::TempDir;

/// A scratch project directory. Every [`Project::session`] call starts from
/// a fresh artifact manager and a freshly opened ledger, the way separate
/// `kiln` invocations would.
pub struct Project {
  pub temp: TempDir,
}

impl Project {
  pub fn new() -> Self {
    Project {
      temp: TempDir::new().unwrap(),
    }
  }

  pub fn root(&self) -> PathBuf {
    dunce::canonicalize(self.temp.path()).unwrap()
  }

  pub fn path(&self, relative: &str) -> PathBuf {
    self.root().join(relative)
  }

  pub fn write(&self, relative: &str, content: &str) {
    let path = self.path(relative);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
  }

  pub fn read(&self, relative: &str) -> String {
    std::fs::read_to_string(self.path(relative)).unwrap()
  }

  pub fn exists(&self, relative: &str) -> bool {
    self.path(relative).exists()
  }

  /// Lines appended to `runs.log` by recipes, one per execution.
  pub fn runs(&self) -> Vec<String> {
    match std::fs::read_to_string(self.path("runs.log")) {
      Ok(log) => log.lines().map(str::to_string).collect(),
      Err(_) => Vec::new(),
    }
  }

  pub fn ledger_path(&self) -> PathBuf {
    paths::provenance_path(&self.root())
  }

  pub fn session(&self, manifest: &str) -> Arc<BuildSession> {
    let root = self.root();
    let manager = Arc::new(ArtifactManager::with_defaults(&root).unwrap());
    let graph = manifest.parse::<ManifestDef>().unwrap().into_graph(&manager).unwrap();
    let store = Arc::new(FileProvenance::open(self.ledger_path()).unwrap());
    BuildSession::new(
      Arc::new(graph),
      store,
      manager,
      SessionConfig::default().with_workdir(&root),
    )
  }

  pub async fn build_all(&self, manifest: &str) -> BuildReport {
    self.session(manifest).build_all().await
  }
}

pub fn assert_success(report: &BuildReport) {
  let failures: Vec<String> = report
    .failures()
    .map(|(target, err)| format!("{target}: {}", err.trace()))
    .collect();
  assert!(failures.is_empty(), "build failed:\n{}", failures.join("\n"));
}

