//! Dependencies discovered while a recipe runs, carried between sessions by
//! the provenance ledger.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use kiln_lib::BuildError;
use kiln_lib::artifact::{ArtifactKey, ArtifactManager};
use kiln_lib::config::SessionConfig;
use kiln_lib::job::Job;
use kiln_lib::provenance::{FileProvenance, ProvenanceStore};
use kiln_lib::recipe::{Recipe, RecipeSpec};
use kiln_lib::rule::{AbsencePolicy, GraphBuilder, Rule, RuleKey};
use kiln_lib::session::BuildSession;
use serde_json::json;

use super::common::{Project, assert_success};

/// Reads the name of another internal artifact from `internal:index`, reads
/// that artifact as a dynamic dependency and copies it to `internal:out`.
#[derive(Debug, Default)]
struct IndirectCopy {
  runs: AtomicUsize,
}

#[async_trait]
impl Recipe for IndirectCopy {
  async fn concretize_spec_for(&self, _job: &Job) -> Result<RecipeSpec, BuildError> {
    Ok(RecipeSpec::new(json!({ "type": "indirect-copy" })))
  }

  async fn execute_for(&self, job: &Job, _spec: &RecipeSpec) -> Result<(), BuildError> {
    self.runs.fetch_add(1, Ordering::SeqCst);
    let session = job.session()?;
    let index = session.manager().get("internal:index")?;
    let name = String::from_utf8(index.read().await?.unwrap_or_default())
      .map_err(|e| BuildError::Recipe(e.to_string()))?;

    let source = session.manager().get(&format!("internal:{name}"))?;
    job.add_dynamic_dependency(Arc::clone(&source)).await?;
    let content = source.read().await?.unwrap_or_default();
    session.manager().get("internal:out")?.write(&content).await?;
    Ok(())
  }
}

struct Fixture {
  project: Project,
  manager: Arc<ArtifactManager>,
  recipe: Arc<IndirectCopy>,
}

impl Fixture {
  async fn new() -> Self {
    let project = Project::new();
    let manager = Arc::new(ArtifactManager::with_defaults(project.root()).unwrap());
    let fixture = Fixture {
      project,
      manager,
      recipe: Arc::new(IndirectCopy::default()),
    };
    fixture.write("index", "data").await;
    fixture.write("data", "payload").await;
    fixture
  }

  async fn write(&self, name: &str, content: &str) {
    let artifact = self.manager.get(&format!("internal:{name}")).unwrap();
    artifact.write(content.as_bytes()).await.unwrap();
  }

  async fn build(&self) -> Vec<String> {
    let mut rule = Rule::new("", "indirect");
    rule.add_dependency(self.manager.get("internal:index").unwrap(), AbsencePolicy::Violation);
    rule.add_output(self.manager.get("internal:out").unwrap());
    rule.set_recipe(self.recipe.clone()).unwrap();
    let mut builder = GraphBuilder::new();
    builder.add_rule(rule);

    let store = Arc::new(FileProvenance::open(self.project.ledger_path()).unwrap());
    let session = BuildSession::new(
      Arc::new(builder.finalize().unwrap()),
      store,
      Arc::clone(&self.manager),
      SessionConfig::default(),
    );
    assert_success(&session.build(&["internal:out".to_string()]).await);
    session.executed_rules()
  }

  fn runs(&self) -> usize {
    self.recipe.runs.load(Ordering::SeqCst)
  }
}

#[tokio::test]
async fn discovered_dependency_is_tracked_across_sessions() {
  let fixture = Fixture::new().await;
  assert_eq!(fixture.build().await, vec!["indirect"]);
  assert!(fixture.build().await.is_empty());

  fixture.write("data", "changed").await;
  assert_eq!(fixture.build().await, vec!["indirect"]);
  assert_eq!(fixture.runs(), 2);

  let out = fixture.manager.get("internal:out").unwrap();
  assert_eq!(out.read().await.unwrap().unwrap(), b"changed");
}

#[tokio::test]
async fn discovered_dependency_is_recorded_in_the_ledger() {
  let fixture = Fixture::new().await;
  fixture.build().await;

  let store = FileProvenance::open(fixture.project.ledger_path()).unwrap();
  let sources = store.rule_sources(&RuleKey::of("indirect")).unwrap();
  assert!(sources.contains(&ArtifactKey::of("internal", "data")));
  assert!(sources.contains(&ArtifactKey::of("internal", "index")));
  assert_eq!(
    store.artifact_row(&ArtifactKey::of("internal", "data")).unwrap().unwrap().reference(),
    "internal:data"
  );
}

#[tokio::test]
async fn pruning_keeps_referenced_rows() {
  let fixture = Fixture::new().await;
  fixture.build().await;

  let store = FileProvenance::open(fixture.project.ledger_path()).unwrap();
  assert_eq!(store.prune_artifacts().unwrap(), 0);
  assert!(store.retract_rule(&RuleKey::of("indirect")).unwrap() > 0);
  assert!(store.prune_artifacts().unwrap() >= 3);
  assert!(store.artifact_row(&ArtifactKey::of("internal", "out")).unwrap().is_none());
}
