//! Per-rule jobs.
//!
//! A [`Job`] is the state of one rule within one [`BuildSession`]. Its
//! execution is memoized: every caller of [`Job::run`] awaits the same
//! future, so the rule's recipe runs at most once per session no matter how
//! many dependents ask for it concurrently.
//!
//! A job's `also` rules are not part of that future. The job queues them on
//! its session when it finishes, and the session runs the queue once the
//! requested targets settle.

mod set;

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::OnceCell;
use tracing::{debug, info};

pub use set::JobSet;

use crate::artifact::{Artifact, ArtifactKey, Version};
use crate::error::{BuildError, InternalError};
use crate::recipe::{Recipe, RecipeSpec};
use crate::rule::{AbsencePolicy, Dependency, GraphError, Rule};
use crate::session::{BuildEvent, BuildSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
  /// Created, not yet run.
  Pending,
  /// Merging declared and recorded dependencies, concretizing the recipe.
  Preparing,
  /// Waiting for producer and `after` jobs.
  AwaitingPrerequisites,
  /// Checking dependencies and the up-to-date decision.
  Deciding,
  /// Up to date; the recipe will not run.
  Skipped,
  /// Running the recipe.
  Executing,
  Finished,
  Failed,
}

/// Inputs and outputs of a job once declared and recorded history are merged.
struct Prepared {
  dependencies: Vec<Dependency>,
  recorded_outputs: Vec<Arc<Artifact>>,
}

/// One rule's work within one [`BuildSession`].
pub struct Job {
  rule: Arc<Rule>,
  /// Owning session. Jobs never keep their session alive.
  session: Weak<BuildSession>,
  recipe: Arc<dyn Recipe>,
  /// The synthetic `recipe:<rule id>` artifact, an implicit dependency.
  recipe_artifact: Arc<Artifact>,
  prepared: OnceCell<Prepared>,
  spec: OnceCell<RecipeSpec>,
  /// `hash_spec` of the concretized spec: this session's version of
  /// `recipe_artifact`.
  recipe_version: OnceCell<Version>,
  dynamic_outputs: Mutex<Vec<Arc<Artifact>>>,
  dynamic_dependencies: Mutex<Vec<Dependency>>,
  state: Mutex<JobState>,
  finished: AtomicBool,
  recipe_invoked: AtomicBool,
  /// The memoized outcome every caller of [`Job::run`] shares.
  execution: OnceCell<Result<(), Arc<BuildError>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Merge declared dependencies with ones recorded in provenance.
///
/// Declared entries win for the same artifact. Differing policies where
/// neither side is [`AbsencePolicy::RecordedState`] indicate a bookkeeping bug.
pub fn merge_dependencies(
  declared: Vec<Dependency>,
  recorded: Vec<Dependency>,
) -> Result<Vec<Dependency>, InternalError> {
  let mut merged = declared;
  for dep in recorded {
    match merged.iter().find(|d| d.artifact.key() == dep.artifact.key()) {
      Some(existing)
        if existing.policy != dep.policy
          && existing.policy != AbsencePolicy::RecordedState
          && dep.policy != AbsencePolicy::RecordedState =>
      {
        return Err(InternalError::ConflictingPolicies {
          artifact: dep.artifact.to_string(),
        });
      }
      Some(_) => {}
      None => merged.push(dep),
    }
  }
  Ok(merged)
}

impl Job {
  pub(crate) fn new(rule: Arc<Rule>, session: &Arc<BuildSession>) -> Result<Self, BuildError> {
    let recipe = rule
      .recipe()
      .cloned()
      .ok_or_else(|| GraphError::MissingRecipe { rule: rule.id().to_string() })?;
    let recipe_artifact = session.manager().get(&rule.recipe_reference())?;
    Ok(Job {
      rule,
      session: Arc::downgrade(session),
      recipe,
      recipe_artifact,
      prepared: OnceCell::new(),
      spec: OnceCell::new(),
      recipe_version: OnceCell::new(),
      dynamic_outputs: Mutex::new(Vec::new()),
      dynamic_dependencies: Mutex::new(Vec::new()),
      state: Mutex::new(JobState::Pending),
      finished: AtomicBool::new(false),
      recipe_invoked: AtomicBool::new(false),
      execution: OnceCell::new(),
    })
  }

  /// The rule this job brings up to date.
  pub fn rule(&self) -> &Arc<Rule> {
    &self.rule
  }

  /// Where the job is in its lifecycle.
  pub fn state(&self) -> JobState {
    *lock(&self.state)
  }

  fn set_state(&self, state: JobState) {
    *lock(&self.state) = state;
  }

  /// Whether the job completed successfully, executed or skipped.
  pub fn is_finished(&self) -> bool {
    self.finished.load(Ordering::Acquire)
  }

  /// Whether this job executed its recipe in this session.
  pub fn recipe_invoked(&self) -> bool {
    self.recipe_invoked.load(Ordering::Acquire)
  }

  /// The synthetic artifact standing for this rule's recipe.
  pub fn recipe_artifact(&self) -> &Arc<Artifact> {
    &self.recipe_artifact
  }

  /// The concretized recipe spec, once computed.
  pub fn spec(&self) -> Option<&RecipeSpec> {
    self.spec.get()
  }

  /// Version of the recipe artifact as seen by this job, once concretized.
  ///
  /// It lives on the job rather than the interned artifact, so sessions
  /// sharing an [`crate::artifact::ArtifactManager`] never see each other's
  /// recipe versions.
  pub fn recipe_version(&self) -> Option<&Version> {
    self.recipe_version.get()
  }

  /// Current version of a dependency. The recipe artifact answers with this
  /// job's recipe version.
  pub async fn dependency_version(&self, artifact: &Artifact) -> Result<Version, BuildError> {
    if artifact.key() == self.recipe_artifact.key() {
      return self.recipe_version.get().cloned().ok_or_else(|| {
        InternalError::RecipeNotConcretized {
          rule: self.rule.id().to_string(),
        }
        .into()
      });
    }
    Ok(artifact.version().await?)
  }

  /// Handle on the owning session, failing once it was dropped.
  pub fn session(&self) -> Result<Arc<BuildSession>, BuildError> {
    self.session.upgrade().ok_or_else(|| {
      InternalError::SessionDropped {
        rule: self.rule.id().to_string(),
      }
      .into()
    })
  }

  /// Merged declared and recorded dependencies, then dynamic ones.
  pub fn dependencies(&self) -> Vec<Dependency> {
    let mut deps: Vec<Dependency> = self
      .prepared
      .get()
      .map(|p| p.dependencies.clone())
      .unwrap_or_else(|| self.rule.dependencies().cloned().collect());
    for dep in lock(&self.dynamic_dependencies).iter() {
      if !deps.iter().any(|d| d.artifact.key() == dep.artifact.key()) {
        deps.push(dep.clone());
      }
    }
    deps
  }

  /// Declared outputs followed by dynamic ones.
  pub fn outputs(&self) -> Vec<Arc<Artifact>> {
    let mut outputs: Vec<Arc<Artifact>> = self.rule.outputs().cloned().collect();
    for output in lock(&self.dynamic_outputs).iter() {
      if !self.rule.produces(output.key()) {
        outputs.push(Arc::clone(output));
      }
    }
    outputs
  }

  /// Outputs the provenance store attributes to this rule from earlier builds.
  pub fn recorded_outputs(&self) -> Vec<Arc<Artifact>> {
    self.prepared.get().map(|p| p.recorded_outputs.clone()).unwrap_or_default()
  }

  /// Register an output discovered while the recipe runs.
  pub fn add_dynamic_output(&self, artifact: Arc<Artifact>) {
    let mut outputs = lock(&self.dynamic_outputs);
    if !outputs.iter().any(|o| o.key() == artifact.key()) {
      debug!(rule = %self.rule.id(), artifact = %artifact, "dynamic output");
      outputs.push(artifact);
    }
  }

  /// Register a dependency discovered while the recipe runs. The version
  /// observed now is what this rule relies upon.
  pub async fn add_dynamic_dependency(&self, artifact: Arc<Artifact>) -> Result<(), BuildError> {
    let session = self.session()?;
    let version = artifact.version().await?;
    session.record_reliance(&self.rule, &artifact, &version)?;
    debug!(rule = %self.rule.id(), artifact = %artifact, version = %version, "dynamic dependency");
    let mut deps = lock(&self.dynamic_dependencies);
    if !deps.iter().any(|d| d.artifact.key() == artifact.key()) {
      deps.push(Dependency::new(artifact, AbsencePolicy::RecordedState));
    }
    Ok(())
  }

  /// External identifier of an artifact, e.g. the path of a file artifact.
  pub fn resolve(&self, artifact: &Artifact) -> Result<String, BuildError> {
    self.resolve_reference(&artifact.reference())
  }

  /// External identifier of a reference, resolved by the session's manager.
  pub fn resolve_reference(&self, reference: &str) -> Result<String, BuildError> {
    Ok(self.session()?.manager().resolve_to_external_identifier(reference)?)
  }

  /// Default working directory for recipes.
  pub fn workdir(&self) -> Option<PathBuf> {
    self.session.upgrade().and_then(|s| s.config().workdir.clone())
  }

  /// Bring the rule up to date. Every caller shares one execution and
  /// receives its result, also after it completed.
  pub fn run(&self) -> BoxFuture<'_, Result<(), Arc<BuildError>>> {
    async move { self.execution.get_or_init(|| self.execute()).await.clone() }.boxed()
  }

  async fn execute(&self) -> Result<(), Arc<BuildError>> {
    match self.work().await {
      Ok(()) => Ok(()),
      Err(err) => {
        self.set_state(JobState::Failed);
        let err = err.in_rule(self.rule.id());
        info!(rule = %self.rule.id(), error = %err, "job failed");
        if let Ok(session) = self.session() {
          session.emit(BuildEvent::JobFailed {
            rule: self.rule.id().to_string(),
            error: err.trace(),
          });
        }
        Err(Arc::new(err))
      }
    }
  }

  async fn work(&self) -> Result<(), BuildError> {
    let session = self.session()?;
    let id = self.rule.id();
    debug!(rule = %id, "job started");
    session.emit(BuildEvent::JobStarted { rule: id.to_string() });

    self.set_state(JobState::Preparing);
    let prepared = self.prepare(&session).await?;
    let spec = self.concretize().await?;

    self.set_state(JobState::AwaitingPrerequisites);
    let prerequisites = session.prerequisites_of(&self.rule, &prepared.dependencies)?;
    session.await_prerequisites(&self.rule, &prerequisites).await?;

    self.set_state(JobState::Deciding);
    self.verify_dependencies(&session, &prepared.dependencies).await?;
    for dep in &prepared.dependencies {
      let version = self.dependency_version(&dep.artifact).await?;
      session.record_reliance(&self.rule, &dep.artifact, &version)?;
    }

    if session.is_up_to_date(self).await? {
      self.set_state(JobState::Skipped);
      debug!(rule = %id, "up to date");
      session.emit(BuildEvent::UpToDate { rule: id.to_string() });
    } else {
      self.set_state(JobState::Executing);
      self.rebuild(&session, prepared, spec).await?;
    }

    session.queue_also(&self.rule)?;
    self.finished.store(true, Ordering::Release);
    self.set_state(JobState::Finished);
    session.emit(BuildEvent::JobFinished {
      rule: id.to_string(),
      executed: self.recipe_invoked(),
    });
    Ok(())
  }

  async fn prepare(&self, session: &BuildSession) -> Result<&Prepared, BuildError> {
    self
      .prepared
      .get_or_try_init(|| async {
        let store = session.store();
        let key = self.rule.key();

        let mut recorded_outputs = Vec::new();
        for output in store.rule_outputs(key)? {
          if let Some(artifact) = session.artifact_for_key(&output)? {
            recorded_outputs.push(artifact);
          }
        }

        let own: HashSet<&ArtifactKey> = self
          .rule
          .outputs()
          .chain(recorded_outputs.iter())
          .map(|a| a.key())
          .collect();

        let mut declared: Vec<Dependency> = self.rule.dependencies().cloned().collect();
        declared.push(Dependency::new(Arc::clone(&self.recipe_artifact), AbsencePolicy::Violation));

        let mut recorded = Vec::new();
        for source in store.rule_sources(key)? {
          if own.contains(&source) {
            continue;
          }
          if let Some(artifact) = session.artifact_for_key(&source)? {
            recorded.push(Dependency::new(artifact, AbsencePolicy::RecordedState));
          }
        }

        let dependencies = merge_dependencies(declared, recorded)?;
        debug!(
          rule = %self.rule.id(),
          dependencies = dependencies.len(),
          recorded_outputs = recorded_outputs.len(),
          "job prepared"
        );
        Ok::<_, BuildError>(Prepared {
          dependencies,
          recorded_outputs,
        })
      })
      .await
  }

  /// Concretize the recipe spec once and derive the recipe version from it.
  async fn concretize(&self) -> Result<&RecipeSpec, BuildError> {
    let spec = self
      .spec
      .get_or_try_init(|| self.recipe.concretize_spec_for(self))
      .await?;
    let version = self.recipe_version.get_or_init(|| async { self.recipe.hash_spec(spec) }).await;
    debug!(rule = %self.rule.id(), version = %version, "recipe concretized");
    Ok(spec)
  }

  async fn verify_dependencies(&self, session: &BuildSession, deps: &[Dependency]) -> Result<(), BuildError> {
    for dep in deps {
      if dep.policy == AbsencePolicy::RecordedState
        || dep.artifact.key() == self.recipe_artifact.key()
        || dep.artifact.exists().await?
      {
        continue;
      }
      return Err(match session.graph().producer_of(dep.artifact.key()) {
        Some(producer) => BuildError::NotCreated {
          producer: producer.id().to_string(),
          artifact: dep.artifact.to_string(),
        },
        None => BuildError::NoRuleToBuild {
          artifact: dep.artifact.to_string(),
        },
      });
    }
    Ok(())
  }

  async fn rebuild(&self, session: &BuildSession, prepared: &Prepared, spec: &RecipeSpec) -> Result<(), BuildError> {
    let id = self.rule.id();

    session.emit(BuildEvent::CleanOutputs {
      rule: id.to_string(),
      outputs: prepared.recorded_outputs.iter().map(|o| o.to_string()).collect(),
    });
    for output in &prepared.recorded_outputs {
      if output.capabilities().can_remove && output.exists().await? {
        debug!(rule = %id, artifact = %output, "removing stale output");
        output.remove().await?;
      }
    }
    let retracted = session.store().retract_rule(self.rule.key())?;
    debug!(rule = %id, retracted, "provenance retracted");

    let permit = session.acquire_permit().await?;
    info!(rule = %id, "running recipe");
    session.emit(BuildEvent::RecipeStarted { rule: id.to_string() });
    self.recipe_invoked.store(true, Ordering::Release);
    let started = Instant::now();
    let result = self.recipe.execute_for(self, spec).await;
    drop(permit);
    result?;
    debug!(rule = %id, elapsed = ?started.elapsed(), "recipe finished");

    session.check_rewrite_after_use(self).await?;
    session.record_version_info(self).await
  }
}

impl fmt::Debug for Job {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Job")
      .field("rule", &self.rule.id())
      .field("state", &self.state())
      .field("finished", &self.is_finished())
      .finish()
  }
}
