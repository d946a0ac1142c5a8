//! Build sessions and the incremental rebuild decision.
//!
//! A [`BuildSession`] owns one job per rule and drives requested targets to
//! completion. It decides whether a job is up to date from the provenance
//! ledger, records which artifact versions each rule relied upon, and
//! catches two consistency hazards: two rules observing different versions
//! of the same artifact, and a recipe rewriting an artifact after another
//! rule already used it.

mod events;
mod reliance;
mod waits;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::{Semaphore, SemaphorePermit, mpsc};
use tracing::{debug, info, warn};

pub use events::BuildEvent;
pub use reliance::RelianceTable;

use crate::artifact::{Artifact, ArtifactKey, ArtifactManager, Version};
use crate::config::SessionConfig;
use crate::error::{BuildError, InternalError};
use crate::job::{Job, JobSet};
use crate::provenance::{Fact, FactBatch, ProvenanceStore};
use crate::rule::{Dependency, Graph, Rule, RuleKey};
use waits::WaitGraph;

/// Result of one requested target.
#[derive(Debug)]
pub struct TargetOutcome {
  /// The reference or rule id as requested.
  pub target: String,
  pub result: Result<(), Arc<BuildError>>,
}

/// Per-target outcomes of a build request. Targets are independent, so some
/// may succeed while others fail.
#[derive(Debug, Default)]
pub struct BuildReport {
  /// One outcome per requested target, in request order.
  pub targets: Vec<TargetOutcome>,
  /// Outcomes of `also` rules scheduled by jobs that finished during the
  /// request, keyed by rule id.
  pub induced: Vec<TargetOutcome>,
}

impl BuildReport {
  /// Requested targets first, then induced rules.
  pub fn outcomes(&self) -> impl Iterator<Item = &TargetOutcome> {
    self.targets.iter().chain(&self.induced)
  }

  /// Whether every target and induced rule succeeded.
  pub fn is_success(&self) -> bool {
    self.outcomes().all(|t| t.result.is_ok())
  }

  /// Failed outcomes with their target names.
  pub fn failures(&self) -> impl Iterator<Item = (&str, &Arc<BuildError>)> {
    self
      .outcomes()
      .filter_map(|t| t.result.as_ref().err().map(|e| (t.target.as_str(), e)))
  }

  /// Append the outcomes of a later request.
  pub fn merge(&mut self, other: BuildReport) {
    self.targets.extend(other.targets);
    self.induced.extend(other.induced);
  }
}

fn shared(err: impl Into<BuildError>) -> Arc<BuildError> {
  Arc::new(err.into())
}

/// Shared state of one build request. Discarded when the request ends;
/// only the provenance store outlives it.
pub struct BuildSession {
  graph: Arc<Graph>,
  store: Arc<dyn ProvenanceStore>,
  manager: Arc<ArtifactManager>,
  config: SessionConfig,
  /// Caps the number of recipes executing at once.
  permits: Semaphore,
  jobs: DashMap<RuleKey, Arc<Job>>,
  job_sets: DashMap<RuleKey, JobSet>,
  reliance: RelianceTable,
  waits: WaitGraph,
  /// `also` jobs queued by finished jobs, drained by the build entry points.
  induced: Mutex<JobSet>,
  events: Option<mpsc::UnboundedSender<BuildEvent>>,
}

impl BuildSession {
  /// A session without an event listener.
  pub fn new(
    graph: Arc<Graph>,
    store: Arc<dyn ProvenanceStore>,
    manager: Arc<ArtifactManager>,
    config: SessionConfig,
  ) -> Arc<Self> {
    Self::with_events(graph, store, manager, config, None)
  }

  /// A session reporting progress on `events`.
  pub fn with_events(
    graph: Arc<Graph>,
    store: Arc<dyn ProvenanceStore>,
    manager: Arc<ArtifactManager>,
    config: SessionConfig,
    events: Option<mpsc::UnboundedSender<BuildEvent>>,
  ) -> Arc<Self> {
    let permits = Semaphore::new(config.parallelism.max(1));
    Arc::new(BuildSession {
      graph,
      store,
      manager,
      config,
      permits,
      jobs: DashMap::new(),
      job_sets: DashMap::new(),
      reliance: RelianceTable::default(),
      waits: WaitGraph::default(),
      induced: Mutex::new(JobSet::new()),
      events,
    })
  }

  /// The finalized rule graph this session builds from.
  pub fn graph(&self) -> &Arc<Graph> {
    &self.graph
  }

  /// Provenance recorded by earlier sessions, and by this one as jobs finish.
  pub fn store(&self) -> &Arc<dyn ProvenanceStore> {
    &self.store
  }

  pub fn manager(&self) -> &Arc<ArtifactManager> {
    &self.manager
  }

  pub fn config(&self) -> &SessionConfig {
    &self.config
  }

  /// Which rules relied on which artifact versions so far in this session.
  pub fn reliance(&self) -> &RelianceTable {
    &self.reliance
  }

  pub(crate) fn emit(&self, event: BuildEvent) {
    if let Some(events) = &self.events {
      // A dropped receiver only means nobody is listening.
      let _ = events.send(event);
    }
  }

  pub(crate) async fn acquire_permit(&self) -> Result<SemaphorePermit<'_>, BuildError> {
    self.permits.acquire().await.map_err(|_| InternalError::PermitsClosed.into())
  }

  /// The job for `rule` in this session, created on first use.
  pub fn job_for(self: &Arc<Self>, rule: &Arc<Rule>) -> Result<Arc<Job>, BuildError> {
    if let Some(job) = self.jobs.get(rule.key()) {
      return Ok(Arc::clone(job.value()));
    }
    let job = self
      .jobs
      .entry(rule.key().clone())
      .or_try_insert_with(|| Job::new(Arc::clone(rule), self).map(Arc::new))?;
    Ok(Arc::clone(job.value()))
  }

  fn job_for_key(self: &Arc<Self>, key: &RuleKey) -> Result<Arc<Job>, BuildError> {
    let rule = self
      .graph
      .rule(key)
      .ok_or_else(|| InternalError::UnknownRuleKey { key: key.to_string() })?;
    self.job_for(rule)
  }

  /// The job set that brings `rule` up to date.
  pub fn job_set_for_rule(self: &Arc<Self>, rule: &Arc<Rule>) -> Result<JobSet, BuildError> {
    if let Some(set) = self.job_sets.get(rule.key()) {
      return Ok(set.value().clone());
    }
    let set = JobSet::single(self.job_for(rule)?);
    Ok(self.job_sets.entry(rule.key().clone()).or_insert(set).value().clone())
  }

  /// The job set of `artifact`'s producing rule, or `None` for sources.
  pub fn job_set_for_artifact(self: &Arc<Self>, artifact: &Artifact) -> Result<Option<JobSet>, BuildError> {
    match self.graph.producer_of(artifact.key()) {
      Some(rule) => self.job_set_for_rule(rule).map(Some),
      None => Ok(None),
    }
  }

  /// Jobs that must finish before `rule` may decide: producers of its
  /// dependencies and its `after` rules.
  pub(crate) fn prerequisites_of(self: &Arc<Self>, rule: &Rule, deps: &[Dependency]) -> Result<JobSet, BuildError> {
    let mut set = JobSet::new();
    for dep in deps {
      if let Some(producer) = self.graph.producer_of(dep.artifact.key())
        && producer.key() != rule.key()
      {
        set.extend(&self.job_set_for_rule(producer)?)?;
      }
    }
    for after in rule.after() {
      set.insert(self.job_for_key(after)?)?;
    }
    Ok(set)
  }

  pub(crate) fn also_of(self: &Arc<Self>, rule: &Rule) -> Result<JobSet, BuildError> {
    let mut set = JobSet::new();
    for also in rule.also() {
      set.insert(self.job_for_key(also)?)?;
    }
    Ok(set)
  }

  fn lock_induced(&self) -> MutexGuard<'_, JobSet> {
    self.induced.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Queue the `also` jobs of a rule whose job just finished.
  ///
  /// Nothing awaits them here: an `also` rule may itself wait on the inducing
  /// rule, so running them inside its execution could deadlock.
  pub(crate) fn queue_also(self: &Arc<Self>, rule: &Rule) -> Result<(), BuildError> {
    let also = self.also_of(rule)?;
    if also.is_empty() {
      return Ok(());
    }
    debug!(rule = %rule.id(), also = also.len(), "queueing also rules");
    self.lock_induced().extend(&also)?;
    Ok(())
  }

  /// Run queued `also` jobs, and the ones they queue in turn, until none are
  /// left. Each rule is reported once per call, and rules in `requested`
  /// already have an outcome of their own.
  async fn run_induced(&self, requested: JobSet) -> Vec<TargetOutcome> {
    let mut outcomes = Vec::new();
    let mut seen = requested;
    loop {
      let queued = std::mem::take(&mut *self.lock_induced());
      let batch = queued.difference(&seen);
      if batch.is_empty() {
        return outcomes;
      }
      seen = match seen.union(&batch) {
        Ok(seen) => seen,
        Err(err) => {
          outcomes.push(TargetOutcome {
            target: "induced rules".to_string(),
            result: Err(shared(err)),
          });
          return outcomes;
        }
      };
      let results = join_all(batch.jobs().map(|job| async move {
        TargetOutcome {
          target: job.rule().id().to_string(),
          result: job.run().await,
        }
      }))
      .await;
      outcomes.extend(results);
    }
  }

  /// Run `prerequisites` on behalf of `rule`, refusing waits that would deadlock.
  pub(crate) async fn await_prerequisites(&self, rule: &Rule, prerequisites: &JobSet) -> Result<(), BuildError> {
    if prerequisites.is_empty() {
      return Ok(());
    }
    let _guard = self.waits.enter(rule.key(), prerequisites.keys()).map_err(|cycle| BuildError::Cycle {
      path: cycle.iter().map(|key| self.rule_name(key)).collect(),
    })?;
    prerequisites.run().await.map_err(BuildError::Prerequisite)
  }

  fn rule_name(&self, key: &RuleKey) -> String {
    self
      .graph
      .rule(key)
      .map(|r| r.id().to_string())
      .unwrap_or_else(|| key.to_string())
  }

  /// The interned artifact for a key, re-creating it from its ledger row
  /// when this process has not seen it yet.
  pub fn artifact_for_key(&self, key: &ArtifactKey) -> Result<Option<Arc<Artifact>>, BuildError> {
    if let Some(artifact) = self.manager.get_by_key(key) {
      return Ok(Some(artifact));
    }
    match self.store.artifact_row(key)? {
      Some(row) => Ok(Some(self.manager.get(&row.reference())?)),
      None => {
        warn!(key = %key, "provenance refers to an artifact with no recorded identity");
        Ok(None)
      }
    }
  }

  /// Note that `rule` relied on `artifact` at `version`. Fails when another
  /// rule relied on a different version in this session.
  pub fn record_reliance(&self, rule: &Rule, artifact: &Artifact, version: &Version) -> Result<(), BuildError> {
    debug!(rule = %rule.id(), artifact = %artifact, version = %version, "reliance");
    self.reliance.record(rule, artifact, version)
  }

  /// Whether `job`'s outputs are exactly what its rule produced from the
  /// current versions of its recorded sources.
  pub async fn is_up_to_date(&self, job: &Job) -> Result<bool, BuildError> {
    let rule = job.rule();
    let id = rule.id();
    if rule.always() {
      debug!(rule = %id, "stale: always rebuilt");
      return Ok(false);
    }

    let mut outputs: Vec<Arc<Artifact>> = rule.outputs().cloned().collect();
    for recorded in job.recorded_outputs() {
      if !rule.produces(recorded.key()) {
        outputs.push(recorded);
      }
    }
    if outputs.is_empty() {
      debug!(rule = %id, "stale: rule has no outputs to check");
      return Ok(false);
    }

    for output in &outputs {
      if !output.exists().await? {
        debug!(rule = %id, artifact = %output, "stale: output missing");
        return Ok(false);
      }
      let version = output.version().await?;
      match self.store.producer_of(output.key(), &version)? {
        Some(producer) if &producer == rule.key() => {}
        Some(_) => {
          debug!(rule = %id, artifact = %output, "stale: current version was produced by another rule");
          return Ok(false);
        }
        None => {
          debug!(rule = %id, artifact = %output, version = %version, "stale: no provenance for current version");
          return Ok(false);
        }
      }

      let sources = self.store.version_sources(output.key(), &version)?;
      if sources.is_empty() {
        debug!(rule = %id, artifact = %output, "stale: no recorded sources");
        return Ok(false);
      }
      for (source, recorded) in sources {
        let current = match self.reliance.relied_version(rule.key(), &source) {
          Some(version) => version,
          None => match self.artifact_for_key(&source)? {
            Some(artifact) => job.dependency_version(&artifact).await?,
            None => return Ok(false),
          },
        };
        if current != recorded {
          debug!(
            rule = %id,
            artifact = %output,
            source = %source,
            recorded = %recorded,
            current = %current,
            "stale: source changed"
          );
          return Ok(false);
        }
      }
    }
    Ok(true)
  }

  /// Record that every current output of `job` was produced from the
  /// versions of its dependencies it relied upon.
  pub async fn record_version_info(&self, job: &Job) -> Result<(), BuildError> {
    let rule = job.rule();
    let outputs = job.outputs();
    let mut batch = FactBatch::default();

    let mut relied = Vec::new();
    for dep in job.dependencies() {
      if outputs.iter().any(|o| o.key() == dep.artifact.key()) {
        continue;
      }
      let version = self
        .reliance
        .relied_version(rule.key(), dep.artifact.key())
        .ok_or_else(|| InternalError::MissingReliance {
          rule: rule.id().to_string(),
          artifact: dep.artifact.to_string(),
        })?;
      batch.add_artifact(&dep.artifact);
      relied.push((dep.artifact.key().clone(), version));
    }

    for output in &outputs {
      if !output.exists().await? {
        warn!(rule = %rule.id(), artifact = %output, "output missing after recipe, not recorded");
        continue;
      }
      let version = output.version().await?;
      batch.add_artifact(output);
      for (source, source_version) in &relied {
        batch.add_fact(Fact {
          target: output.key().clone(),
          target_version: version.clone(),
          rule: rule.key().clone(),
          source: source.clone(),
          source_version: source_version.clone(),
        });
      }
    }

    debug!(rule = %rule.id(), facts = batch.facts.len(), "recording provenance");
    self.store.record(&batch)?;
    Ok(())
  }

  /// Fail if another rule already relied on a different version of anything
  /// `job` just produced.
  pub async fn check_rewrite_after_use(&self, job: &Job) -> Result<(), BuildError> {
    let id = job.rule().id();
    for output in job.outputs() {
      let version = output.version().await?;
      let stale: Vec<(Version, Vec<String>)> = self
        .reliance
        .reliers(output.key())
        .into_iter()
        .filter(|(relied, _)| relied != &version)
        .map(|(relied, rules)| (relied, rules.into_iter().filter(|r| r != id).collect::<Vec<_>>()))
        .filter(|(_, rules)| !rules.is_empty())
        .collect();
      if !stale.is_empty() {
        return Err(BuildError::RewriteAfterUse {
          rule: id.to_string(),
          artifact: output.to_string(),
          version,
          stale,
        });
      }
    }
    Ok(())
  }

  /// Jobs of the given rules that already exist in this session.
  fn existing_jobs<'r>(&self, rules: impl Iterator<Item = &'r Arc<Rule>>) -> JobSet {
    let mut set = JobSet::new();
    for rule in rules {
      if let Some(job) = self.jobs.get(rule.key()) {
        // Jobs come from `self.jobs`, one per key.
        let _ = set.insert(Arc::clone(job.value()));
      }
    }
    set
  }

  /// Build each reference independently.
  pub async fn build(self: &Arc<Self>, references: &[String]) -> BuildReport {
    let outcomes = join_all(references.iter().map(|reference| async move {
      TargetOutcome {
        target: reference.clone(),
        result: self.build_reference(reference).await,
      }
    }))
    .await;
    let requested = self.existing_jobs(
      references
        .iter()
        .filter_map(|reference| self.manager.find(reference).ok().flatten())
        .filter_map(|artifact| self.graph.producer_of(artifact.key())),
    );
    BuildReport {
      targets: outcomes,
      induced: self.run_induced(requested).await,
    }
  }

  async fn build_reference(self: &Arc<Self>, reference: &str) -> Result<(), Arc<BuildError>> {
    let artifact = self.manager.get(reference).map_err(shared)?;
    match self.job_set_for_artifact(&artifact).map_err(Arc::new)? {
      Some(set) => set.run().await,
      None if artifact.exists().await.map_err(shared)? => {
        debug!(artifact = %artifact, "source artifact, nothing to build");
        Ok(())
      }
      None => Err(shared(BuildError::NoRuleToBuild {
        artifact: artifact.to_string(),
      })),
    }
  }

  /// Build rules by id, each independently.
  pub async fn build_rules(self: &Arc<Self>, ids: &[String]) -> BuildReport {
    let outcomes = join_all(ids.iter().map(|id| async move {
      let result = match self.graph.rule_by_id(id) {
        Some(rule) => match self.job_set_for_rule(rule) {
          Ok(set) => set.run().await,
          Err(err) => Err(Arc::new(err)),
        },
        None => Err(shared(BuildError::UnknownRule { rule: id.clone() })),
      };
      TargetOutcome {
        target: id.clone(),
        result,
      }
    }))
    .await;
    let requested = self.existing_jobs(ids.iter().filter_map(|id| self.graph.rule_by_id(id)));
    BuildReport {
      targets: outcomes,
      induced: self.run_induced(requested).await,
    }
  }

  /// Build every rule of the graph.
  pub async fn build_all(self: &Arc<Self>) -> BuildReport {
    let ids: Vec<String> = self.graph.rules().map(|r| r.id().to_string()).collect();
    info!(rules = ids.len(), "building all rules");
    self.build_rules(&ids).await
  }

  /// Ids of rules whose recipe ran in this session, sorted.
  pub fn executed_rules(&self) -> Vec<String> {
    let mut ids: Vec<String> = self
      .jobs
      .iter()
      .filter(|job| job.value().recipe_invoked())
      .map(|job| job.value().rule().id().to_string())
      .collect();
    ids.sort();
    ids
  }
}

impl std::fmt::Debug for BuildSession {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("BuildSession")
      .field("rules", &self.graph.len())
      .field("jobs", &self.jobs.len())
      .field("parallelism", &self.config.parallelism)
      .finish()
  }
}
