use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;

use super::Job;
use crate::error::{BuildError, InternalError};
use crate::rule::RuleKey;

/// Jobs keyed by rule, at most one job object per rule.
#[derive(Debug, Clone, Default)]
pub struct JobSet {
  jobs: BTreeMap<RuleKey, Arc<Job>>,
}

impl JobSet {
  /// An empty set.
  pub fn new() -> Self {
    Self::default()
  }

  /// A set holding just `job`.
  pub fn single(job: Arc<Job>) -> Self {
    let mut jobs = BTreeMap::new();
    jobs.insert(job.rule().key().clone(), job);
    JobSet { jobs }
  }

  /// Add a job. Re-adding the same job is a no-op; a different job object
  /// for a rule already present is an internal error.
  pub fn insert(&mut self, job: Arc<Job>) -> Result<(), InternalError> {
    match self.jobs.get(job.rule().key()) {
      Some(existing) if Arc::ptr_eq(existing, &job) => Ok(()),
      Some(_) => Err(InternalError::DuplicateJob {
        rule: job.rule().id().to_string(),
      }),
      None => {
        self.jobs.insert(job.rule().key().clone(), job);
        Ok(())
      }
    }
  }

  /// Add every job of `other`, with the same rules as [`JobSet::insert`].
  pub fn extend(&mut self, other: &JobSet) -> Result<(), InternalError> {
    for job in other.jobs.values() {
      self.insert(Arc::clone(job))?;
    }
    Ok(())
  }

  /// Jobs of both sets. Fails like [`JobSet::insert`] when the sets hold
  /// different job objects for one rule.
  pub fn union(&self, other: &JobSet) -> Result<JobSet, InternalError> {
    let mut union = self.clone();
    union.extend(other)?;
    Ok(union)
  }

  /// Jobs of `self` whose rule is not in `other`. Only rule keys are
  /// compared.
  pub fn difference(&self, other: &JobSet) -> JobSet {
    JobSet {
      jobs: self
        .jobs
        .iter()
        .filter(|(key, _)| !other.jobs.contains_key(*key))
        .map(|(key, job)| (key.clone(), Arc::clone(job)))
        .collect(),
    }
  }

  /// Whether the set holds a job for the rule.
  pub fn contains(&self, key: &RuleKey) -> bool {
    self.jobs.contains_key(key)
  }

  /// Rule keys, in key order.
  pub fn keys(&self) -> impl Iterator<Item = &RuleKey> {
    self.jobs.keys()
  }

  /// Jobs, in rule-key order.
  pub fn jobs(&self) -> impl Iterator<Item = &Arc<Job>> {
    self.jobs.values()
  }

  /// Number of jobs.
  pub fn len(&self) -> usize {
    self.jobs.len()
  }

  pub fn is_empty(&self) -> bool {
    self.jobs.is_empty()
  }

  /// Drive every job to completion concurrently. All jobs run even when one
  /// fails; the first failure in rule-key order is returned.
  pub async fn run(&self) -> Result<(), Arc<BuildError>> {
    let results = join_all(self.jobs.values().map(|job| job.run())).await;
    results.into_iter().collect()
  }
}
