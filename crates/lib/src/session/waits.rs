use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::rule::RuleKey;

/// Wait-for graph of jobs blocked on their prerequisites.
///
/// Recorded dependencies are loaded from history at run time, so they can
/// close cycles the static graph check never saw. Refusing the edge that
/// would close a cycle turns a deadlock into an error.
#[derive(Debug, Default)]
pub(crate) struct WaitGraph {
  edges: Mutex<HashMap<RuleKey, Vec<RuleKey>>>,
}

pub(crate) struct WaitGuard<'a> {
  graph: &'a WaitGraph,
  waiter: RuleKey,
}

impl Drop for WaitGuard<'_> {
  fn drop(&mut self) {
    self.graph.lock().remove(&self.waiter);
  }
}

impl WaitGraph {
  fn lock(&self) -> MutexGuard<'_, HashMap<RuleKey, Vec<RuleKey>>> {
    self.edges.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Register `waiter` as waiting on `prerequisites`. On a cycle, returns the
  /// rule keys along it, starting and ending with `waiter`.
  pub(crate) fn enter<'k>(
    &self,
    waiter: &RuleKey,
    prerequisites: impl IntoIterator<Item = &'k RuleKey>,
  ) -> Result<WaitGuard<'_>, Vec<RuleKey>> {
    let prerequisites: Vec<RuleKey> = prerequisites.into_iter().cloned().collect();
    let mut edges = self.lock();
    for prerequisite in &prerequisites {
      if let Some(path) = path_between(&edges, prerequisite, waiter) {
        let mut cycle = Vec::with_capacity(path.len() + 1);
        cycle.push(waiter.clone());
        cycle.extend(path);
        return Err(cycle);
      }
    }
    edges.insert(waiter.clone(), prerequisites);
    Ok(WaitGuard {
      graph: self,
      waiter: waiter.clone(),
    })
  }
}

/// Path of keys from `from` to `to` following wait edges, both ends included.
fn path_between(edges: &HashMap<RuleKey, Vec<RuleKey>>, from: &RuleKey, to: &RuleKey) -> Option<Vec<RuleKey>> {
  let mut stack: Vec<Vec<RuleKey>> = vec![vec![from.clone()]];
  let mut seen: HashSet<RuleKey> = HashSet::new();
  while let Some(path) = stack.pop() {
    let last = path.last()?;
    if last == to {
      return Some(path);
    }
    if !seen.insert(last.clone()) {
      continue;
    }
    for next in edges.get(last).into_iter().flatten() {
      let mut extended = path.clone();
      extended.push(next.clone());
      stack.push(extended);
    }
  }
  None
}
