use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::debug;

use super::{Rule, RuleKey};
use crate::artifact::ArtifactKey;

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
  #[error("rule `{rule}` references unknown rule `{reference}`")]
  UnknownRule { rule: String, reference: String },

  #[error("rule `{rule}` has no recipe")]
  MissingRecipe { rule: String },

  #[error("`{artifact}` is an output of both `{first}` and `{second}`")]
  DuplicateProducer {
    artifact: String,
    first: String,
    second: String,
  },

  #[error("rule `{rule}` declares `{artifact}` as an output, but that artifact type cannot be built")]
  NotBuildable { rule: String, artifact: String },

  #[error("dependency cycle among rules {}", .rules.iter().map(|r| format!("`{r}`")).collect::<Vec<_>>().join(", "))]
  Cycle { rules: Vec<String> },
}

/// Collects rules before the graph is sealed.
#[derive(Debug, Default)]
pub struct GraphBuilder {
  rules: IndexMap<RuleKey, Rule>,
}

impl GraphBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  /// Add a rule. A rule whose key is already present is ignored; returns
  /// whether the rule was inserted.
  pub fn add_rule(&mut self, rule: Rule) -> bool {
    if self.rules.contains_key(rule.key()) {
      debug!(rule = %rule.id(), "rule already declared, ignoring");
      return false;
    }
    self.rules.insert(rule.key().clone(), rule);
    true
  }

  /// Edit a rule before the graph is finalized.
  pub fn rule_mut(&mut self, key: &RuleKey) -> Option<&mut Rule> {
    self.rules.get_mut(key)
  }

  pub fn len(&self) -> usize {
    self.rules.len()
  }

  pub fn is_empty(&self) -> bool {
    self.rules.is_empty()
  }

  /// Seal the graph: resolve `after`/`also` references, index outputs by
  /// producer and reject cycles.
  pub fn finalize(mut self) -> Result<Graph, GraphError> {
    let ids: HashMap<String, RuleKey> = self.rules.values().map(|r| (r.id.clone(), r.key.clone())).collect();

    for rule in self.rules.values_mut() {
      rule.after = resolve_refs(&ids, rule, &rule.after_refs)?;
      rule.also = resolve_refs(&ids, rule, &rule.also_refs)?;
      if rule.recipe.is_none() {
        return Err(GraphError::MissingRecipe { rule: rule.id.clone() });
      }
    }

    let mut producers: HashMap<ArtifactKey, RuleKey> = HashMap::new();
    for rule in self.rules.values() {
      for output in rule.outputs() {
        if !output.capabilities().can_build {
          return Err(GraphError::NotBuildable {
            rule: rule.id.clone(),
            artifact: output.to_string(),
          });
        }
        if let Some(first) = producers.insert(output.key().clone(), rule.key.clone()) {
          return Err(GraphError::DuplicateProducer {
            artifact: output.to_string(),
            first: self.rules[&first].id.clone(),
            second: rule.id.clone(),
          });
        }
      }
    }

    check_acyclic(&self.rules, &producers)?;

    let rules: IndexMap<RuleKey, Arc<Rule>> = self.rules.into_iter().map(|(k, r)| (k, Arc::new(r))).collect();
    debug!(rules = rules.len(), outputs = producers.len(), "graph finalized");
    Ok(Graph { rules, producers, ids })
  }
}

fn resolve_refs(ids: &HashMap<String, RuleKey>, rule: &Rule, refs: &[String]) -> Result<Vec<RuleKey>, GraphError> {
  refs
    .iter()
    .map(|reference| {
      let local = format!("{}+{reference}", rule.module);
      ids
        .get(reference)
        .or_else(|| if rule.module.is_empty() { None } else { ids.get(&local) })
        .cloned()
        .ok_or_else(|| GraphError::UnknownRule {
          rule: rule.id.clone(),
          reference: reference.clone(),
        })
    })
    .collect()
}

fn check_acyclic(rules: &IndexMap<RuleKey, Rule>, producers: &HashMap<ArtifactKey, RuleKey>) -> Result<(), GraphError> {
  let mut graph: DiGraph<&str, ()> = DiGraph::new();
  let nodes: HashMap<&RuleKey, NodeIndex> = rules.iter().map(|(k, r)| (k, graph.add_node(r.id.as_str()))).collect();

  for (key, rule) in rules {
    let node = nodes[key];
    for dep in rule.dependencies() {
      if let Some(producer) = producers.get(dep.artifact.key()) {
        graph.add_edge(nodes[producer], node, ());
      }
    }
    for after in &rule.after {
      graph.add_edge(nodes[after], node, ());
    }
  }

  if toposort(&graph, None).is_ok() {
    return Ok(());
  }
  let cycle = tarjan_scc(&graph)
    .into_iter()
    .find(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
    .unwrap_or_default();
  let mut members: Vec<String> = cycle.into_iter().map(|n| graph[n].to_string()).collect();
  members.sort();
  Err(GraphError::Cycle { rules: members })
}

/// An immutable, validated rule graph.
#[derive(Debug)]
pub struct Graph {
  rules: IndexMap<RuleKey, Arc<Rule>>,
  producers: HashMap<ArtifactKey, RuleKey>,
  ids: HashMap<String, RuleKey>,
}

impl Graph {
  /// Rule by key.
  pub fn rule(&self, key: &RuleKey) -> Option<&Arc<Rule>> {
    self.rules.get(key)
  }

  /// Rule by its `module+name` id, or plain name in the root module.
  pub fn rule_by_id(&self, id: &str) -> Option<&Arc<Rule>> {
    self.ids.get(id).and_then(|key| self.rules.get(key))
  }

  /// The rule declaring `artifact` as an output, if any.
  pub fn producer_of(&self, artifact: &ArtifactKey) -> Option<&Arc<Rule>> {
    self.producers.get(artifact).and_then(|key| self.rules.get(key))
  }

  /// Rules in declaration order.
  pub fn rules(&self) -> impl Iterator<Item = &Arc<Rule>> {
    self.rules.values()
  }

  pub fn len(&self) -> usize {
    self.rules.len()
  }

  pub fn is_empty(&self) -> bool {
    self.rules.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::artifact::ArtifactManager;
  use crate::recipe::ShellRecipe;
  use crate::rule::AbsencePolicy;

  fn rule(m: &ArtifactManager, module: &str, name: &str, inputs: &[&str], outputs: &[&str]) -> Rule {
    let mut rule = Rule::new(module, name);
    for input in inputs {
      rule.add_dependency(m.get(input).unwrap(), AbsencePolicy::Violation);
    }
    for output in outputs {
      rule.add_output(m.get(output).unwrap());
    }
    rule.set_recipe(Arc::new(ShellRecipe::new("true"))).unwrap();
    rule
  }

  #[test]
  fn producer_index_and_lookup() {
    let m = ArtifactManager::with_defaults("/p").unwrap();
    let mut builder = GraphBuilder::new();
    assert!(builder.add_rule(rule(&m, "", "cc", &["a.c"], &["a.o"])));
    assert!(builder.add_rule(rule(&m, "", "ld", &["a.o"], &["app"])));
    let graph = builder.finalize().unwrap();

    let a_o = m.get("a.o").unwrap();
    assert_eq!(graph.producer_of(a_o.key()).unwrap().id(), "cc");
    assert!(graph.producer_of(m.get("a.c").unwrap().key()).is_none());
    assert_eq!(graph.rule_by_id("ld").unwrap().id(), "ld");
    assert_eq!(graph.rules().map(|r| r.id()).collect::<Vec<_>>(), ["cc", "ld"]);
  }

  #[test]
  fn add_rule_is_idempotent() {
    let m = ArtifactManager::with_defaults("/p").unwrap();
    let mut builder = GraphBuilder::new();
    assert!(builder.add_rule(rule(&m, "", "cc", &[], &["a.o"])));
    assert!(!builder.add_rule(rule(&m, "", "cc", &[], &["b.o"])));
    assert_eq!(builder.len(), 1);
  }

  #[test]
  fn duplicate_producers_are_rejected() {
    let m = ArtifactManager::with_defaults("/p").unwrap();
    let mut builder = GraphBuilder::new();
    builder.add_rule(rule(&m, "", "one", &[], &["x"]));
    builder.add_rule(rule(&m, "", "two", &[], &["x"]));
    let err = builder.finalize().unwrap_err();
    assert!(matches!(err, GraphError::DuplicateProducer { first, second, .. } if first == "one" && second == "two"));
  }

  #[test]
  fn after_and_also_resolve_forward_and_module_local() {
    let m = ArtifactManager::with_defaults("/p").unwrap();
    let mut builder = GraphBuilder::new();
    let mut first = rule(&m, "net", "first", &[], &[]);
    first.add_after("second");
    first.add_also("net+third");
    builder.add_rule(first);
    builder.add_rule(rule(&m, "net", "second", &[], &[]));
    builder.add_rule(rule(&m, "net", "third", &[], &[]));
    let graph = builder.finalize().unwrap();

    let first = graph.rule_by_id("net+first").unwrap();
    assert_eq!(first.after(), [RuleKey::of("net+second")]);
    assert_eq!(first.also(), [RuleKey::of("net+third")]);
  }

  #[test]
  fn unknown_references_are_errors() {
    let m = ArtifactManager::with_defaults("/p").unwrap();
    let mut builder = GraphBuilder::new();
    let mut r = rule(&m, "", "a", &[], &[]);
    r.add_after("ghost");
    builder.add_rule(r);
    assert!(matches!(builder.finalize().unwrap_err(), GraphError::UnknownRule { .. }));
  }

  #[test]
  fn cycles_are_rejected() {
    let m = ArtifactManager::with_defaults("/p").unwrap();
    let mut builder = GraphBuilder::new();
    builder.add_rule(rule(&m, "", "a", &["y"], &["x"]));
    builder.add_rule(rule(&m, "", "b", &["x"], &["y"]));
    builder.add_rule(rule(&m, "", "c", &["x"], &["z"]));
    let err = builder.finalize().unwrap_err();
    assert!(matches!(err, GraphError::Cycle { rules } if rules == ["a", "b"]));
  }

  #[test]
  fn recipe_artifacts_cannot_be_outputs() {
    let m = ArtifactManager::with_defaults("/p").unwrap();
    let mut builder = GraphBuilder::new();
    builder.add_rule(rule(&m, "", "a", &[], &["recipe:b"]));
    assert!(matches!(builder.finalize().unwrap_err(), GraphError::NotBuildable { .. }));
  }

  #[test]
  fn rules_need_a_recipe() {
    let mut builder = GraphBuilder::new();
    builder.add_rule(Rule::new("", "bare"));
    assert!(matches!(builder.finalize().unwrap_err(), GraphError::MissingRecipe { .. }));
  }
}
