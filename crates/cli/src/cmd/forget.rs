//! Implementation of the `kiln forget` command.

use std::path::Path;

use anyhow::Result;

use kiln_lib::lock::LockMode;
use kiln_lib::provenance::ProvenanceStore;
use kiln_lib::rule::RuleKey;

use super::Workspace;
use crate::output::{print_info, print_success};

/// Drop everything the ledger remembers about `rule`, so its next build
/// runs the recipe. Rules no longer in the manifest can be forgotten too.
pub fn cmd_forget(manifest: &Path, rule: &str) -> Result<()> {
  let workspace = Workspace::open(manifest, LockMode::Exclusive, "forget")?;
  let key = match workspace.graph.rule_by_id(rule) {
    Some(known) => known.key().clone(),
    None => RuleKey::of(rule),
  };

  match workspace.store.retract_rule(&key)? {
    0 => print_info(&format!("Nothing recorded for `{rule}`")),
    removed => print_success(&format!("Forgot {removed} recorded version(s) built by `{rule}`")),
  }
  Ok(())
}
