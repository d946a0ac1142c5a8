//! Implementation of the `kiln prune` command.

use std::path::Path;

use anyhow::Result;

use kiln_lib::lock::LockMode;
use kiln_lib::provenance::ProvenanceStore;

use super::Workspace;
use crate::output::print_success;

pub fn cmd_prune(manifest: &Path) -> Result<()> {
  let workspace = Workspace::open(manifest, LockMode::Exclusive, "prune")?;
  let removed = workspace.store.prune_artifacts()?;
  print_success(&format!("Pruned {removed} unreferenced artifact record(s)"));
  Ok(())
}
