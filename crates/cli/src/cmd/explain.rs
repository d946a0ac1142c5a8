//! Implementation of the `kiln explain` command.
//!
//! Shows which rule produced the current version of an artifact and from
//! which source versions, marking sources that changed since.

use std::path::Path;

use anyhow::{Context, Result};
use owo_colors::{OwoColorize, Stream};
use serde::Serialize;

use kiln_lib::consts::RECIPE_KIND;
use kiln_lib::lock::LockMode;
use kiln_lib::provenance::ProvenanceStore;

use super::Workspace;
use crate::output::{OutputFormat, print_info, print_json, print_stat, short_version};

#[derive(Debug, Serialize)]
struct Explanation {
  artifact: String,
  version: String,
  producer: Option<String>,
  sources: Vec<SourceState>,
}

#[derive(Debug, Serialize)]
struct SourceState {
  artifact: String,
  recorded: String,
  current: Option<String>,
  changed: bool,
}

pub fn cmd_explain(manifest: &Path, target: &str, output: OutputFormat) -> Result<()> {
  let workspace = Workspace::open(manifest, LockMode::Shared, "explain")?;
  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let explanation = rt.block_on(explain(&workspace, target))?;

  if output.is_json() {
    return print_json(&explanation);
  }

  let Some(producer) = &explanation.producer else {
    print_info(&format!(
      "No recorded producer for {} at version {}",
      explanation.artifact,
      short_version(&explanation.version)
    ));
    return Ok(());
  };

  println!("{}", explanation.artifact);
  print_stat("Version", short_version(&explanation.version));
  print_stat("Built by", producer);
  for source in &explanation.sources {
    let state = match (&source.current, source.changed) {
      (None, _) => "not checked".to_string(),
      (Some(_), false) => "unchanged".to_string(),
      (Some(current), true) => format!("changed, now {}", short_version(current)),
    };
    let line = format!(
      "    {} @ {} ({state})",
      source.artifact,
      short_version(&source.recorded)
    );
    if source.changed {
      println!("{}", line.if_supports_color(Stream::Stdout, |s| s.yellow()));
    } else {
      println!("{line}");
    }
  }
  Ok(())
}

async fn explain(workspace: &Workspace, target: &str) -> Result<Explanation> {
  let artifact = workspace.manager.get(target)?;
  let version = artifact.version().await?;
  let store = &workspace.store;

  let producer = store.producer_of(artifact.key(), &version)?;
  let mut sources = Vec::new();
  if producer.is_some() {
    for (key, recorded) in store.version_sources(artifact.key(), &version)? {
      let source = match store.artifact_row(&key)? {
        Some(row) => Some(workspace.manager.get(&row.reference())?),
        None => None,
      };
      // Recipe versions only exist while their rule's job is alive.
      let current = match &source {
        Some(source) if source.kind() != RECIPE_KIND => Some(source.version().await?),
        _ => None,
      };
      sources.push(SourceState {
        artifact: source.map(|s| s.to_string()).unwrap_or_else(|| key.to_string()),
        recorded: recorded.to_string(),
        changed: current.as_ref().is_some_and(|current| current != &recorded),
        current: current.map(|v| v.to_string()),
      });
    }
  }

  Ok(Explanation {
    artifact: artifact.to_string(),
    version: version.to_string(),
    producer: producer.map(|key| workspace.rule_name(&key)),
    sources,
  })
}
