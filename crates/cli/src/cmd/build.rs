//! Implementation of the `kiln build` command.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use tokio::sync::mpsc;
use tracing::debug;

use kiln_lib::config::SessionConfig;
use kiln_lib::lock::LockMode;
use kiln_lib::session::{BuildEvent, BuildSession};

use super::Workspace;
use crate::output::{format_duration, print_error, print_running, print_stat, print_success, print_up_to_date};

/// Build `targets` (artifact references) and `rules` (rule ids), or every
/// rule when both are empty.
///
/// Recipes run in the manifest's directory. `also` rules scheduled along the
/// way count as targets too. Failed targets are reported with their full
/// cause chain and make the command fail after every target had
/// its chance to build.
pub fn cmd_build(manifest: &Path, targets: Vec<String>, rules: Vec<String>, jobs: Option<usize>, verbose: bool) -> Result<()> {
  let start = Instant::now();
  let workspace = Workspace::open(manifest, LockMode::Exclusive, "build")?;

  let mut config = SessionConfig::default().with_workdir(&workspace.root);
  if let Some(jobs) = jobs {
    config = config.with_parallelism(jobs);
  }

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let (report, executed) = rt.block_on(async {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
      while let Some(event) = rx.recv().await {
        match event {
          BuildEvent::RecipeStarted { rule } => print_running(&rule),
          BuildEvent::UpToDate { rule } if verbose => print_up_to_date(&rule),
          other => debug!(?other, "build event"),
        }
      }
    });

    let session = BuildSession::with_events(
      Arc::clone(&workspace.graph),
      workspace.store.clone(),
      Arc::clone(&workspace.manager),
      config,
      Some(tx),
    );
    let report = if targets.is_empty() && rules.is_empty() {
      session.build_all().await
    } else {
      let mut report = session.build(&targets).await;
      report.merge(session.build_rules(&rules).await);
      report
    };
    let executed = session.executed_rules().len();
    // The printer ends once the session drops its sender.
    drop(session);
    let _ = printer.await;
    (report, executed)
  });

  let failures: Vec<_> = report.failures().collect();
  for (target, err) in &failures {
    print_error(&format!("{target}: {}", err.trace()));
  }

  println!();
  if failures.is_empty() {
    print_success("Build complete");
  }
  print_stat("Targets", &report.outcomes().count().to_string());
  print_stat("Recipes run", &executed.to_string());
  print_stat("Duration", &format_duration(start.elapsed()));

  if !failures.is_empty() {
    bail!("{} of {} target(s) failed", failures.len(), report.outcomes().count());
  }
  Ok(())
}
