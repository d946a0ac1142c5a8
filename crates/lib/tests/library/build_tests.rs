//! End-to-end builds of shell rules against files on disk.

use kiln_lib::BuildError;
use kiln_lib::artifact::{ArtifactKey, Version};
use kiln_lib::provenance::{FileProvenance, ProvenanceStore};
use kiln_lib::rule::RuleKey;
use serde_json::json;

use super::common::{Project, assert_success};

fn copy_manifest(command: &str) -> String {
  json!({
    "rules": [{
      "name": "copy",
      "inputs": ["src.txt"],
      "outputs": ["out.txt"],
      "recipe": { "type": "shell", "command": command }
    }]
  })
  .to_string()
}

const COPY: &str = "cat ${in} > ${out} && echo copy >> runs.log";

#[tokio::test]
async fn unchanged_inputs_are_not_rebuilt() {
  let project = Project::new();
  project.write("src.txt", "hello");

  assert_success(&project.build_all(&copy_manifest(COPY)).await);
  assert_eq!(project.read("out.txt"), "hello");

  let session = project.session(&copy_manifest(COPY));
  assert_success(&session.build_all().await);
  assert!(session.executed_rules().is_empty());
  assert_eq!(project.runs(), vec!["copy"]);
}

#[tokio::test]
async fn edited_input_is_rebuilt() {
  let project = Project::new();
  project.write("src.txt", "hello");
  assert_success(&project.build_all(&copy_manifest(COPY)).await);

  project.write("src.txt", "goodbye");
  assert_success(&project.build_all(&copy_manifest(COPY)).await);
  assert_eq!(project.read("out.txt"), "goodbye");
  assert_eq!(project.runs().len(), 2);
}

#[tokio::test]
async fn edited_command_is_rebuilt() {
  let project = Project::new();
  project.write("src.txt", "hello");
  assert_success(&project.build_all(&copy_manifest(COPY)).await);

  let upper = "tr a-z A-Z < ${in} > ${out} && echo copy >> runs.log";
  assert_success(&project.build_all(&copy_manifest(upper)).await);
  assert_eq!(project.read("out.txt"), "HELLO");
  assert_eq!(project.runs().len(), 2);
}

#[tokio::test]
async fn deleted_output_is_rebuilt() {
  let project = Project::new();
  project.write("src.txt", "hello");
  assert_success(&project.build_all(&copy_manifest(COPY)).await);

  std::fs::remove_file(project.path("out.txt")).unwrap();
  assert_success(&project.build_all(&copy_manifest(COPY)).await);
  assert_eq!(project.read("out.txt"), "hello");
  assert_eq!(project.runs().len(), 2);
}

#[tokio::test]
async fn chained_rules_rebuild_only_downstream_of_a_change() {
  let project = Project::new();
  project.write("a.txt", "a");
  project.write("b.txt", "b");
  let manifest = json!({
    "rules": [
      {
        "name": "left",
        "inputs": ["a.txt"],
        "outputs": ["left.txt"],
        "recipe": { "type": "shell", "command": "cat ${in} > ${out} && echo left >> runs.log" }
      },
      {
        "name": "right",
        "inputs": ["b.txt"],
        "outputs": ["right.txt"],
        "recipe": { "type": "shell", "command": "cat ${in} > ${out} && echo right >> runs.log" }
      },
      {
        "name": "both",
        "inputs": ["left.txt", "right.txt"],
        "outputs": ["both.txt"],
        "recipe": { "type": "shell", "command": "cat ${in} > ${out} && echo both >> runs.log" }
      }
    ]
  })
  .to_string();

  let session = project.session(&manifest);
  assert_success(&session.build(&["both.txt".to_string()]).await);
  assert_eq!(project.read("both.txt"), "ab");
  assert_eq!(session.executed_rules(), vec!["both", "left", "right"]);

  project.write("b.txt", "B");
  let session = project.session(&manifest);
  assert_success(&session.build(&["both.txt".to_string()]).await);
  assert_eq!(project.read("both.txt"), "aB");
  assert_eq!(session.executed_rules(), vec!["both", "right"]);
}

#[tokio::test]
async fn failing_command_reports_exit_status() {
  let project = Project::new();
  project.write("src.txt", "hello");
  let report = project.build_all(&copy_manifest("exit 3")).await;

  let (target, err) = report.failures().next().unwrap();
  assert_eq!(target, "copy");
  assert_eq!(
    err.trace(),
    "`copy` failed to build\nbecause command `exit 3` exited with status 3"
  );
  assert!(matches!(
    &**err,
    BuildError::RuleFailed { cause, .. } if matches!(**cause, BuildError::RecipeExit { code: 3, .. })
  ));
}

#[tokio::test]
async fn missing_declared_output_fails_dependents() {
  let project = Project::new();
  project.write("src.txt", "hello");
  let manifest = json!({
    "rules": [
      {
        "name": "lazy",
        "inputs": ["src.txt"],
        "outputs": ["never.txt"],
        "recipe": { "type": "shell", "command": "true" }
      },
      {
        "name": "user",
        "inputs": ["never.txt"],
        "outputs": ["used.txt"],
        "recipe": { "type": "shell", "command": "cat ${in} > ${out}" }
      }
    ]
  })
  .to_string();

  let report = project.session(&manifest).build(&["used.txt".to_string()]).await;
  let (_, err) = report.failures().next().unwrap();
  assert_eq!(
    err.trace(),
    "`user` failed to build\nbecause `lazy` did not create required `file:never.txt`"
  );
}

#[tokio::test]
async fn renamed_output_removes_the_old_one() {
  let project = Project::new();
  project.write("src.txt", "hello");
  let first = json!({
    "rules": [{
      "name": "copy",
      "inputs": ["src.txt"],
      "outputs": ["old.txt"],
      "recipe": { "type": "shell", "command": "cat ${in} > ${out}" }
    }]
  })
  .to_string();
  let second = first.replace("old.txt", "new.txt");

  assert_success(&project.build_all(&first).await);
  assert!(project.exists("old.txt"));

  assert_success(&project.build_all(&second).await);
  assert!(project.exists("new.txt"));
  assert!(!project.exists("old.txt"));
}

#[tokio::test]
async fn after_orders_without_depending() {
  let project = Project::new();
  let manifest = json!({
    "rules": [
      {
        "name": "first",
        "outputs": ["first.txt"],
        "recipe": { "type": "shell", "command": "echo first >> runs.log && touch ${out}" }
      },
      {
        "name": "second",
        "outputs": ["second.txt"],
        "after": ["first"],
        "recipe": { "type": "shell", "command": "echo second >> runs.log && touch ${out}" }
      }
    ]
  })
  .to_string();

  assert_success(&project.session(&manifest).build(&["second.txt".to_string()]).await);
  assert_eq!(project.runs(), vec!["first", "second"]);
}

#[tokio::test]
async fn also_runs_after_the_inducing_rule() {
  let project = Project::new();
  let manifest = json!({
    "rules": [
      {
        "name": "main",
        "outputs": ["main.txt"],
        "also": ["extra"],
        "recipe": { "type": "shell", "command": "echo main >> runs.log && touch ${out}" }
      },
      {
        "name": "extra",
        "outputs": ["extra.txt"],
        "recipe": { "type": "shell", "command": "echo extra >> runs.log && touch ${out}" }
      }
    ]
  })
  .to_string();

  assert_success(&project.session(&manifest).build(&["main.txt".to_string()]).await);
  assert_eq!(project.runs(), vec!["main", "extra"]);
  assert!(project.exists("extra.txt"));
}

#[tokio::test]
async fn forgotten_rule_is_rebuilt() {
  let project = Project::new();
  project.write("src.txt", "hello");
  assert_success(&project.build_all(&copy_manifest(COPY)).await);

  let store = FileProvenance::open(project.ledger_path()).unwrap();
  assert!(store.retract_rule(&RuleKey::of("copy")).unwrap() > 0);
  drop(store);

  assert_success(&project.build_all(&copy_manifest(COPY)).await);
  assert_eq!(project.runs().len(), 2);
}

#[tokio::test]
async fn ledger_records_what_each_output_was_built_from() {
  let project = Project::new();
  project.write("src.txt", "hello");
  assert_success(&project.build_all(&copy_manifest(COPY)).await);

  let store = FileProvenance::open(project.ledger_path()).unwrap();
  let out = ArtifactKey::of("file", "out.txt");
  let src = ArtifactKey::of("file", "src.txt");
  let versions = store.recorded_versions(&out).unwrap();
  assert_eq!(versions.len(), 1);
  let version: &Version = &versions[0];

  assert_eq!(store.producer_of(&out, version).unwrap(), Some(RuleKey::of("copy")));
  let sources = store.version_sources(&out, version).unwrap();
  assert!(sources.iter().any(|(key, _)| key == &src));
  assert!(sources.iter().any(|(key, _)| key == &ArtifactKey::of("recipe", "copy")));
  assert_eq!(store.rule_outputs(&RuleKey::of("copy")).unwrap(), vec![out.clone()]);
  assert_eq!(store.artifact_row(&out).unwrap().unwrap().reference(), "file:out.txt");
}
