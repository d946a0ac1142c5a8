use std::collections::BTreeMap;
use std::process::ExitStatus;

use async_trait::async_trait;
use serde_json::json;
use tokio::process::Command;
use tracing::{debug, info};

use super::{Recipe, RecipeSpec};
use crate::error::{BuildError, InternalError};
use crate::job::Job;

/// Runs a command template through the platform shell.
///
/// Placeholders: `${out}` / `${in}` expand to every declared output / input,
/// `${out:N}` / `${in:N}` to the N-th one (zero based). Paths are resolved
/// to their filesystem locations and shell-quoted. Any other `${...}` is left
/// for the shell.
#[derive(Debug, Clone)]
pub struct ShellRecipe {
  command: String,
  env: BTreeMap<String, String>,
  cwd: Option<String>,
  shell: Option<String>,
}

impl ShellRecipe {
  pub fn new(command: impl Into<String>) -> Self {
    ShellRecipe {
      command: command.into(),
      env: BTreeMap::new(),
      cwd: None,
      shell: None,
    }
  }

  pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.env.insert(key.into(), value.into());
    self
  }

  /// Working directory, as a file reference in the project.
  pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
    self.cwd = Some(cwd.into());
    self
  }

  pub fn shell(mut self, shell: impl Into<String>) -> Self {
    self.shell = Some(shell.into());
    self
  }
}

/// Shell program and the arguments placed before the command string.
fn shell_invocation(override_shell: Option<&str>) -> Vec<String> {
  if let Some(shell) = override_shell {
    let flag = if shell.contains("cmd") { "/C" } else { "-c" };
    return vec![shell.to_string(), flag.to_string()];
  }

  #[cfg(unix)]
  {
    vec!["/bin/sh".to_string(), "-c".to_string()]
  }

  #[cfg(windows)]
  {
    vec!["cmd.exe".to_string(), "/C".to_string()]
  }
}

fn quote(path: &str) -> String {
  let plain = !path.is_empty()
    && path
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || "_-./+:=,@%".contains(c) || (cfg!(windows) && c == '\\'));
  if plain {
    path.to_string()
  } else if cfg!(windows) {
    format!("\"{path}\"")
  } else {
    format!("'{}'", path.replace('\'', r"'\''"))
  }
}

/// Expand `${in}`, `${out}`, `${in:N}` and `${out:N}` in `template`.
fn render(template: &str, inputs: &[String], outputs: &[String]) -> Result<String, BuildError> {
  let mut out = String::with_capacity(template.len());
  let mut rest = template;

  while let Some(start) = rest.find("${") {
    out.push_str(&rest[..start]);
    let after = &rest[start + 2..];
    let Some(end) = after.find('}') else {
      out.push_str(&rest[start..]);
      return Ok(out);
    };
    let name = &after[..end];
    let (list, index) = match name.split_once(':') {
      Some((list, index)) => (list, Some(index)),
      None => (name, None),
    };
    let paths = match list {
      "in" => Some(inputs),
      "out" => Some(outputs),
      _ => None,
    };

    match (paths, index) {
      (Some(paths), None) => {
        let quoted: Vec<String> = paths.iter().map(|p| quote(p)).collect();
        out.push_str(&quoted.join(" "));
      }
      (Some(paths), Some(index)) => {
        let path = index
          .parse::<usize>()
          .ok()
          .and_then(|i| paths.get(i))
          .ok_or_else(|| BuildError::Recipe(format!("placeholder `${{{name}}}` does not name a declared {list}put")))?;
        out.push_str(&quote(path));
      }
      (None, _) => out.push_str(&rest[start..start + 2 + end + 1]),
    }
    rest = &after[end + 1..];
  }
  out.push_str(rest);
  Ok(out)
}

#[async_trait]
impl Recipe for ShellRecipe {
  async fn concretize_spec_for(&self, job: &Job) -> Result<RecipeSpec, BuildError> {
    let rule = job.rule();
    let inputs = rule
      .dependencies()
      .map(|dep| job.resolve(&dep.artifact))
      .collect::<Result<Vec<_>, _>>()?;
    let outputs = rule.outputs().map(|a| job.resolve(a)).collect::<Result<Vec<_>, _>>()?;

    let command = render(&self.command, &inputs, &outputs)?;
    let cwd = match &self.cwd {
      Some(reference) => Some(job.resolve_reference(reference)?),
      None => job.workdir().map(|p| p.to_string_lossy().into_owned()),
    };

    Ok(RecipeSpec::new(json!({
      "type": "shell",
      "shell": shell_invocation(self.shell.as_deref()),
      "command": command,
      "env": self.env,
      "cwd": cwd,
    })))
  }

  async fn execute_for(&self, job: &Job, spec: &RecipeSpec) -> Result<(), BuildError> {
    let command_line = spec.str_field("command")?;
    let shell: Vec<String> = serde_json::from_value(spec.part("/shell")?.0)
      .map_err(|e| InternalError::MalformedSpec(format!("shell: {e}")))?;
    let env: BTreeMap<String, String> = serde_json::from_value(spec.part("/env")?.0)
      .map_err(|e| InternalError::MalformedSpec(format!("env: {e}")))?;
    let (program, args) = shell
      .split_first()
      .ok_or_else(|| InternalError::MalformedSpec("empty shell invocation".to_string()))?;

    info!(rule = %job.rule().id(), cmd = %command_line, "executing command");

    let mut command = Command::new(program);
    command.args(args).arg(command_line).envs(&env);
    if let Some(cwd) = spec.value().get("cwd").and_then(|v| v.as_str()) {
      command.current_dir(cwd);
    }

    let output = command.output().await.map_err(|source| BuildError::Io {
      context: format!("spawning `{command_line}`"),
      source,
    })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stdout.trim().is_empty() {
      debug!(rule = %job.rule().id(), stdout = %stdout.trim(), "command stdout");
    }
    if !stderr.trim().is_empty() {
      debug!(rule = %job.rule().id(), stderr = %stderr.trim(), "command stderr");
    }

    check_status(command_line, output.status)
  }
}

fn check_status(command: &str, status: ExitStatus) -> Result<(), BuildError> {
  if status.success() {
    return Ok(());
  }
  if let Some(code) = status.code() {
    return Err(BuildError::RecipeExit {
      command: command.to_string(),
      code,
    });
  }
  #[cfg(unix)]
  {
    use std::os::unix::process::ExitStatusExt;
    if let Some(signal) = status.signal() {
      return Err(BuildError::RecipeSignal {
        command: command.to_string(),
        signal,
      });
    }
  }
  Err(BuildError::Recipe(format!("`{command}` ended with {status}")))
}
