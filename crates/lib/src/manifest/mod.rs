//! The JSON rule manifest.
//!
//! A manifest is the only way rules are declared outside of Rust code. It is
//! parsed into [`ManifestDef`] and then turned into a finalized
//! [`Graph`] whose artifacts are interned in the given [`ArtifactManager`].

mod types;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

pub use types::*;

use crate::artifact::{Aid, ArtifactError, ArtifactManager};
use crate::error::InternalError;
use crate::recipe::{DelayRecipe, Recipe, ShellRecipe, WrapRecipe};
use crate::rule::{AbsencePolicy, Graph, GraphBuilder, GraphError, Rule};

const SUPPORTED_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ManifestError {
  #[error("failed to read manifest {}", .path.display())]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("invalid manifest: {0}")]
  Parse(#[from] serde_json::Error),

  #[error("manifest version {found} is not supported (expected {SUPPORTED_VERSION})")]
  UnsupportedVersion { found: u32 },

  #[error("rule `{rule}` is declared twice")]
  DuplicateRule { rule: String },

  #[error("rule `{rule}`: bad artifact reference `{reference}`")]
  Reference {
    rule: String,
    reference: String,
    #[source]
    source: ArtifactError,
  },

  #[error(transparent)]
  Graph(#[from] GraphError),

  #[error(transparent)]
  Internal(#[from] InternalError),
}

impl ManifestDef {
  pub fn load(path: &Path) -> Result<Self, ManifestError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ManifestError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    contents.parse()
  }

  /// Build the rule graph. Artifacts are created through `manager`, so the
  /// caller's session sees the same interned instances.
  pub fn into_graph(self, manager: &ArtifactManager) -> Result<Graph, ManifestError> {
    let mut builder = GraphBuilder::new();
    for def in self.rules {
      let rule = def.into_rule(manager)?;
      let id = rule.id().to_string();
      if !builder.add_rule(rule) {
        return Err(ManifestError::DuplicateRule { rule: id });
      }
    }
    debug!(rules = builder.len(), "manifest loaded");
    Ok(builder.finalize()?)
  }
}

impl std::str::FromStr for ManifestDef {
  type Err = ManifestError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let manifest: ManifestDef = serde_json::from_str(s)?;
    if manifest.version != SUPPORTED_VERSION {
      return Err(ManifestError::UnsupportedVersion {
        found: manifest.version,
      });
    }
    Ok(manifest)
  }
}

impl RuleDef {
  fn into_rule(self, manager: &ArtifactManager) -> Result<Rule, ManifestError> {
    let mut rule = Rule::new(&self.module, &self.name);
    let id = rule.id().to_string();
    let artifact = |reference: &str| {
      Aid::parse(reference)
        .and_then(|aid| manager.get_aid(aid.in_module(&self.module)))
        .map_err(|source| ManifestError::Reference {
          rule: id.clone(),
          reference: reference.to_string(),
          source,
        })
    };

    for input in &self.inputs {
      rule.add_dependency(artifact(input)?, AbsencePolicy::Violation);
    }
    for output in &self.outputs {
      rule.add_output(artifact(output)?);
    }
    for after in self.after {
      rule.add_after(after);
    }
    for also in self.also {
      rule.add_also(also);
    }
    rule.set_always(self.always);
    rule.set_recipe(self.recipe.build())?;
    Ok(rule)
  }
}

impl RecipeDef {
  pub fn build(self) -> Arc<dyn Recipe> {
    match self {
      RecipeDef::Shell {
        command,
        env,
        cwd,
        shell,
      } => {
        let mut recipe = ShellRecipe::new(command);
        for (key, value) in env {
          recipe = recipe.env(key, value);
        }
        if let Some(cwd) = cwd {
          recipe = recipe.cwd(cwd);
        }
        if let Some(shell) = shell {
          recipe = recipe.shell(shell);
        }
        Arc::new(recipe)
      }
      RecipeDef::Delay { millis, recipe } => Arc::new(DelayRecipe::new(Duration::from_millis(millis), recipe.build())),
      RecipeDef::Wrap { before, main, after } => {
        let mut recipe = WrapRecipe::new(main.build());
        for step in before {
          recipe = recipe.before(step.build());
        }
        for step in after {
          recipe = recipe.after(step.build());
        }
        Arc::new(recipe)
      }
    }
  }
}
