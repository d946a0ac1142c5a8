//! Serialized form of `kiln.json`.
//!
//! ```json
//! {
//!   "version": 1,
//!   "rules": [
//!     {
//!       "name": "app",
//!       "inputs": ["src/main.c", "lib+libfoo.a"],
//!       "outputs": ["build/app"],
//!       "after": ["fmt"],
//!       "recipe": { "type": "shell", "command": "cc -o ${out} ${in}" }
//!     }
//!   ]
//! }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The whole manifest file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManifestDef {
  #[serde(default = "default_version")]
  pub version: u32,
  #[serde(default)]
  pub rules: Vec<RuleDef>,
}

fn default_version() -> u32 {
  1
}

/// One production rule. Artifact references without a module inherit the
/// rule's module; `after`/`also` name rules by id or by name within the
/// same module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleDef {
  #[serde(default)]
  pub module: String,
  pub name: String,
  #[serde(default)]
  pub inputs: Vec<String>,
  #[serde(default)]
  pub outputs: Vec<String>,
  #[serde(default)]
  pub after: Vec<String>,
  #[serde(default)]
  pub also: Vec<String>,
  #[serde(default)]
  pub always: bool,
  pub recipe: RecipeDef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum RecipeDef {
  Shell {
    command: String,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    shell: Option<String>,
  },
  Delay {
    millis: u64,
    recipe: Box<RecipeDef>,
  },
  Wrap {
    #[serde(default)]
    before: Vec<RecipeDef>,
    main: Box<RecipeDef>,
    #[serde(default)]
    after: Vec<RecipeDef>,
  },
}
