use std::fmt;
use std::str::FromStr;

use super::ArtifactError;

/// Parsed artifact reference: `[type:][module+]reference`.
///
/// A `type:` prefix is recognised only when it is a lowercase identifier of at
/// least two characters, so paths such as `c:/x` or `dir/a:b` stay plain
/// references. A `module+` prefix is recognised when the segment before the
/// first `+` contains no `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Aid {
  /// `None` means the manager's default kind.
  pub kind: Option<String>,
  /// Dotted module path, as in `net.http+client.o`.
  pub module: Option<String>,
  pub reference: String,
}

impl Aid {
  pub fn parse(input: &str) -> Result<Self, ArtifactError> {
    let invalid = |reason: &str| ArtifactError::InvalidReference {
      input: input.to_string(),
      reason: reason.to_string(),
    };

    if input.is_empty() {
      return Err(invalid("reference is empty"));
    }

    let (kind, rest) = match input.split_once(':') {
      Some(("", _)) => return Err(invalid("type is empty")),
      Some((prefix, rest)) if looks_like_kind(prefix) => (Some(prefix.to_string()), rest),
      Some((prefix, _)) if !prefix.contains('/') && !prefix.contains('\\') && prefix.len() > 1 => {
        return Err(invalid("type must be a lowercase identifier"));
      }
      _ => (None, input),
    };

    let (module, reference) = match rest.split_once('+') {
      Some(("", _)) => return Err(invalid("module is empty")),
      Some((prefix, reference)) if !prefix.contains('/') && !prefix.contains('\\') => {
        (Some(prefix.to_string()), reference)
      }
      _ => (None, rest),
    };

    if reference.is_empty() {
      return Err(invalid("reference is empty"));
    }

    Ok(Aid {
      kind,
      module,
      reference: reference.to_string(),
    })
  }

  /// `[module+]reference`, the part of the reference that names the artifact
  /// within its type.
  pub fn identity(&self) -> String {
    match &self.module {
      Some(module) => format!("{module}+{}", self.reference),
      None => self.reference.clone(),
    }
  }

  /// Fill in a module for references that did not name one.
  pub fn in_module(mut self, module: &str) -> Self {
    if self.module.is_none() && !module.is_empty() {
      self.module = Some(module.to_string());
    }
    self
  }
}

fn looks_like_kind(prefix: &str) -> bool {
  let mut chars = prefix.chars();
  prefix.len() > 1
    && chars.next().is_some_and(|c| c.is_ascii_lowercase())
    && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

impl FromStr for Aid {
  type Err = ArtifactError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Aid::parse(s)
  }
}

impl fmt::Display for Aid {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if let Some(kind) = &self.kind {
      write!(f, "{kind}:")?;
    }
    write!(f, "{}", self.identity())
  }
}
