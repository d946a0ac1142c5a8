//! Fingerprinting helpers shared by artifact keys, versions and recipe specs.
//!
//! - `key_hash()`: truncated digest used for artifact and rule keys
//! - `json_hash()`: digest of a canonical JSON value (recipe specs)
//! - `hash_file()` / `hash_directory()`: content fingerprints for file artifacts
//! - `hash_bytes()`: content fingerprint for in-memory values

use std::fs;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::consts::KEY_HASH_LEN;

/// A full 64-character lowercase hex SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl std::fmt::Display for ContentHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

#[derive(Debug, thiserror::Error)]
pub enum ContentHashError {
  #[error("failed to walk directory {path}: {message}")]
  Walk { path: String, message: String },

  #[error("failed to read {path}: {message}")]
  Read { path: String, message: String },
}

/// Digest of several string parts, truncated to [`KEY_HASH_LEN`] hex characters.
///
/// Each part is length-prefixed so `("ab", "c")` and `("a", "bc")` differ.
pub fn key_hash(parts: &[&str]) -> String {
  let mut hasher = Sha256::new();
  for part in parts {
    hasher.update((part.len() as u64).to_le_bytes());
    hasher.update(part.as_bytes());
  }
  let full = format!("{:x}", hasher.finalize());
  full[..KEY_HASH_LEN].to_string()
}

/// Digest of a JSON value.
///
/// `serde_json::Value` keeps object keys sorted (no `preserve_order`), so the
/// serialized form is canonical.
pub fn json_hash(value: &serde_json::Value) -> ContentHash {
  hash_bytes(value.to_string().as_bytes())
}

pub fn hash_bytes(data: &[u8]) -> ContentHash {
  ContentHash(format!("{:x}", Sha256::digest(data)))
}

/// Hash a single file's contents, streaming.
pub fn hash_file(path: &Path) -> Result<ContentHash, ContentHashError> {
  let read_err = |e: std::io::Error| ContentHashError::Read {
    path: path.display().to_string(),
    message: e.to_string(),
  };
  let mut file = fs::File::open(path).map_err(read_err)?;
  let mut hasher = Sha256::new();
  let mut buffer = [0u8; 8192];
  loop {
    let n = file.read(&mut buffer).map_err(read_err)?;
    if n == 0 {
      break;
    }
    hasher.update(&buffer[..n]);
  }
  Ok(ContentHash(format!("{:x}", hasher.finalize())))
}

/// Deterministic fingerprint of a directory tree.
///
/// Covers relative paths, file contents and symlink targets. Timestamps and
/// permissions do not participate, and special files are ignored.
pub fn hash_directory(root: &Path) -> Result<ContentHash, ContentHashError> {
  let mut lines = Vec::new();

  for entry in WalkDir::new(root).sort_by_file_name().min_depth(1) {
    let entry = entry.map_err(|e| ContentHashError::Walk {
      path: root.display().to_string(),
      message: e.to_string(),
    })?;
    let rel = entry
      .path()
      .strip_prefix(root)
      .unwrap_or(entry.path())
      .to_string_lossy()
      .replace('\\', "/");

    let kind = entry.file_type();
    let line = if kind.is_symlink() {
      let target = fs::read_link(entry.path()).map_err(|e| ContentHashError::Read {
        path: entry.path().display().to_string(),
        message: e.to_string(),
      })?;
      format!("link {rel} {}", hash_bytes(target.to_string_lossy().as_bytes()))
    } else if kind.is_dir() {
      format!("dir {rel}")
    } else if kind.is_file() {
      format!("file {rel} {}", hash_file(entry.path())?)
    } else {
      continue;
    };
    lines.push(line);
  }

  lines.sort();
  let mut hasher = Sha256::new();
  for line in &lines {
    hasher.update(line.as_bytes());
    hasher.update(b"\n");
  }
  Ok(ContentHash(format!("{:x}", hasher.finalize())))
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use tempfile::tempdir;

  #[test]
  fn key_hash_is_truncated_and_stable() {
    let a = key_hash(&["file", "src/main.c"]);
    assert_eq!(a.len(), KEY_HASH_LEN);
    assert_eq!(a, key_hash(&["file", "src/main.c"]));
  }

  #[test]
  fn key_hash_separates_parts() {
    assert_ne!(key_hash(&["ab", "c"]), key_hash(&["a", "bc"]));
  }

  #[test]
  fn json_hash_ignores_insertion_order() {
    let a = json!({"cmd": "cc", "env": {"A": "1", "B": "2"}});
    let b = json!({"env": {"B": "2", "A": "1"}, "cmd": "cc"});
    assert_eq!(json_hash(&a), json_hash(&b));
  }

  #[test]
  fn directory_hash_tracks_content_and_layout() {
    let one = tempdir().unwrap();
    fs::write(one.path().join("a.txt"), "a").unwrap();
    let first = hash_directory(one.path()).unwrap();
    assert_eq!(first, hash_directory(one.path()).unwrap());

    fs::write(one.path().join("a.txt"), "changed").unwrap();
    assert_ne!(first, hash_directory(one.path()).unwrap());

    let two = tempdir().unwrap();
    fs::create_dir(two.path().join("sub")).unwrap();
    fs::write(two.path().join("sub/a.txt"), "a").unwrap();
    assert_ne!(first, hash_directory(two.path()).unwrap());
  }

  #[test]
  fn file_hash_matches_bytes_hash() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("f");
    fs::write(&path, "hello world").unwrap();
    assert_eq!(hash_file(&path).unwrap(), hash_bytes(b"hello world"));
  }

  #[test]
  fn missing_file_is_a_read_error() {
    let dir = tempdir().unwrap();
    let err = hash_file(&dir.path().join("nope")).unwrap_err();
    assert!(matches!(err, ContentHashError::Read { .. }));
  }
}
