pub const APP_NAME: &str = "kiln";

/// Number of hex characters kept from the SHA-256 digest for artifact and rule keys.
pub const KEY_HASH_LEN: usize = 20;

/// Kind assumed for references without a `kind:` prefix.
pub const DEFAULT_ARTIFACT_KIND: &str = "file";
pub const FILE_KIND: &str = "file";
pub const INTERNAL_KIND: &str = "internal";
pub const RECIPE_KIND: &str = "recipe";

pub const DEFAULT_MANIFEST_FILENAME: &str = "kiln.json";
pub const STATE_DIR_NAME: &str = ".kiln";
/// Overrides the state directory location.
pub const STATE_DIR_ENV: &str = "KILN_STATE_DIR";
pub const PROVENANCE_FILENAME: &str = "provenance.json";
pub const LOCK_FILENAME: &str = ".lock";

/// Bumped whenever the provenance file layout changes incompatibly.
pub const PROVENANCE_FORMAT_VERSION: u32 = 1;
