//! kiln-lib: the incremental build engine behind `kiln`.
//!
//! - `artifact`: identity, versioning and interning of build artifacts
//! - `rule`: production rules and the validated rule graph
//! - `recipe`: how a rule turns inputs into outputs
//! - `job`/`session`: per-rule jobs and the rebuild decision
//! - `provenance`: the durable ledger of what was built from what
//! - `manifest`: the `kiln.json` rule front-end

pub mod artifact;
pub mod config;
pub mod consts;
pub mod error;
pub mod job;
pub mod lock;
pub mod manifest;
pub mod provenance;
pub mod recipe;
pub mod rule;
pub mod session;
pub mod util;

pub use error::{BuildError, InternalError};
pub use session::{BuildReport, BuildSession, TargetOutcome};
