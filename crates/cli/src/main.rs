mod cmd;
mod output;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cmd::{cmd_build, cmd_explain, cmd_forget, cmd_prune};
use kiln_lib::consts::DEFAULT_MANIFEST_FILENAME;
use output::{OutputFormat, print_error};

/// kiln - incremental build engine
#[derive(Parser)]
#[command(name = "kiln")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Path to the rule manifest
  #[arg(short, long, global = true, default_value = DEFAULT_MANIFEST_FILENAME)]
  file: PathBuf,

  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Build targets, or everything when none are given
  Build {
    /// Artifact references to build, e.g. `out/app` or `file:lib+libz.a`
    targets: Vec<String>,

    /// Rule ids to build
    #[arg(short, long = "rule")]
    rules: Vec<String>,

    /// Maximum number of recipes running at once
    #[arg(short, long)]
    jobs: Option<usize>,
  },

  /// Show what the current version of an artifact was built from
  Explain {
    target: String,

    #[arg(short, long, value_enum, default_value_t)]
    output: OutputFormat,
  },

  /// Forget a rule's recorded history so it rebuilds
  Forget { rule: String },

  /// Drop artifact records no longer referenced by the ledger
  Prune,
}

fn main() {
  let cli = Cli::parse();

  let default_level = if cli.verbose { "debug" } else { "warn" };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  let result = match cli.command {
    Commands::Build { targets, rules, jobs } => cmd_build(&cli.file, targets, rules, jobs, cli.verbose),
    Commands::Explain { target, output } => cmd_explain(&cli.file, &target, output),
    Commands::Forget { rule } => cmd_forget(&cli.file, &rule),
    Commands::Prune => cmd_prune(&cli.file),
  };

  if let Err(err) = result {
    print_error(&format!("{err:#}"));
    std::process::exit(1);
  }
}
