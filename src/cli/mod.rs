use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::model::{BranchParams, TargetParams};

/// cpgnet: CpG methylation prediction model toolkit
#[derive(Parser, Debug)]
#[command(name = "cpgnet")]
#[command(about = "CpG methylation prediction model toolkit")]
#[command(version)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build a model architecture from a configuration file
    Build(BuildArgs),

    /// Join trained sub-models into a joint model
    Join(JoinArgs),

    /// Copy weights between models by layer name
    Transplant(TransplantArgs),

    /// Inspect a saved model
    Info(InfoArgs),
}

/// Build arguments
#[derive(Parser, Debug)]
pub struct BuildArgs {
    /// Model configuration file (JSON)
    #[arg(short, long, required = true)]
    pub config: PathBuf,

    /// Output directory for the model files
    #[arg(short, long, default_value = "./model")]
    pub output: PathBuf,
}

/// Join arguments
#[derive(Parser, Debug)]
pub struct JoinArgs {
    /// Sub-model files or directories (at least two)
    #[arg(short, long, required = true, num_args = 2..)]
    pub models: Vec<PathBuf>,

    /// Joint variant registry key
    #[arg(long, default_value = "joint_l1")]
    pub variant: String,

    /// Width of each joint fully-connected block
    #[arg(long, default_value = "512")]
    pub nb_hidden: usize,

    /// Dropout rate after each joint block
    #[arg(long, default_value = "0.0")]
    pub drop_out: f64,

    /// Output channels to attach to the joint model
    #[arg(long)]
    pub outputs: Vec<String>,

    /// Output directory for the joint model files
    #[arg(short, long, default_value = "./joint")]
    pub output: PathBuf,
}

/// Transplant arguments
#[derive(Parser, Debug)]
pub struct TransplantArgs {
    /// Source model file or directory
    #[arg(short, long, required = true)]
    pub src: PathBuf,

    /// Destination model file or directory
    #[arg(short, long, required = true)]
    pub dst: PathBuf,

    /// Fail if a destination layer has no source counterpart
    #[arg(long)]
    pub must_exist: bool,

    /// Output directory for the updated destination model
    #[arg(short, long, required = true)]
    pub output: PathBuf,
}

/// Info arguments
#[derive(Parser, Debug)]
pub struct InfoArgs {
    /// Model file or directory
    #[arg(short, long, required = true)]
    pub model: PathBuf,
}

/// Model build configuration file.
#[derive(Debug, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Architecture kind: `dna` or `cpg`
    pub kind: String,
    /// DNA window width (dna models)
    pub seq_len: Option<usize>,
    /// Number of replicates (cpg models)
    pub nb_replicate: Option<usize>,
    /// CpG window width (cpg models)
    pub cpg_wlen: Option<usize>,
    /// Output channels to attach
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Branch hyperparameters; defaults when absent
    pub branch: Option<BranchParams>,
    /// Output-head hyperparameters; defaults when absent
    pub target: Option<TargetParams>,
}

/// Parse CLI arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Setup logging based on verbosity
pub fn setup_logging(verbose: bool) {
    let filter = if verbose { "debug" } else { "info" };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse() {
        let cli = Cli::parse_from(["cpgnet", "build", "-c", "model.json"]);

        match cli.command {
            Commands::Build(args) => {
                assert_eq!(args.config, PathBuf::from("model.json"));
                assert_eq!(args.output, PathBuf::from("./model"));
            }
            _ => panic!("Expected Build command"),
        }
    }

    #[test]
    fn test_join_args() {
        let cli = Cli::parse_from([
            "cpgnet", "join", "-m", "dna_model", "cpg_model", "--variant", "joint_l2", "-o",
            "joint_model",
        ]);

        match cli.command {
            Commands::Join(args) => {
                assert_eq!(args.models.len(), 2);
                assert_eq!(args.variant, "joint_l2");
                assert_eq!(args.nb_hidden, 512);
            }
            _ => panic!("Expected Join command"),
        }
    }

    #[test]
    fn test_build_config_parse() {
        let json = r#"{
            "kind": "dna",
            "seq_len": 1001,
            "outputs": ["cpg/mESC", "stats/cat_var"]
        }"#;
        let config: BuildConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.kind, "dna");
        assert_eq!(config.seq_len, Some(1001));
        assert_eq!(config.outputs.len(), 2);
        assert!(config.branch.is_none());
    }
}
