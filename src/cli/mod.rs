use crate::model::ModelKind;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// stagecv: cross-validated outcome models and attention staging
#[derive(Parser, Debug)]
#[command(name = "stagecv")]
#[command(about = "Cross-validated outcome prediction and attention-weight staging")]
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
    /// Cross-validate a sequence model and write its report
    Experiment(ExperimentArgs),

    /// Collect per-fold attention weights from an earlier experiment
    Attention(AttentionArgs),

    /// Average the attention weights of several runs
    Average(AverageArgs),

    /// Compute natural-breaks boundaries per feature
    Breakpoints(StagingArgs),

    /// Cluster attention weights per feature with k-means
    Cluster(StagingArgs),

    /// Assign every visit its dominant stage
    Stages(StagesArgs),

    /// Stage-conditional outcome rates and weight profiles
    Outcomes(ArtifactArgs),

    /// Cross-validate a penalised Cox model
    Cox(SurvivalArgs),

    /// Cross-validate a random survival forest
    Rsf(SurvivalArgs),
}

/// Experiment arguments
#[derive(Parser, Debug)]
pub struct ExperimentArgs {
    /// Model variant
    #[arg(value_enum)]
    pub model: ModelKind,

    /// Cohort file (CSV or TSV, optionally gzipped)
    #[arg(short, long, required = true)]
    pub input: PathBuf,

    /// Output directory for reports and checkpoints
    #[arg(short, long, default_value = "./results")]
    pub output: PathBuf,

    /// Hyperparameter file (JSON); the model's preset when omitted
    #[arg(short, long)]
    pub setup: Option<PathBuf>,

    /// Fold and resampling settings (JSON)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Independent repetitions of the whole cross-validation
    #[arg(short, long, default_value = "1")]
    pub repeats: usize,
}

/// Attention collection arguments
#[derive(Parser, Debug)]
pub struct AttentionArgs {
    /// Model variant the checkpoints belong to
    #[arg(value_enum, default_value = "attention-bi-lstm")]
    pub model: ModelKind,

    /// Cohort file the experiment was run on
    #[arg(short, long, required = true)]
    pub input: PathBuf,

    /// Output directory of the experiment
    #[arg(short, long, default_value = "./results")]
    pub output: PathBuf,

    /// Run whose fold checkpoints are read
    #[arg(long, required = true)]
    pub run: String,

    /// Artifact directory receiving the weights
    #[arg(short, long, default_value = "./artifacts")]
    pub artifacts: PathBuf,

    /// Hyperparameter file (JSON) used for the experiment
    #[arg(short, long)]
    pub setup: Option<PathBuf>,

    /// Fold settings (JSON) used for the experiment
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

/// Averaging arguments
#[derive(Parser, Debug)]
pub struct AverageArgs {
    /// Artifact directory
    #[arg(short, long, default_value = "./artifacts")]
    pub artifacts: PathBuf,

    /// Runs whose attention weights are averaged
    #[arg(long, required = true, value_delimiter = ',')]
    pub runs: Vec<String>,
}

/// Arguments of the stages that only need staging settings
#[derive(Parser, Debug)]
pub struct StagingArgs {
    /// Artifact directory
    #[arg(short, long, default_value = "./artifacts")]
    pub artifacts: PathBuf,

    /// Staging settings (JSON)
    #[arg(short, long)]
    pub staging: Option<PathBuf>,
}

/// Where stage bins come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BinSource {
    Breakpoints,
    Clusters,
}

/// Stage assignment arguments
#[derive(Parser, Debug)]
pub struct StagesArgs {
    /// Artifact directory
    #[arg(short, long, default_value = "./artifacts")]
    pub artifacts: PathBuf,

    /// Bin source
    #[arg(long, value_enum, default_value = "breakpoints")]
    pub source: BinSource,
}

/// Arguments of stages that only read the artifact directory
#[derive(Parser, Debug)]
pub struct ArtifactArgs {
    /// Artifact directory
    #[arg(short, long, default_value = "./artifacts")]
    pub artifacts: PathBuf,
}

/// Survival experiment arguments
#[derive(Parser, Debug)]
pub struct SurvivalArgs {
    /// Survival table (`patient, visit, time, event, features...`)
    #[arg(short, long, required = true)]
    pub input: PathBuf,

    /// Output directory for the concordance summary
    #[arg(short, long, default_value = "./results")]
    pub output: PathBuf,

    /// Model settings (JSON)
    #[arg(short, long)]
    pub config: Option<PathBuf>,
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
