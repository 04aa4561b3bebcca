use anyhow::{Context, Result};
use stagecv::cli::{
    parse_args, setup_logging, ArtifactArgs, AttentionArgs, AverageArgs, BinSource, Commands, ExperimentArgs,
    StagesArgs, StagingArgs, SurvivalArgs,
};
use stagecv::data::folds::FoldPlan;
use stagecv::data::loader::{CohortLoader, LoaderConfig};
use stagecv::data::Cohort;
use stagecv::experiment::{ExperimentConfig, ExperimentRunner};
use stagecv::model::{
    AttentionBiLstmModel, BiLstmModel, LogisticModel, ModelKind, SelfAttentionBiLstmModel, SequenceModel,
};
use stagecv::staging::pipeline::{
    attention_weights, run_stage, ArtifactStore, AssignStages, AverageWeights, ClusterWeights, ComputeBreakpoints,
    StageOutcomes, StageSource, OUTCOME_LABELS, STAGE_REPORT,
};
use stagecv::staging::StagingConfig;
use stagecv::survival::{
    cross_validate, CoxConfig, CoxModel, CrossValidation, ForestConfig, RandomSurvivalForest, SurvivalCohort,
    SurvivalModel,
};
use stagecv::training::ExperimentSetup;
use stagecv::utils::{ensure_dir, read_settings, run_name};
use std::path::{Path, PathBuf};
use tracing::{error, info};

fn main() {
    let cli = parse_args();

    setup_logging(cli.verbose);

    info!("{}", stagecv::info());

    let result = match cli.command {
        Commands::Experiment(args) => run_experiment(args),
        Commands::Attention(args) => run_attention(args),
        Commands::Average(args) => run_average(args),
        Commands::Breakpoints(args) => run_breakpoints(args),
        Commands::Cluster(args) => run_cluster(args),
        Commands::Stages(args) => run_stages(args),
        Commands::Outcomes(args) => run_outcomes(args),
        Commands::Cox(args) => run_cox(args),
        Commands::Rsf(args) => run_rsf(args),
    };

    if let Err(e) = result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn load_cohort(path: &Path) -> Result<Cohort> {
    CohortLoader::new()
        .load(path)
        .with_context(|| format!("Failed to load cohort from {:?}", path))
}

fn load_setup(kind: ModelKind, path: Option<&PathBuf>) -> Result<ExperimentSetup> {
    match path {
        Some(path) => {
            ExperimentSetup::from_file(path).with_context(|| format!("Failed to load setup from {:?}", path))
        }
        None => Ok(ExperimentSetup::for_model(kind)),
    }
}

fn open_store(path: &Path) -> Result<ArtifactStore> {
    ArtifactStore::open(path).with_context(|| format!("Failed to open artifact directory {:?}", path))
}

/// Model of `kind` writing its fold checkpoints as `<dir>/<run>-fold<k>.mpk`
macro_rules! with_model {
    ($kind:expr, $setup:expr, $run:expr, $dir:expr, |$model:ident| $body:expr) => {
        match $kind {
            ModelKind::Logistic => {
                let mut $model = LogisticModel::new($setup, $dir)?.with_name($run, $dir);
                $body
            }
            ModelKind::BiLstm => {
                let mut $model = BiLstmModel::new($setup, $dir)?.with_name($run, $dir);
                $body
            }
            ModelKind::AttentionBiLstm => {
                let mut $model = AttentionBiLstmModel::new($setup, $dir)?.with_name($run, $dir);
                $body
            }
            ModelKind::SelfAttentionBiLstm => {
                let mut $model = SelfAttentionBiLstmModel::new($setup, $dir)?.with_name($run, $dir);
                $body
            }
        }
    };
}

fn run_experiment(args: ExperimentArgs) -> Result<()> {
    info!("Starting {} experiment...", args.model);
    info!("Input file: {:?}", args.input);
    info!("Output directory: {:?}", args.output);

    ensure_dir(&args.output)?;
    let checkpoint_dir = args.output.join("checkpoints");
    ensure_dir(&checkpoint_dir)?;

    let cohort = load_cohort(&args.input)?;
    let base_setup = load_setup(args.model, args.setup.as_ref())?;
    let mut config: ExperimentConfig = read_settings(args.config.as_ref(), ExperimentConfig::default())?;
    config.output_dir = args.output.clone();

    for repeat in 1..=args.repeats.max(1) {
        let run = run_name(args.model.as_str(), repeat);
        let setup = ExperimentSetup {
            seed: base_setup.seed.wrapping_add(repeat as u64 - 1),
            ..base_setup.clone()
        };
        config.run_name = run.clone();
        let runner = ExperimentRunner::new(config.clone());

        info!("=== Run {} ===", run);
        let (evaluation, paths) = with_model!(args.model, setup, &run, &checkpoint_dir, |model| {
            runner
                .run_and_report(&mut model, &cohort)
                .with_context(|| format!("Experiment {} failed", run))?
        });
        info!("  AUC: {:.4}", evaluation.auc);
        info!("  Threshold: {:.4}", evaluation.threshold);
        info!("  Accuracy: {:.4}", evaluation.metrics.accuracy);
        info!("  Recall: {:.4}", evaluation.metrics.recall);
        match (evaluation.metrics.precision, evaluation.metrics.f1) {
            (Some(precision), Some(f1)) => info!("  Precision: {:.4}, F1: {:.4}", precision, f1),
            _ => info!("  Precision and F1 undefined: no positive predictions"),
        }
        info!("Report saved to: {:?}", paths.summary);
    }

    Ok(())
}

fn collect<M: SequenceModel>(
    model: &mut M,
    runner: &ExperimentRunner,
    cohort: &Cohort,
    store: &ArtifactStore,
    run: &str,
) -> Result<()> {
    let collected = runner
        .collect_attention(model, cohort)
        .with_context(|| format!("Attention analysis of {} failed", run))?;
    store.save(&attention_weights(run), &collected.weights)?;
    store.save(&OUTCOME_LABELS, &collected.labels)?;
    info!(
        "Saved attention weights of {} patients to {:?}",
        collected.weights.shape()[0],
        store.path(&attention_weights(run))
    );
    Ok(())
}

fn run_attention(args: AttentionArgs) -> Result<()> {
    info!("Collecting attention of run {}", args.run);

    let cohort = load_cohort(&args.input)?;
    let setup = load_setup(args.model, args.setup.as_ref())?;
    let config: ExperimentConfig = read_settings(args.config.as_ref(), ExperimentConfig::default())?;
    let runner = ExperimentRunner::new(config);
    let store = open_store(&args.artifacts)?;
    let checkpoint_dir = args.output.join("checkpoints");

    with_model!(args.model, setup, &args.run, &checkpoint_dir, |model| {
        collect(&mut model, &runner, &cohort, &store, &args.run)?
    });
    Ok(())
}

fn run_average(args: AverageArgs) -> Result<()> {
    let store = open_store(&args.artifacts)?;
    run_stage(&AverageWeights { runs: args.runs }, &store).context("Averaging failed")?;
    Ok(())
}

fn run_breakpoints(args: StagingArgs) -> Result<()> {
    let store = open_store(&args.artifacts)?;
    let staging: StagingConfig = read_settings(args.staging.as_ref(), StagingConfig::default())?;
    run_stage(
        &ComputeBreakpoints {
            classes: staging.classes,
        },
        &store,
    )
    .context("Breakpoint computation failed")?;
    Ok(())
}

fn run_cluster(args: StagingArgs) -> Result<()> {
    let store = open_store(&args.artifacts)?;
    let staging: StagingConfig = read_settings(args.staging.as_ref(), StagingConfig::default())?;
    run_stage(
        &ClusterWeights {
            config: staging.kmeans(),
        },
        &store,
    )
    .context("Clustering failed")?;
    Ok(())
}

fn run_stages(args: StagesArgs) -> Result<()> {
    let store = open_store(&args.artifacts)?;
    let source = match args.source {
        BinSource::Breakpoints => StageSource::Breakpoints,
        BinSource::Clusters => StageSource::Clusters,
    };
    run_stage(&AssignStages { source }, &store).context("Stage assignment failed")?;
    Ok(())
}

fn run_outcomes(args: ArtifactArgs) -> Result<()> {
    let store = open_store(&args.artifacts)?;
    run_stage(&StageOutcomes, &store).context("Stage outcome analysis failed")?;

    let report = store.load(&STAGE_REPORT)?;
    for stage in &report.stages {
        info!(
            "Stage {}: {} samples, {} events, rate {}",
            stage.stage, stage.samples, stage.events, stage.rate
        );
    }
    Ok(())
}

fn survival_experiment<M: SurvivalModel>(mut model: M, args: &SurvivalArgs) -> Result<CrossValidation> {
    ensure_dir(&args.output)?;
    let table = CohortLoader::with_config(LoaderConfig::survival())
        .load_table(&args.input)
        .with_context(|| format!("Failed to load survival table from {:?}", args.input))?;
    let cohort = SurvivalCohort::from_table(table)?;
    let plan = FoldPlan::five_fold(cohort.num_patients())?;

    let summary = cross_validate(&mut model, &cohort, &plan)
        .with_context(|| format!("{} cross-validation failed", model.name()))?;
    let path = args.output.join(format!("{}.cindex.json", model.name()));
    std::fs::write(&path, serde_json::to_string_pretty(&summary)?)
        .with_context(|| format!("Failed to write {:?}", path))?;
    info!("Concordance summary saved to: {:?}", path);
    Ok(summary)
}

fn run_cox(args: SurvivalArgs) -> Result<()> {
    let config: CoxConfig = read_settings(args.config.as_ref(), CoxConfig::default())?;
    let summary = survival_experiment(CoxModel::new(config), &args)?;
    info!("Cox c-index: {:.4} +/- {:.4}", summary.mean, summary.std);
    Ok(())
}

fn run_rsf(args: SurvivalArgs) -> Result<()> {
    let config: ForestConfig = read_settings(args.config.as_ref(), ForestConfig::default())?;
    let summary = survival_experiment(RandomSurvivalForest::new(config), &args)?;
    info!("RSF c-index: {:.4} +/- {:.4}", summary.mean, summary.std);
    Ok(())
}
