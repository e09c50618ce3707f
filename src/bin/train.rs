use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};

use wc26_forecast::artifact::{ArtifactStore, FileArtifactStore};
use wc26_forecast::calibration::{Prob3, calibration_bins};
use wc26_forecast::cli_args::CliArgs;
use wc26_forecast::config::{EraPolicy, PipelineConfig};
use wc26_forecast::fusion::fuse_sources;
use wc26_forecast::logging;
use wc26_forecast::records::{OutcomeLabel, SourceTables};
use wc26_forecast::source_loader::{self, SourcePaths};
use wc26_forecast::trainer::{CancelToken, TrainingOutcome, train_pipeline};

const DEFAULT_OUT_DIR: &str = "artifacts";
const RELIABILITY_BINS: usize = 10;

fn main() -> Result<()> {
    logging::init();
    let args = CliArgs::from_env();

    let mut cfg = PipelineConfig::from_env();
    apply_flags(&args, &mut cfg)?;

    let sources = load_sources(&args)?;
    let outcome = train_pipeline(&sources, &cfg, &CancelToken::new())
        .context("training run failed, no artifact written")?;

    let out_dir = args
        .path("--out")
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OUT_DIR));
    let store = FileArtifactStore::new(&out_dir);
    let handle = store.save(&outcome.artifact)?;

    print_report(&outcome, &store.path_for(&handle));
    if args.has_flag("--warnings") {
        for w in &outcome.warnings {
            println!("warning: {w}");
        }
        for d in &outcome.dropped {
            println!(
                "dropped: match #{} ({}): {}",
                d.index,
                d.match_id.as_deref().unwrap_or("no id"),
                d.reason
            );
        }
    }
    if args.has_flag("--reliability") {
        print_reliability(&sources, &outcome)?;
    }
    Ok(())
}

fn apply_flags(args: &CliArgs, cfg: &mut PipelineConfig) -> Result<()> {
    if let Some(v) = args.parsed("--train-ratio")? {
        cfg.train.train_ratio = v;
    }
    if let Some(v) = args.parsed("--seed")? {
        cfg.train.seed = v;
    }
    if let Some(v) = args.parsed("--min-rows")? {
        cfg.train.min_rows = v;
    }
    if let Some(v) = args.parsed("--l2")? {
        cfg.train.l2 = v;
    }
    if let Some(v) = args.parsed("--max-iters")? {
        cfg.train.max_iters = v;
    }
    if let Some(v) = args.parsed("--default-temperature")? {
        cfg.features.default_temperature_c = v;
    }
    if let Some(raw) = args.value("--era-policy") {
        cfg.features.era_policy =
            EraPolicy::parse(&raw).ok_or_else(|| anyhow!("unknown era policy `{raw}`"))?;
    }
    if args.has_flag("--no-calibration") {
        cfg.train.calibrate = false;
    }
    Ok(())
}

fn load_sources(args: &CliArgs) -> Result<SourceTables> {
    if let Some(db_path) = args.path("--db") {
        let conn = source_loader::open_db(&db_path)?;
        return source_loader::load_db_sources(&conn);
    }
    let paths = SourcePaths {
        teams: args.path("--teams"),
        matches: args.path("--matches"),
        rankings: args.path("--rankings"),
        venues: args.path("--venues"),
        weather: args.path("--weather"),
        awards: args.path("--awards"),
    };
    if !paths.has_any() {
        return Err(anyhow!(
            "pass --db PATH or --teams/--matches/--rankings [--venues --weather --awards]"
        ));
    }
    source_loader::load_json_sources(&paths)
}

fn print_report(outcome: &TrainingOutcome, path: &std::path::Path) {
    let meta = &outcome.artifact.metadata;
    let m = &outcome.metrics;
    println!("Training complete");
    println!("Artifact: {} ({})", path.display(), meta.version_id);
    match &meta.fusion {
        Some(f) => println!(
            "Rows: {} fused / {} source, {} dropped, {} warnings",
            meta.training_rows, f.source_matches, f.dropped_rows, f.warnings
        ),
        None => println!("Rows: {}", meta.training_rows),
    }
    println!(
        "Split: train={} validation={} seed={} ratio={:.2}",
        meta.train_rows, meta.validation_rows, meta.seed, meta.train_ratio
    );
    println!("Iterations: {}", meta.iterations);
    println!(
        "Validation: accuracy={:.3} macro_f1={:.3} log_loss={:.4} brier={:.4}",
        m.accuracy, m.macro_f1, m.log_loss, m.brier
    );
    println!(
        "Uncalibrated: accuracy={:.3} log_loss={:.4}",
        meta.uncalibrated_validation.accuracy, meta.uncalibrated_validation.log_loss
    );
    println!(
        "Base rate: accuracy={:.3} log_loss={:.4}",
        meta.base_rate_validation.accuracy, meta.base_rate_validation.log_loss
    );
    println!(
        "Calibration: scale={:.2} draw_bias={:+.2}",
        outcome.artifact.params.calibration.scale, outcome.artifact.params.calibration.draw_bias
    );
    for c in &m.per_class {
        println!(
            "  {:<9} precision={:.3} recall={:.3} f1={:.3} support={}",
            c.label.as_str(),
            c.precision,
            c.recall,
            c.f1,
            c.support
        );
    }
}

/// In-sample reliability table over every fused row.
fn print_reliability(sources: &SourceTables, outcome: &TrainingOutcome) -> Result<()> {
    let artifact = &outcome.artifact;
    let fusion = fuse_sources(sources, artifact.features.config());
    let vectors = artifact
        .features
        .build_training_matrix(&fusion.rows, &CancelToken::new())?;
    let probs: Vec<Prob3> = vectors
        .iter()
        .map(|v| artifact.params.probabilities(v))
        .collect();
    let labels: Vec<OutcomeLabel> = fusion.rows.iter().map(|r| r.outcome).collect();

    for class in OutcomeLabel::ALL {
        println!("Reliability ({class}):");
        for bin in calibration_bins(&probs, &labels, class, RELIABILITY_BINS) {
            if bin.count == 0 {
                continue;
            }
            println!(
                "  [{:.1}, {:.1}) n={:<5} predicted={:.3} observed={:.3}",
                bin.bucket_start, bin.bucket_end, bin.count, bin.avg_pred, bin.actual_rate
            );
        }
    }
    Ok(())
}
