mod common;

use common::{pipeline_config, raw_match, team, tournament, trained_artifact};
use wc26_forecast::artifact::{ArtifactStore, MemoryArtifactStore, ModelArtifact};
use wc26_forecast::config::FeatureConfig;
use wc26_forecast::error::ForecastError;
use wc26_forecast::features::FeatureBuilder;
use wc26_forecast::fusion::fuse_sources;
use wc26_forecast::records::{OutcomeLabel, SourceTables};
use wc26_forecast::trainer::{CancelToken, split_indices, train, train_pipeline};

fn save_if_trained(
    store: &dyn ArtifactStore,
    sources: &SourceTables,
) -> Result<(), ForecastError> {
    let outcome = train_pipeline(sources, &pipeline_config(), &CancelToken::new())?;
    store.save(&outcome.artifact)?;
    Ok(())
}

#[test]
fn too_few_rows_is_rejected_before_anything_is_written() {
    let sources = SourceTables {
        teams: vec![team("ITA", "men"), team("FRA", "men"), team("GER", "men")],
        matches: vec![
            raw_match("ITA", "FRA", "2006-07-09", "draw"),
            raw_match("ITA", "GER", "2006-07-04", "home team win"),
            raw_match("GER", "FRA", "2006-07-01", "away team win"),
        ],
        ..SourceTables::default()
    };
    let store = MemoryArtifactStore::new();

    let err = save_if_trained(&store, &sources).unwrap_err();
    match err {
        ForecastError::TrainingData { reason } => {
            assert!(reason.contains("3 usable rows"), "{reason}");
        }
        other => panic!("expected training data error, got {other:?}"),
    }
    assert!(store.is_empty());
}

#[test]
fn a_class_missing_from_training_is_rejected() {
    let mut sources = tournament();
    for m in &mut sources.matches {
        m.outcome = Some("home team win".into());
        m.home_score = None;
        m.away_score = None;
    }
    let err = train_pipeline(&sources, &pipeline_config(), &CancelToken::new()).unwrap_err();
    match err {
        ForecastError::TrainingData { reason } => assert!(reason.contains("absent"), "{reason}"),
        other => panic!("expected training data error, got {other:?}"),
    }
}

#[test]
fn same_seed_gives_same_split_and_parameters() {
    let sources = tournament();
    let mut cfg = pipeline_config();
    cfg.train.max_iters = 120;

    let first = train_pipeline(&sources, &cfg, &CancelToken::new()).expect("first run");
    let second = train_pipeline(&sources, &cfg, &CancelToken::new()).expect("second run");

    assert_eq!(first.artifact.params, second.artifact.params);
    assert_eq!(first.metrics, second.metrics);
    assert_eq!(
        first.artifact.metadata.train_rows,
        second.artifact.metadata.train_rows
    );

    let n = first.artifact.metadata.training_rows;
    assert_eq!(
        split_indices(n, cfg.train.train_ratio, cfg.train.seed).expect("split"),
        split_indices(n, cfg.train.train_ratio, cfg.train.seed).expect("split")
    );
}

#[test]
fn artifact_carries_validation_metrics_and_provenance() {
    let artifact = trained_artifact();
    let meta = &artifact.metadata;
    let sources = tournament();

    let fusion = meta.fusion.expect("fusion provenance");
    assert_eq!(fusion.source_matches, sources.matches.len());
    assert_eq!(fusion.dropped_rows, 0);
    assert_eq!(meta.training_rows, sources.matches.len());
    assert_eq!(meta.train_rows + meta.validation_rows, meta.training_rows);
    assert_eq!(meta.seed, 42);
    assert_eq!(meta.version_id.len(), 16);
    assert!(meta.iterations >= 1);

    let v = &meta.validation;
    assert_eq!(v.samples, meta.validation_rows);
    assert_eq!(v.per_class.len(), 3);
    assert!((0.0..=1.0).contains(&v.accuracy));
    assert!((0.0..=1.0).contains(&v.macro_f1));
    assert!(v.log_loss.is_finite() && v.log_loss > 0.0);
    assert!(v.f1(OutcomeLabel::Draw).is_some());
    let support: usize = v.per_class.iter().map(|c| c.support).sum();
    assert_eq!(support, meta.validation_rows);
}

#[test]
fn calibration_does_not_worsen_validation_log_loss() {
    let artifact = trained_artifact();
    let meta = &artifact.metadata;
    assert!(meta.validation.log_loss <= meta.uncalibrated_validation.log_loss + 1e-12);
}

#[test]
fn trained_model_beats_uniform_guessing() {
    let artifact = trained_artifact();
    let meta = &artifact.metadata;
    // uniform over three classes scores ln 3
    assert!(meta.validation.log_loss < 3f64.ln());
    assert_eq!(meta.base_rate_validation.samples, meta.validation_rows);
    assert!(meta.base_rate_validation.log_loss.is_finite());
    assert!(meta.validation.log_loss < meta.base_rate_validation.log_loss);
}

#[test]
fn pre_cancelled_run_returns_cancelled() {
    let cancel = CancelToken::new();
    cancel.cancel();
    let err = train_pipeline(&tournament(), &pipeline_config(), &cancel).unwrap_err();
    assert!(matches!(err, ForecastError::Cancelled));
}

#[test]
fn train_on_prepared_vectors() {
    let sources = tournament();
    let mut cfg = pipeline_config();
    cfg.train.max_iters = 60;
    cfg.train.calibrate = false;

    let fusion = fuse_sources(&sources, &FeatureConfig::default());
    let features = FeatureBuilder::fit(&fusion, FeatureConfig::default()).expect("fit");
    let vectors = features
        .build_training_matrix(&fusion.rows, &CancelToken::new())
        .expect("matrix");
    let labels: Vec<OutcomeLabel> = fusion.rows.iter().map(|r| r.outcome).collect();

    let (artifact, metrics) =
        train(features, &vectors, &labels, &cfg.train, &CancelToken::new()).expect("train");
    assert_eq!(artifact.params.calibration.scale, 1.0);
    assert_eq!(artifact.params.calibration.draw_bias, 0.0);
    assert_eq!(metrics, artifact.metadata.uncalibrated_validation);
    assert_eq!(artifact.metadata.fusion, None);
    assert_eq!(artifact.metadata.base_rate_validation.samples, metrics.samples);

    let err = train(
        artifact.features.clone(),
        &vectors,
        &labels[1..],
        &cfg.train,
        &CancelToken::new(),
    )
    .unwrap_err();
    assert!(matches!(err, ForecastError::TrainingData { .. }));
}

#[test]
fn artifact_survives_json_round_trip() {
    let artifact = trained_artifact();
    let json = artifact.to_json_pretty().expect("encode");
    let back = ModelArtifact::from_json(&json).expect("decode");
    assert_eq!(back, artifact);
}
