//! Model Trainer.
//!
//! The model is a symmetric multinomial logit over (team A win, draw, team B win):
//!
//! ```text
//! z = w . x_anti + (s[team_a] - s[team_b])
//! d = b + u . x_sym + v[venue] + e[era] + g[stage]
//! logits = (z, d, -z)
//! ```
//!
//! Swapping the teams negates `x_anti` and the strength difference, which mirrors the
//! logits exactly. There is no home term.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::artifact::{FusionProvenance, ModelArtifact, TrainingMetadata};
use crate::calibration::{
    LogitCalibration, Logits3, Metrics, Prob3, empirical_outcome_probs, evaluate_probs,
    fit_logit_calibration, softmax3,
};
use crate::config::{PipelineConfig, TrainConfig};
use crate::error::{ForecastError, Result};
use crate::features::{ANTI_DIM, FeatureBuilder, FeatureEncoders, FeatureVector, SYM_DIM};
use crate::fusion::{DroppedRow, FusionWarning, fuse_sources};
use crate::records::{OutcomeLabel, SourceTables};

const IMPROVEMENT_EPS: f64 = 1e-5;
const CHECK_EVERY: usize = 20;
const PATIENCE: usize = 20;

/// Cooperative cancellation flag shared with the caller.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Antisymmetric features are divided by their RMS (no centring, so the sign flip
/// survives); symmetric ones are standardised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureScaling {
    pub anti_rms: [f64; ANTI_DIM],
    pub sym_mean: [f64; SYM_DIM],
    pub sym_std: [f64; SYM_DIM],
}

impl FeatureScaling {
    pub fn fit(samples: &[&FeatureVector]) -> Self {
        let mut anti_sq = [0.0; ANTI_DIM];
        let mut mean = [0.0; SYM_DIM];
        let mut var = [0.0; SYM_DIM];
        let n = samples.len().max(1) as f64;

        for s in samples {
            for i in 0..ANTI_DIM {
                anti_sq[i] += s.anti[i] * s.anti[i];
            }
            for i in 0..SYM_DIM {
                mean[i] += s.sym[i];
            }
        }
        for v in &mut mean {
            *v /= n;
        }
        for s in samples {
            for i in 0..SYM_DIM {
                let d = s.sym[i] - mean[i];
                var[i] += d * d;
            }
        }

        Self {
            anti_rms: anti_sq.map(|sq| (sq / n).sqrt().max(1e-6)),
            sym_mean: mean,
            sym_std: var.map(|v| (v / n).sqrt().max(1e-6)),
        }
    }

    pub fn scale(&self, v: &FeatureVector) -> ([f64; ANTI_DIM], [f64; SYM_DIM]) {
        let mut anti = [0.0; ANTI_DIM];
        let mut sym = [0.0; SYM_DIM];
        for i in 0..ANTI_DIM {
            anti[i] = v.anti[i] / self.anti_rms[i];
        }
        for i in 0..SYM_DIM {
            sym[i] = standardized(v.sym[i], self.sym_mean[i], self.sym_std[i]);
        }
        (anti, sym)
    }

    fn is_finite(&self) -> bool {
        self.anti_rms
            .iter()
            .chain(&self.sym_mean)
            .chain(&self.sym_std)
            .all(|v| v.is_finite())
    }
}

fn standardized(x: f64, mean: f64, std: f64) -> f64 {
    (x - mean) / std.max(1e-6)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    pub scaling: FeatureScaling,
    pub w_anti: [f64; ANTI_DIM],
    pub w_sym: [f64; SYM_DIM],
    pub draw_bias: f64,
    pub team_strength: Vec<f64>,
    pub venue_draw: Vec<f64>,
    pub era_draw: Vec<f64>,
    pub stage_draw: Vec<f64>,
    pub calibration: LogitCalibration,
}

impl ModelParams {
    pub fn zeros(encoders: &FeatureEncoders, scaling: FeatureScaling) -> Self {
        Self {
            scaling,
            w_anti: [0.0; ANTI_DIM],
            w_sym: [0.0; SYM_DIM],
            draw_bias: 0.0,
            team_strength: vec![0.0; encoders.teams.slots()],
            venue_draw: vec![0.0; encoders.venues.slots()],
            era_draw: vec![0.0; encoders.eras.slots()],
            stage_draw: vec![0.0; encoders.stages.slots()],
            calibration: LogitCalibration::IDENTITY,
        }
    }

    fn zeros_like(other: &ModelParams) -> Self {
        Self {
            scaling: other.scaling.clone(),
            w_anti: [0.0; ANTI_DIM],
            w_sym: [0.0; SYM_DIM],
            draw_bias: 0.0,
            team_strength: vec![0.0; other.team_strength.len()],
            venue_draw: vec![0.0; other.venue_draw.len()],
            era_draw: vec![0.0; other.era_draw.len()],
            stage_draw: vec![0.0; other.stage_draw.len()],
            calibration: LogitCalibration::IDENTITY,
        }
    }

    /// Uncalibrated logits.
    pub fn logits(&self, v: &FeatureVector) -> Logits3 {
        let (anti, sym) = self.scaling.scale(v);
        let strength_gap = slot(&self.team_strength, v.team_a) - slot(&self.team_strength, v.team_b);
        let z = dot(&self.w_anti, &anti) + strength_gap;
        let d = self.draw_bias
            + dot(&self.w_sym, &sym)
            + slot(&self.venue_draw, v.venue)
            + slot(&self.era_draw, v.era)
            + slot(&self.stage_draw, v.stage);
        Logits3 {
            home: z,
            draw: d,
            away: -z,
        }
    }

    pub fn probabilities(&self, v: &FeatureVector) -> Prob3 {
        self.calibration.apply(self.logits(v))
    }

    pub fn matches_encoders(&self, encoders: &FeatureEncoders) -> bool {
        self.team_strength.len() == encoders.teams.slots()
            && self.venue_draw.len() == encoders.venues.slots()
            && self.era_draw.len() == encoders.eras.slots()
            && self.stage_draw.len() == encoders.stages.slots()
    }

    pub fn is_finite(&self) -> bool {
        self.scaling.is_finite()
            && self
                .w_anti
                .iter()
                .chain(&self.w_sym)
                .chain(std::iter::once(&self.draw_bias))
                .chain(&self.team_strength)
                .chain(&self.venue_draw)
                .chain(&self.era_draw)
                .chain(&self.stage_draw)
                .chain([&self.calibration.scale, &self.calibration.draw_bias])
                .all(|v| v.is_finite())
    }
}

fn slot(values: &[f64], idx: usize) -> f64 {
    values.get(idx).copied().unwrap_or(0.0)
}

fn dot<const N: usize>(a: &[f64; N], b: &[f64; N]) -> f64 {
    let mut out = 0.0;
    for i in 0..N {
        out += a[i] * b[i];
    }
    out
}

/// Indices into the training set for each partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    pub train: Vec<usize>,
    pub validation: Vec<usize>,
}

/// Seeded shuffle split. Same seed and length always produce the same partitions.
pub fn split_indices(n: usize, train_ratio: f64, seed: u64) -> Result<Split> {
    if !train_ratio.is_finite() || train_ratio <= 0.0 || train_ratio >= 1.0 {
        return Err(ForecastError::training_data(format!(
            "train ratio {train_ratio} must lie strictly between 0 and 1"
        )));
    }
    if n < 2 {
        return Err(ForecastError::training_data(format!(
            "need at least 2 rows to split, got {n}"
        )));
    }
    let mut idx: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    idx.shuffle(&mut rng);

    let n_train = ((n as f64) * train_ratio).round() as usize;
    let n_train = n_train.clamp(1, n - 1);
    let validation = idx.split_off(n_train);
    Ok(Split {
        train: idx,
        validation,
    })
}

/// Fitted parameters plus what was learned about them on the validation partition.
#[derive(Debug, Clone)]
pub struct FittedModel {
    pub params: ModelParams,
    pub split: Split,
    pub iterations: usize,
    pub validation: Metrics,
    pub uncalibrated_validation: Metrics,
    pub base_rate_validation: Metrics,
}

pub fn fit_model(
    encoders: &FeatureEncoders,
    vectors: &[FeatureVector],
    labels: &[OutcomeLabel],
    cfg: &TrainConfig,
    cancel: &CancelToken,
) -> Result<FittedModel> {
    if vectors.len() != labels.len() {
        return Err(ForecastError::training_data(format!(
            "{} feature vectors but {} labels",
            vectors.len(),
            labels.len()
        )));
    }
    if vectors.len() < cfg.min_rows {
        return Err(ForecastError::training_data(format!(
            "{} rows available, at least {} required",
            vectors.len(),
            cfg.min_rows
        )));
    }

    let split = split_indices(vectors.len(), cfg.train_ratio, cfg.seed)?;
    let mut seen = [false; 3];
    for &i in &split.train {
        seen[labels[i].index()] = true;
    }
    if let Some(missing) = OutcomeLabel::ALL.iter().find(|l| !seen[l.index()]) {
        return Err(ForecastError::training_data(format!(
            "class {missing} is absent from the training partition"
        )));
    }

    let train_x: Vec<&FeatureVector> = split.train.iter().map(|&i| &vectors[i]).collect();
    let train_y: Vec<OutcomeLabel> = split.train.iter().map(|&i| labels[i]).collect();
    let val_x: Vec<&FeatureVector> = split.validation.iter().map(|&i| &vectors[i]).collect();
    let val_y: Vec<OutcomeLabel> = split.validation.iter().map(|&i| labels[i]).collect();

    let scaling = FeatureScaling::fit(&train_x);
    let init = ModelParams::zeros(encoders, scaling);
    info!(
        train = train_x.len(),
        validation = val_x.len(),
        teams = encoders.teams.slots() - 1,
        "fitting outcome model"
    );

    let (mut params, iterations) =
        fit_coeffs(init, &train_x, &train_y, &val_x, &val_y, cfg, cancel)?;

    let val_logits: Vec<Logits3> = val_x.iter().map(|v| params.logits(v)).collect();
    let raw_probs: Vec<Prob3> = val_logits.iter().map(|l| softmax3(*l)).collect();
    let uncalibrated_validation = evaluate_probs(&raw_probs, &val_y);
    let base_rate = empirical_outcome_probs(&train_y);
    let base_rate_validation = evaluate_probs(&vec![base_rate; val_y.len()], &val_y);

    let validation = if cfg.calibrate {
        let (calibration, metrics) = fit_logit_calibration(&val_logits, &val_y);
        debug!(
            scale = calibration.scale,
            draw_bias = calibration.draw_bias,
            "fitted logit calibration"
        );
        params.calibration = calibration;
        metrics
    } else {
        uncalibrated_validation.clone()
    };

    info!(
        iterations,
        accuracy = validation.accuracy,
        macro_f1 = validation.macro_f1,
        log_loss = validation.log_loss,
        "model fitted"
    );

    Ok(FittedModel {
        params,
        split,
        iterations,
        validation,
        uncalibrated_validation,
        base_rate_validation,
    })
}

/// Full-batch gradient descent with validation early stopping. Returns the best
/// parameters seen and the number of iterations run.
fn fit_coeffs(
    init: ModelParams,
    train_x: &[&FeatureVector],
    train_y: &[OutcomeLabel],
    val_x: &[&FeatureVector],
    val_y: &[OutcomeLabel],
    cfg: &TrainConfig,
    cancel: &CancelToken,
) -> Result<(ModelParams, usize)> {
    let mut params = init;
    let mut best = params.clone();
    let mut best_val = log_loss_for_params(&params, val_x, val_y);
    let mut no_improve = 0usize;
    let mut iterations = 0usize;
    let n = train_x.len().max(1) as f64;

    for iter in 0..cfg.max_iters {
        if cancel.is_cancelled() {
            warn!(iter, "training cancelled");
            return Err(ForecastError::Cancelled);
        }
        iterations = iter + 1;

        let mut g = ModelParams::zeros_like(&params);
        for (v, y) in train_x.iter().zip(train_y) {
            let (anti, sym) = params.scaling.scale(v);
            let p = softmax3(params.logits(v));
            let target = y.index();
            let y_h = f64::from(target == 0);
            let y_d = f64::from(target == 1);
            let y_a = f64::from(target == 2);
            let dz = (p.home - y_h) - (p.away - y_a);
            let dd = p.draw - y_d;

            for j in 0..ANTI_DIM {
                g.w_anti[j] += dz * anti[j];
            }
            add_slot(&mut g.team_strength, v.team_a, dz);
            add_slot(&mut g.team_strength, v.team_b, -dz);
            for j in 0..SYM_DIM {
                g.w_sym[j] += dd * sym[j];
            }
            g.draw_bias += dd;
            add_slot(&mut g.venue_draw, v.venue, dd);
            add_slot(&mut g.era_draw, v.era, dd);
            add_slot(&mut g.stage_draw, v.stage, dd);
        }

        let lr = cfg.learning_rate / (1.0 + (iter as f64 * 0.003));
        let l2 = cfg.l2;
        step_array(&mut params.w_anti, &g.w_anti, n, l2, lr);
        step_array(&mut params.w_sym, &g.w_sym, n, l2, lr);
        params.draw_bias -= lr * g.draw_bias / n;
        step_slice(&mut params.team_strength, &g.team_strength, n, l2, lr);
        step_slice(&mut params.venue_draw, &g.venue_draw, n, l2, lr);
        step_slice(&mut params.era_draw, &g.era_draw, n, l2, lr);
        step_slice(&mut params.stage_draw, &g.stage_draw, n, l2, lr);

        if iter % CHECK_EVERY == 0 || iter + 1 == cfg.max_iters {
            let val_ll = log_loss_for_params(&params, val_x, val_y);
            debug!(iter, val_log_loss = val_ll, "validation check");
            if val_ll + IMPROVEMENT_EPS < best_val {
                best_val = val_ll;
                best = params.clone();
                no_improve = 0;
            } else {
                no_improve = no_improve.saturating_add(1);
                if no_improve >= PATIENCE {
                    break;
                }
            }
        }
    }

    Ok((best, iterations))
}

fn add_slot(values: &mut [f64], idx: usize, delta: f64) {
    if let Some(v) = values.get_mut(idx) {
        *v += delta;
    }
}

fn step_array<const N: usize>(w: &mut [f64; N], grad: &[f64; N], n: f64, l2: f64, lr: f64) {
    step_slice(w, grad, n, l2, lr);
}

fn step_slice(w: &mut [f64], grad: &[f64], n: f64, l2: f64, lr: f64) {
    for (wj, gj) in w.iter_mut().zip(grad) {
        let g = gj / n + l2 * *wj;
        *wj -= lr * g;
    }
}

fn log_loss_for_params(
    params: &ModelParams,
    samples: &[&FeatureVector],
    labels: &[OutcomeLabel],
) -> f64 {
    if samples.is_empty() {
        return f64::INFINITY;
    }
    let sum: f64 = samples
        .iter()
        .zip(labels)
        .map(|(v, y)| -softmax3(params.logits(v)).get(*y).max(1e-9).ln())
        .sum();
    sum / samples.len() as f64
}

/// Fits parameters on prepared vectors and wraps them with `features` into a new
/// artifact.
pub fn train(
    features: FeatureBuilder,
    vectors: &[FeatureVector],
    labels: &[OutcomeLabel],
    cfg: &TrainConfig,
    cancel: &CancelToken,
) -> Result<(ModelArtifact, Metrics)> {
    let fitted = fit_model(features.encoders(), vectors, labels, cfg, cancel)?;
    let metadata = TrainingMetadata::from_fit(&fitted, &features, cfg, Utc::now(), vectors.len());
    let metrics = fitted.validation.clone();
    let artifact = ModelArtifact::assemble(features, fitted.params, metadata)?;
    Ok((artifact, metrics))
}

/// Result of one batch run from raw sources to artifact.
#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub artifact: ModelArtifact,
    pub metrics: Metrics,
    pub warnings: Vec<FusionWarning>,
    pub dropped: Vec<DroppedRow>,
}

/// Fuse, build features, fit and assemble. Nothing is persisted here.
pub fn train_pipeline(
    sources: &SourceTables,
    cfg: &PipelineConfig,
    cancel: &CancelToken,
) -> Result<TrainingOutcome> {
    let fusion = fuse_sources(sources, &cfg.features);
    info!(
        source_matches = sources.matches.len(),
        rows = fusion.rows.len(),
        dropped = fusion.dropped.len(),
        warnings = fusion.warnings.len(),
        "fusion complete"
    );
    if fusion.rows.len() < cfg.train.min_rows {
        return Err(ForecastError::training_data(format!(
            "{} usable rows after fusion, at least {} required",
            fusion.rows.len(),
            cfg.train.min_rows
        )));
    }

    let features = FeatureBuilder::fit(&fusion, cfg.features.clone())?;
    let vectors = features.build_training_matrix(&fusion.rows, cancel)?;
    let labels: Vec<OutcomeLabel> = fusion.rows.iter().map(|r| r.outcome).collect();

    let fitted = fit_model(features.encoders(), &vectors, &labels, &cfg.train, cancel)?;
    let mut metadata =
        TrainingMetadata::from_fit(&fitted, &features, &cfg.train, Utc::now(), vectors.len());
    metadata.fusion = Some(FusionProvenance {
        source_matches: sources.matches.len(),
        dropped_rows: fusion.dropped.len(),
        warnings: fusion.warnings.len(),
    });

    let metrics = fitted.validation.clone();
    let artifact = ModelArtifact::assemble(features, fitted.params, metadata)?;
    Ok(TrainingOutcome {
        artifact,
        metrics,
        warnings: fusion.warnings,
        dropped: fusion.dropped,
    })
}
