use serde::{Deserialize, Serialize};

use crate::records::OutcomeLabel;

/// Raw class scores: home (team A), draw, away (team B).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Logits3 {
    pub home: f64,
    pub draw: f64,
    pub away: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prob3 {
    pub home: f64,
    pub draw: f64,
    pub away: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub label: OutcomeLabel,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub samples: usize,
    pub accuracy: f64,
    pub macro_f1: f64,
    pub per_class: Vec<ClassMetrics>,
    pub log_loss: f64,
    pub brier: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct CalibrationBin {
    pub bucket_start: f64,
    pub bucket_end: f64,
    pub count: usize,
    pub avg_pred: f64,
    pub actual_rate: f64,
}

/// Temperature scale plus additive draw bias, applied to centred logits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LogitCalibration {
    pub scale: f64,
    pub draw_bias: f64,
}

impl Default for LogitCalibration {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl LogitCalibration {
    pub const IDENTITY: Self = Self {
        scale: 1.0,
        draw_bias: 0.0,
    };

    pub fn apply(&self, logits: Logits3) -> Prob3 {
        let s = self.scale.clamp(0.50, 1.80);
        // home and away are summed first so the result is exact under a team swap
        let mean = ((logits.home + logits.away) + logits.draw) / 3.0;
        softmax3(Logits3 {
            home: (logits.home - mean) * s,
            draw: (logits.draw - mean) * s + self.draw_bias,
            away: (logits.away - mean) * s,
        })
    }
}

impl Prob3 {
    pub fn uniform() -> Self {
        Self {
            home: 1.0 / 3.0,
            draw: 1.0 / 3.0,
            away: 1.0 / 3.0,
        }
    }

    pub fn get(&self, label: OutcomeLabel) -> f64 {
        match label {
            OutcomeLabel::HomeWin => self.home,
            OutcomeLabel::Draw => self.draw,
            OutcomeLabel::AwayWin => self.away,
        }
    }

    pub fn sum(&self) -> f64 {
        self.home + self.draw + self.away
    }
}

pub fn softmax3(logits: Logits3) -> Prob3 {
    let mx = logits.home.max(logits.draw.max(logits.away));
    let eh = (logits.home - mx).exp();
    let ed = (logits.draw - mx).exp();
    let ea = (logits.away - mx).exp();
    let den = ((eh + ea) + ed).max(1e-12);

    Prob3 {
        home: (eh / den).clamp(0.0, 1.0),
        draw: (ed / den).clamp(0.0, 1.0),
        away: (ea / den).clamp(0.0, 1.0),
    }
}

/// Most probable class. Ties resolve home, then draw, then away.
pub fn argmax(p: Prob3) -> OutcomeLabel {
    if p.home >= p.draw && p.home >= p.away {
        OutcomeLabel::HomeWin
    } else if p.draw >= p.away {
        OutcomeLabel::Draw
    } else {
        OutcomeLabel::AwayWin
    }
}

pub fn empirical_outcome_probs(outcomes: &[OutcomeLabel]) -> Prob3 {
    if outcomes.is_empty() {
        return Prob3::uniform();
    }

    let mut counts = [0usize; 3];
    for outcome in outcomes {
        counts[outcome.index()] += 1;
    }
    let n = outcomes.len() as f64;
    Prob3 {
        home: counts[0] as f64 / n,
        draw: counts[1] as f64 / n,
        away: counts[2] as f64 / n,
    }
}

pub fn evaluate_probs(predictions: &[Prob3], outcomes: &[OutcomeLabel]) -> Metrics {
    if predictions.is_empty() || predictions.len() != outcomes.len() {
        return Metrics::empty();
    }

    let mut brier_sum = 0.0_f64;
    let mut log_loss_sum = 0.0_f64;
    let mut correct = 0usize;
    // confusion[actual][predicted]
    let mut confusion = [[0usize; 3]; 3];

    for (p, outcome) in predictions.iter().zip(outcomes) {
        let y = one_hot(*outcome);
        brier_sum +=
            (p.home - y.home).powi(2) + (p.draw - y.draw).powi(2) + (p.away - y.away).powi(2);
        log_loss_sum += -p.get(*outcome).clamp(1e-12, 1.0).ln();

        let predicted = argmax(*p);
        if predicted == *outcome {
            correct += 1;
        }
        confusion[outcome.index()][predicted.index()] += 1;
    }

    let per_class: Vec<ClassMetrics> = OutcomeLabel::ALL
        .iter()
        .map(|label| {
            let k = label.index();
            let tp = confusion[k][k] as f64;
            let support: usize = confusion[k].iter().sum();
            let predicted: usize = confusion.iter().map(|row| row[k]).sum();
            let precision = if predicted > 0 { tp / predicted as f64 } else { 0.0 };
            let recall = if support > 0 { tp / support as f64 } else { 0.0 };
            let f1 = if precision + recall > 0.0 {
                2.0 * precision * recall / (precision + recall)
            } else {
                0.0
            };
            ClassMetrics {
                label: *label,
                precision,
                recall,
                f1,
                support,
            }
        })
        .collect();

    let n = predictions.len() as f64;
    Metrics {
        samples: predictions.len(),
        accuracy: correct as f64 / n,
        macro_f1: per_class.iter().map(|c| c.f1).sum::<f64>() / per_class.len() as f64,
        per_class,
        log_loss: log_loss_sum / n,
        brier: brier_sum / n,
    }
}

impl Metrics {
    pub fn empty() -> Self {
        Self {
            samples: 0,
            accuracy: 0.0,
            macro_f1: 0.0,
            per_class: Vec::new(),
            log_loss: 0.0,
            brier: 0.0,
        }
    }

    pub fn f1(&self, label: OutcomeLabel) -> Option<f64> {
        self.per_class.iter().find(|c| c.label == label).map(|c| c.f1)
    }
}

/// Grid search over scale and draw bias minimising log loss. Returns the identity
/// when nothing beats the uncalibrated model.
pub fn fit_logit_calibration(
    logits: &[Logits3],
    outcomes: &[OutcomeLabel],
) -> (LogitCalibration, Metrics) {
    if logits.is_empty() || logits.len() != outcomes.len() {
        return (LogitCalibration::IDENTITY, Metrics::empty());
    }

    let mut best = LogitCalibration::IDENTITY;
    let mut best_metrics = evaluate_calibrated(logits, outcomes, best);

    for scale_step in 25..=90 {
        let scale = scale_step as f64 / 50.0; // 0.50..1.80
        for draw_step in -40..=40 {
            let draw_bias = draw_step as f64 / 100.0; // -0.40..0.40
            let candidate = LogitCalibration { scale, draw_bias };
            let metrics = evaluate_calibrated(logits, outcomes, candidate);
            if metrics.log_loss < best_metrics.log_loss {
                best_metrics = metrics;
                best = candidate;
            }
        }
    }

    (best, best_metrics)
}

pub fn calibration_bins(
    predictions: &[Prob3],
    outcomes: &[OutcomeLabel],
    class: OutcomeLabel,
    bins: usize,
) -> Vec<CalibrationBin> {
    let bins = bins.max(2);
    let mut counts = vec![0usize; bins];
    let mut pred_sum = vec![0.0_f64; bins];
    let mut actual_sum = vec![0.0_f64; bins];

    for (p, outcome) in predictions.iter().zip(outcomes) {
        let class_prob = p.get(class).clamp(0.0, 1.0);
        let idx = ((class_prob * bins as f64).floor() as usize).min(bins - 1);
        counts[idx] += 1;
        pred_sum[idx] += class_prob;
        if *outcome == class {
            actual_sum[idx] += 1.0;
        }
    }

    (0..bins)
        .map(|i| {
            let count = counts[i];
            let (avg_pred, actual_rate) = if count > 0 {
                (pred_sum[i] / count as f64, actual_sum[i] / count as f64)
            } else {
                (0.0, 0.0)
            };
            CalibrationBin {
                bucket_start: i as f64 / bins as f64,
                bucket_end: (i + 1) as f64 / bins as f64,
                count,
                avg_pred,
                actual_rate,
            }
        })
        .collect()
}

fn one_hot(outcome: OutcomeLabel) -> Prob3 {
    match outcome {
        OutcomeLabel::HomeWin => Prob3 {
            home: 1.0,
            draw: 0.0,
            away: 0.0,
        },
        OutcomeLabel::Draw => Prob3 {
            home: 0.0,
            draw: 1.0,
            away: 0.0,
        },
        OutcomeLabel::AwayWin => Prob3 {
            home: 0.0,
            draw: 0.0,
            away: 1.0,
        },
    }
}

fn evaluate_calibrated(
    logits: &[Logits3],
    outcomes: &[OutcomeLabel],
    calibration: LogitCalibration,
) -> Metrics {
    let calibrated: Vec<Prob3> = logits.iter().map(|l| calibration.apply(*l)).collect();
    evaluate_probs(&calibrated, outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perfect_predictions_have_zero_brier_and_full_f1() {
        let preds = vec![
            Prob3 {
                home: 1.0,
                draw: 0.0,
                away: 0.0,
            },
            Prob3 {
                home: 0.0,
                draw: 1.0,
                away: 0.0,
            },
            Prob3 {
                home: 0.0,
                draw: 0.0,
                away: 1.0,
            },
        ];
        let outcomes = vec![OutcomeLabel::HomeWin, OutcomeLabel::Draw, OutcomeLabel::AwayWin];
        let m = evaluate_probs(&preds, &outcomes);
        assert_eq!(m.samples, 3);
        assert!(m.brier < 1e-12);
        assert_eq!(m.accuracy, 1.0);
        assert_eq!(m.macro_f1, 1.0);
        assert_eq!(m.f1(OutcomeLabel::Draw), Some(1.0));
    }

    #[test]
    fn base_rate_follows_label_frequencies() {
        use OutcomeLabel::*;
        let p = empirical_outcome_probs(&[HomeWin, HomeWin, Draw, AwayWin]);
        assert_eq!(p.home, 0.5);
        assert_eq!(p.draw, 0.25);
        assert_eq!(p.away, 0.25);
        assert_eq!(empirical_outcome_probs(&[]), Prob3::uniform());
    }

    #[test]
    fn never_predicted_class_scores_zero_f1() {
        let p = Prob3 {
            home: 0.6,
            draw: 0.1,
            away: 0.3,
        };
        let outcomes = vec![OutcomeLabel::HomeWin, OutcomeLabel::Draw];
        let m = evaluate_probs(&[p, p], &outcomes);
        assert_eq!(m.f1(OutcomeLabel::Draw), Some(0.0));
        assert!((m.f1(OutcomeLabel::HomeWin).unwrap_or(0.0) - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn logit_calibration_keeps_distribution_normalized() {
        let l = Logits3 {
            home: 0.7,
            draw: -0.2,
            away: -0.7,
        };
        let cal = LogitCalibration {
            scale: 1.12,
            draw_bias: 0.08,
        };
        let q = cal.apply(l);
        assert!((q.sum() - 1.0).abs() < 1e-9);
        assert!(q.home >= 0.0 && q.draw >= 0.0 && q.away >= 0.0);
    }

    #[test]
    fn calibration_is_exact_under_home_away_mirror() {
        let cal = LogitCalibration {
            scale: 0.86,
            draw_bias: -0.14,
        };
        let l = Logits3 {
            home: 0.3137,
            draw: -0.0921,
            away: -0.3137,
        };
        let mirrored = Logits3 {
            home: l.away,
            draw: l.draw,
            away: l.home,
        };
        let p = cal.apply(l);
        let q = cal.apply(mirrored);
        assert_eq!(p.home, q.away);
        assert_eq!(p.away, q.home);
        assert_eq!(p.draw, q.draw);
    }

    #[test]
    fn grid_fit_never_worsens_log_loss() {
        let logits: Vec<Logits3> = (0..60)
            .map(|i| {
                let z = (i % 7) as f64 * 0.4 - 1.2;
                Logits3 {
                    home: z,
                    draw: 0.0,
                    away: -z,
                }
            })
            .collect();
        let outcomes: Vec<OutcomeLabel> = (0..60).map(|i| OutcomeLabel::ALL[i % 3]).collect();
        let base = evaluate_calibrated(&logits, &outcomes, LogitCalibration::IDENTITY);
        let (_, fitted) = fit_logit_calibration(&logits, &outcomes);
        assert!(fitted.log_loss <= base.log_loss);
    }
}
