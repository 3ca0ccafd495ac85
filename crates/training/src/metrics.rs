use serde::{Deserialize, Serialize};

/// Running arithmetic mean of per-batch values.
#[derive(Debug, Clone, Default)]
pub struct RunningMean {
    sum: f64,
    count: u64,
}

impl RunningMean {
    pub fn update(&mut self, sample: f64) {
        self.sum += sample;
        self.count += 1;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn value(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum / self.count as f64)
        }
    }
}

/// One-vs-rest confusion counts for a single positive class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PositiveClassCounts {
    pub true_positives: u64,
    pub false_positives: u64,
    pub false_negatives: u64,
}

impl PositiveClassCounts {
    pub fn update(&mut self, predictions: &[u32], labels: &[u32], positive: u32) {
        for (&predicted, &actual) in predictions.iter().zip(labels) {
            match (predicted == positive, actual == positive) {
                (true, true) => self.true_positives += 1,
                (true, false) => self.false_positives += 1,
                (false, true) => self.false_negatives += 1,
                (false, false) => {}
            }
        }
    }

    pub fn precision(&self) -> f64 {
        ratio(
            self.true_positives,
            self.true_positives + self.false_positives,
        )
    }

    pub fn recall(&self) -> f64 {
        ratio(
            self.true_positives,
            self.true_positives + self.false_negatives,
        )
    }

    /// Harmonic mean of precision and recall; 0 when both are 0.
    pub fn f1(&self) -> f64 {
        let precision = self.precision();
        let recall = self.recall();
        if precision + recall == 0.0 {
            0.0
        } else {
            2.0 * precision * recall / (precision + recall)
        }
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

#[derive(Debug, Default)]
pub struct EvaluationMetrics {
    loss: RunningMean,
    counts: PositiveClassCounts,
    examples: u64,
}

impl EvaluationMetrics {
    pub fn update(&mut self, loss: f64, predictions: &[u32], labels: &[u32], positive: u32) {
        self.loss.update(loss);
        self.counts.update(predictions, labels, positive);
        self.examples += labels.len() as u64;
    }

    pub fn finalize(self) -> Option<EvaluationSummary> {
        let average_loss = self.loss.value()?;
        Some(EvaluationSummary {
            average_loss,
            precision: self.counts.precision(),
            recall: self.counts.recall(),
            f1: self.counts.f1(),
            examples: self.examples,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EvaluationSummary {
    pub average_loss: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub examples: u64,
}

/// One row of the per-epoch history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochSummary {
    pub epoch: usize,
    pub train_loss: Option<f64>,
    pub validation_loss: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub improved: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_correct_positive_batch_scores_one() {
        let mut counts = PositiveClassCounts::default();
        counts.update(&[1, 1, 1], &[1, 1, 1], 1);
        assert_eq!(counts.f1(), 1.0);
    }

    #[test]
    fn all_wrong_scores_zero() {
        let mut counts = PositiveClassCounts::default();
        counts.update(&[0, 2, 0], &[1, 1, 0], 1);
        assert_eq!(counts.precision(), 0.0);
        assert_eq!(counts.recall(), 0.0);
        assert_eq!(counts.f1(), 0.0);
    }

    #[test]
    fn no_positive_labels_or_predictions_is_zero_not_nan() {
        let mut counts = PositiveClassCounts::default();
        counts.update(&[0, 2, 0], &[0, 2, 2], 1);
        assert_eq!(counts.f1(), 0.0);
    }

    #[test]
    fn f1_matches_harmonic_mean() {
        let mut counts = PositiveClassCounts::default();
        // tp=2 fp=1 fn=1
        counts.update(&[1, 1, 1, 0, 0], &[1, 1, 0, 1, 0], 1);
        assert!((counts.precision() - 2.0 / 3.0).abs() < 1e-12);
        assert!((counts.recall() - 2.0 / 3.0).abs() < 1e-12);
        assert!((counts.f1() - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn running_mean_is_empty_until_updated() {
        let mut mean = RunningMean::default();
        assert_eq!(mean.value(), None);
        mean.update(1.0);
        mean.update(3.0);
        assert_eq!(mean.value(), Some(2.0));
        assert_eq!(mean.count(), 2);
    }

    #[test]
    fn evaluation_requires_a_batch() {
        assert!(EvaluationMetrics::default().finalize().is_none());

        let mut metrics = EvaluationMetrics::default();
        metrics.update(0.5, &[1, 0], &[1, 1], 1);
        let summary = metrics.finalize().unwrap();
        assert_eq!(summary.average_loss, 0.5);
        assert_eq!(summary.precision, 1.0);
        assert_eq!(summary.recall, 0.5);
        assert_eq!(summary.examples, 2);
    }
}
