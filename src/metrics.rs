use ndarray::{Array1, ArrayView1};

pub fn sigmoid(z: f64) -> f64 {
    (1f64 + (-z).exp()).recip()
}

/// `-z*log(sigmoid(x)) - (1-z)*log(1-sigmoid(x))`, stable for large |x|
pub fn sigmoid_cross_entropy_with_logits(logit: f64, label: f64) -> f64 {
    logit.max(0f64) - logit * label + (-logit.abs()).exp().ln_1p()
}

pub fn mean_cross_entropy(logits: ArrayView1<f64>, labels: ArrayView1<f64>) -> f64 {
    if logits.is_empty() {
        return 0f64;
    }

    logits
        .iter()
        .zip(labels)
        .map(|(x, z)| sigmoid_cross_entropy_with_logits(*x, *z))
        .sum::<f64>()
        / logits.len() as f64
}

/// Fraction of examples whose probability, thresholded at 0.5, matches the label
pub fn accuracy(probabilities: &[f64], labels: &[f64]) -> f64 {
    if labels.is_empty() {
        return 0f64;
    }

    let correct = probabilities
        .iter()
        .zip(labels)
        .filter(|(p, y)| (**p >= 0.5) == (**y >= 0.5))
        .count();

    correct as f64 / labels.len() as f64
}

/// Confusion counts at every distinct threshold, from the highest score down.
/// Examples with equal scores share one threshold
fn cumulative_counts(scores: &[f64], labels: &[f64]) -> Vec<(f64, f64)> {
    let mut pairs: Vec<(f64, bool)> = scores.iter().zip(labels).map(|(s, y)| (*s, *y >= 0.5)).collect();
    pairs.sort_by(|a, b| b.0.total_cmp(&a.0));

    let mut counts = vec![];
    let (mut tp, mut fp) = (0f64, 0f64);
    let mut i = 0;

    while i < pairs.len() {
        let score = pairs[i].0;
        while i < pairs.len() && pairs[i].0 == score {
            if pairs[i].1 {
                tp += 1f64;
            } else {
                fp += 1f64;
            }
            i += 1;
        }
        counts.push((tp, fp));
    }

    counts
}

/// Area under the ROC curve. 0.5 when only one class is present
pub fn roc_auc(scores: &[f64], labels: &[f64]) -> f64 {
    let positives = labels.iter().filter(|y| **y >= 0.5).count() as f64;
    let negatives = labels.len() as f64 - positives;

    if positives == 0f64 || negatives == 0f64 {
        return 0.5;
    }

    let mut area = 0f64;
    let (mut prev_tp, mut prev_fp) = (0f64, 0f64);

    for (tp, fp) in cumulative_counts(scores, labels) {
        area += (fp - prev_fp) * (tp + prev_tp) / 2f64;
        prev_tp = tp;
        prev_fp = fp;
    }

    area / (positives * negatives)
}

/// Area under the precision-recall curve (trapezoidal). 0 without positives
pub fn pr_auc(scores: &[f64], labels: &[f64]) -> f64 {
    let positives = labels.iter().filter(|y| **y >= 0.5).count() as f64;

    if positives == 0f64 {
        return 0f64;
    }

    let mut area = 0f64;
    let mut prev: Option<(f64, f64)> = None;

    for (tp, fp) in cumulative_counts(scores, labels) {
        let recall = tp / positives;
        let precision = tp / (tp + fp);
        // The curve starts at recall 0 with the precision of the first threshold
        let (prev_recall, prev_precision) = prev.unwrap_or((0f64, precision));

        area += (recall - prev_recall) * (precision + prev_precision) / 2f64;
        prev = Some((recall, precision));
    }

    area
}

#[derive(Clone, Debug, PartialEq)]
pub struct EvalMetrics {
    pub loss: f64,
    pub accuracy: f64,
    pub auc: f64,
    pub pr: f64,
    pub label_mean: f64,
    pub prediction_mean: f64,
    pub num_examples: usize,
}

impl EvalMetrics {
    pub fn compute(logits: &Array1<f64>, labels: &Array1<f64>) -> EvalMetrics {
        let probabilities: Vec<f64> = logits.iter().map(|x| sigmoid(*x)).collect();
        let labels_vec = labels.to_vec();
        let n = labels.len().max(1) as f64;

        EvalMetrics {
            loss: mean_cross_entropy(logits.view(), labels.view()),
            accuracy: accuracy(&probabilities, &labels_vec),
            auc: roc_auc(&probabilities, &labels_vec),
            pr: pr_auc(&probabilities, &labels_vec),
            label_mean: labels.sum() / n,
            prediction_mean: probabilities.iter().sum::<f64>() / n,
            num_examples: labels.len(),
        }
    }

    /// Named scalars, in the order they are logged
    pub fn scalars(&self) -> Vec<(&'static str, f64)> {
        vec![
            ("loss", self.loss),
            ("accuracy", self.accuracy),
            ("auc", self.auc),
            ("pr", self.pr),
            ("label_mean", self.label_mean),
            ("prediction_mean", self.prediction_mean),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn cross_entropy_matches_definition() {
        for (x, z) in [(0.3, 1.0), (-2.0, 0.0), (1.5, 0.0)] {
            let p = sigmoid(x);
            let naive = -(z * p.ln() + (1.0 - z) * (1.0 - p).ln());
            assert!((sigmoid_cross_entropy_with_logits(x, z) - naive).abs() < 1e-12);
        }
    }

    #[test]
    fn cross_entropy_is_finite_for_large_logits() {
        let loss = sigmoid_cross_entropy_with_logits(1000.0, 0.0);
        assert!((loss - 1000.0).abs() < 1e-9);
        assert!(sigmoid_cross_entropy_with_logits(-1000.0, 0.0) < 1e-12);
    }

    #[test]
    fn accuracy_at_half() {
        assert_eq!(accuracy(&[0.9, 0.5, 0.2, 0.4], &[1.0, 0.0, 0.0, 1.0]), 0.5);
    }

    #[test]
    fn roc_auc_perfect_and_reversed() {
        let labels = [0.0, 0.0, 1.0, 1.0];
        assert_eq!(roc_auc(&[0.1, 0.2, 0.8, 0.9], &labels), 1.0);
        assert_eq!(roc_auc(&[0.9, 0.8, 0.2, 0.1], &labels), 0.0);
    }

    #[test]
    fn roc_auc_counts_ties_as_half() {
        assert_eq!(roc_auc(&[0.5, 0.5], &[0.0, 1.0]), 0.5);
        // one of four pairs misordered
        assert_eq!(roc_auc(&[0.1, 0.4, 0.35, 0.8], &[0.0, 0.0, 1.0, 1.0]), 0.75);
    }

    #[test]
    fn roc_auc_single_class() {
        assert_eq!(roc_auc(&[0.1, 0.7], &[1.0, 1.0]), 0.5);
    }

    #[test]
    fn pr_auc_values() {
        assert_eq!(pr_auc(&[0.9, 0.8, 0.2, 0.1], &[1.0, 1.0, 0.0, 0.0]), 1.0);
        assert_eq!(pr_auc(&[0.3, 0.2], &[0.0, 0.0]), 0.0);

        // Thresholds: (r=0.5, p=1), (r=0.5, p=0.5), (r=1, p=2/3)
        let area = pr_auc(&[0.9, 0.8, 0.7], &[1.0, 0.0, 1.0]);
        let expected = 0.5 * 1.0 + 0.5 * (0.5 + 2.0 / 3.0) / 2.0;
        assert!((area - expected).abs() < 1e-12);
    }

    #[test]
    fn eval_metrics_compute() {
        let metrics = EvalMetrics::compute(&array![2.0, -2.0, 3.0, -1.0], &array![1.0, 0.0, 1.0, 1.0]);

        assert_eq!(metrics.num_examples, 4);
        assert_eq!(metrics.accuracy, 0.75);
        assert_eq!(metrics.auc, 1.0);
        assert_eq!(metrics.label_mean, 0.75);
        assert!(metrics.loss > 0.0);
    }
}
