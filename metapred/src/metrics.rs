/// Classification quality on one evaluation set
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Metrics {
    pub accuracy: f64,
    pub auroc: f64,
    pub avepre: f64,
    pub f1: f64,
}

impl std::fmt::Display for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "acc: {:.4}, auc: {:.4}, ap: {:.4}, f1: {:.4}",
            self.accuracy, self.auroc, self.avepre, self.f1
        )
    }
}

/// Score class probabilities against true labels.
///
/// Binary problems are scored on class 1; with more classes AUROC,
/// AP and F1 are macro averages of one-vs-rest scores.
///
/// * `probs` - one row of class probabilities per sample
/// * `labels` - true class per sample
pub fn evaluate_predictions(probs: &[Vec<f32>], labels: &[usize], n_classes: usize) -> Metrics {
    if labels.is_empty() {
        return Metrics::default();
    }

    let predicted: Vec<usize> = probs.iter().map(|p| argmax(p)).collect();
    let accuracy = accuracy(&predicted, labels);

    let one_vs_rest = |k: usize| {
        let scores: Vec<f32> = probs.iter().map(|p| p.get(k).cloned().unwrap_or(0.)).collect();
        let truth: Vec<bool> = labels.iter().map(|&y| y == k).collect();
        let called: Vec<bool> = predicted.iter().map(|&y| y == k).collect();
        (
            auroc(&scores, &truth),
            average_precision(&scores, &truth),
            f1_score(&called, &truth),
        )
    };

    if n_classes <= 2 {
        let (auroc, avepre, f1) = one_vs_rest(1);
        return Metrics {
            accuracy,
            auroc,
            avepre,
            f1,
        };
    }

    let per_class: Vec<(f64, f64, f64)> = (0..n_classes).map(one_vs_rest).collect();
    let nk = n_classes as f64;
    Metrics {
        accuracy,
        auroc: per_class.iter().map(|x| x.0).sum::<f64>() / nk,
        avepre: per_class.iter().map(|x| x.1).sum::<f64>() / nk,
        f1: per_class.iter().map(|x| x.2).sum::<f64>() / nk,
    }
}

fn argmax(p: &[f32]) -> usize {
    let mut best = 0;
    for (k, &x) in p.iter().enumerate() {
        if x > p[best] {
            best = k;
        }
    }
    best
}

pub fn accuracy(predicted: &[usize], labels: &[usize]) -> f64 {
    if labels.is_empty() {
        return 0.;
    }
    let hits = predicted
        .iter()
        .zip(labels.iter())
        .filter(|(a, b)| a == b)
        .count();
    hits as f64 / labels.len() as f64
}

/// Area under the ROC curve by the rank-sum statistic; tied scores
/// share their average rank. 0.5 when only one class is present.
pub fn auroc(scores: &[f32], positive: &[bool]) -> f64 {
    let n_pos = positive.iter().filter(|&&y| y).count();
    let n_neg = positive.len() - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return 0.5;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut rank_sum_pos = 0f64;
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        // ranks i+1 ..= j+1 averaged
        let rank = (i + j + 2) as f64 / 2.;
        rank_sum_pos += rank * order[i..=j].iter().filter(|&&s| positive[s]).count() as f64;
        i = j + 1;
    }

    let (p, n) = (n_pos as f64, n_neg as f64);
    (rank_sum_pos - p * (p + 1.) / 2.) / (p * n)
}

/// Average precision: `sum_n (R_n - R_{n-1}) P_n` over the distinct
/// score thresholds, highest first. Equals the positive rate when
/// only one class is present.
pub fn average_precision(scores: &[f32], positive: &[bool]) -> f64 {
    let n = positive.len();
    let n_pos = positive.iter().filter(|&&y| y).count();
    if n == 0 {
        return 0.;
    }
    if n_pos == 0 || n_pos == n {
        return n_pos as f64 / n as f64;
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let mut ap = 0f64;
    let (mut tp, mut seen) = (0usize, 0usize);
    let mut prev_recall = 0f64;
    let mut i = 0;
    while i < n {
        let mut j = i;
        while j + 1 < n && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        tp += order[i..=j].iter().filter(|&&s| positive[s]).count();
        seen += j + 1 - i;
        let recall = tp as f64 / n_pos as f64;
        let precision = tp as f64 / seen as f64;
        ap += (recall - prev_recall) * precision;
        prev_recall = recall;
        i = j + 1;
    }
    ap
}

/// Harmonic mean of precision and recall; 0 when undefined
pub fn f1_score(called: &[bool], positive: &[bool]) -> f64 {
    let mut tp = 0f64;
    let mut fp = 0f64;
    let mut fn_ = 0f64;
    for (&c, &y) in called.iter().zip(positive.iter()) {
        match (c, y) {
            (true, true) => tp += 1.,
            (true, false) => fp += 1.,
            (false, true) => fn_ += 1.,
            _ => {}
        }
    }
    if tp == 0. {
        return 0.;
    }
    2. * tp / (2. * tp + fp + fn_)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn auroc_with_ties() {
        // pairs (pos, neg): 0.8>0.1, 0.8>0.4, 0.4=0.4 -> 0.5, 0.4>0.1
        let scores = [0.1, 0.4, 0.4, 0.8];
        let truth = [false, false, true, true];
        assert_abs_diff_eq!(auroc(&scores, &truth), 3.5 / 4., epsilon = 1e-12);
        assert_abs_diff_eq!(auroc(&scores, &[true; 4]), 0.5);
    }

    #[test]
    fn average_precision_by_hand() {
        let scores = [0.9, 0.8, 0.7, 0.6];
        let truth = [true, false, true, false];
        // P@1 = 1 (R 0.5), P@3 = 2/3 (R 1.0)
        assert_abs_diff_eq!(
            average_precision(&scores, &truth),
            0.5 + 0.5 * 2. / 3.,
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(average_precision(&scores, &[false; 4]), 0.);
        assert_abs_diff_eq!(average_precision(&scores, &[true; 4]), 1.);
    }

    #[test]
    fn f1_by_hand() {
        let called = [true, true, false, false];
        let truth = [true, false, true, true];
        // tp 1, fp 1, fn 2
        assert_abs_diff_eq!(f1_score(&called, &truth), 2. / 5., epsilon = 1e-12);
        assert_abs_diff_eq!(f1_score(&[false; 4], &truth), 0.);
    }

    #[test]
    fn binary_and_multiclass_summaries() {
        let probs = vec![
            vec![0.9, 0.1],
            vec![0.3, 0.7],
            vec![0.6, 0.4],
            vec![0.2, 0.8],
        ];
        let m = evaluate_predictions(&probs, &[0, 1, 1, 1], 2);
        assert_abs_diff_eq!(m.accuracy, 0.75);
        assert_abs_diff_eq!(m.auroc, 1.0);
        assert_abs_diff_eq!(m.f1, 0.8, epsilon = 1e-12);

        let probs = vec![vec![0.8, 0.1, 0.1], vec![0.1, 0.8, 0.1], vec![0.1, 0.1, 0.8]];
        let m = evaluate_predictions(&probs, &[0, 1, 2], 3);
        assert_abs_diff_eq!(m.accuracy, 1.);
        assert_abs_diff_eq!(m.auroc, 1.);
        assert_abs_diff_eq!(m.f1, 1.);
        assert!(evaluate_predictions(&probs, &[0, 0, 0], 3).auroc.is_finite());
    }
}
