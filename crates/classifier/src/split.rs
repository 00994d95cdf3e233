//! Seeded stratified sampling: train/test split and k-fold assignment.

use medrisk_model::{RiskClass, NUM_CLASSES};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::ClassifierError;

/// Row indices grouped by class, each group shuffled with `rng`.
fn shuffled_by_class(labels: &[RiskClass], rng: &mut StdRng) -> [Vec<usize>; NUM_CLASSES] {
    let mut groups: [Vec<usize>; NUM_CLASSES] = Default::default();
    for (i, label) in labels.iter().enumerate() {
        groups[label.index()].push(i);
    }
    for group in &mut groups {
        group.shuffle(rng);
    }
    groups
}

/// Split row indices into (train, test), preserving class proportions.
///
/// The test set has `ceil(test_size * n)` rows. Per-class test counts are
/// proportional, with leftover rows going to the classes with the largest
/// fractional share.
pub fn stratified_train_test_split(
    labels: &[RiskClass],
    test_size: f64,
    seed: u64,
) -> Result<(Vec<usize>, Vec<usize>), ClassifierError> {
    if !(test_size > 0.0 && test_size < 1.0) {
        return Err(ClassifierError::InvalidConfig(format!(
            "test_size must be in (0, 1), got {test_size}"
        )));
    }
    let n = labels.len();
    let n_test = (test_size * n as f64).ceil() as usize;
    if n_test == 0 || n_test >= n {
        return Err(ClassifierError::InvalidSplit(format!(
            "{n} rows cannot be split with test_size {test_size}"
        )));
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let groups = shuffled_by_class(labels, &mut rng);

    let shares: Vec<f64> = groups
        .iter()
        .map(|g| g.len() as f64 * n_test as f64 / n as f64)
        .collect();
    let mut take: Vec<usize> = shares.iter().map(|s| s.floor() as usize).collect();
    let mut by_remainder: Vec<usize> = (0..NUM_CLASSES).collect();
    by_remainder.sort_by(|&a, &b| {
        let ra = shares[a] - shares[a].floor();
        let rb = shares[b] - shares[b].floor();
        rb.total_cmp(&ra).then(a.cmp(&b))
    });
    let mut leftover = n_test - take.iter().sum::<usize>();
    for k in by_remainder {
        if leftover == 0 {
            break;
        }
        if take[k] < groups[k].len() {
            take[k] += 1;
            leftover -= 1;
        }
    }

    let mut train = Vec::with_capacity(n - n_test);
    let mut test = Vec::with_capacity(n_test);
    for (group, &t) in groups.iter().zip(&take) {
        test.extend_from_slice(&group[..t]);
        train.extend_from_slice(&group[t..]);
    }
    train.sort_unstable();
    test.sort_unstable();
    Ok((train, test))
}

/// Stratified k-fold: returns `(train, validation)` index pairs per fold.
///
/// Rows of each class are shuffled and dealt round-robin across folds, with
/// the dealing position carried over between classes so fold sizes differ
/// by at most one.
pub fn stratified_kfold(
    labels: &[RiskClass],
    n_folds: usize,
    seed: u64,
) -> Result<Vec<(Vec<usize>, Vec<usize>)>, ClassifierError> {
    if n_folds < 2 || n_folds > labels.len() {
        return Err(ClassifierError::InvalidSplit(format!(
            "cannot make {n_folds} folds from {} rows",
            labels.len()
        )));
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let groups = shuffled_by_class(labels, &mut rng);
    for (k, group) in groups.iter().enumerate() {
        if !group.is_empty() && group.len() < n_folds {
            tracing::warn!(
                class = ?RiskClass::ALL[k],
                members = group.len(),
                n_folds,
                "Least populated class has fewer members than folds"
            );
        }
    }

    let mut fold_of = vec![0usize; labels.len()];
    let mut position = 0usize;
    for group in &groups {
        for &i in group {
            fold_of[i] = position % n_folds;
            position += 1;
        }
    }

    Ok((0..n_folds)
        .map(|fold| {
            let (validation, train): (Vec<usize>, Vec<usize>) =
                (0..labels.len()).partition(|&i| fold_of[i] == fold);
            (train, validation)
        })
        .collect())
}
