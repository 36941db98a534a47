use rand::prelude::*;

/// Stratified k-fold partition.
///
/// Each class is shuffled and dealt round-robin over the folds; the
/// starting fold rotates by class so fold sizes stay within one of
/// each other.
///
/// * `labels` - class of every position
/// * `n_fold` - number of folds
///
/// # Returns sorted positions of each fold
pub fn stratified_kfold<R: Rng>(labels: &[usize], n_fold: usize, rng: &mut R) -> Vec<Vec<usize>> {
    let n_fold = n_fold.max(1);
    let n_classes = labels.iter().max().map(|&y| y + 1).unwrap_or(0);

    let mut folds = vec![vec![]; n_fold];
    let mut offset = 0;

    for k in 0..n_classes {
        let mut members: Vec<usize> = (0..labels.len()).filter(|&i| labels[i] == k).collect();
        members.shuffle(rng);
        for (j, i) in members.iter().enumerate() {
            folds[(offset + j) % n_fold].push(*i);
        }
        offset = (offset + members.len()) % n_fold;
    }

    for f in folds.iter_mut() {
        f.sort_unstable();
    }
    folds
}

/// Hold out about `ratio` of every class.
///
/// A class with at least two members keeps at least one on each side
/// when `ratio > 0`.
///
/// # Returns `(kept, held_out)`, both sorted
pub fn stratified_holdout<R: Rng>(
    positions: &[usize],
    labels: &[usize],
    ratio: f32,
    rng: &mut R,
) -> (Vec<usize>, Vec<usize>) {
    let n_classes = positions.iter().map(|&i| labels[i] + 1).max().unwrap_or(0);
    let mut kept = vec![];
    let mut held = vec![];

    for k in 0..n_classes {
        let mut members: Vec<usize> = positions.iter().cloned().filter(|&i| labels[i] == k).collect();
        members.shuffle(rng);
        let n = members.len();
        let mut n_held = (ratio.clamp(0., 1.) * n as f32).round() as usize;
        if ratio > 0. && n >= 2 {
            n_held = n_held.clamp(1, n - 1);
        }
        held.extend_from_slice(&members[..n_held]);
        kept.extend_from_slice(&members[n_held..]);
    }

    kept.sort_unstable();
    held.sort_unstable();
    (kept, held)
}

/// Draw `size` positions balanced over the non-empty class pools:
/// `size / #classes` from each class, the remainder from all pools
/// together. A class smaller than its quota is sampled with
/// replacement.
pub fn stratified_sample<R: Rng>(
    pools: &[Vec<usize>],
    size: usize,
    rng: &mut R,
) -> anyhow::Result<Vec<usize>> {
    let nonempty: Vec<&Vec<usize>> = pools.iter().filter(|p| !p.is_empty()).collect();
    if nonempty.is_empty() {
        return Err(anyhow::anyhow!("cannot sample from an empty pool"));
    }

    let quota = size / nonempty.len();
    let mut ret = Vec::with_capacity(size);

    for pool in nonempty.iter() {
        if pool.len() >= quota {
            ret.extend(pool.choose_multiple(rng, quota).cloned());
        } else {
            ret.extend((0..quota).filter_map(|_| pool.choose(rng).cloned()));
        }
    }

    let everyone: Vec<usize> = nonempty.iter().flat_map(|p| p.iter().cloned()).collect();
    while ret.len() < size {
        if let Some(&i) = everyone.choose(rng) {
            ret.push(i);
        }
    }

    ret.shuffle(rng);
    Ok(ret)
}

/// Mix `seed` with `(stream, index)` into an independent seed
pub fn derive_seed(seed: u64, stream: u64, index: u64) -> u64 {
    // splitmix64 finalizer
    let mut z = seed
        ^ stream.wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ index.wrapping_add(1).wrapping_mul(0xD1B5_4A32_D192_ED03);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;

    #[test]
    fn kfold_partitions_every_position_once() {
        let labels = vec![0, 1, 0, 0, 1, 1, 0, 0, 0, 1, 0];
        let folds = stratified_kfold(&labels, 3, &mut StdRng::seed_from_u64(3));
        let mut all: Vec<usize> = folds.iter().flatten().cloned().collect();
        all.sort();
        assert_eq!(all, (0..labels.len()).collect::<Vec<_>>());
        let sizes: Vec<usize> = folds.iter().map(|f| f.len()).collect();
        assert!(sizes.iter().max().unwrap() - sizes.iter().min().unwrap() <= 1);
        for f in folds.iter() {
            assert!(f.iter().any(|&i| labels[i] == 1));
        }
    }

    #[test]
    fn holdout_keeps_both_classes_on_each_side() {
        let labels = vec![0, 0, 0, 0, 0, 0, 0, 0, 1, 1];
        let positions: Vec<usize> = (0..10).collect();
        let (kept, held) =
            stratified_holdout(&positions, &labels, 0.2, &mut StdRng::seed_from_u64(0));
        assert_eq!(kept.len() + held.len(), 10);
        assert!(held.iter().any(|&i| labels[i] == 1));
        assert!(kept.iter().any(|&i| labels[i] == 1));
    }

    #[test]
    fn sample_is_balanced_and_sized() -> anyhow::Result<()> {
        let pools = vec![(0..50).collect::<Vec<_>>(), vec![100, 101]];
        let s = stratified_sample(&pools, 9, &mut StdRng::seed_from_u64(1))?;
        assert_eq!(s.len(), 9);
        assert!(s.iter().filter(|&&i| i >= 100).count() >= 4);
        assert!(stratified_sample(&[vec![], vec![]], 3, &mut StdRng::seed_from_u64(1)).is_err());
        assert_eq!(stratified_sample(&pools, 1, &mut StdRng::seed_from_u64(1))?.len(), 1);
        Ok(())
    }

    #[test]
    fn derived_seeds_differ() {
        assert_ne!(derive_seed(1, 0, 0), derive_seed(1, 0, 1));
        assert_ne!(derive_seed(1, 0, 0), derive_seed(1, 1, 0));
        assert_eq!(derive_seed(9, 2, 3), derive_seed(9, 2, 3));
    }
}
