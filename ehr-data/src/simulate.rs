use crate::cohort::{Cohort, VisitEntry};

use log::info;
use rand::prelude::*;
use rand_distr::{Bernoulli, Distribution, Uniform};
use std::path::Path;

pub struct SimArgs {
    pub n_samples: usize,
    pub n_visits: usize,
    pub n_codes: usize,
    pub n_classes: usize,
    /// background probability of a code in a visit
    pub density: f64,
    /// extra probability of the class-specific codes
    pub signal: f64,
    /// class-specific codes per class
    pub n_marker_codes: usize,
    /// share of class-specific codes every task has in common
    pub shared: f64,
    pub rseed: u64,
}

impl Default for SimArgs {
    fn default() -> Self {
        Self {
            n_samples: 200,
            n_visits: 8,
            n_codes: 30,
            n_classes: 2,
            density: 0.05,
            signal: 0.3,
            n_marker_codes: 5,
            shared: 0.5,
            rseed: 42,
        }
    }
}

/// Simulate one cohort per task name.
///
/// Each class `k` has a set of marker codes; a patient of class `k`
/// sees each code in each visit with probability `density`, marker
/// codes with `density + signal`. A fraction `shared` of the markers
/// is common to all tasks, the rest is drawn per task.
///
/// ```text
/// X(i,t,d) ~ Bernoulli( density + signal * 1[d in M(task, y_i)] )
/// ```
pub fn simulate_cohorts(tasks: &[Box<str>], args: &SimArgs) -> anyhow::Result<Vec<Cohort>> {
    if args.n_classes < 2 {
        return Err(anyhow::anyhow!("need at least two classes"));
    }
    if args.n_codes == 0 || args.n_visits == 0 {
        return Err(anyhow::anyhow!("empty visit-by-code layout"));
    }

    let mut rng = StdRng::seed_from_u64(args.rseed);
    let n_markers = args.n_marker_codes.clamp(1, args.n_codes);
    let n_shared = ((args.shared.clamp(0., 1.) * n_markers as f64).round()) as usize;

    let all_codes: Vec<usize> = (0..args.n_codes).collect();
    let shared_markers: Vec<Vec<usize>> = (0..args.n_classes)
        .map(|_| all_codes.choose_multiple(&mut rng, n_shared).cloned().collect())
        .collect();

    let background = Bernoulli::new(args.density.clamp(0., 1.))?;
    let elevated = Bernoulli::new((args.density + args.signal).clamp(0., 1.))?;
    let runif = Uniform::new(0usize, args.n_classes)?;

    let mut ret = Vec::with_capacity(tasks.len());

    for task in tasks {
        let markers: Vec<Vec<bool>> = shared_markers
            .iter()
            .map(|shared| {
                let mut is_marker = vec![false; args.n_codes];
                for &d in shared {
                    is_marker[d] = true;
                }
                for &d in all_codes.choose_multiple(&mut rng, n_markers - n_shared) {
                    is_marker[d] = true;
                }
                is_marker
            })
            .collect();

        let mut sample_names = Vec::with_capacity(args.n_samples);
        let mut labels = Vec::with_capacity(args.n_samples);
        let mut records = Vec::with_capacity(args.n_samples);

        for i in 0..args.n_samples {
            // every class shows up at least once
            let y = if i < args.n_classes {
                i
            } else {
                runif.sample(&mut rng)
            };
            let mut rec = vec![];
            for t in 0..args.n_visits {
                for d in 0..args.n_codes {
                    let hit = if markers[y][d] {
                        elevated.sample(&mut rng)
                    } else {
                        background.sample(&mut rng)
                    };
                    if hit {
                        rec.push(VisitEntry {
                            visit: t,
                            code: d,
                            value: 1.,
                        });
                    }
                }
            }
            sample_names.push(format!("{}_{}", task, i).into_boxed_str());
            labels.push(y);
            records.push(rec);
        }

        info!(
            "simulated {}: {} samples, {} entries",
            task,
            args.n_samples,
            records.iter().map(|r| r.len()).sum::<usize>()
        );

        ret.push(Cohort::new(task, sample_names, labels, records)?);
    }

    Ok(ret)
}

/// Simulate and write `<dir>/<task>.{labels,visits}.tsv.gz`
pub fn generate_ehr_data(tasks: &[Box<str>], args: &SimArgs, data_dir: &Path) -> anyhow::Result<()> {
    for cohort in simulate_cohorts(tasks, args)? {
        cohort.write(data_dir)?;
    }
    info!("wrote {} tasks to {}", tasks.len(), data_dir.display());
    Ok(())
}
