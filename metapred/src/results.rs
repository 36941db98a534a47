use crate::metrics::Metrics;

use ehr_data::common_io::{mkdir, write_lines};
use log::info;
use std::path::Path;

/// Keys of the results file, in writing order
pub const RESULT_KEYS: [&str; 3] = ["aucroc", "avepre", "f1score"];

/// Per-fold values of every result key; keys keep their insertion
/// order
#[derive(Clone, Debug)]
pub struct MetricTable {
    columns: Vec<(Box<str>, Vec<f64>)>,
}

impl Default for MetricTable {
    fn default() -> Self {
        Self::new(&RESULT_KEYS)
    }
}

impl MetricTable {
    pub fn new(keys: &[&str]) -> Self {
        Self {
            columns: keys.iter().map(|k| (Box::from(*k), vec![])).collect(),
        }
    }

    pub fn push(&mut self, key: &str, value: f64) {
        match self.columns.iter_mut().find(|(k, _)| k.as_ref() == key) {
            Some((_, values)) => values.push(value),
            None => self.columns.push((key.into(), vec![value])),
        }
    }

    /// Append the AUROC, AP and F1 of one fold
    pub fn push_metrics(&mut self, m: &Metrics) {
        self.push("aucroc", m.auroc);
        self.push("avepre", m.avepre);
        self.push("f1score", m.f1);
    }

    pub fn keys(&self) -> Vec<&str> {
        self.columns.iter().map(|(k, _)| k.as_ref()).collect()
    }

    pub fn get(&self, key: &str) -> Option<&[f64]> {
        self.columns
            .iter()
            .find(|(k, _)| k.as_ref() == key)
            .map(|(_, v)| v.as_slice())
    }

    /// `(key, mean, population std)` in key order
    pub fn summary(&self) -> Vec<(&str, f64, f64)> {
        self.columns
            .iter()
            .map(|(k, v)| {
                let (mu, sd) = mean_std(v);
                (k.as_ref(), mu, sd)
            })
            .collect()
    }
}

/// Mean and population standard deviation; NaN when empty
pub fn mean_std(x: &[f64]) -> (f64, f64) {
    if x.is_empty() {
        return (f64::NAN, f64::NAN);
    }
    let n = x.len() as f64;
    let mu = x.iter().sum::<f64>() / n;
    let var = x.iter().map(|v| (v - mu) * (v - mu)).sum::<f64>() / n;
    (mu, var.sqrt())
}

/// Write the mean and the standard deviation of every key, one value
/// per line, two lines per key
pub fn save_results<P: AsRef<Path>>(table: &MetricTable, file: P) -> anyhow::Result<()> {
    let file = file.as_ref();
    if let Some(dir) = file.parent().filter(|d| !d.as_os_str().is_empty()) {
        mkdir(dir)?;
    }
    let lines: Vec<f64> = table
        .summary()
        .into_iter()
        .flat_map(|(_, mu, sd)| [mu, sd])
        .collect();
    write_lines(&lines, file)?;
    info!("results saved: {}", file.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_rows_per_key_in_order() -> anyhow::Result<()> {
        let mut table = MetricTable::default();
        for (auc, ap, f1) in [(0.5, 0.4, 0.2), (0.7, 0.6, 0.4)] {
            table.push_metrics(&Metrics {
                accuracy: 0.,
                auroc: auc,
                avepre: ap,
                f1,
            });
        }
        assert_eq!(table.keys(), RESULT_KEYS.to_vec());

        let dir = tempfile::tempdir()?;
        let file = dir.path().join("results").join("res_x");
        save_results(&table, &file)?;

        let lines: Vec<f64> = std::fs::read_to_string(&file)?
            .lines()
            .map(|l| l.parse::<f64>())
            .collect::<Result<_, _>>()?;
        assert_eq!(lines.len(), 6);
        approx::assert_abs_diff_eq!(lines[0], 0.6, epsilon = 1e-12);
        approx::assert_abs_diff_eq!(lines[1], 0.1, epsilon = 1e-12);
        approx::assert_abs_diff_eq!(lines[4], 0.3, epsilon = 1e-12);
        approx::assert_abs_diff_eq!(lines[5], 0.1, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn population_std() {
        let (mu, sd) = mean_std(&[1., 3.]);
        approx::assert_abs_diff_eq!(mu, 2.);
        approx::assert_abs_diff_eq!(sd, 1.);
        assert!(mean_std(&[]).0.is_nan());
    }
}
