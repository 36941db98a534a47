use crate::common_io::*;

use log::info;
use std::collections::HashMap;
use std::path::Path;

const DELIM: [char; 3] = ['\t', ',', ' '];

/// One non-zero cell of a patient's visit-by-code matrix
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VisitEntry {
    pub visit: usize,
    pub code: usize,
    pub value: f32,
}

/// Visit (time) and code (feature) extents of the dense input
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EhrDims {
    pub n_visits: usize,
    pub n_codes: usize,
}

impl EhrDims {
    /// Take `max index + 1` over all cohorts unless given.
    /// An explicit extent smaller than what the data needs is an
    /// error.
    pub fn infer(
        cohorts: &[&Cohort],
        n_visits: Option<usize>,
        n_codes: Option<usize>,
    ) -> anyhow::Result<Self> {
        let need_visits = cohorts.iter().map(|c| c.max_visit() + 1).max().unwrap_or(1);
        let need_codes = cohorts.iter().map(|c| c.max_code() + 1).max().unwrap_or(1);

        let n_visits = match n_visits {
            Some(t) if t < need_visits => {
                return Err(anyhow::anyhow!(
                    "--n-visits {} but the data has visit index {}",
                    t,
                    need_visits - 1
                ))
            }
            Some(t) => t,
            None => need_visits,
        };

        let n_codes = match n_codes {
            Some(d) if d < need_codes => {
                return Err(anyhow::anyhow!(
                    "--n-codes {} but the data has code index {}",
                    d,
                    need_codes - 1
                ))
            }
            Some(d) => d,
            None => need_codes,
        };

        Ok(Self { n_visits, n_codes })
    }

    pub fn sample_len(&self) -> usize {
        self.n_visits * self.n_codes
    }
}

/// A named cohort: labelled patients with sparse visit records
#[derive(Clone, Debug)]
pub struct Cohort {
    pub name: Box<str>,
    pub sample_names: Vec<Box<str>>,
    pub labels: Vec<usize>,
    pub records: Vec<Vec<VisitEntry>>,
}

impl Cohort {
    pub fn new(
        name: &str,
        sample_names: Vec<Box<str>>,
        labels: Vec<usize>,
        records: Vec<Vec<VisitEntry>>,
    ) -> anyhow::Result<Self> {
        if sample_names.len() != labels.len() || labels.len() != records.len() {
            return Err(anyhow::anyhow!(
                "{}: {} names, {} labels, {} records",
                name,
                sample_names.len(),
                labels.len(),
                records.len()
            ));
        }
        Ok(Self {
            name: name.into(),
            sample_names,
            labels,
            records,
        })
    }

    /// Read `<dir>/<task>.labels.tsv[.gz]` and
    /// `<dir>/<task>.visits.tsv[.gz]`
    pub fn read(data_dir: &Path, task: &str) -> anyhow::Result<Self> {
        let label_file = find_tsv(data_dir, &format!("{}.labels", task)).ok_or_else(|| {
            anyhow::anyhow!("no {}.labels.tsv[.gz] in {}", task, data_dir.display())
        })?;
        let visit_file = find_tsv(data_dir, &format!("{}.visits", task)).ok_or_else(|| {
            anyhow::anyhow!("no {}.visits.tsv[.gz] in {}", task, data_dir.display())
        })?;

        let mut sample_names = vec![];
        let mut labels = vec![];
        let mut position: HashMap<Box<str>, usize> = HashMap::new();

        for (line, words) in read_lines_of_words_delim(&label_file, &DELIM)? {
            if words.len() < 2 {
                return Err(anyhow::anyhow!(
                    "{}:{}: expected `sample label`",
                    label_file.display(),
                    line
                ));
            }
            let label = words[1].parse::<usize>().map_err(|e| {
                anyhow::anyhow!("{}:{}: bad label: {}", label_file.display(), line, e)
            })?;
            if position.insert(words[0].clone(), sample_names.len()).is_some() {
                return Err(anyhow::anyhow!(
                    "{}:{}: duplicate sample {}",
                    label_file.display(),
                    line,
                    words[0]
                ));
            }
            sample_names.push(words[0].clone());
            labels.push(label);
        }

        let mut records = vec![vec![]; sample_names.len()];

        for (line, words) in read_lines_of_words_delim(&visit_file, &DELIM)? {
            if words.len() < 3 {
                return Err(anyhow::anyhow!(
                    "{}:{}: expected `sample visit code [value]`",
                    visit_file.display(),
                    line
                ));
            }
            let &i = position.get(&words[0]).ok_or_else(|| {
                anyhow::anyhow!(
                    "{}:{}: sample {} has no label",
                    visit_file.display(),
                    line,
                    words[0]
                )
            })?;
            let parse_err =
                |e: &dyn std::fmt::Display| anyhow::anyhow!("{}:{}: {}", visit_file.display(), line, e);
            let visit = words[1].parse::<usize>().map_err(|e| parse_err(&e))?;
            let code = words[2].parse::<usize>().map_err(|e| parse_err(&e))?;
            let value = match words.get(3) {
                Some(v) => v.parse::<f32>().map_err(|e| parse_err(&e))?,
                None => 1.0,
            };
            records[i].push(VisitEntry { visit, code, value });
        }

        info!(
            "{}: {} samples, {} visit entries",
            task,
            sample_names.len(),
            records.iter().map(|r| r.len()).sum::<usize>()
        );

        Self::new(task, sample_names, labels, records)
    }

    /// Write the cohort back in the input format
    pub fn write(&self, data_dir: &Path) -> anyhow::Result<()> {
        mkdir(data_dir)?;

        let label_lines: Vec<String> = self
            .sample_names
            .iter()
            .zip(self.labels.iter())
            .map(|(s, y)| format!("{}\t{}", s, y))
            .collect();
        write_lines(
            &label_lines,
            data_dir.join(format!("{}.labels.tsv.gz", self.name)),
        )?;

        let visit_lines: Vec<String> = self
            .sample_names
            .iter()
            .zip(self.records.iter())
            .flat_map(|(s, rec)| {
                rec.iter()
                    .map(move |e| format!("{}\t{}\t{}\t{}", s, e.visit, e.code, e.value))
            })
            .collect();
        write_lines(
            &visit_lines,
            data_dir.join(format!("{}.visits.tsv.gz", self.name)),
        )
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn max_visit(&self) -> usize {
        self.records
            .iter()
            .flatten()
            .map(|e| e.visit)
            .max()
            .unwrap_or(0)
    }

    pub fn max_code(&self) -> usize {
        self.records
            .iter()
            .flatten()
            .map(|e| e.code)
            .max()
            .unwrap_or(0)
    }

    /// Sample positions of each class `0 .. n_classes`
    pub fn class_pools(&self, n_classes: usize) -> Vec<Vec<usize>> {
        self.pools_of(&(0..self.len()).collect::<Vec<_>>(), n_classes)
    }

    /// Split `positions` by class
    pub fn pools_of(&self, positions: &[usize], n_classes: usize) -> Vec<Vec<usize>> {
        let mut pools = vec![vec![]; n_classes];
        for &i in positions {
            if let Some(pool) = pools.get_mut(self.labels[i]) {
                pool.push(i);
            }
        }
        pools
    }

    pub fn check_labels(&self, n_classes: usize) -> anyhow::Result<()> {
        if let Some((i, y)) = self
            .labels
            .iter()
            .enumerate()
            .find(|(_, &y)| y >= n_classes)
        {
            return Err(anyhow::anyhow!(
                "{}: sample {} has label {} outside [0, {})",
                self.name,
                self.sample_names[i],
                y,
                n_classes
            ));
        }
        Ok(())
    }

    /// Densify sample `i` into `out` laid out as (visit x code);
    /// entries outside `dims` are dropped, repeated cells add up
    pub fn fill_dense(&self, i: usize, dims: &EhrDims, out: &mut [f32]) {
        for e in self.records[i].iter() {
            if e.visit < dims.n_visits && e.code < dims.n_codes {
                out[e.visit * dims.n_codes + e.code] += e.value;
            }
        }
    }
}
