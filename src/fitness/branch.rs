//! Branch-coverage novelty: a run is interesting iff it drives a branch
//! counter that was never non-zero before.

use std::collections::HashSet;
use std::fmt;

use crate::put::RunView;

#[derive(Debug, Default)]
pub struct BranchCovFitness {
    branches: HashSet<usize>,
    hashes: HashSet<u64>,
    exec_n: u64,
}

impl BranchCovFitness {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_fit(&mut self, run: &RunView) -> bool {
        self.exec_n += 1;
        self.hashes.insert(run.hash);

        let mut fit = false;
        for (i, &hits) in run.trace.iter().enumerate() {
            if hits == 0 {
                continue;
            }
            if self.branches.insert(i) {
                fit = true;
            }
        }
        fit
    }

    /// Number of branch indices ever observed non-zero.
    #[must_use]
    pub fn branch_count(&self) -> usize {
        self.branches.len()
    }

    #[must_use]
    pub fn branches(&self) -> &HashSet<usize> {
        &self.branches
    }

    /// Number of distinct trace hashes observed.
    #[must_use]
    pub fn hash_count(&self) -> usize {
        self.hashes.len()
    }

    #[must_use]
    pub fn exec_n(&self) -> u64 {
        self.exec_n
    }
}

impl fmt::Display for BranchCovFitness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} branches and {} hashes over {} execs",
            self.branches.len(),
            self.hashes.len(),
            self.exec_n
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::put::{RunRecord, RunStatus};

    fn run_with(indices: &[usize]) -> RunRecord {
        let mut trace = vec![0u8; 64];
        for &i in indices {
            trace[i] = 1;
        }
        RunRecord {
            input: vec![],
            status: RunStatus::default(),
            hash: crate::trace::hash_trace(&trace),
            trace,
        }
    }

    #[test]
    fn novel_branch_is_fit_once() {
        let mut fit = BranchCovFitness::new();
        let run = run_with(&[0]);
        assert!(fit.is_fit(&run.view()));
        // Same trace again: indices are a subset of what is known.
        assert!(!fit.is_fit(&run.view()));
        assert_eq!(fit.branch_count(), 1);
        assert_eq!(fit.exec_n(), 2);
    }

    #[test]
    fn subset_is_not_fit_superset_is() {
        let mut fit = BranchCovFitness::new();
        assert!(fit.is_fit(&run_with(&[0, 5]).view()));
        assert!(!fit.is_fit(&run_with(&[5]).view()));
        assert!(fit.is_fit(&run_with(&[5, 9]).view()));
        assert_eq!(fit.branch_count(), 3);
    }

    #[test]
    fn hashes_accumulate_even_when_not_fit() {
        let mut fit = BranchCovFitness::new();
        fit.is_fit(&run_with(&[1, 2]).view());
        fit.is_fit(&run_with(&[1]).view());
        fit.is_fit(&run_with(&[2]).view());
        assert_eq!(fit.hash_count(), 3);
    }
}
