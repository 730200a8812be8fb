//! Fitness functions: stateful predicates over runs.
//!
//! A run judged fit by any fitness is promoted towards seed-hood. The
//! variants are a closed set so composite fitnesses can be taken apart by
//! pattern matching (no downcasting) when the analysis phase goes looking
//! for the PCA state.

pub mod branch;
pub mod pca;

use std::fmt;

use crate::put::RunView;

pub use branch::BranchCovFitness;
pub use pca::PcaFitness;

/// A stateful predicate over runs.
#[derive(Debug)]
pub enum Fitness {
    /// Judges every run interesting. Used for one-shot trace collection.
    Always,
    /// Judges no run interesting. The placeholder security policy.
    Never,
    BranchCov(BranchCovFitness),
    Pca(PcaFitness),
    /// Composite: fit iff any child is fit, but every child sees every run.
    Multi(Vec<Fitness>),
}

impl Fitness {
    /// The standard discovery fitness of a seed.
    #[must_use]
    pub fn discovery() -> Self {
        Fitness::Multi(vec![
            Fitness::BranchCov(BranchCovFitness::new()),
            Fitness::Pca(PcaFitness::new()),
        ])
    }

    /// Evaluate the run. Stateful children update on every call, fit or not.
    pub fn is_fit(&mut self, run: &RunView) -> bool {
        match self {
            Fitness::Always => true,
            Fitness::Never => false,
            Fitness::BranchCov(fitness) => fitness.is_fit(run),
            Fitness::Pca(fitness) => fitness.is_fit(run),
            Fitness::Multi(children) => {
                // No short-circuiting: the PCA child must see every run.
                let mut fit = false;
                for child in children {
                    fit |= child.is_fit(run);
                }
                fit
            }
        }
    }

    /// Find the PCA state anywhere in this fitness tree.
    #[must_use]
    pub fn pca(&self) -> Option<&PcaFitness> {
        match self {
            Fitness::Pca(fitness) => Some(fitness),
            Fitness::Multi(children) => children.iter().find_map(Fitness::pca),
            _ => None,
        }
    }

    /// Find the branch-coverage state anywhere in this fitness tree.
    #[must_use]
    pub fn branch_cov(&self) -> Option<&BranchCovFitness> {
        match self {
            Fitness::BranchCov(fitness) => Some(fitness),
            Fitness::Multi(children) => children.iter().find_map(Fitness::branch_cov),
            _ => None,
        }
    }
}

impl fmt::Display for Fitness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fitness::Always => write!(f, "always fit"),
            Fitness::Never => write!(f, "never fit"),
            Fitness::BranchCov(fitness) => fitness.fmt(f),
            Fitness::Pca(fitness) => fitness.fmt(f),
            Fitness::Multi(children) => {
                write!(f, "[")?;
                for (i, child) in children.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    child.fmt(f)?;
                }
                write!(f, "]")
            }
        }
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
    fn constants_behave() {
        let run = run_with(&[1]);
        assert!(Fitness::Always.is_fit(&run.view()));
        assert!(!Fitness::Never.is_fit(&run.view()));
    }

    #[test]
    fn multiplexer_evaluates_every_child() {
        // Two branch-coverage children: if evaluation short-circuited after
        // the first reported fit, the second would never record the run.
        let mut multi = Fitness::Multi(vec![
            Fitness::BranchCov(BranchCovFitness::new()),
            Fitness::BranchCov(BranchCovFitness::new()),
        ]);
        assert!(multi.is_fit(&run_with(&[3]).view()));
        let Fitness::Multi(children) = &multi else {
            unreachable!();
        };
        for child in children {
            let Fitness::BranchCov(cov) = child else {
                unreachable!();
            };
            assert_eq!(cov.exec_n(), 1);
            assert_eq!(cov.branch_count(), 1);
        }
    }

    #[test]
    fn multiplexer_is_fit_when_any_child_is() {
        let mut primed = BranchCovFitness::new();
        primed.is_fit(&run_with(&[3]).view());
        let mut multi = Fitness::Multi(vec![
            Fitness::BranchCov(primed),
            Fitness::BranchCov(BranchCovFitness::new()),
        ]);
        // First child already knows branch 3, the fresh one does not.
        assert!(multi.is_fit(&run_with(&[3]).view()));
        assert!(!multi.is_fit(&run_with(&[3]).view()));
    }

    #[test]
    fn pca_is_discoverable_in_the_tree() {
        let discovery = Fitness::discovery();
        assert!(discovery.pca().is_some());
        assert!(discovery.branch_cov().is_some());
        assert!(Fitness::Never.pca().is_none());
    }
}
