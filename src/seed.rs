//! A seed: an interesting run kept for repeated mutation, together with its
//! execution bookkeeping and its executor (which owns the per-seed fitness
//! state, including the PCA).

use crate::{exec::Executor, pca::DynPca, put::RunRecord};

#[derive(Debug)]
pub struct Seed {
    /// Stable identity; the scheduler reorders its list constantly.
    pub id: u64,
    /// The run this seed was promoted from.
    pub run: RunRecord,
    /// How many rounds this seed has been dispatched for.
    pub exec_n: usize,
    /// Set while a worker is exercising this seed.
    pub running: bool,
    /// The seed's executor. `None` exactly while it is out on loan to a
    /// worker.
    pub exec: Option<Executor>,
}

impl Seed {
    #[must_use]
    pub fn new(id: u64, run: RunRecord, exec: Executor) -> Self {
        Seed {
            id,
            run,
            exec_n: 0,
            running: false,
            exec: Some(exec),
        }
    }

    /// The seed's PCA, if it reached the steady state.
    #[must_use]
    pub fn steady_pca(&self) -> Option<&DynPca> {
        let pca = self.exec.as_ref()?.discovery.pca()?.dynpca()?;
        pca.is_steady().then_some(pca)
    }

    /// Ever executed at all?
    #[must_use]
    pub fn exercised(&self) -> bool {
        self.exec_n > 0
    }
}
