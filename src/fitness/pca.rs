//! The PCA fitness: a sink-style stateful fitness that first collects an
//! initialization queue and then streams every trace into its [`DynPca`].
//!
//! It never judges a run interesting on its own; its value is the analysis
//! state it accumulates for the post-campaign projection.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::{Duration, Instant};

use crate::{
    config::{INIT_QUEUE_MAX, PCA_INIT_DIM, PCA_INIT_TIME},
    pca::{DynPca, DynPcaParams},
    put::RunView,
};

#[derive(Debug)]
pub struct PcaFitness {
    initialized: bool,
    init_window: Duration,
    init_deadline: Instant,
    queue: Vec<Vec<u8>>,

    hashes: HashSet<u64>,
    /// Saturating per-hash observation counts.
    hash_counts: HashMap<u64, u8>,

    dynpca: Option<DynPca>,
    params: DynPcaParams,
}

impl Default for PcaFitness {
    fn default() -> Self {
        Self::new()
    }
}

impl PcaFitness {
    #[must_use]
    pub fn new() -> Self {
        Self::with_params(DynPcaParams::default(), PCA_INIT_TIME)
    }

    #[must_use]
    pub fn with_params(params: DynPcaParams, init_window: Duration) -> Self {
        Self {
            initialized: false,
            init_window,
            init_deadline: Instant::now() + init_window,
            queue: Vec::new(),
            hashes: HashSet::new(),
            hash_counts: HashMap::new(),
            dynpca: None,
            params,
        }
    }

    /// Feed one run. Always returns `false`: this fitness only observes.
    pub fn is_fit(&mut self, run: &RunView) -> bool {
        let count = self.hash_counts.entry(run.hash).or_insert(0);
        *count = count.saturating_add(1);

        if self.initialized {
            if let Some(pca) = &mut self.dynpca {
                pca.new_sample(run.trace);
            }
            return false;
        }

        // Only novel-hash traces are worth a slot in the queue.
        if self.hashes.insert(run.hash) && self.queue.len() < INIT_QUEUE_MAX {
            self.queue.push(run.trace.to_vec());
        }

        if Instant::now() > self.init_deadline || self.queue.len() >= INIT_QUEUE_MAX {
            self.end_init();
        }
        false
    }

    /// Try to leave the collection stage. Too few traces, or a failed
    /// factorization, re-arms the deadline with a tripled window.
    fn end_init(&mut self) {
        if self.queue.len() >= PCA_INIT_DIM {
            match DynPca::from_queue_with_params(&self.queue, self.params) {
                Ok(pca) => {
                    log::debug!("PCA initialized from {} traces", self.queue.len());
                    self.dynpca = Some(pca);
                    self.initialized = true;
                    self.queue = Vec::new();
                    return;
                }
                Err(err) => log::warn!("PCA initialization failed, retrying later: {err}"),
            }
        }
        self.init_window *= 3;
        self.init_deadline = Instant::now() + self.init_window;
    }

    #[must_use]
    pub fn dynpca(&self) -> Option<&DynPca> {
        self.dynpca.as_ref()
    }

    #[must_use]
    pub fn hash_counts(&self) -> &HashMap<u64, u8> {
        &self.hash_counts
    }
}

impl fmt::Display for PcaFitness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.dynpca {
            Some(pca) => write!(f, "pca[{pca}]"),
            None => write!(f, "pca[collecting {} traces]", self.queue.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::put::{RunRecord, RunStatus};
    use crate::trace::{hash_trace, MAP_SIZE};

    fn run_from(trace: Vec<u8>) -> RunRecord {
        RunRecord {
            input: vec![],
            status: RunStatus::default(),
            hash: hash_trace(&trace),
            trace,
        }
    }

    fn varied_trace(tag: u8) -> Vec<u8> {
        let mut state = u64::from(tag) + 1;
        (0..MAP_SIZE)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
                ((state >> 33) % 6) as u8
            })
            .collect()
    }

    fn fast_fitness() -> PcaFitness {
        let params = DynPcaParams {
            settle_dur: Duration::from_secs(3600),
            converge_dur: Duration::from_secs(3600),
            ..DynPcaParams::default()
        };
        PcaFitness::with_params(params, Duration::from_secs(3600))
    }

    #[test]
    fn never_fit_and_queues_only_novel_hashes() {
        let mut fitness = fast_fitness();
        let run = run_from(varied_trace(1));
        assert!(!fitness.is_fit(&run.view()));
        assert!(!fitness.is_fit(&run.view()));
        assert_eq!(fitness.queue.len(), 1);
        assert_eq!(fitness.hash_counts()[&run.hash], 2);
    }

    #[test]
    fn full_queue_triggers_initialization() {
        let mut fitness = fast_fitness();
        for tag in 0..INIT_QUEUE_MAX {
            let run = run_from(varied_trace(tag as u8));
            fitness.is_fit(&run.view());
        }
        assert!(fitness.initialized);
        assert!(fitness.dynpca().is_some());
        assert!(fitness.queue.is_empty());
    }

    #[test]
    fn deadline_with_too_few_traces_triples_the_window() {
        let params = DynPcaParams::default();
        let mut fitness = PcaFitness::with_params(params, Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(3));
        fitness.is_fit(&run_from(varied_trace(1)).view());
        assert!(!fitness.initialized);
        assert_eq!(fitness.init_window, Duration::from_millis(3));
    }

    #[test]
    fn samples_flow_into_the_pca_after_initialization() {
        let mut fitness = fast_fitness();
        for tag in 0..INIT_QUEUE_MAX {
            fitness.is_fit(&run_from(varied_trace(tag as u8)).view());
        }
        let before = fitness.dynpca().unwrap().sample_n();
        fitness.is_fit(&run_from(varied_trace(200)).view());
        assert_eq!(fitness.dynpca().unwrap().sample_n(), before + 1);
    }

    #[test]
    fn hash_counts_saturate() {
        let mut fitness = fast_fitness();
        let run = run_from(varied_trace(9));
        for _ in 0..300 {
            fitness.is_fit(&run.view());
        }
        assert_eq!(fitness.hash_counts()[&run.hash], u8::MAX);
    }
}
