//! The global-fitness aggregator: the single consumer of everything the
//! workers judged fit. It keeps the union branch coverage and decides which
//! runs become new seeds.

use std::{sync::Arc, thread::JoinHandle};

use crossbeam_channel::{select, tick, Receiver, Sender};

use crate::{
    config::{Config, HEARTBEAT_TICK},
    fitness::BranchCovFitness,
    interrupt::InterruptMultiplexer,
    put::RunRecord,
};

/// Union coverage plus the promotion policy.
#[derive(Debug)]
pub struct GlobalFitness {
    coverage: BranchCovFitness,
    use_evo: bool,
    /// Bootstrap cap: with evolution off, stop promoting once there is one
    /// seed per worker and let the existing seeds be exercised instead.
    seed_target: usize,
    seed_count: usize,
}

impl GlobalFitness {
    #[must_use]
    pub fn new(config: &Config, initial_seed_n: usize) -> Self {
        Self {
            coverage: BranchCovFitness::new(),
            use_evo: config.use_evo,
            seed_target: config.thread_n,
            seed_count: initial_seed_n,
        }
    }

    /// The union branch coverage across all workers.
    #[must_use]
    pub fn coverage(&self) -> &BranchCovFitness {
        &self.coverage
    }

    /// Record one fit run; return it when it should become a new seed.
    fn ingest(&mut self, run: RunRecord) -> Option<RunRecord> {
        let fit = self.coverage.is_fit(&run.view());
        if !fit {
            return None;
        }
        if self.use_evo || self.seed_count < self.seed_target {
            self.seed_count += 1;
            return Some(run);
        }
        None
    }
}

/// Run the aggregator on its own thread. It stops on interrupt, on
/// `stop_rx`, or when the fit channel closes; joining yields the final
/// union coverage.
pub fn spawn_aggregator(
    config: &Config,
    initial_seed_n: usize,
    fit_rx: Receiver<RunRecord>,
    new_seed_tx: Sender<RunRecord>,
    stop_rx: Receiver<()>,
    interrupt: &Arc<InterruptMultiplexer>,
) -> std::io::Result<JoinHandle<GlobalFitness>> {
    let mut state = GlobalFitness::new(config, initial_seed_n);
    let interrupt = Arc::clone(interrupt);

    std::thread::Builder::new()
        .name("aggregator".into())
        .spawn(move || {
            let int_rx = interrupt.subscribe();
            let heartbeat = tick(HEARTBEAT_TICK);

            loop {
                let promoted = select! {
                    recv(int_rx) -> _ => break,
                    recv(stop_rx) -> _ => break,
                    recv(heartbeat) -> _ => {
                        log::info!("Global fitness: {}", state.coverage);
                        continue;
                    }
                    recv(fit_rx) -> msg => match msg {
                        Ok(run) => state.ingest(run),
                        Err(_) => break,
                    },
                };

                if let Some(run) = promoted {
                    // The scheduler may be gone already; keep the interrupt
                    // armed so this send cannot wedge the shutdown.
                    select! {
                        send(new_seed_tx, run) -> res => {
                            if res.is_err() {
                                break;
                            }
                        }
                        recv(int_rx) -> _ => break,
                    }
                }
            }

            state
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RUN_TIMEOUT;
    use std::path::PathBuf;

    fn config(use_evo: bool, thread_n: usize) -> Config {
        Config::new(
            PathBuf::from("/bin/true"),
            vec![],
            PathBuf::from("in"),
            PathBuf::from("out"),
            thread_n,
            RUN_TIMEOUT,
            use_evo,
            false,
        )
    }

    fn run_with(indices: &[usize]) -> RunRecord {
        let mut trace = vec![0u8; 64];
        for &i in indices {
            trace[i] = 1;
        }
        RunRecord {
            input: vec![],
            status: crate::put::RunStatus::default(),
            hash: crate::trace::hash_trace(&trace),
            trace,
        }
    }

    #[test]
    fn evolution_promotes_every_coverage_extension() {
        let mut state = GlobalFitness::new(&config(true, 1), 1);
        assert!(state.ingest(run_with(&[0])).is_some());
        assert!(state.ingest(run_with(&[1])).is_some());
        // No new coverage, no seed.
        assert!(state.ingest(run_with(&[0, 1])).is_none());
        assert_eq!(state.coverage().branch_count(), 2);
    }

    #[test]
    fn bootstrap_stops_at_one_seed_per_worker() {
        // Two workers, one initial seed: exactly one promotion allowed.
        let mut state = GlobalFitness::new(&config(false, 2), 1);
        assert!(state.ingest(run_with(&[0])).is_some());
        assert!(state.ingest(run_with(&[1])).is_none());
        // Coverage is still recorded for the rejected run.
        assert_eq!(state.coverage().branch_count(), 2);
    }

    #[test]
    fn unfit_runs_never_promote() {
        let mut state = GlobalFitness::new(&config(true, 1), 0);
        state.ingest(run_with(&[3]));
        assert!(state.ingest(run_with(&[3])).is_none());
    }
}
