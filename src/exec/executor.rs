//! The executor: the per-seed bundle of input generator, fitness functions
//! and reporting channels, run by a worker against its PUT.

use crossbeam_channel::Sender;

use crate::{
    config::Config,
    fitness::Fitness,
    inputgen::InputGen,
    interrupt::InterruptMultiplexer,
    put::{AflPut, RunRecord, RunView},
};

pub struct Executor {
    gen: Box<dyn InputGen>,
    /// What makes a run worth promoting.
    pub discovery: Fitness,
    /// What makes a run a security finding. Currently always [`Fitness::Never`];
    /// the hook and the crash channel are kept wired.
    pub security: Fitness,
    fit_tx: Sender<RunRecord>,
    crash_tx: Sender<RunRecord>,
    one_exec: bool,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("discovery", &self.discovery)
            .field("security", &self.security)
            .field("one_exec", &self.one_exec)
            .finish_non_exhaustive()
    }
}

impl Executor {
    #[must_use]
    pub fn new(
        gen: Box<dyn InputGen>,
        discovery: Fitness,
        security: Fitness,
        fit_tx: Sender<RunRecord>,
        crash_tx: Sender<RunRecord>,
    ) -> Self {
        Self {
            gen,
            discovery,
            security,
            fit_tx,
            crash_tx,
            one_exec: false,
        }
    }

    /// An executor that runs its generator exactly once and reports the run
    /// unconditionally. Used to (re-)collect seed traces.
    #[must_use]
    pub fn one_shot(
        gen: Box<dyn InputGen>,
        fit_tx: Sender<RunRecord>,
        crash_tx: Sender<RunRecord>,
    ) -> Self {
        Self {
            gen,
            discovery: Fitness::Always,
            security: Fitness::Never,
            fit_tx,
            crash_tx,
            one_exec: true,
        }
    }

    #[must_use]
    pub fn is_one_exec(&self) -> bool {
        self.one_exec
    }

    /// One generate/run/evaluate iteration.
    pub fn execute_one(&mut self, put: &mut AflPut) {
        let testcase = self.gen.generate();

        let status = match put.run(&testcase) {
            Ok(status) => status,
            Err(err) => {
                // A failed run yields no record; the fork server survived.
                log::warn!("execution failed, skipping run: {err}");
                return;
            }
        };

        let run = RunView {
            input: &testcase,
            status,
            trace: put.trace(),
            hash: put.trace_hash(),
        };

        let discovery_fit = self.discovery.is_fit(&run);
        let security_fit = self.security.is_fit(&run);
        if !(discovery_fit || security_fit || self.one_exec) {
            return;
        }

        // The shared trace dies with the next run; promote it now.
        let record = run.to_record();
        if security_fit {
            let record = record.clone();
            if self.crash_tx.send(record).is_err() {
                log::debug!("crash channel is closed");
            }
        }
        if discovery_fit || self.one_exec {
            if self.fit_tx.send(record).is_err() {
                log::debug!("fit channel is closed");
            }
        }
    }

    /// Keep iterating until the round time is up or an interrupt fires. The
    /// interrupt check sits between iterations, so an in-flight execution
    /// always completes (or times out) first.
    pub fn execute_loop(
        &mut self,
        put: &mut AflPut,
        config: &Config,
        interrupt: &InterruptMultiplexer,
    ) {
        let deadline = std::time::Instant::now() + config.round_time;
        while std::time::Instant::now() < deadline {
            if interrupt.is_fired() {
                break;
            }
            self.execute_one(put);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inputgen::SeedCopier;
    use crossbeam_channel::bounded;

    #[test]
    fn one_shot_executors_are_marked() {
        let (fit_tx, _fit_rx) = bounded(1);
        let (crash_tx, _crash_rx) = bounded(1);
        let exec = Executor::one_shot(Box::new(SeedCopier::new(vec![b'A'])), fit_tx, crash_tx);
        assert!(exec.is_one_exec());
        assert!(matches!(exec.discovery, Fitness::Always));
        assert!(matches!(exec.security, Fitness::Never));
    }
}
