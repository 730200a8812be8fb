//! The seed scheduler: hands idle workers the least-exercised seed until
//! every seed has consumed its execution budget.

use std::{sync::Arc, time::Duration};

use crossbeam_channel::{select, tick, Receiver, Sender};
use rand::Rng;

use crate::{
    config::{Config, PRINT_TICK},
    exec::{Executor, Job, Worker, WorkerEvent},
    fitness::Fitness,
    inputgen::RatioMutator,
    interrupt::InterruptMultiplexer,
    put::RunRecord,
    seed::Seed,
};

/// Bit-flip ratio of the per-seed mutator.
const MUTATION_RATIO: f64 = 1.0 / 100.0;

#[derive(Debug)]
pub struct Scheduler<'a> {
    workers: &'a [Worker],
    events: &'a Receiver<WorkerEvent>,
    event_tx: Sender<WorkerEvent>,
    new_seeds: &'a Receiver<RunRecord>,
    fit_tx: Sender<RunRecord>,
    crash_tx: Sender<RunRecord>,
    interrupt: Arc<InterruptMultiplexer>,
    config: &'a Config,

    seeds: Vec<Seed>,
    /// Workers that asked for work while none was available.
    parked: Vec<usize>,
    running_n: usize,
    next_id: u64,
    done: bool,
}

impl<'a> Scheduler<'a> {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        workers: &'a [Worker],
        events: &'a Receiver<WorkerEvent>,
        event_tx: Sender<WorkerEvent>,
        new_seeds: &'a Receiver<RunRecord>,
        fit_tx: Sender<RunRecord>,
        crash_tx: Sender<RunRecord>,
        interrupt: &Arc<InterruptMultiplexer>,
        config: &'a Config,
    ) -> Self {
        Self {
            workers,
            events,
            event_tx,
            new_seeds,
            fit_tx,
            crash_tx,
            interrupt: Arc::clone(interrupt),
            config,
            seeds: Vec::new(),
            parked: Vec::new(),
            running_n: 0,
            next_id: 0,
            done: false,
        }
    }

    /// Drive the campaign to completion and publish the seed list.
    ///
    /// Terminates when every seed reached the budget and no worker is still
    /// running, or when an interrupt arrives (in-flight rounds are drained
    /// first either way).
    pub fn run(mut self, seed_inputs: Vec<Vec<u8>>) -> Vec<Seed> {
        for input in seed_inputs {
            self.add_seed(RunRecord::from_input(input));
        }

        let int_rx = self.interrupt.subscribe();
        let progress = tick(PRINT_TICK);
        let events = self.events;
        let new_seeds = self.new_seeds;

        while !self.done {
            select! {
                recv(int_rx) -> _ => break,
                recv(progress) -> _ => self.print_progress(),
                recv(new_seeds) -> msg => {
                    if let Ok(run) = msg {
                        self.on_new_seed(run);
                    }
                }
                recv(events) -> msg => match msg {
                    Ok(event) => self.on_event(event),
                    Err(_) => break,
                },
            }
        }

        self.drain();
        self.print_progress();
        self.seeds
    }

    fn add_seed(&mut self, run: RunRecord) {
        let gen = RatioMutator::new(run.input.clone(), MUTATION_RATIO);
        let exec = Executor::new(
            Box::new(gen),
            // The real discovery fitness is installed on first dispatch.
            Fitness::Never,
            Fitness::Never,
            self.fit_tx.clone(),
            self.crash_tx.clone(),
        );
        self.seeds.push(Seed::new(self.next_id, run, exec));
        self.next_id += 1;
    }

    fn on_new_seed(&mut self, run: RunRecord) {
        log::info!("new seed (hash=0x{:016x})", run.hash);
        self.add_seed(run);
        if let Some(worker) = self.parked.pop() {
            self.dispatch(worker);
        }
    }

    fn on_event(&mut self, event: WorkerEvent) {
        let worker = match event {
            WorkerEvent::Idle { worker } => worker,
            WorkerEvent::Done {
                worker,
                seed_id,
                executor,
            } => {
                self.take_back(seed_id, executor);
                worker
            }
        };
        self.dispatch(worker);
    }

    /// Return a loaned executor to its seed.
    fn take_back(&mut self, seed_id: u64, executor: Executor) {
        self.running_n -= 1;
        match self.seeds.iter_mut().find(|s| s.id == seed_id) {
            Some(seed) => {
                seed.running = false;
                seed.exec = Some(executor);
            }
            None => log::error!("completion for unknown seed {seed_id}"),
        }
    }

    fn dispatch(&mut self, worker: usize) {
        if self.seeds.is_empty() {
            self.parked.push(worker);
            return;
        }

        // Running seeds and high execution counts sort to the front; the
        // last element is an idle seed with the fewest executions.
        self.seeds
            .sort_by(|a, b| (b.running, b.exec_n).cmp(&(a.running, a.exec_n)));
        let idx = self.seeds.len() - 1;
        let budget = self.config.fuzz_round_n;

        if self.seeds[idx].exec_n >= budget {
            if self.running_n == 0 && self.seeds.iter().all(|s| s.exec_n >= budget) {
                self.done = true;
            } else {
                self.parked.push(worker);
            }
            return;
        }

        if self.seeds[idx].running {
            // Lost a race with a completion; try again after a round.
            self.postpone(worker);
            return;
        }

        let seed = &mut self.seeds[idx];
        let Some(mut executor) = seed.exec.take() else {
            log::error!("seed {} has no executor although it is idle", seed.id);
            self.parked.push(worker);
            return;
        };
        if !seed.exercised() && matches!(executor.discovery, Fitness::Never) {
            executor.discovery = Fitness::discovery();
        }
        seed.exec_n += 1;
        seed.running = true;
        self.running_n += 1;
        let seed_id = seed.id;

        if let Err(job) = self.workers[worker].submit(Job { seed_id, executor }) {
            // The worker is gone; undo the dispatch and retire it.
            log::error!("worker {worker} rejected a job, retiring it");
            self.running_n -= 1;
            if let Some(seed) = self.seeds.iter_mut().find(|s| s.id == seed_id) {
                seed.running = false;
                seed.exec_n -= 1;
                seed.exec = Some(job.executor);
            }
        }
    }

    /// Re-announce the worker as idle after a round plus some jitter.
    fn postpone(&self, worker: usize) {
        let event_tx = self.event_tx.clone();
        let delay = self.config.round_time
            + Duration::from_millis(rand::thread_rng().gen_range(300..1000));
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            let _ = event_tx.send(WorkerEvent::Idle { worker });
        });
    }

    /// Wait for every outstanding round so all executors are home again.
    fn drain(&mut self) {
        while self.running_n > 0 {
            match self.events.recv_timeout(Duration::from_secs(60)) {
                Ok(WorkerEvent::Done {
                    seed_id, executor, ..
                }) => self.take_back(seed_id, executor),
                Ok(WorkerEvent::Idle { .. }) => {}
                Err(_) => {
                    log::warn!(
                        "{} workers still running after the drain timeout",
                        self.running_n
                    );
                    break;
                }
            }
        }
    }

    fn print_progress(&self) {
        let rounds: usize = self.seeds.iter().map(|s| s.exec_n).sum();
        log::info!(
            "{} seeds, {} rounds dispatched, {} running, {} workers parked",
            self.seeds.len(),
            rounds,
            self.running_n,
            self.parked.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RUN_TIMEOUT;
    use crossbeam_channel::{bounded, unbounded};
    use std::path::PathBuf;

    fn test_config(fuzz_rounds_evo: bool) -> Config {
        Config::new(
            PathBuf::from("/bin/true"),
            vec![],
            PathBuf::from("in"),
            PathBuf::from("out"),
            1,
            RUN_TIMEOUT,
            fuzz_rounds_evo,
            false,
        )
    }

    struct Harness {
        config: Config,
        events: Receiver<WorkerEvent>,
        event_tx: Sender<WorkerEvent>,
        new_seeds: Receiver<RunRecord>,
        fit_tx: Sender<RunRecord>,
        crash_tx: Sender<RunRecord>,
        _fit_rx: Receiver<RunRecord>,
        _crash_rx: Receiver<RunRecord>,
        interrupt: Arc<InterruptMultiplexer>,
    }

    impl Harness {
        fn new() -> Self {
            let (event_tx, events) = unbounded();
            let (_new_seed_tx, new_seeds) = bounded(0);
            let (fit_tx, _fit_rx) = unbounded();
            let (crash_tx, _crash_rx) = unbounded();
            Self {
                config: test_config(true),
                events,
                event_tx,
                new_seeds,
                fit_tx,
                crash_tx,
                _fit_rx,
                _crash_rx,
                interrupt: InterruptMultiplexer::new(),
            }
        }

        fn scheduler<'a>(&'a self, workers: &'a [Worker]) -> Scheduler<'a> {
            Scheduler::new(
                workers,
                &self.events,
                self.event_tx.clone(),
                &self.new_seeds,
                self.fit_tx.clone(),
                self.crash_tx.clone(),
                &self.interrupt,
                &self.config,
            )
        }
    }

    #[test]
    fn seeds_sort_least_exercised_idle_last() {
        let harness = Harness::new();
        let mut sched = harness.scheduler(&[]);
        sched.add_seed(RunRecord::from_input(vec![1]));
        sched.add_seed(RunRecord::from_input(vec![2]));
        sched.add_seed(RunRecord::from_input(vec![3]));
        sched.seeds[0].exec_n = 2;
        sched.seeds[1].exec_n = 1;
        sched.seeds[1].running = true;
        sched.seeds[2].exec_n = 5;

        sched
            .seeds
            .sort_by(|a, b| (b.running, b.exec_n).cmp(&(a.running, a.exec_n)));
        let last = sched.seeds.last().unwrap();
        assert!(!last.running);
        assert_eq!(last.exec_n, 2);
        // The running seed sorts to the front despite its low count.
        assert!(sched.seeds[0].running);
    }

    #[test]
    fn interrupt_ends_an_idle_campaign() {
        let harness = Harness::new();
        harness.interrupt.fire();
        let sched = harness.scheduler(&[]);
        let seeds = sched.run(vec![vec![b'A']]);
        assert_eq!(seeds.len(), 1);
        assert!(!seeds[0].exercised());
    }

    #[test]
    fn take_back_restores_the_seed() {
        let harness = Harness::new();
        let mut sched = harness.scheduler(&[]);
        sched.add_seed(RunRecord::from_input(vec![9]));
        let executor = sched.seeds[0].exec.take().unwrap();
        sched.seeds[0].running = true;
        sched.running_n = 1;

        sched.take_back(0, executor);
        assert_eq!(sched.running_n, 0);
        assert!(!sched.seeds[0].running);
        assert!(sched.seeds[0].exec.is_some());
    }

    #[test]
    fn budget_reached_with_nothing_running_finishes_the_campaign() {
        let harness = Harness::new();
        let mut sched = harness.scheduler(&[]);
        sched.add_seed(RunRecord::from_input(vec![1]));
        sched.seeds[0].exec_n = sched.config.fuzz_round_n;
        sched.dispatch(0);
        assert!(sched.done);

        // With another seed under budget the worker parks instead.
        let mut sched = harness.scheduler(&[]);
        sched.add_seed(RunRecord::from_input(vec![1]));
        sched.add_seed(RunRecord::from_input(vec![2]));
        sched.seeds[0].exec_n = sched.config.fuzz_round_n;
        sched.seeds[1].exec_n = sched.config.fuzz_round_n;
        sched.running_n = 1;
        sched.dispatch(0);
        assert!(!sched.done);
        assert_eq!(sched.parked, vec![0]);
    }

    #[test]
    fn first_dispatch_installs_the_discovery_fitness() {
        // No workers: submit fails, but the fitness must already be
        // installed by then; the failed dispatch restores the executor.
        let harness = Harness::new();
        let mut sched = harness.scheduler(&[]);
        sched.add_seed(RunRecord::from_input(vec![7]));
        let exec = sched.seeds[0].exec.as_ref().unwrap();
        assert!(matches!(exec.discovery, Fitness::Never));
    }
}
