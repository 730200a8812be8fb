//! Worker threads: one OS thread, pinned to one logical CPU, owning exactly
//! one PUT instance. Jobs arrive on a rendezvous channel; completions go out
//! on the shared event channel the scheduler listens to.

use std::{
    sync::Arc,
    thread::{self, JoinHandle},
};

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::{
    bolts::cpu::{num_cpus, pin_current_thread, CpuPool},
    config::Config,
    exec::Executor,
    interrupt::InterruptMultiplexer,
    put::AflPut,
    Error,
};

/// One dispatch: exercise this executor (for its seed) once or for a round.
#[derive(Debug)]
pub struct Job {
    pub seed_id: u64,
    pub executor: Executor,
}

/// What workers report on the shared event channel.
#[derive(Debug)]
pub enum WorkerEvent {
    /// The worker came up and wants work.
    Idle { worker: usize },
    /// A dispatch finished; the executor comes back to its seed.
    Done {
        worker: usize,
        seed_id: u64,
        executor: Executor,
    },
}

/// Handle to a running worker thread. Dropping it closes the job channel,
/// which makes the thread clean up its PUT and exit; the drop joins it.
#[derive(Debug)]
pub struct Worker {
    id: usize,
    cpu: usize,
    job_tx: Option<Sender<Job>>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawn a worker. Blocks until the thread has reserved a CPU and its
    /// fork server finished the handshake, so a startup failure surfaces
    /// here instead of as a silent dead thread.
    pub fn spawn(
        id: usize,
        config: &Config,
        cpu_pool: &Arc<CpuPool>,
        interrupt: &Arc<InterruptMultiplexer>,
        event_tx: Sender<WorkerEvent>,
    ) -> Result<Self, Error> {
        let (startup_tx, startup_rx) = bounded::<Result<usize, Error>>(1);
        let (job_tx, job_rx) = bounded::<Job>(0);

        let config = config.clone();
        let cpu_pool = Arc::clone(cpu_pool);
        let interrupt = Arc::clone(interrupt);

        let handle = thread::Builder::new()
            .name(format!("worker-{id}"))
            .spawn(move || {
                worker_main(id, &config, &cpu_pool, &interrupt, &startup_tx, &job_rx, &event_tx);
            })?;

        let cpu = match startup_rx.recv() {
            Ok(Ok(cpu)) => cpu,
            Ok(Err(err)) => {
                let _ = handle.join();
                return Err(err);
            }
            Err(_) => {
                let _ = handle.join();
                return Err(Error::unknown("worker thread died during startup"));
            }
        };

        Ok(Self {
            id,
            cpu,
            job_tx: Some(job_tx),
            handle: Some(handle),
        })
    }

    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    #[must_use]
    pub fn cpu(&self) -> usize {
        self.cpu
    }

    /// Hand a job to the worker. Blocks until the (idle) worker takes it.
    /// On failure the job is returned so the executor is not lost.
    pub fn submit(&self, job: Job) -> Result<(), Job> {
        match &self.job_tx {
            Some(tx) => tx.send(job).map_err(|err| err.into_inner()),
            None => Err(job),
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.job_tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::warn!("worker {} panicked", self.id);
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn worker_main(
    id: usize,
    config: &Config,
    cpu_pool: &CpuPool,
    interrupt: &InterruptMultiplexer,
    startup_tx: &Sender<Result<usize, Error>>,
    job_rx: &Receiver<Job>,
    event_tx: &Sender<WorkerEvent>,
) {
    let cpu = match cpu_pool.reserve() {
        Ok(cpu) => cpu,
        Err(err) => {
            let _ = startup_tx.send(Err(err));
            return;
        }
    };
    if let Err(err) = pin_current_thread(cpu) {
        log::warn!("could not pin worker {id} to CPU {cpu}: {err}");
    }

    let mut put = match AflPut::start(
        &config.bin_path,
        &config.args,
        config.timeout,
        &config.out_dir,
        config.debug_child,
    ) {
        Ok(put) => put,
        Err(err) => {
            cpu_pool.release(cpu);
            let _ = startup_tx.send(Err(err));
            return;
        }
    };

    let _ = startup_tx.send(Ok(cpu));
    log::info!("worker {id} up on CPU {cpu}");

    if event_tx.send(WorkerEvent::Idle { worker: id }).is_ok() {
        for job in job_rx.iter() {
            let Job {
                seed_id,
                mut executor,
            } = job;

            if executor.is_one_exec() {
                executor.execute_one(&mut put);
            } else {
                executor.execute_loop(&mut put, config, interrupt);
            }

            if event_tx
                .send(WorkerEvent::Done {
                    worker: id,
                    seed_id,
                    executor,
                })
                .is_err()
            {
                break;
            }
        }
    }

    drop(put);
    cpu_pool.release(cpu);
}

/// Bring up `config.thread_n` workers. Requesting more workers than logical
/// CPUs is a configuration error; individual startup failures only cost the
/// affected worker, as long as at least one survives.
pub fn spawn_workers(
    config: &Config,
    cpu_pool: &Arc<CpuPool>,
    interrupt: &Arc<InterruptMultiplexer>,
    event_tx: &Sender<WorkerEvent>,
) -> Result<Vec<Worker>, Error> {
    let available = num_cpus();
    if config.thread_n > available {
        return Err(Error::illegal_argument(format!(
            "there are only {available} CPUs but {} threads were requested",
            config.thread_n
        )));
    }

    let mut workers = Vec::with_capacity(config.thread_n);
    for id in 0..config.thread_n {
        match Worker::spawn(id, config, cpu_pool, interrupt, event_tx.clone()) {
            Ok(worker) => workers.push(worker),
            Err(err) => log::error!("worker {id} failed to start: {err}"),
        }
    }
    if workers.is_empty() {
        return Err(Error::illegal_state("no worker could be started"));
    }
    Ok(workers)
}
