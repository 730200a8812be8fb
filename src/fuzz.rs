//! Wiring of one fuzzing campaign: channels, the aggregator task and the
//! scheduler loop on the calling thread.

use std::sync::Arc;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

use crate::{
    config::Config,
    exec::{Worker, WorkerEvent},
    interrupt::InterruptMultiplexer,
    put::RunRecord,
    sched::{spawn_aggregator, GlobalFitness, Scheduler},
    seed::Seed,
};

/// Capacity of the fit-record channel between workers and the aggregator.
const FIT_CHAN_CAP: usize = 1000;

/// The channels shared by workers, scheduler and aggregator.
#[derive(Debug)]
pub struct Channels {
    pub event_tx: Sender<WorkerEvent>,
    pub event_rx: Receiver<WorkerEvent>,
    pub fit_tx: Sender<RunRecord>,
    pub fit_rx: Receiver<RunRecord>,
    pub crash_tx: Sender<RunRecord>,
    pub crash_rx: Receiver<RunRecord>,
}

impl Channels {
    #[must_use]
    pub fn new() -> Self {
        let (event_tx, event_rx) = bounded(0);
        let (fit_tx, fit_rx) = bounded(FIT_CHAN_CAP);
        let (crash_tx, crash_rx) = unbounded();
        Self {
            event_tx,
            event_rx,
            fit_tx,
            fit_rx,
            crash_tx,
            crash_rx,
        }
    }
}

impl Default for Channels {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain the crash channel. The security policy is a placeholder, so this
/// normally never sees a record; anything that does arrive is only logged.
pub fn spawn_crash_sink(crash_rx: Receiver<RunRecord>) {
    if let Err(err) = std::thread::Builder::new()
        .name("crash-sink".into())
        .spawn(move || {
            for record in crash_rx.iter() {
                log::warn!(
                    "crash record (signal {}, hash 0x{:016x})",
                    record.status.signal,
                    record.hash
                );
            }
        })
    {
        log::warn!("could not start the crash sink: {err}");
    }
}

/// Run one campaign to completion.
///
/// Blocks on the scheduler; the aggregator runs beside it and is stopped and
/// joined before returning, so the final union coverage is consistent.
pub fn fuzz_campaign(
    config: &Config,
    workers: &[Worker],
    channels: &Channels,
    interrupt: &Arc<InterruptMultiplexer>,
    seed_inputs: Vec<Vec<u8>>,
) -> (Vec<Seed>, GlobalFitness) {
    let (new_seed_tx, new_seed_rx) = bounded(0);
    let (stop_tx, stop_rx) = bounded::<()>(0);

    let aggregator = spawn_aggregator(
        config,
        seed_inputs.len(),
        channels.fit_rx.clone(),
        new_seed_tx,
        stop_rx,
        interrupt,
    );

    let scheduler = Scheduler::new(
        workers,
        &channels.event_rx,
        channels.event_tx.clone(),
        &new_seed_rx,
        channels.fit_tx.clone(),
        channels.crash_tx.clone(),
        interrupt,
        config,
    );
    let seeds = scheduler.run(seed_inputs);

    // Closing these unblocks the aggregator wherever it is: dropping the
    // receiver fails any in-flight promotion send, dropping the stop sender
    // fires its select arm.
    drop(new_seed_rx);
    drop(stop_tx);
    let global = match aggregator {
        Ok(handle) => match handle.join() {
            Ok(state) => state,
            Err(_) => {
                log::error!("aggregator panicked; reporting empty union coverage");
                GlobalFitness::new(config, 0)
            }
        },
        Err(err) => {
            log::error!("aggregator never started: {err}");
            GlobalFitness::new(config, 0)
        }
    };

    (seeds, global)
}
