//! One-shot interrupt fan-out.
//!
//! Every long-running component subscribes once and receives at most one
//! message. Workers poll [`InterruptMultiplexer::is_fired`] between loop
//! iterations instead, so an already-consumed subscription cannot mask the
//! shutdown.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use crossbeam_channel::{bounded, Receiver, Sender};
use signal_hook::{consts::TERM_SIGNALS, iterator::Signals};

use crate::Error;

#[derive(Debug, Default)]
pub struct InterruptMultiplexer {
    fired: AtomicBool,
    subscribers: Mutex<Vec<Sender<()>>>,
}

impl InterruptMultiplexer {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create the multiplexer and register it for the termination signals.
    pub fn install() -> Result<Arc<Self>, Error> {
        let mux = Self::new();
        let mut signals = Signals::new(TERM_SIGNALS)?;
        let handler = Arc::clone(&mux);
        let _handle = std::thread::Builder::new()
            .name("signals".into())
            .spawn(move || {
                for signal in signals.forever() {
                    println!("Signal: {signal}");
                    handler.fire();
                }
            })?;
        Ok(mux)
    }

    /// A receiver that will see exactly one message once an interrupt fires.
    pub fn subscribe(&self) -> Receiver<()> {
        let (tx, rx) = bounded(1);
        if self.is_fired() {
            let _ = tx.try_send(());
        }
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    /// Signal every subscriber. Idempotent.
    pub fn fire(&self) {
        self.fired.store(true, Ordering::SeqCst);
        for tx in self.subscribers.lock().unwrap().iter() {
            // A full buffer means this subscriber was already signaled.
            let _ = tx.try_send(());
        }
    }

    #[must_use]
    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}
