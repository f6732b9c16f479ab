//! In-process fan-out of progress messages to attached observers.
//!
//! Producers publish from any thread without coordination; a single
//! dispatch thread drains the queue and writes to each observer in turn.
//! A write failure detaches only the failing observer.

use crate::error::Result;
use crate::message::Message;
use crate::replay::{Clock, ReplayCache};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// A live consumer of progress messages. An `Err` from `write` means the
/// connection is gone and the observer is dropped from the hub.
pub trait Observer: Send {
    fn write(&mut self, msg: &Message) -> Result<()>;
}

type ObserverSet = Arc<Mutex<Vec<Box<dyn Observer>>>>;

#[derive(Clone)]
pub struct MessageHub {
    tx: Sender<Arc<Message>>,
    observers: ObserverSet,
    replay: Arc<ReplayCache>,
}

impl MessageHub {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (tx, rx) = mpsc::channel::<Arc<Message>>();
        let observers: ObserverSet = Arc::new(Mutex::new(Vec::new()));
        let dispatch_set = Arc::clone(&observers);
        thread::spawn(move || dispatch(rx, dispatch_set));
        Self {
            tx,
            observers,
            replay: Arc::new(ReplayCache::new(clock)),
        }
    }

    /// Hand a message to the dispatch loop. Never blocks the producer;
    /// the message also becomes the replay state for its operation key.
    pub fn publish(&self, msg: Message) {
        let msg = Arc::new(msg);
        self.replay.push(Arc::clone(&msg));
        // Send fails only after the dispatch thread is gone, which means
        // the hub itself is shutting down.
        let _ = self.tx.send(msg);
    }

    /// Attach an observer, delivering the replay backlog first so it sees
    /// in-flight operations without gaps. If backlog delivery fails the
    /// observer is not added.
    pub fn attach(&self, mut observer: Box<dyn Observer>) -> Result<()> {
        let backlog = self.replay.backlog();
        let mut observers = self.observers.lock().expect("observer set lock poisoned");
        for msg in &backlog {
            observer.write(msg)?;
            msg.mark_sent();
        }
        observers.push(observer);
        Ok(())
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().expect("observer set lock poisoned").len()
    }

    /// Run `produce` every `period` while observers remain attached. The
    /// producer thread re-checks observer presence before each emission
    /// and exits once the set is empty.
    pub fn run_by_ticker<F>(&self, period: Duration, produce: F)
    where
        F: Fn() -> Option<Message> + Send + 'static,
    {
        let hub = self.clone();
        thread::spawn(move || loop {
            thread::sleep(period);
            if hub.observer_count() == 0 {
                return;
            }
            if let Some(msg) = produce() {
                hub.publish(msg);
            }
        });
    }
}

fn dispatch(rx: Receiver<Arc<Message>>, observers: ObserverSet) {
    while let Ok(msg) = rx.recv() {
        let mut observers = observers.lock().expect("observer set lock poisoned");
        let mut delivered = 0usize;
        observers.retain_mut(|observer| match observer.write(&msg) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(err) => {
                log_status!("hub", "observer detached: {}", err);
                false
            }
        });
        if delivered > 0 {
            msg.mark_sent();
        }
    }
}
