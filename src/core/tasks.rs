//! Per-key task serialization: at most one in-flight job per key, FIFO
//! for later jobs on the same key, full parallelism across keys.

use crate::error::Result;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::thread;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TaskId(pub u64);

type Job = Box<dyn FnOnce() -> Result<()> + Send>;

struct Inner<K> {
    next_id: u64,
    active: HashSet<K>,
    queues: HashMap<K, VecDeque<Job>>,
}

pub struct TaskManager<K> {
    inner: Arc<Mutex<Inner<K>>>,
}

impl<K> TaskManager<K>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_id: 0,
                active: HashSet::new(),
                queues: HashMap::new(),
            })),
        }
    }

    /// Schedule `job` under `key`. Returns immediately; the job runs on a
    /// worker thread once no earlier job for the same key is in flight.
    pub fn add_task<F>(&self, key: K, job: F) -> Result<TaskId>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let mut inner = self.inner.lock().expect("task manager lock poisoned");
        inner.next_id += 1;
        let id = TaskId(inner.next_id);

        if inner.active.contains(&key) {
            inner
                .queues
                .entry(key)
                .or_default()
                .push_back(Box::new(job));
        } else {
            inner.active.insert(key.clone());
            let shared = Arc::clone(&self.inner);
            thread::spawn(move || run_worker(shared, key, Box::new(job)));
        }

        Ok(id)
    }
}

impl<K> Default for TaskManager<K>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

fn run_worker<K>(inner: Arc<Mutex<Inner<K>>>, key: K, first: Job)
where
    K: Eq + Hash + Clone + Debug,
{
    let mut job = first;
    loop {
        if let Err(err) = job() {
            // Progress reporting already happened inside the job.
            log_status!("tasks", "task for {:?} failed: {}", key, err);
        }

        let next = {
            let mut inner = inner.lock().expect("task manager lock poisoned");
            match inner.queues.get_mut(&key).and_then(|queue| queue.pop_front()) {
                Some(job) => Some(job),
                None => {
                    inner.queues.remove(&key);
                    inner.active.remove(&key);
                    None
                }
            }
        };

        match next {
            Some(queued) => job = queued,
            None => return,
        }
    }
}
