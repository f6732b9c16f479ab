//! Replay backlog for late-joining observers: the latest message per
//! operation key, retained under status-specific expiry rules.

use crate::message::{Message, OpType, TaskStatus};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Time source, injected so expiry is testable.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// Terminal outcomes age out quickly; a run still in flight stays
// replayable long enough for a client connecting mid-operation.
const SUCCESS_RETENTION_SECS: i64 = 5;
const ERROR_RETENTION_SECS: i64 = 10;
const IN_PROGRESS_RETENTION_SECS: i64 = 30;
const METRICS_RETENTION_SECS: i64 = 30;

struct CacheEntry {
    msg: Arc<Message>,
    expires: DateTime<Utc>,
}

pub struct ReplayCache {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<(OpType, i64), CacheEntry>>,
}

impl ReplayCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record `msg` as the latest state of its operation key.
    pub fn push(&self, msg: Arc<Message>) {
        let retention = match (msg.op, msg.status()) {
            (OpType::Metrics, _) => METRICS_RETENTION_SECS,
            (_, Some(TaskStatus::Success)) => SUCCESS_RETENTION_SECS,
            (_, Some(TaskStatus::Error)) | (_, Some(TaskStatus::Degraded)) => ERROR_RETENTION_SECS,
            _ => IN_PROGRESS_RETENTION_SECS,
        };
        let expires = self.clock.now() + Duration::seconds(retention);
        let mut entries = self.entries.lock().expect("replay cache lock poisoned");
        entries.insert(msg.key(), CacheEntry { msg, expires });
    }

    /// Still-valid backlog for a newly attached observer. Expired entries
    /// are evicted here, except must-send messages nobody has received.
    pub fn backlog(&self) -> Vec<Arc<Message>> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().expect("replay cache lock poisoned");
        entries.retain(|_, entry| {
            now < entry.expires || (entry.msg.must_send && !entry.msg.was_sent())
        });
        entries.values().map(|entry| Arc::clone(&entry.msg)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::NodeProgress;

    struct ManualClock {
        now: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                now: Mutex::new(Utc::now()),
            })
        }

        fn advance(&self, secs: i64) {
            let mut now = self.now.lock().unwrap();
            *now = *now + Duration::seconds(secs);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock().unwrap()
        }
    }

    fn progress(status: TaskStatus, node_id: i64) -> Arc<Message> {
        Arc::new(Message::progress(
            OpType::AddNodeToCluster,
            NodeProgress {
                node_id,
                status,
                percent: 50,
                log: String::new(),
                error: None,
            },
        ))
    }

    #[test]
    fn keeps_latest_message_per_key() {
        let cache = ReplayCache::new(ManualClock::new());
        cache.push(progress(TaskStatus::InProcess, 1));
        let success = progress(TaskStatus::Success, 1);
        success.mark_sent();
        cache.push(Arc::clone(&success));

        let backlog = cache.backlog();
        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog[0].status(), Some(TaskStatus::Success));
    }

    #[test]
    fn in_process_outlives_terminal_retention() {
        let clock = ManualClock::new();
        let cache_clock: Arc<dyn Clock> = clock.clone();
        let cache = ReplayCache::new(cache_clock);
        cache.push(progress(TaskStatus::InProcess, 1));

        clock.advance(20);
        assert_eq!(cache.backlog().len(), 1, "still within 30s retention");

        clock.advance(20);
        assert!(cache.backlog().is_empty(), "expired after 30s");
    }

    #[test]
    fn sent_success_expires_quickly() {
        let clock = ManualClock::new();
        let cache_clock: Arc<dyn Clock> = clock.clone();
        let cache = ReplayCache::new(cache_clock);
        let msg = progress(TaskStatus::Success, 1);
        msg.mark_sent();
        cache.push(msg);

        clock.advance(6);
        assert!(cache.backlog().is_empty());
    }

    #[test]
    fn unsent_must_send_survives_expiry() {
        let clock = ManualClock::new();
        let cache_clock: Arc<dyn Clock> = clock.clone();
        let cache = ReplayCache::new(cache_clock);
        cache.push(progress(TaskStatus::Error, 1));

        clock.advance(3600);
        let backlog = cache.backlog();
        assert_eq!(backlog.len(), 1, "undelivered terminal outcome is retained");

        // Once delivered, the next backlog request evicts it.
        backlog[0].mark_sent();
        assert!(cache.backlog().is_empty());
    }

    #[test]
    fn distinct_nodes_get_distinct_slots() {
        let cache = ReplayCache::new(ManualClock::new());
        cache.push(progress(TaskStatus::InProcess, 1));
        cache.push(progress(TaskStatus::InProcess, 2));
        assert_eq!(cache.backlog().len(), 2);
    }
}
