//! Typed progress messages exchanged between pipeline runs and observers.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};

/// Operation a message reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum OpType {
    AddNodeToCluster,
    RemoveNodeFromCluster,
    Metrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    InQueue,
    Start,
    InProcess,
    Error,
    Success,
    /// The node joined the cluster but post-join add-on installation
    /// failed. The cluster assignment stays committed.
    Degraded,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Error | TaskStatus::Success | TaskStatus::Degraded)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeProgress {
    pub node_id: i64,
    pub status: TaskStatus,
    pub percent: u8,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub log: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Progress(NodeProgress),
    Metrics(serde_json::Value),
}

/// One progress event. The payload is immutable after construction; the
/// only mutation ever applied is flipping the `sent` bookkeeping flag.
#[derive(Debug, Serialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub op: OpType,
    pub payload: Payload,
    /// Terminal outcomes must reach at least one observer before the
    /// replay cache may evict them.
    #[serde(skip)]
    pub must_send: bool,
    #[serde(skip)]
    sent: AtomicBool,
}

impl Message {
    pub fn progress(op: OpType, progress: NodeProgress) -> Self {
        let must_send = progress.status.is_terminal();
        Self {
            op,
            payload: Payload::Progress(progress),
            must_send,
            sent: AtomicBool::new(false),
        }
    }

    pub fn metrics(value: serde_json::Value) -> Self {
        Self {
            op: OpType::Metrics,
            payload: Payload::Metrics(value),
            must_send: false,
            sent: AtomicBool::new(false),
        }
    }

    /// Replay-cache key: one slot per operation and subject.
    pub fn key(&self) -> (OpType, i64) {
        match &self.payload {
            Payload::Progress(p) => (self.op, p.node_id),
            Payload::Metrics(_) => (self.op, 0),
        }
    }

    pub fn status(&self) -> Option<TaskStatus> {
        match &self.payload {
            Payload::Progress(p) => Some(p.status),
            Payload::Metrics(_) => None,
        }
    }

    pub fn mark_sent(&self) {
        self.sent.store(true, Ordering::Relaxed);
    }

    pub fn was_sent(&self) -> bool {
        self.sent.load(Ordering::Relaxed)
    }
}
