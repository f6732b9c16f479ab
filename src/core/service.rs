//! Orchestration surface: node registration, cluster membership
//! operations scheduled per node address, and observer attachment.

use crate::error::{Error, Result};
use crate::hub::{MessageHub, Observer};
use crate::installer::Installer;
use crate::message::{Message, NodeProgress, OpType, TaskStatus};
use crate::node::{NewNode, Node, UNASSIGNED};
use crate::remote::SessionFactory;
use crate::repository::{Repository, DEFAULT_CLUSTER_ID};
use crate::tasks::{TaskId, TaskManager};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

const SUMMARY_PERIOD: Duration = Duration::from_secs(10);

pub struct Service {
    repo: Arc<dyn Repository>,
    sessions: Arc<dyn SessionFactory>,
    installer: Arc<Installer>,
    hub: MessageHub,
    tasks: TaskManager<SocketAddr>,
}

impl Service {
    pub fn new(
        repo: Arc<dyn Repository>,
        sessions: Arc<dyn SessionFactory>,
        installer: Arc<Installer>,
        hub: MessageHub,
    ) -> Self {
        Self {
            repo,
            sessions,
            installer,
            hub,
            tasks: TaskManager::new(),
        }
    }

    // ========================================================================
    // Node registration
    // ========================================================================

    pub fn register_node(&self, node: NewNode) -> Result<i64> {
        if self.repo.find_node_by_addr(node.addr.ip())?.is_some() {
            return Err(Error::NodeExists(node.addr.to_string()));
        }
        self.repo.add_node(&node)
    }

    pub fn remove_node(&self, id: i64) -> Result<()> {
        let node = self.repo.get_full_node(id)?;
        if node.cluster_id != UNASSIGNED {
            return Err(Error::Other(format!(
                "node {} is assigned to cluster {}; remove it from the cluster first",
                id, node.cluster_id
            )));
        }
        self.repo.remove_node(id)
    }

    pub fn nodes(&self) -> Result<Vec<Node>> {
        Ok(self
            .repo
            .get_nodes()?
            .iter()
            .map(|node| node.redacted())
            .collect())
    }

    // ========================================================================
    // Cluster membership
    // ========================================================================

    /// Schedule provisioning of `id` into the current cluster. Returns as
    /// soon as the pipeline is queued under the node's address key.
    pub fn add_node_to_cluster(&self, id: i64) -> Result<TaskId> {
        let node = self.repo.get_full_node(id)?;
        let installer = Arc::clone(&self.installer);
        let sessions = Arc::clone(&self.sessions);
        let hub = self.hub.clone();
        let task_node = node.clone();

        let task_id = self.tasks.add_task(node.addr, move || {
            let report = progress_reporter(&hub, OpType::AddNodeToCluster, task_node.id);
            report(1, TaskStatus::Start, "", None);
            let session = match sessions.connect(&task_node) {
                Ok(session) => session,
                Err(err) => {
                    report(1, TaskStatus::Error, "", Some(&err.to_string()));
                    return Err(err);
                }
            };
            report(1, TaskStatus::InProcess, "", None);
            let result = installer.install(session.as_ref(), &task_node, &report);
            let _ = session.close();
            result
        })?;

        self.hub.publish(Message::progress(
            OpType::AddNodeToCluster,
            NodeProgress {
                node_id: id,
                status: TaskStatus::InQueue,
                percent: 0,
                log: String::new(),
                error: None,
            },
        ));

        Ok(task_id)
    }

    /// Schedule decommissioning of `id`. The node's cluster assignment is
    /// cleared after the pipeline regardless of its outcome, and the
    /// bootstrap record goes with it when the node was the control plane.
    pub fn remove_node_from_cluster(&self, id: i64) -> Result<TaskId> {
        let node = self.repo.get_full_node(id)?;
        let repo = Arc::clone(&self.repo);
        let installer = Arc::clone(&self.installer);
        let sessions = Arc::clone(&self.sessions);
        let hub = self.hub.clone();
        let task_node = node.clone();

        let task_id = self.tasks.add_task(node.addr, move || {
            let report = progress_reporter(&hub, OpType::RemoveNodeFromCluster, task_node.id);
            report(1, TaskStatus::Start, "", None);
            let session = match sessions.connect(&task_node) {
                Ok(session) => session,
                Err(err) => {
                    report(1, TaskStatus::Error, "", Some(&err.to_string()));
                    return Err(err);
                }
            };
            let pipeline_result = installer.remove(session.as_ref(), &report);
            let _ = session.close();

            // Deferred cleanup: a half-reset node is still released.
            if let Err(err) = repo.reset_node_cluster(task_node.id) {
                log_status!("service", "failed to clear cluster assignment: {}", err);
            }
            if task_node.is_control_plane {
                log_status!("service", "Removing cluster bootstrap record");
                if let Err(err) = repo.clear_cluster_bootstrap(DEFAULT_CLUSTER_ID) {
                    log_status!("service", "failed to clear bootstrap record: {}", err);
                }
            }

            pipeline_result
        })?;

        self.hub.publish(Message::progress(
            OpType::RemoveNodeFromCluster,
            NodeProgress {
                node_id: id,
                status: TaskStatus::InQueue,
                percent: 0,
                log: String::new(),
                error: None,
            },
        ));

        Ok(task_id)
    }

    // ========================================================================
    // Observers
    // ========================================================================

    /// Attach a progress observer. The replay backlog is delivered before
    /// live messages; the first observer also (re)starts the periodic
    /// cluster-summary producer.
    pub fn attach_observer(&self, observer: Box<dyn Observer>) -> Result<()> {
        let was_empty = self.hub.observer_count() == 0;
        self.hub.attach(observer)?;
        if was_empty {
            let repo = Arc::clone(&self.repo);
            self.hub
                .run_by_ticker(SUMMARY_PERIOD, move || cluster_summary(repo.as_ref()));
        }
        Ok(())
    }
}

fn progress_reporter(
    hub: &MessageHub,
    op: OpType,
    node_id: i64,
) -> impl Fn(u8, TaskStatus, &str, Option<&str>) + '_ {
    move |percent, status, log, error| {
        hub.publish(Message::progress(
            op,
            NodeProgress {
                node_id,
                status,
                percent,
                log: log.to_string(),
                error: error.map(str::to_string),
            },
        ));
    }
}

fn cluster_summary(repo: &dyn Repository) -> Option<Message> {
    let nodes = repo.get_nodes().ok()?;
    let cluster_nodes = nodes
        .iter()
        .filter(|node| node.cluster_id != UNASSIGNED)
        .count();
    let control_plane_ready = repo
        .cluster_bootstrap(DEFAULT_CLUSTER_ID)
        .ok()?
        .is_bootstrapped();
    Some(Message::metrics(serde_json::json!({
        "totalNodes": nodes.len(),
        "clusterNodes": cluster_nodes,
        "controlPlaneReady": control_plane_ready,
    })))
}
