use bosun::hub::Observer;
use bosun::log_status;
use bosun::message::{Message, OpType, Payload, TaskStatus};
use bosun::service::Service;
use bosun::{Error, Result};
use clap::{Args, Subcommand};
use std::sync::mpsc::{self, Sender};

#[derive(Args)]
pub struct ClusterArgs {
    #[command(subcommand)]
    command: ClusterCommand,
}

#[derive(Subcommand)]
enum ClusterCommand {
    /// Provision a registered node into the cluster (control plane first,
    /// workers after)
    Add { id: i64 },
    /// Decommission a node from the cluster
    Remove { id: i64 },
}

struct ProgressPrinter {
    tx: Sender<(TaskStatus, Option<String>)>,
    op: OpType,
    node_id: i64,
}

impl Observer for ProgressPrinter {
    fn write(&mut self, msg: &Message) -> Result<()> {
        let Payload::Progress(progress) = &msg.payload else {
            return Ok(());
        };
        if msg.op != self.op || progress.node_id != self.node_id {
            return Ok(());
        }
        eprintln!("[{:>3}%] {:?}", progress.percent, progress.status);
        if progress.status.is_terminal() {
            self.tx
                .send((progress.status, progress.error.clone()))
                .map_err(|_| Error::Other("progress consumer gone".to_string()))?;
        }
        Ok(())
    }
}

pub fn run(service: &Service, args: ClusterArgs) -> Result<()> {
    let (op, id) = match args.command {
        ClusterCommand::Add { id } => (OpType::AddNodeToCluster, id),
        ClusterCommand::Remove { id } => (OpType::RemoveNodeFromCluster, id),
    };

    let (tx, rx) = mpsc::channel();
    service.attach_observer(Box::new(ProgressPrinter {
        tx,
        op,
        node_id: id,
    }))?;

    let task = match op {
        OpType::AddNodeToCluster => service.add_node_to_cluster(id)?,
        OpType::RemoveNodeFromCluster => service.remove_node_from_cluster(id)?,
        OpType::Metrics => unreachable!(),
    };
    log_status!("cluster", "scheduled as task {}", task.0);

    // Block until the pipeline reports its terminal status.
    let (status, error) = rx
        .recv()
        .map_err(|_| Error::Other("progress stream closed before completion".to_string()))?;

    match status {
        TaskStatus::Success => {
            println!("{}", serde_json::json!({ "id": id, "status": "success" }));
            Ok(())
        }
        TaskStatus::Degraded => {
            println!(
                "{}",
                serde_json::json!({ "id": id, "status": "degraded", "error": error })
            );
            Err(Error::Other(
                error.unwrap_or_else(|| "add-on installation failed".to_string()),
            ))
        }
        _ => Err(Error::Other(
            error.unwrap_or_else(|| "operation failed".to_string()),
        )),
    }
}
