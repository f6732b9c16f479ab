use bosun::node::{NewNode, NodeAuth};
use bosun::service::Service;
use bosun::{Error, Result};
use clap::{Args, Subcommand};
use std::net::SocketAddr;

#[derive(Args)]
pub struct NodeArgs {
    #[command(subcommand)]
    command: NodeCommand,
}

#[derive(Subcommand)]
enum NodeCommand {
    /// Register a node for later provisioning
    Add {
        /// Display name for the node
        #[arg(long)]
        name: String,
        /// SSH endpoint, e.g. 10.0.0.5:22
        #[arg(long)]
        addr: SocketAddr,
        /// SSH login user
        #[arg(long)]
        login: String,
        /// SSH password
        #[arg(long, conflicts_with = "identity_file")]
        password: Option<String>,
        /// SSH private key path (alternative to --password)
        #[arg(long)]
        identity_file: Option<String>,
    },
    /// Unregister a node (must not be assigned to a cluster)
    Rm { id: i64 },
    /// List registered nodes
    List,
}

pub fn run(service: &Service, args: NodeArgs) -> Result<()> {
    match args.command {
        NodeCommand::Add {
            name,
            addr,
            login,
            password,
            identity_file,
        } => {
            let auth = match (password, identity_file) {
                (Some(password), None) => NodeAuth::Password(password),
                (None, Some(path)) => NodeAuth::IdentityFile(path),
                _ => {
                    return Err(Error::Other(
                        "exactly one of --password or --identity-file is required".to_string(),
                    ))
                }
            };
            let id = service.register_node(NewNode {
                name,
                addr,
                login,
                auth,
            })?;
            println!("{}", serde_json::json!({ "id": id }));
            Ok(())
        }
        NodeCommand::Rm { id } => {
            service.remove_node(id)?;
            println!("{}", serde_json::json!({ "removed": id }));
            Ok(())
        }
        NodeCommand::List => {
            let nodes = service.nodes()?;
            println!("{}", serde_json::to_string_pretty(&nodes)?);
            Ok(())
        }
    }
}
