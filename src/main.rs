use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

mod commands;

use bosun::helm::HelmCli;
use bosun::hub::MessageHub;
use bosun::installer::Installer;
use bosun::replay::SystemClock;
use bosun::repository::{Repository, SqliteRepository};
use bosun::service::Service;
use bosun::ssh::SshSessionFactory;
use bosun::Result;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "bosun")]
#[command(version = VERSION)]
#[command(about = "Provision and decommission Kubernetes cluster membership over SSH")]
struct Cli {
    /// Path to the node/cluster database
    #[arg(long, default_value = "./bosun.db")]
    database: String,

    /// Where the fetched control-plane kubeconfig is stored
    #[arg(long, default_value = "./config")]
    kubeconfig: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage registered nodes
    #[command(visible_alias = "nodes")]
    Node(commands::node::NodeArgs),
    /// Provision or decommission cluster membership
    Cluster(commands::cluster::ClusterArgs),
}

fn build_service(database: &str, kubeconfig: &str) -> Result<Service> {
    let database = shellexpand::tilde(database).to_string();
    let kubeconfig = PathBuf::from(shellexpand::tilde(kubeconfig).to_string());

    let repo: Arc<dyn Repository> = Arc::new(SqliteRepository::open(database.as_ref())?);
    let charts = Arc::new(HelmCli::new(kubeconfig.clone()));
    let installer = Arc::new(
        Installer::new(Arc::clone(&repo), charts).with_kubeconfig_path(kubeconfig),
    );
    let hub = MessageHub::new(Arc::new(SystemClock));
    Ok(Service::new(
        repo,
        Arc::new(SshSessionFactory),
        installer,
        hub,
    ))
}

fn run(cli: Cli) -> Result<()> {
    let service = build_service(&cli.database, &cli.kubeconfig)?;
    match cli.command {
        Commands::Node(args) => commands::node::run(&service, args),
        Commands::Cluster(args) => commands::cluster::run(&service, args),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error[{}]: {}", err.code(), err);
            ExitCode::FAILURE
        }
    }
}
