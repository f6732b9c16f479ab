//! Command pipeline executor: provisions cluster membership on a remote
//! host and decommissions it again, reporting progress along the way.
//!
//! The bootstrap branch is a two-state machine read once per run: no
//! bootstrap record means this node becomes the control plane, an
//! existing record means the node joins it as a worker.

use crate::commands::ubuntu::UbuntuCommandLib;
use crate::commands::{CommandStep, RunPolicy};
use crate::error::{Error, Result};
use crate::helm::ChartInstaller;
use crate::message::TaskStatus;
use crate::node::FullNode;
use crate::remote::RemoteSession;
use crate::repository::{
    BootstrapCredentials, BootstrapState, Repository, DEFAULT_CLUSTER_ID,
};
use regex::Regex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Progress callback: percent, status, accumulated transcript, error text.
pub type ProgressFn<'a> = &'a dyn Fn(u8, TaskStatus, &str, Option<&str>);

const TRANSCRIPT_INITIAL_SIZE: usize = 2048;

// Remote add-ons need time to reach a ready state before the next
// dependent step can succeed.
const SETTLE_SHORT: Duration = Duration::from_secs(5);
const SETTLE_MEDIUM: Duration = Duration::from_secs(30);
const SETTLE_LONG: Duration = Duration::from_secs(60);

const BITNAMI_REPO: &str = "https://charts.bitnami.com/bitnami";
const METALLB_REPO: &str = "https://metallb.github.io/metallb";

pub struct Installer {
    repo: Arc<dyn Repository>,
    charts: Arc<dyn ChartInstaller>,
    kubeconfig_path: PathBuf,
    settle: fn(Duration),
}

enum PostAction {
    FetchKubeconfig,
    Settle(Duration),
    Chart {
        release: &'static str,
        repo_url: &'static str,
        chart: &'static str,
        set_values: Option<&'static str>,
    },
    Remote(CommandStep),
}

impl Installer {
    pub fn new(repo: Arc<dyn Repository>, charts: Arc<dyn ChartInstaller>) -> Self {
        Self {
            repo,
            charts,
            kubeconfig_path: PathBuf::from("./config"),
            settle: std::thread::sleep,
        }
    }

    /// Where the fetched control-plane kubeconfig is persisted locally.
    pub fn with_kubeconfig_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.kubeconfig_path = path.into();
        self
    }

    /// Replace the settle-delay sleeper (tests pass a no-op).
    pub fn with_settle(mut self, settle: fn(Duration)) -> Self {
        self.settle = settle;
        self
    }

    // ========================================================================
    // Catalogs
    // ========================================================================

    fn bootstrap_catalog(&self) -> Vec<CommandStep> {
        let lib = UbuntuCommandLib;
        vec![
            lib.apt_update(),
            lib.apt_full_upgrade(),
            lib.install_prereqs(),
            lib.add_crio_repo(),
            lib.apt_update(),
            lib.install_crio(),
            lib.enable_crio(),
            lib.disable_swap(),
            lib.add_kubernetes_repo(),
            lib.install_kubeadm(),
            lib.enable_bridge_netfilter(),
            lib.enable_ip_forward(),
        ]
    }

    fn init_catalog(&self) -> Vec<CommandStep> {
        let lib = UbuntuCommandLib;
        let repo = Arc::clone(&self.repo);
        vec![
            lib.init_kubeadm(Box::new(move |output| {
                let creds = parse_kubeadm_init(output)?;
                repo.set_cluster_bootstrap(DEFAULT_CLUSTER_ID, &creds)
            })),
            lib.place_kubeconfig(),
            lib.untaint_control_plane(),
            lib.apply_flannel(),
            lib.install_helm(),
            lib.add_bitnami_repo(),
            lib.install_prometheus(),
        ]
    }

    fn reset_catalog(&self) -> Vec<CommandStep> {
        let lib = UbuntuCommandLib;
        vec![
            lib.kubeadm_reset(),
            lib.stop_kubelet(),
            lib.stop_crio(),
            lib.link_down_cni0(),
            lib.link_down_flannel(),
            lib.delete_cni_bridge(),
        ]
    }

    fn post_bootstrap_plan(&self, node: &FullNode) -> Vec<PostAction> {
        let lib = UbuntuCommandLib;
        let host_ip = node.addr.ip().to_string();
        vec![
            PostAction::FetchKubeconfig,
            PostAction::Settle(SETTLE_MEDIUM),
            PostAction::Chart {
                release: "metallb",
                repo_url: METALLB_REPO,
                chart: "metallb",
                set_values: None,
            },
            PostAction::Settle(SETTLE_MEDIUM),
            PostAction::Remote(lib.metallb_address_pool(&host_ip)),
            PostAction::Settle(SETTLE_SHORT),
            PostAction::Chart {
                release: "nginx-ingress-controller",
                repo_url: BITNAMI_REPO,
                chart: "nginx-ingress-controller",
                set_values: None,
            },
            PostAction::Settle(SETTLE_MEDIUM),
            PostAction::Remote(lib.default_storage_class()),
            PostAction::Remote(lib.grafana_pv(&node.name)),
            PostAction::Remote(lib.postgres_pv(&node.name)),
            PostAction::Remote(lib.grafana_ingress(&format!("grafana.{}.nip.io", host_ip))),
            PostAction::Remote(lib.create_pv_folders()),
            PostAction::Settle(SETTLE_LONG),
            PostAction::Chart {
                release: "grafana",
                repo_url: BITNAMI_REPO,
                chart: "grafana",
                set_values: Some("admin.password=admin"),
            },
            PostAction::Settle(SETTLE_LONG),
            PostAction::Remote(lib.reset_grafana_password()),
        ]
    }

    // ========================================================================
    // Pipelines
    // ========================================================================

    /// Provision cluster membership on `node`. With no bootstrap record
    /// this initializes a new control plane (including add-on
    /// installation); otherwise it joins the node as a worker.
    pub fn install(
        &self,
        session: &dyn RemoteSession,
        node: &FullNode,
        report: ProgressFn,
    ) -> Result<()> {
        let state = self.repo.cluster_bootstrap(DEFAULT_CLUSTER_ID)?;
        let joining = state.is_bootstrapped();

        let mut steps = self.bootstrap_catalog();
        match &state {
            BootstrapState::Bootstrapped(creds) => {
                log_status!("install", "Adding new worker to cluster");
                let lib = UbuntuCommandLib;
                steps.push(lib.kubeadm_join(&creds.endpoint, &creds.token, &creds.ca_cert_hash));
            }
            BootstrapState::Unbootstrapped => {
                log_status!("install", "Adding new control plane to cluster");
                steps.extend(self.init_catalog());
            }
        }

        let post = if joining {
            Vec::new()
        } else {
            self.post_bootstrap_plan(node)
        };

        // One tick per step, one for the cluster assignment, one per
        // post-bootstrap action. Derived from the run's actual shape so
        // percentages stay monotonic whatever the catalog length.
        let mut ticks = ProgressTicks::new(steps.len() + 1 + post.len());
        let mut transcript = String::with_capacity(TRANSCRIPT_INITIAL_SIZE);

        self.run_steps(
            &steps,
            session,
            &mut transcript,
            &mut ticks,
            report,
            TaskStatus::Error,
        )?;

        if let Err(err) = self
            .repo
            .set_node_cluster(node.id, DEFAULT_CLUSTER_ID, !joining)
        {
            let text = err.to_string();
            report(ticks.next(), TaskStatus::Error, &transcript, Some(&text));
            return Err(err);
        }
        report(ticks.next(), TaskStatus::InProcess, &transcript, None);

        if joining {
            report(100, TaskStatus::Success, &transcript, None);
            return Ok(());
        }

        // The cluster assignment is already committed. A failure from here
        // on leaves a joined-but-degraded control plane, reported as its
        // own terminal status rather than a plain error.
        for action in &post {
            if let Err(err) = self.apply_post_action(action, session, &mut transcript) {
                let text = err.to_string();
                report(ticks.next(), TaskStatus::Degraded, &transcript, Some(&text));
                return Err(err);
            }
            report(ticks.next(), TaskStatus::InProcess, &transcript, None);
        }

        report(100, TaskStatus::Success, &transcript, None);
        Ok(())
    }

    /// Best-effort decommission of a node. The caller clears the node's
    /// cluster assignment afterwards regardless of the outcome here.
    pub fn remove(&self, session: &dyn RemoteSession, report: ProgressFn) -> Result<()> {
        let steps = self.reset_catalog();
        let mut ticks = ProgressTicks::new(steps.len());
        let mut transcript = String::with_capacity(TRANSCRIPT_INITIAL_SIZE);

        self.run_steps(
            &steps,
            session,
            &mut transcript,
            &mut ticks,
            report,
            TaskStatus::Error,
        )?;

        report(100, TaskStatus::Success, &transcript, None);
        Ok(())
    }

    fn run_steps(
        &self,
        steps: &[CommandStep],
        session: &dyn RemoteSession,
        transcript: &mut String,
        ticks: &mut ProgressTicks,
        report: ProgressFn,
        terminal_on_error: TaskStatus,
    ) -> Result<()> {
        for step in steps {
            match self.exec_step(step, session, transcript) {
                Ok(()) => report(ticks.next(), TaskStatus::InProcess, transcript, None),
                Err(err) => {
                    let text = err.to_string();
                    report(ticks.next(), terminal_on_error, transcript, Some(&text));
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    fn exec_step(
        &self,
        step: &CommandStep,
        session: &dyn RemoteSession,
        transcript: &mut String,
    ) -> Result<()> {
        let outcome = session.exec(&step.command);
        let (stdout, failure) = match outcome {
            Ok(output) => {
                push_transcript(transcript, &step.command, &output.combined());
                let failure = (!output.success).then(|| {
                    let detail = output.stderr.trim();
                    if detail.is_empty() {
                        format!("exit code {}", output.exit_code)
                    } else {
                        format!("exit code {}: {}", output.exit_code, detail)
                    }
                });
                (output.stdout, failure)
            }
            Err(err) => {
                push_transcript(transcript, &step.command, "");
                (String::new(), Some(err.to_string()))
            }
        };

        if let Some(text) = failure {
            if step.policy != RunPolicy::Anyway {
                log_status!("install", "exec failed: {}", first_line(&step.command));
                return Err(Error::RemoteCommand(text));
            }
            log_status!("install", "exec failed, continuing: {}", first_line(&step.command));
        }

        if let Some(parser) = &step.parser {
            // A parser failure means the pipeline cannot safely continue
            // without the data it was meant to extract, whatever the
            // step's execution policy says.
            parser(stdout.as_bytes())?;
        }

        Ok(())
    }

    fn apply_post_action(
        &self,
        action: &PostAction,
        session: &dyn RemoteSession,
        transcript: &mut String,
    ) -> Result<()> {
        match action {
            PostAction::FetchKubeconfig => {
                let lib = UbuntuCommandLib;
                let step = lib.read_admin_conf();
                let output = session.exec(&step.command)?;
                push_transcript(transcript, &step.command, "");
                if !output.success {
                    return Err(Error::RemoteCommand(format!(
                        "reading admin.conf failed: {}",
                        output.stderr.trim()
                    )));
                }
                std::fs::write(&self.kubeconfig_path, output.stdout)?;
                Ok(())
            }
            PostAction::Settle(duration) => {
                (self.settle)(*duration);
                Ok(())
            }
            PostAction::Chart {
                release,
                repo_url,
                chart,
                set_values,
            } => self
                .charts
                .install_chart(release, repo_url, chart, *set_values),
            PostAction::Remote(step) => self.exec_step(step, session, transcript),
        }
    }
}

/// Extract the join endpoint, token and CA certificate hash from
/// `kubeadm init` output. The tool prints a ready-to-run join command;
/// everything after its "kubeadm join " hint has a fixed shape.
pub fn parse_kubeadm_init(output: &[u8]) -> Result<BootstrapCredentials> {
    let text = String::from_utf8_lossy(output);
    let (_, tail) = text
        .split_once("kubeadm join ")
        .ok_or_else(|| Error::Parse("kubeadm init output carries no join command".to_string()))?;

    let pattern = Regex::new(
        r"(?P<endpoint>[a-z0-9_.:-]+) --token (?P<token>[a-z0-9_.-]+) \\\n\s*--discovery-token-ca-cert-hash (?P<hash>[a-z0-9:-]+)",
    )
    .map_err(|e| Error::Parse(e.to_string()))?;

    let caps = pattern
        .captures(tail)
        .ok_or_else(|| Error::Parse("join command did not match expected shape".to_string()))?;

    Ok(BootstrapCredentials {
        token: caps["token"].to_string(),
        endpoint: caps["endpoint"].to_string(),
        ca_cert_hash: caps["hash"].to_string(),
    })
}

/// Percent schedule for one run: `((k * 100) - 1) / total`, capped below
/// 100 so the terminal report is the only one that reaches it.
struct ProgressTicks {
    total: u32,
    k: u32,
}

impl ProgressTicks {
    fn new(total: usize) -> Self {
        Self {
            total: total.max(1) as u32,
            k: 0,
        }
    }

    fn next(&mut self) -> u8 {
        self.k += 1;
        let percent = (self.k * 100).saturating_sub(1) / self.total;
        percent.min(99) as u8
    }
}

fn push_transcript(transcript: &mut String, command: &str, output: &str) {
    let command = command.replace('\n', "\n$ ");
    if !transcript.is_empty() {
        transcript.push('\n');
    }
    transcript.push_str("$ ");
    transcript.push_str(&command);
    transcript.push('\n');
    transcript.push_str(output);
}

fn first_line(command: &str) -> &str {
    command.lines().next().unwrap_or(command)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeAuth;
    use crate::remote::CommandOutput;
    use crate::repository::SqliteRepository;
    use std::net::SocketAddr;
    use std::sync::Mutex;

    const INIT_OUTPUT: &str = "Your Kubernetes control-plane has initialized successfully!\n\
        \n\
        Then you can join any number of worker nodes by running the following on each as root:\n\
        \n\
        kubeadm join 192.168.1.10:6443 --token abcdef.0123456789abcdef \\\n\
        \t--discovery-token-ca-cert-hash sha256:8d0c2f9a3b\n";

    struct ScriptedSession {
        commands: Mutex<Vec<String>>,
        fail_on: Option<&'static str>,
        fail_error: &'static str,
    }

    impl ScriptedSession {
        fn new() -> Self {
            Self {
                commands: Mutex::new(Vec::new()),
                fail_on: None,
                fail_error: "boom",
            }
        }

        fn failing_on(fragment: &'static str, error: &'static str) -> Self {
            Self {
                commands: Mutex::new(Vec::new()),
                fail_on: Some(fragment),
                fail_error: error,
            }
        }

        fn executed(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }
    }

    impl RemoteSession for ScriptedSession {
        fn exec(&self, command: &str) -> Result<CommandOutput> {
            self.commands.lock().unwrap().push(command.to_string());
            if let Some(fragment) = self.fail_on {
                if command.contains(fragment) {
                    return Err(Error::Ssh(self.fail_error.to_string()));
                }
            }
            let stdout = if command.contains("kubeadm init") {
                INIT_OUTPUT.to_string()
            } else if command.contains("cat /etc/kubernetes/admin.conf") {
                "apiVersion: v1\nkind: Config\n".to_string()
            } else {
                String::new()
            };
            Ok(CommandOutput {
                stdout,
                stderr: String::new(),
                success: true,
                exit_code: 0,
            })
        }

        fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    struct RecordingCharts {
        installed: Mutex<Vec<String>>,
        fail_on: Option<&'static str>,
    }

    impl RecordingCharts {
        fn new() -> Self {
            Self {
                installed: Mutex::new(Vec::new()),
                fail_on: None,
            }
        }

        fn failing_on(chart: &'static str) -> Self {
            Self {
                installed: Mutex::new(Vec::new()),
                fail_on: Some(chart),
            }
        }
    }

    impl ChartInstaller for RecordingCharts {
        fn install_chart(
            &self,
            _release: &str,
            _repo_url: &str,
            chart: &str,
            _set_values: Option<&str>,
        ) -> Result<()> {
            if self.fail_on == Some(chart) {
                return Err(Error::Chart(format!("{}: release failed", chart)));
            }
            self.installed.lock().unwrap().push(chart.to_string());
            Ok(())
        }
    }

    struct Report {
        status: TaskStatus,
        percent: u8,
        log: String,
        error: Option<String>,
    }

    fn collect_reports() -> (Arc<Mutex<Vec<Report>>>, impl Fn(u8, TaskStatus, &str, Option<&str>)) {
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reports);
        let report = move |percent, status, log: &str, error: Option<&str>| {
            sink.lock().unwrap().push(Report {
                status,
                percent,
                log: log.to_string(),
                error: error.map(str::to_string),
            });
        };
        (reports, report)
    }

    fn test_node(id: i64, ip: &str) -> FullNode {
        FullNode {
            id,
            name: format!("node-{}", id),
            addr: format!("{}:22", ip).parse::<SocketAddr>().unwrap(),
            login: "ubuntu".to_string(),
            auth: NodeAuth::Password("pw".to_string()),
            cluster_id: 0,
            is_control_plane: false,
        }
    }

    fn test_installer(
        repo: Arc<dyn Repository>,
        charts: Arc<dyn ChartInstaller>,
    ) -> (Installer, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let installer = Installer::new(repo, charts)
            .with_kubeconfig_path(dir.path().join("config"))
            .with_settle(|_| {});
        (installer, dir)
    }

    #[test]
    fn parses_join_credentials_from_init_output() {
        let creds = parse_kubeadm_init(INIT_OUTPUT.as_bytes()).unwrap();
        assert_eq!(creds.endpoint, "192.168.1.10:6443");
        assert_eq!(creds.token, "abcdef.0123456789abcdef");
        assert_eq!(creds.ca_cert_hash, "sha256:8d0c2f9a3b");
    }

    #[test]
    fn init_output_without_join_hint_is_a_parse_error() {
        let err = parse_kubeadm_init(b"something went sideways").unwrap_err();
        assert_eq!(err.code(), "PARSE_ERROR");
    }

    #[test]
    fn malformed_join_command_is_a_parse_error() {
        let err = parse_kubeadm_init(b"kubeadm join 10.0.0.1:6443 --token only").unwrap_err();
        assert_eq!(err.code(), "PARSE_ERROR");
    }

    #[test]
    fn percent_schedule_is_monotonic_and_capped() {
        let mut ticks = ProgressTicks::new(7);
        let mut last = 0;
        for _ in 0..7 {
            let percent = ticks.next();
            assert!(percent >= last);
            assert!(percent < 100);
            last = percent;
        }
        assert_eq!(last, 99);
    }

    #[test]
    fn transcript_prefixes_every_embedded_command_line() {
        let mut transcript = String::new();
        push_transcript(&mut transcript, "sudo apt-get update\nsudo apt-get install -y cri-o", "ok");
        assert_eq!(
            transcript,
            "$ sudo apt-get update\n$ sudo apt-get install -y cri-o\nok"
        );
    }

    #[test]
    fn required_failure_aborts_and_skips_later_steps() {
        let repo: Arc<dyn Repository> = Arc::new(SqliteRepository::open_in_memory().unwrap());
        let charts = Arc::new(RecordingCharts::new());
        let (installer, _dir) = test_installer(Arc::clone(&repo), charts);
        let session = ScriptedSession::failing_on("swapoff", "boom");
        let (reports, report) = collect_reports();

        let err = installer
            .install(&session, &test_node(1, "10.0.0.1"), &report)
            .unwrap_err();
        assert!(err.to_string().contains("boom"));

        // Nothing after the failing step reached the session.
        let executed = session.executed();
        assert!(executed.iter().any(|c| c.contains("swapoff")));
        assert!(!executed.iter().any(|c| c.contains("kubeadm")));

        let reports = reports.lock().unwrap();
        let last = reports.last().unwrap();
        assert_eq!(last.status, TaskStatus::Error);
        assert!(last.error.as_deref().unwrap().contains("boom"));
        assert!(last.log.contains("swapoff"));

        // Exactly one terminal report.
        assert_eq!(reports.iter().filter(|r| r.status.is_terminal()).count(), 1);
    }

    #[test]
    fn anyway_failure_is_swallowed_and_pipeline_continues() {
        let repo: Arc<dyn Repository> = Arc::new(SqliteRepository::open_in_memory().unwrap());
        let node_id = repo
            .add_node(&crate::node::NewNode {
                name: "cp".to_string(),
                addr: "10.0.0.1:22".parse().unwrap(),
                login: "ubuntu".to_string(),
                auth: NodeAuth::Password("pw".to_string()),
            })
            .unwrap();
        let (installer, _dir) =
            test_installer(Arc::clone(&repo), Arc::new(RecordingCharts::new()));
        let (reports, report) = collect_reports();

        // place_kubeconfig is the catalog's Anyway step; make it the only
        // failure by scripting the fragment it contains.
        let session = ScriptedSession {
            fail_on: Some("cp -i /etc/kubernetes/admin.conf $HOME"),
            ..ScriptedSession::new()
        };

        installer
            .install(&session, &test_node(node_id, "10.0.0.1"), &report)
            .unwrap();

        let reports = reports.lock().unwrap();
        let last = reports.last().unwrap();
        assert_eq!(last.status, TaskStatus::Success);
        assert_eq!(last.percent, 100);
        assert_eq!(reports.iter().filter(|r| r.status == TaskStatus::Error).count(), 0);
    }

    #[test]
    fn control_plane_path_sets_bootstrap_record_and_runs_addons() {
        let repo: Arc<dyn Repository> = Arc::new(SqliteRepository::open_in_memory().unwrap());
        let node_id = repo
            .add_node(&crate::node::NewNode {
                name: "node-1".to_string(),
                addr: "192.168.1.10:22".parse().unwrap(),
                login: "ubuntu".to_string(),
                auth: NodeAuth::Password("pw".to_string()),
            })
            .unwrap();
        let charts = Arc::new(RecordingCharts::new());
        let charts_seam: Arc<dyn ChartInstaller> = charts.clone();
        let (installer, dir) = test_installer(Arc::clone(&repo), charts_seam);
        let session = ScriptedSession::new();
        let (reports, report) = collect_reports();

        let node = test_node(node_id, "192.168.1.10");
        installer.install(&session, &node, &report).unwrap();

        // Bootstrap record extracted from kubeadm init output.
        let state = repo.cluster_bootstrap(DEFAULT_CLUSTER_ID).unwrap();
        let BootstrapState::Bootstrapped(creds) = state else {
            panic!("expected bootstrap record");
        };
        assert_eq!(creds.endpoint, "192.168.1.10:6443");

        // Node committed to the cluster as the control plane.
        let stored = repo.get_full_node(node_id).unwrap();
        assert_eq!(stored.cluster_id, DEFAULT_CLUSTER_ID);
        assert!(stored.is_control_plane);

        // Kubeconfig fetched and persisted locally.
        let config = std::fs::read_to_string(dir.path().join("config")).unwrap();
        assert!(config.contains("kind: Config"));

        // Client-side charts all installed.
        assert_eq!(
            *charts.installed.lock().unwrap(),
            vec!["metallb", "nginx-ingress-controller", "grafana"]
        );

        // Progress is monotonic and ends with the single terminal 100.
        let reports = reports.lock().unwrap();
        let mut last = 0u8;
        for r in reports.iter() {
            assert!(r.percent >= last, "{} < {}", r.percent, last);
            last = r.percent;
        }
        assert_eq!(reports.last().unwrap().percent, 100);
        assert_eq!(reports.last().unwrap().status, TaskStatus::Success);
        assert_eq!(reports.iter().filter(|r| r.status.is_terminal()).count(), 1);
    }

    #[test]
    fn worker_path_joins_with_stored_credentials() {
        let repo: Arc<dyn Repository> = Arc::new(SqliteRepository::open_in_memory().unwrap());
        repo.set_cluster_bootstrap(
            DEFAULT_CLUSTER_ID,
            &BootstrapCredentials {
                token: "abcdef.0123456789abcdef".to_string(),
                endpoint: "192.168.1.10:6443".to_string(),
                ca_cert_hash: "sha256:8d0c2f9a3b".to_string(),
            },
        )
        .unwrap();
        // The joining worker must exist for the assignment write.
        let node_id = repo
            .add_node(&crate::node::NewNode {
                name: "worker".to_string(),
                addr: "192.168.1.11:22".parse().unwrap(),
                login: "ubuntu".to_string(),
                auth: NodeAuth::Password("pw".to_string()),
            })
            .unwrap();

        let charts = Arc::new(RecordingCharts::new());
        let charts_seam: Arc<dyn ChartInstaller> = charts.clone();
        let (installer, _dir) = test_installer(Arc::clone(&repo), charts_seam);
        let session = ScriptedSession::new();
        let (reports, report) = collect_reports();

        let mut node = test_node(node_id, "192.168.1.11");
        node.name = "worker".to_string();
        installer.install(&session, &node, &report).unwrap();

        // Exactly one join step, parameterized with the stored record.
        let joins: Vec<_> = session
            .executed()
            .into_iter()
            .filter(|c| c.contains("kubeadm join"))
            .collect();
        assert_eq!(joins.len(), 1);
        assert!(joins[0].contains("192.168.1.10:6443"));
        assert!(joins[0].contains("--token abcdef.0123456789abcdef"));
        assert!(joins[0].contains("--discovery-token-ca-cert-hash sha256:8d0c2f9a3b"));

        // No init, no add-ons on the worker path.
        assert!(!session.executed().iter().any(|c| c.contains("kubeadm init")));
        assert!(charts.installed.lock().unwrap().is_empty());

        let stored = repo.get_full_node(node_id).unwrap();
        assert_eq!(stored.cluster_id, DEFAULT_CLUSTER_ID);
        assert!(!stored.is_control_plane);

        let reports = reports.lock().unwrap();
        assert_eq!(reports.last().unwrap().status, TaskStatus::Success);
    }

    #[test]
    fn chart_failure_after_assignment_reports_degraded() {
        let repo: Arc<dyn Repository> = Arc::new(SqliteRepository::open_in_memory().unwrap());
        let node_id = repo
            .add_node(&crate::node::NewNode {
                name: "cp".to_string(),
                addr: "10.0.0.1:22".parse().unwrap(),
                login: "ubuntu".to_string(),
                auth: NodeAuth::Password("pw".to_string()),
            })
            .unwrap();
        let charts = Arc::new(RecordingCharts::failing_on("metallb"));
        let (installer, _dir) = test_installer(Arc::clone(&repo), charts);
        let session = ScriptedSession::new();
        let (reports, report) = collect_reports();

        let err = installer
            .install(&session, &test_node(node_id, "10.0.0.1"), &report)
            .unwrap_err();
        assert_eq!(err.code(), "CHART_ERROR");

        let reports = reports.lock().unwrap();
        let last = reports.last().unwrap();
        assert_eq!(last.status, TaskStatus::Degraded);
        assert!(last.error.as_deref().unwrap().contains("metallb"));

        // The assignment stays committed: degraded, not rolled back.
        let stored = repo.get_full_node(node_id).unwrap();
        assert_eq!(stored.cluster_id, DEFAULT_CLUSTER_ID);
    }

    #[test]
    fn parser_error_aborts_the_run() {
        let repo: Arc<dyn Repository> = Arc::new(SqliteRepository::open_in_memory().unwrap());
        let (installer, _dir) = test_installer(Arc::clone(&repo), Arc::new(RecordingCharts::new()));
        let (reports, report) = collect_reports();

        // Session succeeds on every command but returns init output with
        // no join hint, so credential extraction must fail the run.
        struct NoJoinSession(ScriptedSession);
        impl RemoteSession for NoJoinSession {
            fn exec(&self, command: &str) -> Result<CommandOutput> {
                let mut out = self.0.exec(command)?;
                if command.contains("kubeadm init") {
                    out.stdout = "initialized, but the join hint is gone".to_string();
                }
                Ok(out)
            }
            fn close(&self) -> Result<()> {
                Ok(())
            }
        }

        let session = NoJoinSession(ScriptedSession::new());
        let err = installer
            .install(&session, &test_node(1, "10.0.0.1"), &report)
            .unwrap_err();
        assert_eq!(err.code(), "PARSE_ERROR");

        let reports = reports.lock().unwrap();
        assert_eq!(reports.last().unwrap().status, TaskStatus::Error);
        // No bootstrap record was written.
        assert_eq!(
            repo.cluster_bootstrap(DEFAULT_CLUSTER_ID).unwrap(),
            BootstrapState::Unbootstrapped
        );
    }

    #[test]
    fn remove_tolerates_anyway_failures() {
        let repo: Arc<dyn Repository> = Arc::new(SqliteRepository::open_in_memory().unwrap());
        let (installer, _dir) = test_installer(repo, Arc::new(RecordingCharts::new()));
        // Interface teardown fails; the reset pipeline still completes.
        let session = ScriptedSession::failing_on("ip link set cni0 down", "no such device");
        let (reports, report) = collect_reports();

        installer.remove(&session, &report).unwrap();

        // All six reset steps ran despite the mid-catalog failure.
        assert_eq!(session.executed().len(), 6);
        let reports = reports.lock().unwrap();
        assert_eq!(reports.last().unwrap().status, TaskStatus::Success);
        assert_eq!(reports.last().unwrap().percent, 100);
    }

    #[test]
    fn remove_aborts_when_reset_itself_fails() {
        let repo: Arc<dyn Repository> = Arc::new(SqliteRepository::open_in_memory().unwrap());
        let (installer, _dir) = test_installer(repo, Arc::new(RecordingCharts::new()));
        let session = ScriptedSession::failing_on("kubeadm reset", "boom");
        let (reports, report) = collect_reports();

        let err = installer.remove(&session, &report).unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert_eq!(session.executed().len(), 1);
        let reports = reports.lock().unwrap();
        assert_eq!(reports.last().unwrap().status, TaskStatus::Error);
    }
}
