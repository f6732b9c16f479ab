//! Chart-based software installation, consumed by the installer through a
//! narrow seam. The shipped implementation drives a local `helm` binary
//! against the kubeconfig fetched during control-plane bootstrap.

use crate::error::{Error, Result};
use crate::ssh::execute_local_command;
use crate::utils::shell::{quote_arg, quote_path};
use std::path::PathBuf;

pub trait ChartInstaller: Send + Sync {
    fn install_chart(
        &self,
        release: &str,
        repo_url: &str,
        chart: &str,
        set_values: Option<&str>,
    ) -> Result<()>;
}

pub struct HelmCli {
    kubeconfig: PathBuf,
}

impl HelmCli {
    pub fn new(kubeconfig: impl Into<PathBuf>) -> Self {
        Self {
            kubeconfig: kubeconfig.into(),
        }
    }
}

impl ChartInstaller for HelmCli {
    fn install_chart(
        &self,
        release: &str,
        repo_url: &str,
        chart: &str,
        set_values: Option<&str>,
    ) -> Result<()> {
        let mut command = format!(
            "helm upgrade --install {} {} --repo {} --kubeconfig {} --wait --timeout 5m",
            quote_arg(release),
            quote_arg(chart),
            quote_arg(repo_url),
            quote_path(&self.kubeconfig.to_string_lossy()),
        );
        if let Some(values) = set_values {
            command.push_str(" --set ");
            command.push_str(&quote_arg(values));
        }

        log_status!("helm", "installing chart {} as {}", chart, release);
        let output = execute_local_command(&command);
        if !output.success {
            let detail = if output.stderr.trim().is_empty() {
                format!("exit code {}", output.exit_code)
            } else {
                output.stderr.trim().to_string()
            };
            return Err(Error::Chart(format!("{}: {}", chart, detail)));
        }
        Ok(())
    }
}
