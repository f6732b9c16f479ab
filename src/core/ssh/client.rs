use crate::error::{Error, Result};
use crate::node::{FullNode, NodeAuth};
use crate::remote::{CommandOutput, RemoteSession, SessionFactory};
use std::process::Command;

#[derive(Debug, Clone)]
pub enum SshAuth {
    Password(String),
    IdentityFile(String),
}

pub struct SshClient {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub auth: SshAuth,
    /// When true, all commands run locally instead of over SSH.
    /// Set automatically when the node host is localhost/127.0.0.1/::1.
    pub is_local: bool,
}

impl SshClient {
    pub fn from_node(node: &FullNode) -> Result<Self> {
        let auth = match &node.auth {
            NodeAuth::Password(password) => SshAuth::Password(password.clone()),
            NodeAuth::IdentityFile(path) => {
                let expanded = shellexpand::tilde(path).to_string();
                if !std::path::Path::new(&expanded).exists() {
                    return Err(Error::Ssh(format!(
                        "identity file not found for node '{}': {}",
                        node.name, expanded
                    )));
                }
                SshAuth::IdentityFile(expanded)
            }
        };

        let host = node.addr.ip().to_string();
        let is_local = is_local_host(&host);
        if is_local {
            log_status!("ssh", "Node '{}' is localhost — using local execution", node.name);
        }

        Ok(Self {
            host,
            user: node.login.clone(),
            port: node.addr.port(),
            auth,
            is_local,
        })
    }

    fn build_ssh_args(&self, command: &str) -> Vec<String> {
        let mut args = Vec::new();

        match &self.auth {
            SshAuth::IdentityFile(identity_file) => {
                args.push("-i".to_string());
                args.push(identity_file.clone());
                // BatchMode prevents hangs on unexpected auth prompts, but
                // would defeat sshpass-driven password auth.
                args.push("-o".to_string());
                args.push("BatchMode=yes".to_string());
            }
            SshAuth::Password(_) => {
                args.push("-o".to_string());
                args.push("StrictHostKeyChecking=accept-new".to_string());
            }
        }

        if self.port != 22 {
            args.push("-p".to_string());
            args.push(self.port.to_string());
        }

        // Timeout and keepalive options to prevent hangs on stalled
        // connections during long package installs.
        args.extend([
            "-o".to_string(),
            "ConnectTimeout=10".to_string(),
            "-o".to_string(),
            "ServerAliveInterval=15".to_string(),
            "-o".to_string(),
            "ServerAliveCountMax=3".to_string(),
        ]);

        args.push(format!("{}@{}", self.user, self.host));
        args.push(command.to_string());

        args
    }

    pub fn execute(&self, command: &str) -> CommandOutput {
        self.execute_with_retry(command, 3)
    }

    fn execute_with_retry(&self, command: &str, max_attempts: u32) -> CommandOutput {
        let backoff_secs = [0, 2, 5]; // delays before retry 1, 2, 3

        for attempt in 0..max_attempts {
            let result = self.execute_once(command);

            // Only retry on transient connection errors, not command failures
            if result.success || attempt + 1 >= max_attempts || !is_transient_ssh_error(&result) {
                return result;
            }

            let delay = backoff_secs.get(attempt as usize + 1).copied().unwrap_or(5);
            log_status!(
                "ssh",
                "Connection failed (attempt {}/{}), retrying in {}s...",
                attempt + 1,
                max_attempts,
                delay
            );
            std::thread::sleep(std::time::Duration::from_secs(delay));
        }

        // Unreachable, but satisfy the compiler
        CommandOutput {
            stdout: String::new(),
            stderr: "SSH retry exhausted".to_string(),
            success: false,
            exit_code: -1,
        }
    }

    fn execute_once(&self, command: &str) -> CommandOutput {
        // Local execution: run command directly instead of over SSH
        if self.is_local {
            return execute_local_command(command);
        }

        let args = self.build_ssh_args(command);

        let mut cmd = match &self.auth {
            SshAuth::Password(password) => {
                let mut cmd = Command::new("sshpass");
                cmd.arg("-p").arg(password).arg("ssh");
                cmd
            }
            SshAuth::IdentityFile(_) => Command::new("ssh"),
        };
        cmd.args(&args);

        match cmd.output() {
            Ok(out) => CommandOutput {
                stdout: String::from_utf8_lossy(&out.stdout).to_string(),
                stderr: String::from_utf8_lossy(&out.stderr).to_string(),
                success: out.status.success(),
                exit_code: out.status.code().unwrap_or(-1),
            },
            Err(e) => CommandOutput {
                stdout: String::new(),
                stderr: format!("SSH error: {}", e),
                success: false,
                exit_code: -1,
            },
        }
    }
}

impl RemoteSession for SshClient {
    fn exec(&self, command: &str) -> Result<CommandOutput> {
        let output = self.execute(command);
        // SSH exit code 255 = connection error (not a remote command failure)
        if !output.success && (output.exit_code == 255 || output.exit_code == -1) {
            return Err(Error::Ssh(output.stderr.trim().to_string()));
        }
        Ok(output)
    }

    fn close(&self) -> Result<()> {
        // Process-per-command transport holds no persistent session.
        Ok(())
    }
}

pub struct SshSessionFactory;

impl SessionFactory for SshSessionFactory {
    fn connect(&self, node: &FullNode) -> Result<Box<dyn RemoteSession>> {
        Ok(Box::new(SshClient::from_node(node)?))
    }
}

pub fn execute_local_command(command: &str) -> CommandOutput {
    #[cfg(windows)]
    let mut cmd = {
        let mut cmd = Command::new("cmd");
        cmd.args(["/C", command]);
        cmd
    };

    #[cfg(not(windows))]
    let mut cmd = {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", command]);
        cmd
    };

    match cmd.output() {
        Ok(out) => CommandOutput {
            stdout: String::from_utf8_lossy(&out.stdout).to_string(),
            stderr: String::from_utf8_lossy(&out.stderr).to_string(),
            success: out.status.success(),
            exit_code: out.status.code().unwrap_or(-1),
        },
        Err(e) => CommandOutput {
            stdout: String::new(),
            stderr: format!("Command error: {}", e),
            success: false,
            exit_code: -1,
        },
    }
}

/// Check if a host address refers to the local machine.
pub fn is_local_host(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1")
}

/// Check if an SSH failure is a transient connection error worth retrying.
fn is_transient_ssh_error(output: &CommandOutput) -> bool {
    let stderr = output.stderr.to_lowercase();
    // SSH exit code 255 = connection error (not a remote command failure)
    let is_connection_exit = output.exit_code == 255;

    let transient_patterns = [
        "connection refused",
        "connection reset",
        "connection timed out",
        "no route to host",
        "network is unreachable",
        "temporary failure in name resolution",
        "could not resolve hostname",
        "broken pipe",
        "ssh_exchange_identification",
        "connection closed by remote host",
    ];

    is_connection_exit || transient_patterns.iter().any(|p| stderr.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_host_detection() {
        assert!(is_local_host("localhost"));
        assert!(is_local_host("127.0.0.1"));
        assert!(is_local_host("::1"));
        assert!(!is_local_host("10.0.0.5"));
    }

    #[test]
    fn transient_error_on_exit_255() {
        let out = CommandOutput {
            stdout: String::new(),
            stderr: "kex_exchange_identification: read: Connection reset".to_string(),
            success: false,
            exit_code: 255,
        };
        assert!(is_transient_ssh_error(&out));
    }

    #[test]
    fn command_failure_is_not_transient() {
        let out = CommandOutput {
            stdout: String::new(),
            stderr: "E: Unable to locate package cri-o".to_string(),
            success: false,
            exit_code: 100,
        };
        assert!(!is_transient_ssh_error(&out));
    }

    #[test]
    fn combined_output_joins_streams() {
        let out = CommandOutput {
            stdout: "out".to_string(),
            stderr: "err".to_string(),
            success: true,
            exit_code: 0,
        };
        assert_eq!(out.combined(), "out\nerr");
    }
}
