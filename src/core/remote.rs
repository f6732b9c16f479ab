use crate::error::Result;
use crate::node::FullNode;

/// Captured result of one remote (or local) command execution.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub exit_code: i32,
}

impl CommandOutput {
    /// stdout and stderr joined for transcript purposes.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            return self.stdout.clone();
        }
        if self.stdout.is_empty() {
            return self.stderr.clone();
        }
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

/// An open shell session against one host.
///
/// `exec` returns `Err` only for transport-level failures (connection
/// refused, session torn down). A command that ran but exited non-zero
/// comes back as `Ok` with `success == false`.
pub trait RemoteSession: Send {
    fn exec(&self, command: &str) -> Result<CommandOutput>;
    fn close(&self) -> Result<()>;
}

/// Opens authenticated sessions from stored node credentials.
pub trait SessionFactory: Send + Sync {
    fn connect(&self, node: &FullNode) -> Result<Box<dyn RemoteSession>>;
}
