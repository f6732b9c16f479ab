//! Remote operation definitions: a command, an optional output parser and
//! a failure policy, assembled into ordered catalogs per OS family.

use crate::error::Result;

pub mod ubuntu;

/// Failure policy for a single remote step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPolicy {
    /// Reserved: success here would short-circuit the rest of the chain.
    /// Modeled for catalog completeness, not exercised by current catalogs.
    Sufficient,
    /// Failure aborts the remaining pipeline.
    Required,
    /// Failure is logged and the pipeline continues.
    Anyway,
}

/// Inspects raw command output after a step ran. Used to recover cluster
/// bootstrap credentials from `kubeadm init` output.
pub type OutputParser = Box<dyn Fn(&[u8]) -> Result<()> + Send>;

pub struct CommandStep {
    pub command: String,
    pub parser: Option<OutputParser>,
    pub policy: RunPolicy,
}

impl CommandStep {
    pub fn required(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            parser: None,
            policy: RunPolicy::Required,
        }
    }

    pub fn anyway(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            parser: None,
            policy: RunPolicy::Anyway,
        }
    }

    pub fn with_parser(mut self, parser: OutputParser) -> Self {
        self.parser = Some(parser);
        self
    }
}

impl std::fmt::Debug for CommandStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandStep")
            .field("command", &self.command)
            .field("policy", &self.policy)
            .field("parser", &self.parser.is_some())
            .finish()
    }
}
