//! Tool adapters
//!
//! An adapter wraps one external reconnaissance tool behind a uniform
//! contract. The executor only ever talks to tools through this trait:
//! it validates the target, builds a command, executes it, captures the raw
//! output as evidence and finally asks the adapter to turn that evidence into
//! findings.

mod process;

pub use process::{ProcessAdapter, ProcessAdapterSpec, load_process_adapters, output_path};

use async_trait::async_trait;
use recon_core::domain::evidence::Evidence;
use recon_core::domain::finding::Finding;
use recon_core::domain::target::Target;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("tool binary '{0}' not found")]
    ToolNotFound(String),

    #[error("failed to build command: {0}")]
    Build(String),

    #[error("failed to parse tool output: {0}")]
    Parse(String),

    #[error("adapter '{0}' is already registered")]
    Duplicate(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Fully resolved command line for one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Human readable command line, recorded on the run and in evidence
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Per-attempt knobs handed to `build_command`
#[derive(Debug, Clone, Default)]
pub struct CommandOptions {
    pub timeout: Duration,
    pub explicit_approval: bool,
}

/// Context of the attempt being executed
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub job_id: Uuid,
    pub run_id: Uuid,
    pub attempt: u32,
    pub timeout: Duration,
    /// Cancelled when the job is cancelled; adapters may stop early
    pub cancel: CancellationToken,
}

/// Raw result of running a tool
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
}

impl ExecutionOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Contract every reconnaissance tool integration implements
///
/// # Example
///
/// ```rust,ignore
/// struct Echo;
///
/// #[async_trait]
/// impl ToolAdapter for Echo {
///     fn name(&self) -> &str { "echo" }
///
///     fn build_command(&self, target: &Target, _: &Path, _: &CommandOptions)
///         -> Result<CommandSpec, AdapterError> {
///         Ok(CommandSpec::new("echo").arg(target.value.clone()))
///     }
///
///     async fn execute(&self, command: &CommandSpec, ctx: &ExecutionContext)
///         -> Result<ExecutionOutput, AdapterError> { /* ... */ }
/// }
/// ```
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    /// Tool identifier; must match the tool name used in policies and job
    /// requests
    fn name(&self) -> &str;

    /// Tool version recorded in evidence, when known
    async fn version(&self) -> Option<String> {
        None
    }

    /// Rejects targets this tool cannot handle, e.g. a URL for a port scanner
    fn validate_target(&self, _target: &Target) -> Result<(), String> {
        Ok(())
    }

    /// Builds the command line for one attempt
    ///
    /// # Arguments
    /// * `target` - The normalized target
    /// * `output_path` - Per-run file path the tool may write results to
    /// * `options` - Attempt options (timeout, approval)
    fn build_command(
        &self,
        target: &Target,
        output_path: &Path,
        options: &CommandOptions,
    ) -> Result<CommandSpec, AdapterError>;

    /// Runs the command to completion
    ///
    /// The executor enforces the timeout by dropping this future, so
    /// implementations must release any child process when dropped.
    async fn execute(
        &self,
        command: &CommandSpec,
        ctx: &ExecutionContext,
    ) -> Result<ExecutionOutput, AdapterError>;

    /// Parses captured evidence into a tool specific structured value
    fn parse_output(&self, evidence: &Evidence) -> Result<serde_json::Value, AdapterError> {
        serde_json::from_slice(&evidence.stdout).map_err(|e| AdapterError::Parse(e.to_string()))
    }

    /// Normalizes parsed output into findings
    fn to_findings(&self, parsed: &serde_json::Value, run_id: Uuid, evidence_id: Uuid)
    -> Vec<Finding>;
}

/// Registry of tool adapters, resolved once when the executor starts
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn ToolAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an adapter under its own name
    ///
    /// # Errors
    /// Returns `AdapterError::Duplicate` if the name is already taken
    pub fn register(&mut self, adapter: Arc<dyn ToolAdapter>) -> Result<(), AdapterError> {
        let name = adapter.name().to_string();
        if self.adapters.contains_key(&name) {
            return Err(AdapterError::Duplicate(name));
        }
        tracing::debug!("Registered adapter '{}'", name);
        self.adapters.insert(name, adapter);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolAdapter>> {
        self.adapters.get(name).cloned()
    }

    /// Registered tool names in sorted order
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop(&'static str);

    #[async_trait]
    impl ToolAdapter for Noop {
        fn name(&self) -> &str {
            self.0
        }

        fn build_command(
            &self,
            target: &Target,
            _output_path: &Path,
            _options: &CommandOptions,
        ) -> Result<CommandSpec, AdapterError> {
            Ok(CommandSpec::new("true").arg(target.value.clone()))
        }

        async fn execute(
            &self,
            _command: &CommandSpec,
            _ctx: &ExecutionContext,
        ) -> Result<ExecutionOutput, AdapterError> {
            Ok(ExecutionOutput::default())
        }

        fn to_findings(&self, _: &serde_json::Value, _: Uuid, _: Uuid) -> Vec<Finding> {
            Vec::new()
        }
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(Noop("nmap"))).unwrap();
        registry.register(Arc::new(Noop("amass"))).unwrap();

        let err = registry.register(Arc::new(Noop("nmap"))).unwrap_err();
        assert!(matches!(err, AdapterError::Duplicate(name) if name == "nmap"));
        assert_eq!(registry.names(), vec!["amass", "nmap"]);
        assert!(registry.get("nmap").is_some());
        assert!(registry.get("masscan").is_none());
    }

    #[test]
    fn test_command_display() {
        let command = CommandSpec::new("nmap").arg("-sV").arg("10.0.0.1");
        assert_eq!(command.display(), "nmap -sV 10.0.0.1");
    }
}
