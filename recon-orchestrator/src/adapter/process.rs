//! Generic subprocess adapter
//!
//! Wraps any command line tool described in the adapters file. Arguments are
//! templates where `{target}`, `{host}` and `{output}` are substituted per
//! attempt.
//!
//! ```yaml
//! - name: nmap
//!   program: nmap
//!   args: ["-sV", "-oX", "{output}", "{host}"]
//!   version_args: ["--version"]
//!   target_types: [ip, cidr, domain]
//! ```

use super::{
    AdapterError, CommandOptions, CommandSpec, ExecutionContext, ExecutionOutput, ToolAdapter,
};
use async_trait::async_trait;
use recon_core::domain::evidence::Evidence;
use recon_core::domain::finding::{Finding, Severity};
use recon_core::domain::target::{Target, TargetType};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, warn};
use uuid::Uuid;

/// One entry of the adapters file
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProcessAdapterSpec {
    pub name: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub version_args: Vec<String>,
    /// Accepted target types; empty accepts every type
    #[serde(default)]
    pub target_types: Vec<TargetType>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Upper bound on the `version_args` invocation
    #[serde(default = "default_version_timeout_secs")]
    pub version_timeout_secs: u64,
}

fn default_version_timeout_secs() -> u64 {
    10
}

/// Loads adapter definitions from a YAML file
pub fn load_process_adapters(path: &Path) -> anyhow::Result<Vec<ProcessAdapter>> {
    use anyhow::Context;

    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read adapters file {}", path.display()))?;
    let specs: Vec<ProcessAdapterSpec> = serde_yaml::from_str(&raw)
        .with_context(|| format!("Failed to parse adapters file {}", path.display()))?;

    Ok(specs.into_iter().map(ProcessAdapter::new).collect())
}

pub struct ProcessAdapter {
    spec: ProcessAdapterSpec,
    version: OnceCell<Option<String>>,
}

impl ProcessAdapter {
    pub fn new(spec: ProcessAdapterSpec) -> Self {
        Self {
            spec,
            version: OnceCell::new(),
        }
    }

    fn render(&self, template: &str, target: &Target, output_path: &Path) -> String {
        template
            .replace("{target}", &target.value)
            .replace("{host}", &target.limit_key())
            .replace("{output}", &output_path.display().to_string())
    }

    async fn query_version(&self) -> Option<String> {
        if self.spec.version_args.is_empty() {
            return None;
        }

        let bound = Duration::from_secs(self.spec.version_timeout_secs);
        let output = tokio::time::timeout(
            bound,
            Command::new(&self.spec.program)
                .args(&self.spec.version_args)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await;

        let output = match output {
            Ok(output) => output,
            Err(_) => {
                warn!(
                    "Version query for '{}' did not finish within {:?}",
                    self.spec.name, bound
                );
                return None;
            }
        };

        match output {
            Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout)
                .lines()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .map(str::to_string),
            Ok(output) => {
                debug!(
                    "Version query for '{}' exited with {:?}",
                    self.spec.name,
                    output.status.code()
                );
                None
            }
            Err(e) => {
                warn!("Version query for '{}' failed: {}", self.spec.name, e);
                None
            }
        }
    }
}

#[async_trait]
impl ToolAdapter for ProcessAdapter {
    fn name(&self) -> &str {
        &self.spec.name
    }

    async fn version(&self) -> Option<String> {
        self.version
            .get_or_init(|| self.query_version())
            .await
            .clone()
    }

    fn validate_target(&self, target: &Target) -> Result<(), String> {
        if self.spec.target_types.is_empty() || self.spec.target_types.contains(&target.target_type)
        {
            Ok(())
        } else {
            Err(format!(
                "{} does not accept {:?} targets",
                self.spec.name, target.target_type
            ))
        }
    }

    fn build_command(
        &self,
        target: &Target,
        output_path: &Path,
        _options: &CommandOptions,
    ) -> Result<CommandSpec, AdapterError> {
        if self.spec.program.trim().is_empty() {
            return Err(AdapterError::Build(format!(
                "adapter '{}' has no program",
                self.spec.name
            )));
        }

        Ok(CommandSpec {
            program: self.spec.program.clone(),
            args: self
                .spec
                .args
                .iter()
                .map(|arg| self.render(arg, target, output_path))
                .collect(),
            env: self
                .spec
                .env
                .iter()
                .map(|(k, v)| (k.clone(), self.render(v, target, output_path)))
                .collect(),
        })
    }

    async fn execute(
        &self,
        command: &CommandSpec,
        ctx: &ExecutionContext,
    ) -> Result<ExecutionOutput, AdapterError> {
        debug!(
            "Run {} attempt {}: {}",
            ctx.run_id,
            ctx.attempt,
            command.display()
        );

        let child = Command::new(&command.program)
            .args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => AdapterError::ToolNotFound(command.program.clone()),
                _ => AdapterError::Io(e),
            })?;

        let output = child.wait_with_output().await?;

        Ok(ExecutionOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.status.code(),
        })
    }

    /// JSON output is taken as is; anything else becomes an array of its
    /// non-empty lines
    fn parse_output(&self, evidence: &Evidence) -> Result<serde_json::Value, AdapterError> {
        let text = evidence.stdout_lossy();
        let trimmed = text.trim_start();

        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            return serde_json::from_str(trimmed).map_err(|e| AdapterError::Parse(e.to_string()));
        }

        Ok(serde_json::Value::Array(
            text.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(|line| serde_json::Value::String(line.to_string()))
                .collect(),
        ))
    }

    fn to_findings(
        &self,
        parsed: &serde_json::Value,
        run_id: Uuid,
        evidence_id: Uuid,
    ) -> Vec<Finding> {
        let items: Vec<&serde_json::Value> = match parsed {
            serde_json::Value::Array(items) => items.iter().collect(),
            serde_json::Value::Null => Vec::new(),
            other => vec![other],
        };

        items
            .into_iter()
            .map(|item| Finding {
                id: Uuid::new_v4(),
                run_id,
                evidence_id,
                tool: self.spec.name.clone(),
                title: finding_title(item),
                severity: Severity::Info,
                details: item.clone(),
            })
            .collect()
    }
}

fn finding_title(item: &serde_json::Value) -> String {
    match item {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Object(map) => ["title", "name", "host"]
            .iter()
            .find_map(|key| map.get(*key).and_then(|v| v.as_str()))
            .map(str::to_string)
            .unwrap_or_else(|| item.to_string()),
        other => other.to_string(),
    }
}

/// Per-run output path under `root`
pub fn output_path(root: &Path, job_id: Uuid, tool: &str, run_id: Uuid) -> PathBuf {
    root.join(job_id.to_string()).join(format!("{}-{}", tool, run_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use recon_core::domain::target::Scope;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn adapter(program: &str, args: &[&str]) -> ProcessAdapter {
        ProcessAdapter::new(ProcessAdapterSpec {
            name: "scanner".to_string(),
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            version_args: Vec::new(),
            target_types: vec![TargetType::Domain, TargetType::Ip],
            env: BTreeMap::new(),
            version_timeout_secs: 10,
        })
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext {
            job_id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            attempt: 1,
            timeout: Duration::from_secs(10),
            cancel: CancellationToken::new(),
        }
    }

    fn evidence(stdout: &str) -> Evidence {
        Evidence::capture(
            Uuid::new_v4(),
            "scanner".to_string(),
            None,
            stdout.as_bytes().to_vec(),
            Vec::new(),
            Some(0),
        )
    }

    #[test]
    fn test_build_command_substitutes_placeholders() {
        let adapter = adapter("scan", &["--out", "{output}", "{host}", "{target}"]);
        let target = Target::parse("https://Example.com/login", Scope::InScope).unwrap();

        let command = adapter
            .build_command(&target, Path::new("/tmp/out.json"), &CommandOptions::default())
            .unwrap();

        assert_eq!(command.program, "scan");
        assert_eq!(command.args[1], "/tmp/out.json");
        assert_eq!(command.args[2], "example.com");
        assert_eq!(command.args[3], target.value);
    }

    #[test]
    fn test_validate_target_by_type() {
        let adapter = adapter("scan", &[]);
        let ip = Target::parse("10.0.0.1", Scope::InScope).unwrap();
        let cidr = Target::parse("10.0.0.0/24", Scope::InScope).unwrap();

        assert!(adapter.validate_target(&ip).is_ok());
        assert!(adapter.validate_target(&cidr).is_err());
    }

    #[tokio::test]
    async fn test_execute_captures_output() {
        let adapter = adapter("sh", &[]);
        let command = CommandSpec::new("sh")
            .arg("-c")
            .arg("echo found.example.com; echo oops >&2; exit 3");

        let output = adapter.execute(&command, &ctx()).await.unwrap();
        assert_eq!(output.stdout, b"found.example.com\n");
        assert_eq!(output.stderr, b"oops\n");
        assert_eq!(output.exit_code, Some(3));
        assert!(!output.success());
    }

    #[tokio::test]
    async fn test_version_query() {
        let mut spec = adapter("sh", &[]).spec;
        spec.version_args = vec!["-c".to_string(), "echo 'scanner 7.94'".to_string()];
        assert_eq!(
            ProcessAdapter::new(spec).version().await.as_deref(),
            Some("scanner 7.94")
        );
    }

    #[tokio::test]
    async fn test_hanging_version_query_gives_up() {
        let mut spec = adapter("sh", &[]).spec;
        spec.version_args = vec!["-c".to_string(), "sleep 30".to_string()];
        spec.version_timeout_secs = 1;
        let adapter = ProcessAdapter::new(spec);

        let started = std::time::Instant::now();
        assert_eq!(adapter.version().await, None);
        assert!(started.elapsed() < Duration::from_secs(10));
        // Cached, not re-run
        assert_eq!(adapter.version().await, None);
    }

    #[tokio::test]
    async fn test_missing_binary_is_tool_not_found() {
        let adapter = adapter("recon-no-such-binary", &[]);
        let command = CommandSpec::new("recon-no-such-binary");

        let err = adapter.execute(&command, &ctx()).await.unwrap_err();
        assert!(matches!(err, AdapterError::ToolNotFound(p) if p == "recon-no-such-binary"));
    }

    #[test]
    fn test_parse_lines_and_json() {
        let adapter = adapter("scan", &[]);

        let lines = adapter
            .parse_output(&evidence("a.example.com\n\n b.example.com \n"))
            .unwrap();
        let findings = adapter.to_findings(&lines, Uuid::new_v4(), Uuid::new_v4());
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[1].title, "b.example.com");

        let json = adapter
            .parse_output(&evidence(r#"[{"host": "10.0.0.1", "port": 22}]"#))
            .unwrap();
        let findings = adapter.to_findings(&json, Uuid::new_v4(), Uuid::new_v4());
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].title, "10.0.0.1");
        assert_eq!(findings[0].details["port"], 22);
    }

    #[test]
    fn test_malformed_json_is_parse_error() {
        let adapter = adapter("scan", &[]);
        let err = adapter.parse_output(&evidence("{\"open\": [")).unwrap_err();
        assert!(matches!(err, AdapterError::Parse(_)));
    }
}
