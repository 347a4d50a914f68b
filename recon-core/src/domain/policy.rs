//! Policy (Rules of Engagement) domain types
//!
//! A policy is a versioned, read-only configuration object. The orchestrator
//! evaluates jobs against it and the rate limiter reads its limits; neither
//! mutates it. Every field has a serde default so partial policy files load.

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Rules of Engagement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default = "default_version")]
    pub version: u64,
    #[serde(default)]
    pub network: NetworkRules,
    #[serde(default)]
    pub domains: DomainRules,
    /// Tool table keyed by tool name; tools missing here are refused
    #[serde(default)]
    pub tools: BTreeMap<String, ToolRule>,
    #[serde(default)]
    pub limits: RateLimits,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default)]
    pub partial_rejection: PartialRejection,
    /// Refuse targets whose scope is not explicitly `in_scope`
    #[serde(default)]
    pub require_in_scope: bool,
}

/// CIDR allow/deny lists; deny always wins
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkRules {
    #[serde(default)]
    pub allow: Vec<IpNetwork>,
    #[serde(default)]
    pub deny: Vec<IpNetwork>,
}

/// Domain allow/deny patterns
///
/// A plain pattern matches the domain itself and every subdomain. A pattern
/// containing `*` is a glob over the whole host name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainRules {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolRule {
    #[serde(default)]
    pub risk: RiskLevel,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub requires_approval: bool,
    /// Overrides `Policy::default_timeout_secs` for this tool
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for ToolRule {
    fn default() -> Self {
        Self {
            risk: RiskLevel::Low,
            enabled: true,
            requires_approval: false,
            timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
        }
    }
}

/// What to do when some, but not all, requested tools are refused
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialRejection {
    RejectJob,
    #[default]
    ProceedWithAllowed,
}

/// Concurrency ceilings and token-bucket parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimits {
    /// Token refill rate per target; zero disables rate limiting
    #[serde(default = "default_rps")]
    pub requests_per_second: f64,
    #[serde(default = "default_burst")]
    pub burst: u32,
    #[serde(default = "default_global")]
    pub max_concurrent_global: usize,
    #[serde(default = "default_per_target")]
    pub max_concurrent_per_target: usize,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            requests_per_second: default_rps(),
            burst: default_burst(),
            max_concurrent_global: default_global(),
            max_concurrent_per_target: default_per_target(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
        }
    }
}

impl RateLimits {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

/// Retry budget and exponential backoff for transient execution failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based), doubling from the base
    /// delay and capped at `max_delay_ms`
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(32);
        let delay = self.base_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            version: default_version(),
            network: NetworkRules::default(),
            domains: DomainRules::default(),
            tools: BTreeMap::new(),
            limits: RateLimits::default(),
            retry: RetryPolicy::default(),
            default_timeout_secs: default_timeout_secs(),
            partial_rejection: PartialRejection::default(),
            require_in_scope: false,
        }
    }
}

impl Policy {
    /// Timeout applied to one attempt of `tool`
    pub fn tool_timeout(&self, tool: &str) -> Duration {
        let secs = self
            .tools
            .get(tool)
            .and_then(|rule| rule.timeout_secs)
            .unwrap_or(self.default_timeout_secs);
        Duration::from_secs(secs)
    }

    /// Checks internal consistency of the policy
    pub fn validate(&self) -> Result<(), String> {
        if self.limits.max_concurrent_global == 0 {
            return Err("limits.max_concurrent_global must be greater than 0".to_string());
        }
        if self.limits.max_concurrent_per_target == 0 {
            return Err("limits.max_concurrent_per_target must be greater than 0".to_string());
        }
        if !self.limits.requests_per_second.is_finite() || self.limits.requests_per_second < 0.0 {
            return Err("limits.requests_per_second must be a non-negative number".to_string());
        }
        if self.limits.requests_per_second > 0.0 && self.limits.burst == 0 {
            return Err("limits.burst must be at least 1 when rate limiting is enabled".to_string());
        }
        if self.default_timeout_secs == 0 {
            return Err("default_timeout_secs must be greater than 0".to_string());
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err("retry.base_delay_ms must not exceed retry.max_delay_ms".to_string());
        }
        for (name, rule) in &self.tools {
            if rule.timeout_secs == Some(0) {
                return Err(format!("tools.{}.timeout_secs must be greater than 0", name));
            }
        }
        for pattern in self.domains.allow.iter().chain(&self.domains.deny) {
            if pattern.trim().is_empty() {
                return Err("domain patterns must not be empty".to_string());
            }
        }
        Ok(())
    }

    /// Names of enabled tools that need no approval, sorted
    pub fn unattended_tools(&self) -> Vec<String> {
        self.tools
            .iter()
            .filter(|(_, rule)| {
                rule.enabled && !rule.requires_approval && rule.risk != RiskLevel::High
            })
            .map(|(name, _)| name.clone())
            .collect()
    }
}

fn default_version() -> u64 {
    1
}

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_rps() -> f64 {
    5.0
}

fn default_burst() -> u32 {
    5
}

fn default_global() -> usize {
    8
}

fn default_per_target() -> usize {
    2
}

fn default_acquire_timeout_secs() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    2
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let retry = RetryPolicy {
            max_retries: 10,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(200));
        assert_eq!(retry.backoff(4), Duration::from_millis(800));
        assert_eq!(retry.backoff(5), Duration::from_millis(1_000));
        assert_eq!(retry.backoff(60), Duration::from_millis(1_000));
    }

    #[test]
    fn test_default_policy_is_valid() {
        assert!(Policy::default().validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_ceilings() {
        let mut policy = Policy::default();
        policy.limits.max_concurrent_per_target = 0;
        assert!(policy.validate().is_err());

        let mut policy = Policy::default();
        policy.limits.requests_per_second = -1.0;
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_tool_timeout_override() {
        let mut policy = Policy::default();
        policy.tools.insert(
            "slowscan".to_string(),
            ToolRule {
                timeout_secs: Some(900),
                ..ToolRule::default()
            },
        );
        assert_eq!(policy.tool_timeout("slowscan"), Duration::from_secs(900));
        assert_eq!(policy.tool_timeout("other"), Duration::from_secs(300));
    }

    #[test]
    fn test_partial_policy_deserializes_with_defaults() {
        let json = serde_json::json!({
            "version": 3,
            "network": { "deny": ["10.10.10.0/24"] },
            "tools": { "toolA": { "risk": "medium" } }
        });
        let policy: Policy = serde_json::from_value(json).unwrap();
        assert_eq!(policy.version, 3);
        assert_eq!(policy.network.deny.len(), 1);
        assert!(policy.tools["toolA"].enabled);
        assert_eq!(policy.limits, RateLimits::default());
    }
}
