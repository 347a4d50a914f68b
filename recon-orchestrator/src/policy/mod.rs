//! Policy Engine
//!
//! Evaluates a job request against the Rules of Engagement. Evaluation is a
//! pure function of (request, policy): every check runs and every violation is
//! collected, so callers can report everything wrong with a request at once.

pub mod domain;
pub mod network;
mod store;

pub use store::{PolicyError, PolicyStore};

use recon_core::domain::policy::{PartialRejection, Policy, RiskLevel};
use recon_core::domain::target::{Scope, Target, TargetHost};
use recon_core::dto::job::JobRequest;
use serde::Serialize;

/// Category of a policy violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    InvalidTarget,
    OutOfScope,
    NetworkDenied,
    NetworkNotAllowed,
    DomainDenied,
    DomainNotAllowed,
    NoTools,
    UnknownTool,
    ToolDisabled,
    ApprovalRequired,
    /// Informational: requested parallelism exceeds the global ceiling
    CapacityExceeded,
}

/// A single broken rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub kind: ViolationKind,
    /// Tool the violation applies to; `None` for target-level violations
    pub tool: Option<String>,
    pub message: String,
}

impl Violation {
    fn target(kind: ViolationKind, message: String) -> Self {
        Self {
            kind,
            tool: None,
            message,
        }
    }

    fn tool(kind: ViolationKind, tool: &str, message: String) -> Self {
        Self {
            kind,
            tool: Some(tool.to_string()),
            message,
        }
    }
}

/// A tool that passed every check, with its configured risk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllowedTool {
    pub name: String,
    pub risk: RiskLevel,
}

/// Outcome of evaluating one request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyDecision {
    pub policy_version: u64,
    pub accepted: bool,
    /// Parsed target, absent when the value could not be interpreted
    #[serde(skip)]
    pub target: Option<Target>,
    /// Tools that will run; empty unless accepted
    pub allowed: Vec<AllowedTool>,
    /// Blocking violations in evaluation order
    pub violations: Vec<Violation>,
    /// Non-blocking observations
    pub notices: Vec<Violation>,
}

impl PolicyDecision {
    /// Violations that refuse one specific tool
    pub fn tool_violations(&self) -> impl Iterator<Item = &Violation> {
        self.violations.iter().filter(|v| v.tool.is_some())
    }

    /// Human readable summary of every blocking violation
    pub fn summary(&self) -> String {
        self.violations
            .iter()
            .map(|v| v.message.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Stateless Rules of Engagement evaluator
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyEngine;

impl PolicyEngine {
    pub fn new() -> Self {
        Self
    }

    /// Evaluates `request` against `policy`
    ///
    /// Identical (request, policy) inputs always produce identical decisions.
    pub fn validate(&self, request: &JobRequest, policy: &Policy) -> PolicyDecision {
        let mut violations = Vec::new();
        let mut notices = Vec::new();

        let target = match Target::parse(&request.target, request.scope) {
            Ok(target) => Some(target),
            Err(e) => {
                violations.push(Violation::target(ViolationKind::InvalidTarget, e.to_string()));
                None
            }
        };

        if let Some(target) = &target {
            check_scope(target, policy, &mut violations);
            match target.host() {
                Some(host @ (TargetHost::Address(_) | TargetHost::Network(_))) => {
                    check_network(target, &host, policy, &mut violations)
                }
                Some(TargetHost::Domain(name)) => check_domain(&name, policy, &mut violations),
                None => violations.push(Violation::target(
                    ViolationKind::InvalidTarget,
                    format!("target '{}' has no resolvable host", target.value),
                )),
            }
        }

        let target_blocked = !violations.is_empty();

        let tools = request.normalized_tools();
        if tools.is_empty() {
            violations.push(Violation::target(
                ViolationKind::NoTools,
                "request names no tools".to_string(),
            ));
        }

        let mut allowed = Vec::new();
        for tool in &tools {
            if let Some(risk) = check_tool(tool, request, policy, &mut violations) {
                allowed.push(AllowedTool {
                    name: tool.clone(),
                    risk,
                });
            }
        }

        let requested_parallel = request.options.max_parallel_tools.unwrap_or(tools.len());
        if requested_parallel > policy.limits.max_concurrent_global {
            notices.push(Violation::target(
                ViolationKind::CapacityExceeded,
                format!(
                    "requested parallelism {} exceeds global ceiling {}; runs will queue",
                    requested_parallel, policy.limits.max_concurrent_global
                ),
            ));
        }

        let partial = allowed.len() < tools.len();
        let accepted = !target_blocked
            && !allowed.is_empty()
            && (!partial || policy.partial_rejection == PartialRejection::ProceedWithAllowed);

        if !accepted {
            allowed.clear();
        }

        PolicyDecision {
            policy_version: policy.version,
            accepted,
            target,
            allowed,
            violations,
            notices,
        }
    }
}

fn check_scope(target: &Target, policy: &Policy, violations: &mut Vec<Violation>) {
    match target.scope {
        Scope::OutOfScope => violations.push(Violation::target(
            ViolationKind::OutOfScope,
            format!("target '{}' is marked out of scope", target.value),
        )),
        Scope::Unknown if policy.require_in_scope => violations.push(Violation::target(
            ViolationKind::OutOfScope,
            format!(
                "target '{}' has unknown scope and policy requires in-scope targets",
                target.value
            ),
        )),
        _ => {}
    }
}

fn check_network(
    target: &Target,
    host: &TargetHost,
    policy: &Policy,
    violations: &mut Vec<Violation>,
) {
    let rules = &policy.network;

    let (denied_by, allowed) = match host {
        TargetHost::Address(addr) => (
            network::address_denied(*addr, &rules.deny),
            network::address_allowed(*addr, &rules.allow),
        ),
        TargetHost::Network(net) => (
            network::network_denied(net, &rules.deny),
            network::network_allowed(net, &rules.allow),
        ),
        TargetHost::Domain(_) => return,
    };

    if let Some(deny) = denied_by {
        violations.push(Violation::target(
            ViolationKind::NetworkDenied,
            format!("target '{}' falls within denied network {}", target.value, deny),
        ));
    } else if !rules.allow.is_empty() && !allowed {
        violations.push(Violation::target(
            ViolationKind::NetworkNotAllowed,
            format!("target '{}' is not within any allowed network", target.value),
        ));
    }
}

fn check_domain(name: &str, policy: &Policy, violations: &mut Vec<Violation>) {
    let rules = &policy.domains;

    if let Some(pattern) = domain::first_match(&rules.deny, name) {
        violations.push(Violation::target(
            ViolationKind::DomainDenied,
            format!("domain '{}' matches denied pattern '{}'", name, pattern),
        ));
    } else if !rules.allow.is_empty() && domain::first_match(&rules.allow, name).is_none() {
        violations.push(Violation::target(
            ViolationKind::DomainNotAllowed,
            format!("domain '{}' matches no allowed pattern", name),
        ));
    }
}

fn check_tool(
    tool: &str,
    request: &JobRequest,
    policy: &Policy,
    violations: &mut Vec<Violation>,
) -> Option<RiskLevel> {
    let Some(rule) = policy.tools.get(tool) else {
        violations.push(Violation::tool(
            ViolationKind::UnknownTool,
            tool,
            format!("tool '{}' is not defined in policy v{}", tool, policy.version),
        ));
        return None;
    };

    if !rule.enabled {
        violations.push(Violation::tool(
            ViolationKind::ToolDisabled,
            tool,
            format!("tool '{}' is disabled", tool),
        ));
        return None;
    }

    let needs_approval = rule.risk == RiskLevel::High || rule.requires_approval;
    if needs_approval && !request.options.explicit_approval {
        violations.push(Violation::tool(
            ViolationKind::ApprovalRequired,
            tool,
            format!(
                "tool '{}' ({} risk) requires explicit approval",
                tool, rule.risk
            ),
        ));
        return None;
    }

    Some(rule.risk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use recon_core::domain::policy::ToolRule;

    fn policy() -> Policy {
        let mut policy = Policy::default();
        policy.tools.insert("toolA".to_string(), ToolRule::default());
        policy.tools.insert(
            "toolB".to_string(),
            ToolRule {
                risk: RiskLevel::Medium,
                ..ToolRule::default()
            },
        );
        policy.tools.insert(
            "exploit".to_string(),
            ToolRule {
                risk: RiskLevel::High,
                ..ToolRule::default()
            },
        );
        policy.tools.insert(
            "legacy".to_string(),
            ToolRule {
                enabled: false,
                ..ToolRule::default()
            },
        );
        policy
    }

    #[test]
    fn test_permissive_policy_accepts() {
        let decision = PolicyEngine.validate(&JobRequest::new("example.com", &["toolA"]), &policy());
        assert!(decision.accepted);
        assert!(decision.violations.is_empty());
        assert_eq!(decision.allowed.len(), 1);
        assert_eq!(decision.allowed[0].risk, RiskLevel::Low);
    }

    #[test]
    fn test_denied_cidr_rejects_whole_job() {
        let mut policy = policy();
        policy.network.deny.push("10.10.10.0/24".parse().unwrap());

        let decision = PolicyEngine.validate(&JobRequest::new("10.10.10.5", &["toolA"]), &policy);
        assert!(!decision.accepted);
        assert!(decision.allowed.is_empty());
        assert_eq!(decision.violations[0].kind, ViolationKind::NetworkDenied);

        let decision =
            PolicyEngine.validate(&JobRequest::new("10.10.0.0/16", &["toolA"]), &policy);
        assert!(!decision.accepted, "overlapping range must be denied");
    }

    #[test]
    fn test_deny_takes_precedence_over_allow() {
        let mut policy = policy();
        policy.network.allow.push("10.0.0.0/8".parse().unwrap());
        policy.network.deny.push("10.10.10.0/24".parse().unwrap());

        let decision = PolicyEngine.validate(&JobRequest::new("10.10.10.9", &["toolA"]), &policy);
        assert_eq!(decision.violations.len(), 1);
        assert_eq!(decision.violations[0].kind, ViolationKind::NetworkDenied);

        let decision = PolicyEngine.validate(&JobRequest::new("10.20.0.1", &["toolA"]), &policy);
        assert!(decision.accepted);

        let decision = PolicyEngine.validate(&JobRequest::new("192.168.1.1", &["toolA"]), &policy);
        assert_eq!(decision.violations[0].kind, ViolationKind::NetworkNotAllowed);
    }

    #[test]
    fn test_domain_rules() {
        let mut policy = policy();
        policy.domains.allow.push("example.com".to_string());
        policy.domains.deny.push("*.prod.example.com".to_string());

        let ok = PolicyEngine.validate(&JobRequest::new("staging.example.com", &["toolA"]), &policy);
        assert!(ok.accepted);

        let denied =
            PolicyEngine.validate(&JobRequest::new("db.prod.example.com", &["toolA"]), &policy);
        assert_eq!(denied.violations[0].kind, ViolationKind::DomainDenied);

        let outside = PolicyEngine.validate(&JobRequest::new("other.org", &["toolA"]), &policy);
        assert_eq!(outside.violations[0].kind, ViolationKind::DomainNotAllowed);

        let url = PolicyEngine.validate(
            &JobRequest::new("https://db.prod.example.com/login", &["toolA"]),
            &policy,
        );
        assert!(!url.accepted, "URL targets use their host for domain rules");
    }

    #[test]
    fn test_high_risk_needs_approval_and_partial_proceeds() {
        let request = JobRequest::new("example.com", &["toolA", "exploit"]);
        let decision = PolicyEngine.validate(&request, &policy());

        assert!(decision.accepted);
        assert_eq!(decision.allowed.len(), 1);
        assert_eq!(decision.allowed[0].name, "toolA");
        let refused: Vec<_> = decision.tool_violations().collect();
        assert_eq!(refused.len(), 1);
        assert_eq!(refused[0].kind, ViolationKind::ApprovalRequired);
        assert_eq!(refused[0].tool.as_deref(), Some("exploit"));

        let mut approved = request.clone();
        approved.options.explicit_approval = true;
        let decision = PolicyEngine.validate(&approved, &policy());
        assert_eq!(decision.allowed.len(), 2);
        assert_eq!(decision.allowed[1].risk, RiskLevel::High);
    }

    #[test]
    fn test_partial_rejection_can_reject_job() {
        let mut policy = policy();
        policy.partial_rejection = PartialRejection::RejectJob;

        let decision =
            PolicyEngine.validate(&JobRequest::new("example.com", &["toolA", "legacy"]), &policy);
        assert!(!decision.accepted);
        assert!(decision.allowed.is_empty());
        assert_eq!(decision.violations[0].kind, ViolationKind::ToolDisabled);
    }

    #[test]
    fn test_all_violations_collected() {
        let mut policy = policy();
        policy.network.deny.push("10.0.0.0/8".parse().unwrap());

        let mut request = JobRequest::new("10.1.1.1", &["legacy", "exploit", "mystery"]);
        request.scope = Scope::OutOfScope;
        let decision = PolicyEngine.validate(&request, &policy);

        let kinds: Vec<_> = decision.violations.iter().map(|v| v.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ViolationKind::OutOfScope,
                ViolationKind::NetworkDenied,
                ViolationKind::ToolDisabled,
                ViolationKind::ApprovalRequired,
                ViolationKind::UnknownTool,
            ]
        );
        assert!(decision.summary().contains("mystery"));
    }

    #[test]
    fn test_target_violation_blocks_allowed_tools() {
        let decision = PolicyEngine.validate(&JobRequest::new("not a host", &["toolA"]), &policy());
        assert!(!decision.accepted);
        assert!(decision.target.is_none());
        assert_eq!(decision.violations[0].kind, ViolationKind::InvalidTarget);
    }

    #[test]
    fn test_capacity_is_informational() {
        let mut policy = policy();
        policy.limits.max_concurrent_global = 1;
        let decision =
            PolicyEngine.validate(&JobRequest::new("example.com", &["toolA", "toolB"]), &policy);
        assert!(decision.accepted);
        assert_eq!(decision.notices[0].kind, ViolationKind::CapacityExceeded);
    }

    #[test]
    fn test_decisions_are_deterministic() {
        let mut policy = policy();
        policy.network.deny.push("192.168.0.0/16".parse().unwrap());
        policy.domains.deny.push("*.internal".to_string());

        let requests = [
            JobRequest::new("example.com", &["toolA", "exploit", "toolB"]),
            JobRequest::new("192.168.4.4", &["toolA"]),
            JobRequest::new("db.internal", &["legacy", "toolA"]),
            JobRequest::new("10.9.9.0/24", &["toolB", "toolB", "nope"]),
            JobRequest::new("", &[]),
        ];

        for request in &requests {
            let first = PolicyEngine.validate(request, &policy);
            for _ in 0..50 {
                assert_eq!(PolicyEngine.validate(request, &policy), first);
            }
        }
    }
}
