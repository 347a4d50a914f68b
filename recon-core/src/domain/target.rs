//! Target domain types
//!
//! A target is the thing a job scans: a domain, a single address, a network
//! range or a URL. Targets are immutable once referenced by a job.

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// A scan target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub value: String,
    #[serde(rename = "type")]
    pub target_type: TargetType,
    pub scope: Scope,
}

/// Kind of target, inferred from its textual value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    Domain,
    Ip,
    Cidr,
    Url,
}

/// Whether the target was declared part of the engagement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    InScope,
    OutOfScope,
    #[default]
    Unknown,
}

/// Host portion of a target, used by the network and domain rules
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetHost {
    Address(IpAddr),
    Network(IpNetwork),
    Domain(String),
}

/// Error returned when a target value cannot be interpreted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTarget(pub String);

impl fmt::Display for InvalidTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid target: {}", self.0)
    }
}

impl std::error::Error for InvalidTarget {}

impl Target {
    /// Parses a raw target value and infers its type
    ///
    /// Order of detection: CIDR, IP address, URL (anything with a scheme),
    /// then domain name. Domains are lower-cased and lose a trailing dot.
    pub fn parse(value: &str, scope: Scope) -> Result<Self, InvalidTarget> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(InvalidTarget("target is empty".to_string()));
        }

        if trimmed.contains('/') && !trimmed.contains("://") {
            let network: IpNetwork = trimmed
                .parse()
                .map_err(|_| InvalidTarget(format!("'{}' is not a valid CIDR", trimmed)))?;
            return Ok(Self {
                value: network.to_string(),
                target_type: TargetType::Cidr,
                scope,
            });
        }

        if let Ok(addr) = trimmed.parse::<IpAddr>() {
            return Ok(Self {
                value: addr.to_string(),
                target_type: TargetType::Ip,
                scope,
            });
        }

        if trimmed.contains("://") {
            let parsed = url::Url::parse(trimmed)
                .map_err(|e| InvalidTarget(format!("'{}' is not a valid URL: {}", trimmed, e)))?;
            if parsed.host().is_none() {
                return Err(InvalidTarget(format!("URL '{}' has no host", trimmed)));
            }
            return Ok(Self {
                value: parsed.to_string(),
                target_type: TargetType::Url,
                scope,
            });
        }

        let domain = normalize_domain(trimmed)?;
        Ok(Self {
            value: domain,
            target_type: TargetType::Domain,
            scope,
        })
    }

    /// Returns the host this target resolves to for policy matching
    pub fn host(&self) -> Option<TargetHost> {
        match self.target_type {
            TargetType::Ip => self.value.parse().ok().map(TargetHost::Address),
            TargetType::Cidr => self.value.parse().ok().map(TargetHost::Network),
            TargetType::Domain => Some(TargetHost::Domain(self.value.clone())),
            TargetType::Url => {
                let parsed = url::Url::parse(&self.value).ok()?;
                match parsed.host()? {
                    url::Host::Domain(d) => Some(TargetHost::Domain(d.to_ascii_lowercase())),
                    url::Host::Ipv4(a) => Some(TargetHost::Address(IpAddr::V4(a))),
                    url::Host::Ipv6(a) => Some(TargetHost::Address(IpAddr::V6(a))),
                }
            }
        }
    }

    /// Key used to group concurrency and rate limits per target
    ///
    /// URLs are keyed by host so that several paths on the same server share
    /// one budget.
    pub fn limit_key(&self) -> String {
        match self.host() {
            Some(TargetHost::Address(addr)) => addr.to_string(),
            Some(TargetHost::Network(net)) => net.to_string(),
            Some(TargetHost::Domain(d)) => d,
            None => self.value.clone(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetType::Domain => write!(f, "domain"),
            TargetType::Ip => write!(f, "ip"),
            TargetType::Cidr => write!(f, "cidr"),
            TargetType::Url => write!(f, "url"),
        }
    }
}

fn normalize_domain(raw: &str) -> Result<String, InvalidTarget> {
    let domain = raw.trim_end_matches('.').to_ascii_lowercase();

    if domain.is_empty() || domain.len() > 253 {
        return Err(InvalidTarget(format!("'{}' is not a valid domain", raw)));
    }

    for label in domain.split('.') {
        let valid = !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(InvalidTarget(format!("'{}' is not a valid domain", raw)));
        }
    }

    Ok(domain)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_infers_type() {
        let ip = Target::parse("10.10.10.5", Scope::InScope).unwrap();
        assert_eq!(ip.target_type, TargetType::Ip);

        let cidr = Target::parse("10.10.10.0/24", Scope::InScope).unwrap();
        assert_eq!(cidr.target_type, TargetType::Cidr);

        let url = Target::parse("https://app.example.com/login", Scope::Unknown).unwrap();
        assert_eq!(url.target_type, TargetType::Url);

        let domain = Target::parse("Example.COM.", Scope::Unknown).unwrap();
        assert_eq!(domain.target_type, TargetType::Domain);
        assert_eq!(domain.value, "example.com");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Target::parse("", Scope::Unknown).is_err());
        assert!(Target::parse("10.0.0.0/99", Scope::Unknown).is_err());
        assert!(Target::parse("bad domain", Scope::Unknown).is_err());
        assert!(Target::parse("-lead.example.com", Scope::Unknown).is_err());
    }

    #[test]
    fn test_url_host_extraction() {
        let url = Target::parse("http://10.0.0.7:8080/admin", Scope::Unknown).unwrap();
        assert_eq!(
            url.host(),
            Some(TargetHost::Address("10.0.0.7".parse().unwrap()))
        );
        assert_eq!(url.limit_key(), "10.0.0.7");

        let url = Target::parse("https://API.example.com/v1", Scope::Unknown).unwrap();
        assert_eq!(
            url.host(),
            Some(TargetHost::Domain("api.example.com".to_string()))
        );
    }
}
