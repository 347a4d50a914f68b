//! Active policy holder
//!
//! The store hands out `Arc<Policy>` snapshots. Reloading swaps the whole
//! object at once; jobs keep the snapshot they were submitted under.

use recon_core::domain::policy::Policy;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Failed to read policy file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse policy: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid policy: {0}")]
    Invalid(String),

    #[error("Policy version {offered} is older than active version {active}")]
    StaleVersion { active: u64, offered: u64 },

    #[error("Policy version {0} is already active with different rules")]
    VersionConflict(u64),

    #[error("Policy store has no source file to reload from")]
    NoSource,
}

/// Holder of the active policy
#[derive(Debug)]
pub struct PolicyStore {
    active: RwLock<Arc<Policy>>,
    source: Option<PathBuf>,
}

impl PolicyStore {
    pub fn new(policy: Policy) -> Result<Self, PolicyError> {
        policy.validate().map_err(PolicyError::Invalid)?;
        Ok(Self {
            active: RwLock::new(Arc::new(policy)),
            source: None,
        })
    }

    /// Loads the initial policy from a YAML file and remembers the path for
    /// later reloads
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, PolicyError> {
        let path = path.into();
        let policy = load_file(&path)?;
        Ok(Self {
            active: RwLock::new(Arc::new(policy)),
            source: Some(path),
        })
    }

    /// Snapshot of the active policy
    pub fn current(&self) -> Arc<Policy> {
        match self.active.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Atomically swaps in a new policy
    ///
    /// Versions never go backward. Re-offering the active version is accepted
    /// only when the rules are identical, so a version number always
    /// identifies one rule set.
    pub fn replace(&self, policy: Policy) -> Result<Arc<Policy>, PolicyError> {
        policy.validate().map_err(PolicyError::Invalid)?;

        let mut guard = match self.active.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let active = guard.version;
        if policy.version < active {
            return Err(PolicyError::StaleVersion {
                active,
                offered: policy.version,
            });
        }
        if policy.version == active && **guard != policy {
            return Err(PolicyError::VersionConflict(active));
        }

        let policy = Arc::new(policy);
        *guard = Arc::clone(&policy);
        info!("Activated policy version {}", policy.version);
        Ok(policy)
    }

    /// Re-reads the source file and swaps it in
    pub fn reload(&self) -> Result<Arc<Policy>, PolicyError> {
        let path = self.source.as_ref().ok_or(PolicyError::NoSource)?;
        let policy = load_file(path)?;
        self.replace(policy)
    }
}

/// Reads and validates a YAML policy file
pub fn load_file(path: &Path) -> Result<Policy, PolicyError> {
    let raw = std::fs::read_to_string(path).map_err(|source| PolicyError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&raw)
}

pub fn parse(raw: &str) -> Result<Policy, PolicyError> {
    let policy: Policy = serde_yaml::from_str(raw)?;
    policy.validate().map_err(PolicyError::Invalid)?;
    Ok(policy)
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLICY_YAML: &str = r#"
version: 4
network:
  allow: ["10.0.0.0/8"]
  deny: ["10.10.10.0/24"]
domains:
  deny: ["*.gov"]
tools:
  toolA: {}
  exploit:
    risk: high
limits:
  requests_per_second: 2
  burst: 2
  max_concurrent_per_target: 1
partial_rejection: reject_job
"#;

    #[test]
    fn test_parse_yaml_policy() {
        let policy = parse(POLICY_YAML).unwrap();
        assert_eq!(policy.version, 4);
        assert_eq!(policy.network.deny.len(), 1);
        assert_eq!(policy.limits.burst, 2);
        assert_eq!(policy.limits.max_concurrent_global, 8);
        assert!(policy.tools["toolA"].enabled);
    }

    #[test]
    fn test_parse_rejects_invalid_policy() {
        assert!(matches!(
            parse("network:\n  deny: [\"10.0.0.0/99\"]\n"),
            Err(PolicyError::Parse(_))
        ));
        assert!(matches!(
            parse("limits:\n  max_concurrent_global: 0\n"),
            Err(PolicyError::Invalid(_))
        ));
    }

    #[test]
    fn test_replace_is_monotonic() {
        let store = PolicyStore::new(parse(POLICY_YAML).unwrap()).unwrap();
        let before = store.current();

        let mut newer = (*before).clone();
        newer.version = 5;
        newer.tools.remove("exploit");
        store.replace(newer).unwrap();

        assert_eq!(store.current().version, 5);
        assert_eq!(before.version, 4, "old snapshots are unaffected");

        let mut older = (*before).clone();
        older.version = 3;
        assert!(matches!(
            store.replace(older),
            Err(PolicyError::StaleVersion { active: 5, offered: 3 })
        ));

        let mut conflicting = (*store.current()).clone();
        conflicting.require_in_scope = true;
        assert!(matches!(
            store.replace(conflicting),
            Err(PolicyError::VersionConflict(5))
        ));
    }

    #[test]
    fn test_reload_without_source() {
        let store = PolicyStore::new(Policy::default()).unwrap();
        assert!(matches!(store.reload(), Err(PolicyError::NoSource)));
    }
}
