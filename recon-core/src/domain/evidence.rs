//! Evidence domain types
//!
//! Evidence is the raw output of a run, captured once and never modified.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Raw captured artifact of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    pub id: Uuid,
    pub run_id: Uuid,
    pub command: String,
    pub tool_version: Option<String>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i32>,
    /// Hex encoded SHA-256 over stdout followed by stderr
    pub checksum: String,
    pub size_bytes: u64,
    pub captured_at: chrono::DateTime<chrono::Utc>,
}

impl Evidence {
    /// Captures tool output and seals it with a checksum
    pub fn capture(
        run_id: Uuid,
        command: String,
        tool_version: Option<String>,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
        exit_code: Option<i32>,
    ) -> Self {
        let checksum = checksum(&stdout, &stderr);
        let size_bytes = (stdout.len() + stderr.len()) as u64;
        Self {
            id: Uuid::new_v4(),
            run_id,
            command,
            tool_version,
            stdout,
            stderr,
            exit_code,
            checksum,
            size_bytes,
            captured_at: chrono::Utc::now(),
        }
    }

    /// Recomputes the checksum and compares it with the sealed one
    pub fn verify(&self) -> bool {
        checksum(&self.stdout, &self.stderr) == self.checksum
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

fn checksum(stdout: &[u8], stderr: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(stdout);
    hasher.update(stderr);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_seals_output() {
        let evidence = Evidence::capture(
            Uuid::new_v4(),
            "toolA example.com".to_string(),
            Some("1.2.3".to_string()),
            b"open 443/tcp\n".to_vec(),
            Vec::new(),
            Some(0),
        );

        assert_eq!(evidence.size_bytes, 13);
        assert_eq!(evidence.checksum.len(), 64);
        assert!(evidence.verify());
    }

    #[test]
    fn test_tampering_is_detected() {
        let mut evidence = Evidence::capture(
            Uuid::new_v4(),
            "toolA".to_string(),
            None,
            b"result".to_vec(),
            b"warning".to_vec(),
            Some(0),
        );
        evidence.stdout = b"forged".to_vec();
        assert!(!evidence.verify());
    }
}
