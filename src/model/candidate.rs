//! Candidates produced by external importers.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::target::RunKey;

/// A (target, suite) pair judged eligible for an attempt.
///
/// Candidates are consumed, never mutated, by the scheduler. The target is
/// optional at the type level so that malformed imports can be reported
/// instead of failing deserialization of a whole batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Target repository identity.
    #[serde(default)]
    pub target: Option<String>,
    /// Suite of changes to attempt.
    #[serde(default)]
    pub suite: String,
    /// Maintainer used for publish rate limiting.
    #[serde(default)]
    pub maintainer: Option<String>,
    /// Importer-assigned value of attempting this candidate.
    #[serde(default)]
    pub value: f64,
    /// Opaque payload passed to the worker.
    #[serde(default)]
    pub context: serde_json::Value,
}

impl Candidate {
    /// Creates a well-formed candidate.
    pub fn new(target: impl Into<String>, suite: impl Into<String>) -> Self {
        Self {
            target: Some(target.into()),
            suite: suite.into(),
            maintainer: None,
            value: 0.0,
            context: serde_json::Value::Null,
        }
    }

    /// Sets the maintainer.
    pub fn with_maintainer(mut self, maintainer: impl Into<String>) -> Self {
        self.maintainer = Some(maintainer.into());
        self
    }

    /// Sets the candidate value.
    pub fn with_value(mut self, value: f64) -> Self {
        self.value = value;
        self
    }

    /// Sets the worker context.
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    /// Returns the key, or a description of why the candidate is malformed.
    pub fn key(&self) -> Result<RunKey, String> {
        let target = match self.target.as_deref().map(str::trim) {
            Some(t) if !t.is_empty() => t,
            _ => return Err("missing target identity".to_string()),
        };
        if self.suite.trim().is_empty() {
            return Err(format!("candidate for {} has no suite", target));
        }
        if !self.value.is_finite() {
            return Err(format!("candidate for {} has a non-finite value", target));
        }
        Ok(RunKey::new(target, self.suite.trim()))
    }

    /// Rate-limit bucket for this candidate.
    ///
    /// Targets without a known maintainer are limited on their own.
    pub fn rate_limit_bucket(&self) -> String {
        self.maintainer
            .clone()
            .filter(|m| !m.trim().is_empty())
            .or_else(|| self.target.clone())
            .unwrap_or_default()
    }

    /// SHA-256 over the target, suite and context of this candidate.
    pub fn fingerprint(&self) -> String {
        fingerprint(
            self.target.as_deref().unwrap_or_default().trim(),
            self.suite.trim(),
            &self.context,
        )
    }
}

/// Computes the fingerprint of a unit of work.
pub fn fingerprint(target: &str, suite: &str, context: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(target.as_bytes());
    hasher.update([0u8]);
    hasher.update(suite.as_bytes());
    hasher.update([0u8]);
    hasher.update(context.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_for_valid_candidate() {
        let c = Candidate::new("https://example.com/repo", "lintian-fixes");
        assert_eq!(
            c.key(),
            Ok(RunKey::new("https://example.com/repo", "lintian-fixes"))
        );
    }

    #[test]
    fn test_malformed_candidates() {
        let mut c = Candidate::new("", "suite");
        assert!(c.key().is_err());

        c.target = None;
        assert!(c.key().unwrap_err().contains("missing target"));

        let c = Candidate::new("t", "  ");
        assert!(c.key().is_err());

        let c = Candidate::new("t", "s").with_value(f64::NAN);
        assert!(c.key().is_err());
    }

    #[test]
    fn test_deserialize_without_target() {
        let c: Candidate = serde_yaml::from_str("suite: fresh-releases\nvalue: 3\n").unwrap();
        assert!(c.target.is_none());
        assert!(c.key().is_err());
    }

    #[test]
    fn test_fingerprint_tracks_context() {
        let a = Candidate::new("t", "s").with_context(json!({"tag": "1.0"}));
        let b = Candidate::new("t", "s").with_context(json!({"tag": "1.0"}));
        let c = Candidate::new("t", "s").with_context(json!({"tag": "1.1"}));
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }

    #[test]
    fn test_rate_limit_bucket() {
        let c = Candidate::new("https://example.com/r", "s");
        assert_eq!(c.rate_limit_bucket(), "https://example.com/r");
        let c = c.with_maintainer("jane@example.com");
        assert_eq!(c.rate_limit_bucket(), "jane@example.com");
    }
}
