//! Publish mode selection from trust rules.

use crate::config::TrustRule;
use crate::model::{PublishMode, RunKey};

/// Returns the mode of the first rule matching `key`, or `default`.
pub fn select_mode(rules: &[TrustRule], default: PublishMode, key: &RunKey) -> PublishMode {
    rules
        .iter()
        .find(|rule| matches(rule, key))
        .map_or(default, |rule| rule.mode)
}

fn matches(rule: &TrustRule, key: &RunKey) -> bool {
    let target_ok = rule
        .target_prefix
        .as_deref()
        .map_or(true, |prefix| key.target.starts_with(prefix));
    let suite_ok = rule.suite.as_deref().map_or(true, |suite| key.suite == suite);
    target_ok && suite_ok
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(prefix: Option<&str>, suite: Option<&str>, mode: PublishMode) -> TrustRule {
        TrustRule {
            target_prefix: prefix.map(String::from),
            suite: suite.map(String::from),
            mode,
        }
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let rules = vec![
            rule(Some("https://salsa.debian.org/jelmer/"), None, PublishMode::Push),
            rule(None, Some("lintian-fixes"), PublishMode::AttemptPush),
            rule(Some("https://salsa.debian.org/"), Some("lintian-fixes"), PublishMode::Skip),
        ];

        let own = RunKey::new("https://salsa.debian.org/jelmer/dulwich", "lintian-fixes");
        assert_eq!(select_mode(&rules, PublishMode::Propose, &own), PublishMode::Push);

        let other = RunKey::new("https://salsa.debian.org/python-team/x", "lintian-fixes");
        assert_eq!(
            select_mode(&rules, PublishMode::Propose, &other),
            PublishMode::AttemptPush
        );

        let fallback = RunKey::new("https://github.com/x/y", "multiarch-fixes");
        assert_eq!(
            select_mode(&rules, PublishMode::Propose, &fallback),
            PublishMode::Propose
        );
    }

    #[test]
    fn test_no_rules_uses_default() {
        let key = RunKey::new("t", "s");
        assert_eq!(select_mode(&[], PublishMode::BuildOnly, &key), PublishMode::BuildOnly);
    }
}
