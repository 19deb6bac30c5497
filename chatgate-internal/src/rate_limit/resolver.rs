use arc_swap::ArcSwap;
use regex::Regex;
use std::sync::Arc;

use crate::error::{Error, ErrorDetails};
use crate::rate_limit::config::RateLimitRule;

#[derive(Debug)]
struct CompiledRules {
    /// Literal prefixes, longest first
    prefixes: Vec<Arc<RateLimitRule>>,
    /// Wildcard patterns in declaration order
    patterns: Vec<(Regex, Arc<RateLimitRule>)>,
}

impl CompiledRules {
    fn compile(rules: Vec<RateLimitRule>) -> Result<Self, Error> {
        let mut prefixes = Vec::new();
        let mut patterns = Vec::new();
        for rule in rules {
            rule.validate()?;
            if rule.is_wildcard() {
                let regex = wildcard_to_regex(&rule.path)?;
                patterns.push((regex, Arc::new(rule)));
            } else {
                prefixes.push(Arc::new(rule));
            }
        }
        // Stable sort keeps declaration order between equal lengths
        prefixes.sort_by(|a, b| b.path.len().cmp(&a.path.len()));
        Ok(Self { prefixes, patterns })
    }
}

/// Turns `/api/ai/*` into `^/api/ai/.*$`. Everything except `*` is literal.
fn wildcard_to_regex(pattern: &str) -> Result<Regex, Error> {
    let escaped = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{escaped}$")).map_err(|e| {
        Error::new(ErrorDetails::Config {
            message: format!("Invalid rate limit pattern `{pattern}`: {e}"),
        })
    })
}

/// Maps request paths to rate limit rules.
///
/// The rule table is swapped whole on reload and never mutated in place.
#[derive(Debug, Clone)]
pub struct RuleResolver {
    rules: Arc<ArcSwap<CompiledRules>>,
}

impl RuleResolver {
    pub fn new(rules: Vec<RateLimitRule>) -> Result<Self, Error> {
        let compiled = CompiledRules::compile(rules)?;
        Ok(Self {
            rules: Arc::new(ArcSwap::from_pointee(compiled)),
        })
    }

    /// Replace the whole rule table
    pub fn reload(&self, rules: Vec<RateLimitRule>) -> Result<(), Error> {
        let compiled = CompiledRules::compile(rules)?;
        self.rules.store(Arc::new(compiled));
        Ok(())
    }

    /// Returns the governing rule for `path`, or `None` if the path is ungoverned.
    pub fn resolve(&self, path: &str) -> Option<Arc<RateLimitRule>> {
        let rules = self.rules.load();
        if let Some(rule) = rules.prefixes.iter().find(|r| path.starts_with(&r.path)) {
            return Some(Arc::clone(rule));
        }
        rules
            .patterns
            .iter()
            .find(|(regex, _)| regex.is_match(path))
            .map(|(_, rule)| Arc::clone(rule))
    }

    pub fn rule_count(&self) -> usize {
        let rules = self.rules.load();
        rules.prefixes.len() + rules.patterns.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> RuleResolver {
        RuleResolver::new(vec![
            RateLimitRule::new("/api/ai/*", 60_000, 20),
            RateLimitRule::new("/api/contact", 3_600_000, 5),
            RateLimitRule::new("/api/contact/bulk", 3_600_000, 1),
            RateLimitRule::new("/api/*/export", 60_000, 2),
        ])
        .unwrap()
    }

    #[test]
    fn test_exact_prefix_match() {
        let rule = resolver().resolve("/api/contact").unwrap();
        assert_eq!(rule.max_requests, 5);
    }

    #[test]
    fn test_longest_prefix_wins() {
        let rule = resolver().resolve("/api/contact/bulk/upload").unwrap();
        assert_eq!(rule.path, "/api/contact/bulk");
    }

    #[test]
    fn test_wildcard_match() {
        let rule = resolver().resolve("/api/ai/chat").unwrap();
        assert_eq!(rule.path, "/api/ai/*");

        let rule = resolver().resolve("/api/leads/export").unwrap();
        assert_eq!(rule.path, "/api/*/export");
    }

    #[test]
    fn test_wildcard_is_anchored() {
        assert!(resolver().resolve("/v2/api/ai/chat").is_none());
        assert!(resolver().resolve("/api/leads/export.csv").is_none());
    }

    #[test]
    fn test_wildcard_treats_other_characters_literally() {
        let resolver = RuleResolver::new(vec![RateLimitRule::new("/api/v1.0/*", 1000, 1)]).unwrap();
        assert!(resolver.resolve("/api/v1.0/chat").is_some());
        assert!(resolver.resolve("/api/v100/chat").is_none());
    }

    #[test]
    fn test_prefix_takes_precedence_over_wildcard() {
        let resolver = RuleResolver::new(vec![
            RateLimitRule::new("/api/ai/*", 60_000, 20),
            RateLimitRule::new("/api/ai/chat", 60_000, 3),
        ])
        .unwrap();
        assert_eq!(resolver.resolve("/api/ai/chat").unwrap().max_requests, 3);
    }

    #[test]
    fn test_unmatched_path_is_ungoverned() {
        assert!(resolver().resolve("/health").is_none());
    }

    #[test]
    fn test_reload_replaces_rules() {
        let resolver = resolver();
        resolver
            .reload(vec![RateLimitRule::new("/health", 1000, 1)])
            .unwrap();
        assert_eq!(resolver.rule_count(), 1);
        assert!(resolver.resolve("/api/contact").is_none());
        assert!(resolver.resolve("/health").is_some());
    }

    #[test]
    fn test_invalid_rule_fails_to_load() {
        assert!(RuleResolver::new(vec![RateLimitRule::new("/api/*", 0, 1)]).is_err());
    }
}
