//! Destination-domain whitelist evaluation.

/// A compiled per-profile whitelist. Patterns are lower-cased once at load
/// time; hostnames are lower-cased at evaluation time so mixed-case targets
/// cannot bypass the policy.
#[derive(Debug, Clone, Default)]
pub struct DomainPolicy {
    patterns: Vec<String>,
}

impl DomainPolicy {
    pub fn new(patterns: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        Self {
            patterns: patterns
                .into_iter()
                .map(|p| p.as_ref().trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// An empty whitelist is an open policy. Otherwise patterns are tried in
    /// order: `*.suffix` matches `suffix` itself or any `<label>.suffix`;
    /// anything else matches only on exact equality.
    pub fn is_allowed(&self, hostname: &str) -> bool {
        if self.patterns.is_empty() {
            return true;
        }

        let host = hostname.to_lowercase();
        self.patterns.iter().any(|pattern| {
            if let Some(suffix) = pattern.strip_prefix("*.") {
                host == suffix || host.ends_with(&format!(".{}", suffix))
            } else {
                host == *pattern
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_whitelist_allows_all() {
        let policy = DomainPolicy::default();
        assert!(policy.is_allowed("example.com"));
        assert!(policy.is_allowed("anything.at.all"));
    }

    #[test]
    fn test_exact_pattern() {
        let policy = DomainPolicy::new(["example.com"]);
        assert!(policy.is_allowed("example.com"));
        assert!(!policy.is_allowed("api.example.com"));
        assert!(!policy.is_allowed("notexample.com"));
    }

    #[test]
    fn test_wildcard_pattern() {
        let policy = DomainPolicy::new(["*.example.com"]);
        assert!(policy.is_allowed("example.com"));
        assert!(policy.is_allowed("api.example.com"));
        assert!(policy.is_allowed("deep.api.example.com"));
        assert!(!policy.is_allowed("notexample.com"));
    }

    #[test]
    fn test_case_insensitive_both_sides() {
        let policy = DomainPolicy::new(["*.Example.COM"]);
        assert!(policy.is_allowed("API.example.Com"));
        let policy = DomainPolicy::new(["example.com"]);
        assert!(policy.is_allowed("EXAMPLE.COM"));
    }

    #[test]
    fn test_patterns_tried_in_order() {
        let policy = DomainPolicy::new(["internal.example.org", "*.example.com"]);
        assert!(policy.is_allowed("internal.example.org"));
        assert!(policy.is_allowed("cdn.example.com"));
        assert!(!policy.is_allowed("internal.example.com.evil.net"));
    }
}
