use esmcdn_common::{CdnError, Result};

/// Allow/ban lists applied before any resolution work. Entries are exact
/// package names or scope wildcards (`@corp/*`).
#[derive(Debug, Clone, Default)]
pub struct PackagePolicy {
    allow: Vec<String>,
    ban: Vec<String>,
}

impl PackagePolicy {
    pub fn new(allow: Vec<String>, ban: Vec<String>) -> Self {
        Self { allow, ban }
    }

    /// Reject banned packages; when an allow list is configured, reject
    /// everything not on it.
    pub fn check(&self, name: &str) -> Result<()> {
        if self.ban.iter().any(|pat| pattern_matches(pat, name)) {
            return Err(CdnError::Forbidden(format!("package {name} is banned")));
        }
        if !self.allow.is_empty() && !self.allow.iter().any(|pat| pattern_matches(pat, name)) {
            return Err(CdnError::Forbidden(format!("package {name} is not allowed")));
        }
        Ok(())
    }
}

fn pattern_matches(pattern: &str, name: &str) -> bool {
    if let Some(scope) = pattern.strip_suffix("/*") {
        return name.strip_prefix(scope).is_some_and(|rest| rest.starts_with('/'));
    }
    pattern == name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ban_list_blocks_exact_and_scope() {
        let policy = PackagePolicy::new(vec![], vec!["left-pad".into(), "@evil/*".into()]);
        assert!(policy.check("left-pad").is_err());
        assert!(policy.check("@evil/thing").is_err());
        assert!(policy.check("react").is_ok());
        assert!(policy.check("left-pad-extra").is_ok());
    }

    #[test]
    fn allow_list_restricts_everything_else() {
        let policy = PackagePolicy::new(vec!["@corp/*".into()], vec![]);
        assert!(policy.check("@corp/ui").is_ok());
        assert!(policy.check("react").is_err());
    }

    #[test]
    fn empty_policy_allows_all() {
        assert!(PackagePolicy::default().check("anything").is_ok());
    }
}
