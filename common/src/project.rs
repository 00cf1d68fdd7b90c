use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

use crate::config::ConfigError;

fn name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$").unwrap())
}

/// The validated, DNS-safe form of a project name. Doubles as the name of the
/// project's private Docker network and as the proxy route key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProjectName(String);

impl ProjectName {
    /// Slugify a human-entered name and validate the result.
    pub fn from_human(name: &str) -> Result<Self, ConfigError> {
        let slug = slug::slugify(name);

        if !Self::is_valid(&slug) {
            return Err(ConfigError::InvalidProjectName(name.to_string()));
        }

        Ok(Self(slug))
    }

    pub fn is_valid(name: &str) -> bool {
        name_regex().is_match(name)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Prefix shared by every object name tanjun creates for this project.
    pub fn container_prefix(&self) -> String {
        format!("tanjun_{}", self.0)
    }

    /// KV key holding the project's persisted secret map.
    pub fn secrets_key(&self) -> String {
        format!("{}_secrets", self.container_prefix())
    }

    /// KV key marking that the project saw at least one deploy.
    pub fn setup_key(&self) -> String {
        format!("{}_setup", self.container_prefix())
    }
}

impl fmt::Display for ProjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugifies_human_names() {
        let name = ProjectName::from_human("My Shop").unwrap();
        assert_eq!(name.as_str(), "my-shop");
        assert_eq!(name.container_prefix(), "tanjun_my-shop");
        assert_eq!(name.secrets_key(), "tanjun_my-shop_secrets");
    }

    #[test]
    fn test_rejects_unusable_names() {
        assert!(ProjectName::from_human("").is_err());
        assert!(ProjectName::from_human("-leading").is_ok()); // slugified to "leading"
        assert!(ProjectName::from_human(&"a".repeat(80)).is_err());
    }

    #[test]
    fn test_validation_rule() {
        assert!(ProjectName::is_valid("hello"));
        assert!(ProjectName::is_valid("a"));
        assert!(ProjectName::is_valid("shop-2"));
        assert!(!ProjectName::is_valid("Hello"));
        assert!(!ProjectName::is_valid("shop_2"));
        assert!(!ProjectName::is_valid("-shop"));
        assert!(!ProjectName::is_valid("shop-"));
    }
}
