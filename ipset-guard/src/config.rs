//! Configuration for the access guard

use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

use ipset_read::validate_set_name;

use crate::error::{Error, Result};
use crate::policy::{AccessMode, FailurePolicy};

/// Main configuration structure
///
/// The `[default]` rule applies to every server that does not set its own
/// `mode`. A server that sets `mode` replaces the default rule entirely.
///
/// # Example Configuration
///
/// ```toml
/// [default]
/// mode = "blacklist"
/// set = "blocklist"
///
/// [[server]]
/// name = "api.example.com"
/// mode = "whitelist"
/// set = "office"
/// on_failure = "deny"
///
/// [[server]]
/// name = "status.example.com"
/// mode = "off"
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Rule for servers without their own
    #[serde(default)]
    pub default: RuleConfig,

    /// Per-server overrides
    #[serde(default, rename = "server")]
    pub servers: Vec<ServerConfig>,
}

/// An access rule as written in the configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RuleConfig {
    /// Access mode; unset means "inherit" for servers and "off" for the default
    pub mode: Option<AccessMode>,

    /// Name of the ipset consulted by the rule
    pub set: Option<String>,

    /// What to do when the membership test fails (defaults per mode)
    pub on_failure: Option<FailurePolicy>,
}

/// A named server with its own rule
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerConfig {
    pub name: String,

    #[serde(flatten)]
    pub rule: RuleConfig,
}

/// A rule with inheritance and defaults applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub mode: AccessMode,
    pub set: Option<String>,
    pub on_failure: FailurePolicy,
}

impl RuleConfig {
    fn effective(&self) -> Rule {
        let mode = self.mode.unwrap_or(AccessMode::Off);
        Rule {
            mode,
            set: self.set.clone(),
            on_failure: self.on_failure.unwrap_or_else(|| mode.default_failure_policy()),
        }
    }

    fn validate(&self, scope: &str) -> Result<()> {
        match self.mode {
            None | Some(AccessMode::Off) => Ok(()),
            Some(mode) => {
                let set = self.set.as_deref().ok_or_else(|| {
                    Error::Config(format!("{}: mode \"{}\" requires a set", scope, mode))
                })?;
                validate_set_name(set).map_err(|e| Error::Config(format!("{}: {}", scope, e)))
            }
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.default.validate("default")?;

        let mut names = HashSet::new();
        for server in &self.servers {
            if server.name.is_empty() {
                return Err(Error::Config("server name must not be empty".into()));
            }
            if !names.insert(server.name.as_str()) {
                return Err(Error::Config(format!(
                    "server \"{}\" is configured twice",
                    server.name
                )));
            }
            server.rule.validate(&format!("server \"{}\"", server.name))?;
        }

        Ok(())
    }

    /// The default rule
    pub fn default_rule(&self) -> Rule {
        self.default.effective()
    }

    /// The rule in force for `server`, falling back to the default rule
    pub fn rule_for(&self, server: &str) -> Rule {
        self.servers
            .iter()
            .find(|s| s.name == server)
            .map(|s| self.merged(s))
            .unwrap_or_else(|| self.default_rule())
    }

    /// Every server with its effective rule
    pub fn server_rules(&self) -> impl Iterator<Item = (&str, Rule)> + '_ {
        self.servers.iter().map(|s| (s.name.as_str(), self.merged(s)))
    }

    fn merged(&self, server: &ServerConfig) -> Rule {
        if server.rule.mode.is_some() {
            server.rule.effective()
        } else {
            self.default_rule()
        }
    }

    /// Generate a sample configuration
    pub fn sample() -> String {
        r#"# ipset-guard configuration

# Rule for every server without its own.
[default]
# "off", "blacklist" (deny members) or "whitelist" (deny everyone else)
mode = "blacklist"

# ipset consulted by the rule; must exist before startup
set = "blocklist"

# What to do when the kernel cannot answer: "allow" or "deny".
# Defaults to "allow" for blacklist and "deny" for whitelist.
# on_failure = "allow"

# Per-server overrides. A server with a mode ignores the default rule.
[[server]]
name = "admin.example.com"
mode = "whitelist"
set = "office"

[[server]]
name = "status.example.com"
mode = "off"
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_config_parses() {
        let config = Config::from_toml(&Config::sample()).unwrap();
        assert_eq!(config.default.mode, Some(AccessMode::Blacklist));
        assert_eq!(config.servers.len(), 2);
    }

    #[test]
    fn test_empty_config_is_off() {
        let config = Config::from_toml("").unwrap();
        let rule = config.default_rule();
        assert_eq!(rule.mode, AccessMode::Off);
        assert_eq!(rule.set, None);
    }

    #[test]
    fn test_server_inherits_default() {
        let config = Config::from_toml(
            r#"
[default]
mode = "blacklist"
set = "blocklist"

[[server]]
name = "www.example.com"
set = "ignored-without-mode"
"#,
        )
        .unwrap();

        let rule = config.rule_for("www.example.com");
        assert_eq!(rule.mode, AccessMode::Blacklist);
        assert_eq!(rule.set.as_deref(), Some("blocklist"));
        assert_eq!(rule.on_failure, FailurePolicy::Allow);
    }

    #[test]
    fn test_server_override() {
        let config = Config::from_toml(
            r#"
[default]
mode = "blacklist"
set = "blocklist"

[[server]]
name = "admin.example.com"
mode = "whitelist"
set = "office"
"#,
        )
        .unwrap();

        let rule = config.rule_for("admin.example.com");
        assert_eq!(rule.mode, AccessMode::Whitelist);
        assert_eq!(rule.set.as_deref(), Some("office"));
        assert_eq!(rule.on_failure, FailurePolicy::Deny);

        // Unknown servers fall back to the default
        assert_eq!(config.rule_for("other").mode, AccessMode::Blacklist);
    }

    #[test]
    fn test_explicit_failure_policy() {
        let config = Config::from_toml(
            r#"
[default]
mode = "whitelist"
set = "office"
on_failure = "allow"
"#,
        )
        .unwrap();
        assert_eq!(config.default_rule().on_failure, FailurePolicy::Allow);
    }

    #[test]
    fn test_mode_requires_set() {
        let err = Config::from_toml("[default]\nmode = \"whitelist\"\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("requires a set"));
    }

    #[test]
    fn test_invalid_set_name() {
        let toml = format!("[default]\nmode = \"blacklist\"\nset = \"{}\"\n", "x".repeat(40));
        assert!(matches!(Config::from_toml(&toml), Err(Error::Config(_))));
    }

    #[test]
    fn test_duplicate_server() {
        let err = Config::from_toml(
            r#"
[[server]]
name = "a"
mode = "off"

[[server]]
name = "a"
mode = "off"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("configured twice"));
    }

    #[test]
    fn test_unknown_mode_rejected() {
        let err = Config::from_toml("[default]\nmode = \"greylist\"\n").unwrap_err();
        assert!(matches!(err, Error::ConfigParse(_)));

        // Failure policy words are not access modes
        let err = Config::from_toml("[default]\nmode = \"allow\"\nset = \"office\"\n").unwrap_err();
        assert!(matches!(err, Error::ConfigParse(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ipset-guard.toml");
        std::fs::write(&path, Config::sample()).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.rule_for("status.example.com").mode, AccessMode::Off);

        assert!(matches!(
            Config::load(dir.path().join("missing.toml")),
            Err(Error::Io(_))
        ));
    }
}
