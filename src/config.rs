//! Linker configuration - `.typthon-link.toml`
//!
//! ```toml
//! [access]
//! mode = "warn"
//! allowed_callers = ["src/runtime/"]
//!
//! [cache]
//! soft_limit = 256
//! log_reclaims = true
//! ```

use crate::access::AccessMode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// File name looked up by `LinkerConfig::discover`
pub const CONFIG_FILE: &str = ".typthon-link.toml";

/// Environment variable overriding `access.mode`
pub const ACCESS_ENV: &str = "TYPTHON_LINK_NATIVE_ACCESS";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkerConfig {
    #[serde(default)]
    pub access: AccessConfig,

    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccessConfig {
    #[serde(default)]
    pub mode: AccessMode,

    /// Source path prefixes always allowed to link
    #[serde(default)]
    pub allowed_callers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Strong entries per cache before a reclaim pass runs; 0 disables
    #[serde(default = "default_soft_limit")]
    pub soft_limit: usize,

    #[serde(default = "default_true")]
    pub log_reclaims: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            soft_limit: default_soft_limit(),
            log_reclaims: true,
        }
    }
}

fn default_true() -> bool { true }
fn default_soft_limit() -> usize { 256 }

impl LinkerConfig {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config: {}", e))?;

        Self::parse(&content)
    }

    /// Parse configuration from TOML string
    pub fn parse(content: &str) -> Result<Self, String> {
        toml::from_str(content)
            .map_err(|e| format!("Failed to parse config: {}", e))
    }

    /// Find and load configuration file from current directory or parents
    pub fn discover() -> Self {
        match std::env::current_dir() {
            Ok(dir) => Self::discover_from(&dir),
            Err(_) => Self::default(),
        }
    }

    /// Find and load configuration file from `start` or its parents
    pub fn discover_from(start: &Path) -> Self {
        let mut current = Some(start);

        while let Some(dir) = current {
            let config_path = dir.join(CONFIG_FILE);
            if config_path.exists() {
                if let Ok(config) = Self::load(&config_path) {
                    return config;
                }
            }
            current = dir.parent();
        }

        Self::default()
    }

    /// Apply `TYPTHON_LINK_NATIVE_ACCESS`, ignoring unknown values
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(mode) = std::env::var(ACCESS_ENV).ok().as_deref().and_then(AccessMode::parse) {
            self.access.mode = mode;
        }
        self
    }

    /// Generate default configuration file content
    pub fn generate_default() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate config"))
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<(), String> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;

        fs::write(path, content)
            .map_err(|e| format!("Failed to write config: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = LinkerConfig::default();
        assert_eq!(config.access.mode, AccessMode::Allow);
        assert_eq!(config.cache.soft_limit, 256);
        assert!(config.cache.log_reclaims);
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[access]
mode = "deny"
allowed_callers = ["src/runtime/"]

[cache]
soft_limit = 16
"#;

        let config = LinkerConfig::parse(toml).unwrap();
        assert_eq!(config.access.mode, AccessMode::Deny);
        assert_eq!(config.access.allowed_callers, vec!["src/runtime/".to_string()]);
        assert_eq!(config.cache.soft_limit, 16);
        assert!(config.cache.log_reclaims);
    }

    #[test]
    fn test_parse_rejects_unknown_mode() {
        assert!(LinkerConfig::parse("[access]\nmode = \"sometimes\"\n").is_err());
    }

    #[test]
    fn test_save_and_discover_from_parent() {
        let dir = TempDir::new().unwrap();
        let mut config = LinkerConfig::default();
        config.access.mode = AccessMode::Warn;
        config.cache.soft_limit = 8;
        config.save(&dir.path().join(CONFIG_FILE)).unwrap();

        let nested = dir.path().join("a").join("b");
        fs::create_dir_all(&nested).unwrap();
        assert_eq!(LinkerConfig::discover_from(&nested), config);
    }

    #[test]
    fn test_generate_default_round_trips() {
        let text = LinkerConfig::generate_default();
        assert_eq!(LinkerConfig::parse(&text).unwrap(), LinkerConfig::default());
    }
}
