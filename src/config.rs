use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub log: LogConfig,
    /// Named allow-lists of `registry/repository` patterns.
    #[serde(default)]
    pub profiles: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CatalogConfig {
    pub base_url: String,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Name of the environment variable holding a bearer token, if any.
    #[serde(default)]
    pub token_env: Option<String>,
}

fn default_page_size() -> usize {
    500
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub changed_only: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            profile: None,
            batch_size: default_batch_size(),
            changed_only: false,
        }
    }
}

fn default_batch_size() -> usize {
    500
}

/// Largest accepted `sync.batch_size`. A CVE insert binds three variables
/// per row and SQLite caps a statement at 32766.
pub const MAX_BATCH_SIZE: usize = 10_000;

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    /// Config with only the database and catalog endpoint set, everything
    /// else at its default.
    pub fn minimal(db_path: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            catalog: CatalogConfig {
                base_url: base_url.into(),
                page_size: default_page_size(),
                timeout_secs: default_timeout_secs(),
                max_retries: default_max_retries(),
                token_env: None,
            },
            sync: SyncConfig::default(),
            log: LogConfig::default(),
            profiles: BTreeMap::new(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.catalog.base_url.trim().is_empty() {
        anyhow::bail!("catalog.base_url must not be empty");
    }

    if config.catalog.page_size == 0 {
        anyhow::bail!("catalog.page_size must be > 0");
    }

    if config.sync.batch_size == 0 {
        anyhow::bail!("sync.batch_size must be > 0");
    }

    if config.sync.batch_size > MAX_BATCH_SIZE {
        anyhow::bail!(
            "sync.batch_size must be <= {} (got {})",
            MAX_BATCH_SIZE,
            config.sync.batch_size
        );
    }

    if let Some(profile) = &config.sync.profile {
        if !config.profiles.contains_key(profile) {
            anyhow::bail!(
                "sync.profile '{}' is not defined under [profiles]",
                profile
            );
        }
    }

    match config.log.format.as_str() {
        "text" | "json" => {}
        other => anyhow::bail!("Unknown log format: '{}'. Must be text or json.", other),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
[db]
path = "/tmp/catalog.sqlite"

[catalog]
base_url = "https://catalog.example.com/api"
"#;

    #[test]
    fn defaults_are_applied() {
        let config = parse_config(BASE).unwrap();
        assert_eq!(config.catalog.page_size, 500);
        assert_eq!(config.catalog.max_retries, 5);
        assert_eq!(config.sync.batch_size, 500);
        assert!(!config.sync.changed_only);
        assert_eq!(config.log.format, "text");
        assert!(config.profiles.is_empty());
    }

    #[test]
    fn profiles_are_parsed() {
        let content = format!(
            "{}\n[sync]\nprofile = \"ubi\"\n\n[profiles]\nubi = [\"reg1/ubi8/*\", \"reg1/ubi9\"]\n",
            BASE
        );
        let config = parse_config(&content).unwrap();
        assert_eq!(config.sync.profile.as_deref(), Some("ubi"));
        assert_eq!(config.profiles["ubi"].len(), 2);
    }

    #[test]
    fn unknown_profile_is_rejected() {
        let content = format!("{}\n[sync]\nprofile = \"missing\"\n", BASE);
        let err = parse_config(&content).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn zero_page_size_is_rejected() {
        let content = BASE.replace(
            "base_url = \"https://catalog.example.com/api\"",
            "base_url = \"https://catalog.example.com/api\"\npage_size = 0",
        );
        assert!(parse_config(&content).is_err());
    }

    #[test]
    fn oversized_batch_is_rejected() {
        let content = format!("{}\n[sync]\nbatch_size = 20000\n", BASE);
        let err = parse_config(&content).unwrap_err();
        assert!(err.to_string().contains("batch_size"));

        let content = format!("{}\n[sync]\nbatch_size = {}\n", BASE, MAX_BATCH_SIZE);
        assert!(parse_config(&content).is_ok());
    }

    #[test]
    fn unknown_log_format_is_rejected() {
        let content = format!("{}\n[log]\nformat = \"xml\"\n", BASE);
        assert!(parse_config(&content).is_err());
    }
}
