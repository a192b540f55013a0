//! Configuration Management
//!
//! YAML configuration with environment overrides.
//!
//! Resolution order, lowest to highest: built-in defaults, the config file,
//! `GCP_VISUALIZER_*` environment variables, then command-line flags (applied
//! by the caller).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::render::{Layout, OutputFormat};

/// Overrides the config file location
pub const CONFIG_PATH_ENV: &str = "GCP_VISUALIZER_CONFIG";

/// Prefix of every environment override
pub const ENV_PREFIX: &str = "GCP_VISUALIZER_";

const APP_DIR: &str = "gcp-visualizer";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Restricts `scan --all` to projects under this organization
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    /// Projects scanned when none are given on the command line
    pub projects: Vec<String>,
    pub cache: CacheConfig,
    pub visualization: VisualizationConfig,
    pub rate_limits: RateLimitConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// A project synced more recently than this is not rescanned
    pub ttl_hours: u32,
    /// Data older than this is flagged when generating
    pub max_age_hours: u32,
    /// SQLite database file; defaults to the user cache directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_hours: 1,
            max_age_hours: 24,
            database: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisualizationConfig {
    pub layout: Layout,
    pub output_format: OutputFormat,
}

impl Default for VisualizationConfig {
    fn default() -> Self {
        Self {
            layout: Layout::Fdp,
            output_format: OutputFormat::Svg,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_second: f64,
    pub max_concurrent: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 10.0,
            max_concurrent: 5,
        }
    }
}

impl Config {
    /// Config file path: `$GCP_VISUALIZER_CONFIG`, else
    /// `<config dir>/gcp-visualizer/config.yaml`
    pub fn config_path() -> Option<PathBuf> {
        if let Some(path) = std::env::var_os(CONFIG_PATH_ENV).filter(|p| !p.is_empty()) {
            return Some(PathBuf::from(path));
        }
        dirs::config_dir().map(|p| p.join(APP_DIR).join("config.yaml"))
    }

    /// Load `path` (or the default config file) and apply environment
    /// overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).or_else(Self::config_path);
        let mut config = match path {
            Some(path) => Self::load_from(&path)?,
            None => Self::default(),
        };
        config.apply_env_from(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Read a config file. A missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No config file at {}, using defaults", path.display());
                return Ok(Self::default());
            },
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()));
            },
        };

        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        serde_yaml::from_str(&content)
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Apply `GCP_VISUALIZER_*` overrides looked up through `lookup`.
    ///
    /// Empty values are ignored. Values that fail to parse are errors.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}")).filter(|v| !v.trim().is_empty());

        if let Some(org) = get("ORGANIZATION_ID") {
            self.organization_id = Some(org.trim().to_string());
        }
        if let Some(projects) = get("PROJECTS") {
            self.projects = split_list(&projects);
        }
        if let Some(v) = get("TTL_HOURS") {
            self.cache.ttl_hours = parse_env("TTL_HOURS", &v)?;
        }
        if let Some(v) = get("MAX_AGE_HOURS") {
            self.cache.max_age_hours = parse_env("MAX_AGE_HOURS", &v)?;
        }
        if let Some(v) = get("DATABASE") {
            self.cache.database = Some(PathBuf::from(v.trim()));
        }
        if let Some(v) = get("LAYOUT") {
            self.visualization.layout = parse_value_enum("LAYOUT", &v)?;
        }
        if let Some(v) = get("OUTPUT_FORMAT") {
            self.visualization.output_format = parse_value_enum("OUTPUT_FORMAT", &v)?;
        }
        if let Some(v) = get("REQUESTS_PER_SECOND") {
            self.rate_limits.requests_per_second = parse_env("REQUESTS_PER_SECOND", &v)?;
        }
        if let Some(v) = get("MAX_CONCURRENT") {
            self.rate_limits.max_concurrent = parse_env("MAX_CONCURRENT", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let rps = self.rate_limits.requests_per_second;
        if !(rps.is_finite() && rps > 0.0) {
            anyhow::bail!("rate_limits.requests_per_second must be positive, got {rps}");
        }
        if self.rate_limits.max_concurrent == 0 {
            anyhow::bail!("rate_limits.max_concurrent must be at least 1");
        }
        if let Some(project) = self
            .projects
            .iter()
            .find(|p| !crate::gcp::auth::validate_project_id(p))
        {
            anyhow::bail!("invalid project ID in config: {project:?}");
        }
        Ok(())
    }

    /// Save to the default config path, returning where it was written
    pub fn save(&self) -> Result<PathBuf> {
        let path = Self::config_path().context("could not determine config directory")?;
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Create parent directory
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let content = self.to_yaml()?;
        std::fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("failed to encode config")
    }

    /// Database file, defaulting to `<cache dir>/gcp-visualizer/cache.db`
    pub fn database_path(&self) -> PathBuf {
        if let Some(path) = &self.cache.database {
            return path.clone();
        }
        if let Some(cache_dir) = dirs::cache_dir() {
            return cache_dir.join(APP_DIR).join("cache.db");
        }
        if let Some(home) = dirs::home_dir() {
            return home.join(format!(".{APP_DIR}")).join("cache.db");
        }
        PathBuf::from("cache.db")
    }

    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.cache.ttl_hours))
    }

    pub fn max_age(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.cache.max_age_hours))
    }
}

/// Split a comma-separated list, dropping blanks
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_env<T>(name: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid {ENV_PREFIX}{name} {value:?}: {e}"))
}

fn parse_value_enum<T: clap::ValueEnum>(name: &str, value: &str) -> Result<T> {
    T::from_str(value.trim(), true)
        .map_err(|_| anyhow::anyhow!("invalid {ENV_PREFIX}{name} {value:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (format!("{ENV_PREFIX}{k}"), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.cache.ttl_hours, 1);
        assert_eq!(config.cache.max_age_hours, 24);
        assert_eq!(config.visualization.layout, Layout::Fdp);
        assert_eq!(config.visualization.output_format, OutputFormat::Svg);
        assert_eq!(config.rate_limits.requests_per_second, 10.0);
        assert_eq!(config.rate_limits.max_concurrent, 5);
        assert!(config.validate().is_ok());
        assert!(config.database_path().ends_with("cache.db"));
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "organization_id: \"123456\"\nprojects: [shop-prod, shop-dev]\nvisualization:\n  layout: neato\nrate_limits:\n  max_concurrent: 2\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.organization_id.as_deref(), Some("123456"));
        assert_eq!(config.projects, ["shop-prod", "shop-dev"]);
        assert_eq!(config.visualization.layout, Layout::Neato);
        assert_eq!(config.visualization.output_format, OutputFormat::Svg);
        assert_eq!(config.rate_limits.max_concurrent, 2);
        assert_eq!(config.rate_limits.requests_per_second, 10.0);
        assert_eq!(config.cache.ttl_hours, 1);
    }

    #[test]
    fn test_invalid_yaml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "cache: [not, a, map]\n").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("invalid config file"));
    }

    #[test]
    fn test_env_overrides_file_values() {
        let mut config = Config {
            projects: vec!["from-file".into()],
            ..Default::default()
        };
        config
            .apply_env_from(env(&[
                ("PROJECTS", "a, b,,c"),
                ("TTL_HOURS", "6"),
                ("LAYOUT", "DOT"),
                ("OUTPUT_FORMAT", "json"),
                ("REQUESTS_PER_SECOND", "2.5"),
                ("DATABASE", "/tmp/graph.db"),
                ("MAX_AGE_HOURS", ""),
            ]))
            .unwrap();

        assert_eq!(config.projects, ["a", "b", "c"]);
        assert_eq!(config.cache.ttl_hours, 6);
        assert_eq!(config.cache.max_age_hours, 24);
        assert_eq!(config.visualization.layout, Layout::Dot);
        assert_eq!(config.visualization.output_format, OutputFormat::Json);
        assert_eq!(config.rate_limits.requests_per_second, 2.5);
        assert_eq!(config.database_path(), PathBuf::from("/tmp/graph.db"));
    }

    #[test]
    fn test_bad_env_values_are_rejected() {
        let mut config = Config::default();
        let err = config
            .apply_env_from(env(&[("MAX_CONCURRENT", "lots")]))
            .unwrap_err();
        assert!(err.to_string().contains("GCP_VISUALIZER_MAX_CONCURRENT"));

        let err = config
            .apply_env_from(env(&[("LAYOUT", "circo")]))
            .unwrap_err();
        assert!(err.to_string().contains("GCP_VISUALIZER_LAYOUT"));
    }

    #[test]
    fn test_validate_rejects_bad_limits() {
        let mut config = Config::default();
        config.rate_limits.requests_per_second = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.rate_limits.max_concurrent = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.projects = vec!["Not A Project".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_creates_directories_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yaml");
        let mut config = Config::default();
        config.organization_id = Some("42".into());
        config.cache.ttl_hours = 3;

        config.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_split_list() {
        assert_eq!(split_list(" a ,b,, "), ["a", "b"]);
        assert!(split_list("").is_empty());
    }
}
