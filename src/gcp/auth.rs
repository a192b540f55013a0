//! GCP Authentication
//!
//! Bearer tokens come from Application Default Credentials through
//! `gcp_auth`, which caches and refreshes them itself. A fixed token and an
//! anonymous mode cover tests and the Pub/Sub emulator.

use anyhow::{Context, Result};
use gcp_auth::TokenProvider;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// OAuth scope for the Pub/Sub and Resource Manager read calls
pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// Environment variables consulted for the default project, in order
const PROJECT_ENV_VARS: [&str; 3] = ["CLOUDSDK_CORE_PROJECT", "GOOGLE_CLOUD_PROJECT", "GCLOUD_PROJECT"];

#[derive(Clone)]
enum TokenSource {
    Adc(Arc<dyn TokenProvider>),
    Fixed(Arc<str>),
    Anonymous,
}

/// Where request tokens come from. Cheap to clone and shared by every
/// per-project client.
#[derive(Clone)]
pub struct GcpCredentials {
    source: TokenSource,
}

impl GcpCredentials {
    /// Application Default Credentials (service account key, metadata server
    /// or `gcloud auth application-default login`)
    pub async fn new() -> Result<Self> {
        let provider = gcp_auth::provider().await.context(
            "Failed to initialize GCP authentication. Run 'gcloud auth application-default login'",
        )?;
        Ok(Self {
            source: TokenSource::Adc(provider),
        })
    }

    /// Credentials that always present the same bearer token
    pub fn from_static_token(token: impl Into<String>) -> Self {
        Self {
            source: TokenSource::Fixed(token.into().into()),
        }
    }

    /// No credentials at all (Pub/Sub emulator)
    pub fn anonymous() -> Self {
        Self {
            source: TokenSource::Anonymous,
        }
    }

    /// Bearer token for the next request, or `None` when anonymous
    pub async fn get_token(&self) -> Result<Option<String>> {
        match &self.source {
            TokenSource::Anonymous => Ok(None),
            TokenSource::Fixed(token) => Ok(Some(token.to_string())),
            TokenSource::Adc(provider) => {
                let token = provider
                    .token(&[CLOUD_PLATFORM_SCOPE])
                    .await
                    .context("Failed to get access token")?;
                Ok(Some(token.as_str().to_string()))
            },
        }
    }
}

/// gcloud's configuration directory (`$CLOUDSDK_CONFIG` or `~/.config/gcloud`)
pub fn get_gcloud_config_dir() -> Option<PathBuf> {
    std::env::var_os("CLOUDSDK_CONFIG")
        .map(PathBuf::from)
        .or_else(|| dirs::config_dir().map(|p| p.join("gcloud")))
}

/// Check a GCP project ID: 6 to 30 characters of lowercase letters, digits
/// and hyphens, starting with a letter and not ending with a hyphen.
pub fn validate_project_id(project: &str) -> bool {
    let bytes = project.as_bytes();
    (6..=30).contains(&bytes.len())
        && bytes[0].is_ascii_lowercase()
        && bytes[bytes.len() - 1] != b'-'
        && bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
}

/// Default project from the environment, falling back to the active gcloud
/// configuration. Malformed IDs are ignored.
pub fn get_default_project() -> Option<String> {
    let from_env = PROJECT_ENV_VARS.iter().find_map(|var| {
        let value = std::env::var(var).ok()?;
        if validate_project_id(&value) {
            Some(value)
        } else {
            tracing::warn!("Ignoring malformed project ID in {}", var);
            None
        }
    });

    from_env.or_else(|| get_gcloud_config_dir().and_then(|dir| active_gcloud_project(&dir)))
}

fn active_gcloud_project(config_dir: &Path) -> Option<String> {
    let name = std::fs::read_to_string(config_dir.join("active_config"))
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "default".to_string());

    // The name becomes part of a path
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        tracing::warn!("Ignoring gcloud active_config {:?}", name);
        return None;
    }

    let path = config_dir
        .join("configurations")
        .join(format!("config_{name}"));
    let content = std::fs::read_to_string(path).ok()?;
    project_from_gcloud_config(&content)
}

/// `project` from the `[core]` section of a gcloud configuration file
fn project_from_gcloud_config(content: &str) -> Option<String> {
    let mut section = "";
    for line in content.lines().map(str::trim) {
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            section = name;
            continue;
        }
        if section != "core" || line.starts_with(['#', ';']) {
            continue;
        }
        match line.split_once('=') {
            Some((key, value)) if key.trim() == "project" => {
                let project = value.trim();
                return validate_project_id(project).then(|| project.to_string());
            },
            _ => {},
        }
    }
    None
}
