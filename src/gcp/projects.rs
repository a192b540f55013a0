//! GCP Projects
//!
//! Discovers the projects a scan should cover through the Resource Manager API.

use super::auth::GcpCredentials;
use super::http::GcpHttpClient;
use super::pager::{paginate, Page};
use anyhow::Result;
use futures::TryStreamExt;
use serde::Deserialize;

/// Production endpoint of the Resource Manager v1 API
pub const RESOURCE_MANAGER_ENDPOINT: &str = "https://cloudresourcemanager.googleapis.com";

/// Project information
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub project_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub project_number: String,
    #[serde(default)]
    pub lifecycle_state: String,
}

impl Project {
    pub fn is_active(&self) -> bool {
        self.lifecycle_state == "ACTIVE"
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListProjectsResponse {
    #[serde(default)]
    projects: Vec<Project>,
    next_page_token: Option<String>,
}

/// Resource Manager project lister
pub struct ProjectLister {
    credentials: GcpCredentials,
    http: GcpHttpClient,
    base_url: String,
}

impl ProjectLister {
    pub fn new(credentials: GcpCredentials, http: GcpHttpClient) -> Self {
        Self::with_base_url(credentials, http, RESOURCE_MANAGER_ENDPOINT)
    }

    pub fn with_base_url(credentials: GcpCredentials, http: GcpHttpClient, base_url: &str) -> Self {
        Self {
            credentials,
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn list_page(
        &self,
        filter: Option<&str>,
        page_token: Option<String>,
    ) -> Result<Page<Project>> {
        let url = format!("{}/v1/projects", self.base_url);
        let token = self.credentials.get_token().await?;

        let mut query = Vec::new();
        if let Some(filter) = filter {
            query.push(("filter", filter));
        }
        if let Some(page_token) = page_token.as_deref() {
            query.push(("pageToken", page_token));
        }

        let response: ListProjectsResponse =
            self.http.get_json(&url, token.as_deref(), &query).await?;
        Ok(Page {
            items: response.projects,
            next_page_token: response.next_page_token,
        })
    }

    /// List all accessible active projects, optionally limited to those whose
    /// parent is the given organization
    pub async fn list_projects(&self, organization_id: Option<&str>) -> Result<Vec<Project>> {
        let filter = organization_id.map(|org| format!("parent.type:organization parent.id:{org}"));

        let projects: Vec<Project> = paginate(|token| self.list_page(filter.as_deref(), token))
            .try_filter(|p| futures::future::ready(p.is_active()))
            .try_collect()
            .await?;

        Ok(projects)
    }

    /// Get project IDs as a sorted list
    pub async fn list_project_ids(&self, organization_id: Option<&str>) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self
            .list_projects(organization_id)
            .await?
            .into_iter()
            .map(|p| p.project_id)
            .collect();
        ids.sort();
        Ok(ids)
    }
}
