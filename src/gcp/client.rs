//! Pub/Sub Client
//!
//! REST client for the Pub/Sub admin API, combining authentication and HTTP
//! functionality. The collector only sees the [`PubSubApi`] and
//! [`ClientProvider`] traits so tests can swap in fakes.

use super::auth::GcpCredentials;
use super::http::GcpHttpClient;
use super::pager::{paginate, Page};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Deserialize;

/// Production endpoint of the Pub/Sub REST API
pub const PUBSUB_ENDPOINT: &str = "https://pubsub.googleapis.com";

/// Environment variable honoured by every Google client to target the emulator
pub const EMULATOR_HOST_ENV: &str = "PUBSUB_EMULATOR_HOST";

/// Page size requested from list calls (API maximum)
const PAGE_SIZE: &str = "1000";

/// A topic as returned by `projects.topics.list`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicEntry {
    /// `projects/{project}/topics/{topic}`
    pub name: String,
}

/// A subscription as returned by `projects.subscriptions.list`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionEntry {
    /// `projects/{project}/subscriptions/{subscription}`
    pub name: String,
    /// `projects/{project}/topics/{topic}`, or `_deleted-topic_`
    #[serde(default)]
    pub topic: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListTopicsResponse {
    #[serde(default)]
    topics: Vec<TopicEntry>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListSubscriptionsResponse {
    #[serde(default)]
    subscriptions: Vec<SubscriptionEntry>,
    next_page_token: Option<String>,
}

/// Listing operations the collector needs from Pub/Sub.
///
/// Each `list_*` call returns a fresh stream that starts from the first page.
#[async_trait]
pub trait PubSubApi: Send + Sync {
    fn list_topics<'a>(&'a self, project_id: &'a str) -> BoxStream<'a, Result<TopicEntry>>;

    fn list_subscriptions<'a>(
        &'a self,
        project_id: &'a str,
    ) -> BoxStream<'a, Result<SubscriptionEntry>>;

    async fn close(&self) -> Result<()>;
}

/// Hands out an authenticated client scoped to one project.
#[async_trait]
pub trait ClientProvider: Send + Sync {
    async fn get_client(&self, project_id: &str) -> Result<std::sync::Arc<dyn PubSubApi>>;
}

/// Pub/Sub REST client for one project
#[derive(Clone)]
pub struct PubSubClient {
    pub credentials: GcpCredentials,
    pub http: GcpHttpClient,
    pub project_id: String,
    base_url: String,
}

impl PubSubClient {
    pub fn new(project_id: &str, credentials: GcpCredentials, http: GcpHttpClient) -> Self {
        Self::with_base_url(project_id, credentials, http, PUBSUB_ENDPOINT)
    }

    /// Client pointed at a non-default endpoint (emulator, mock server)
    pub fn with_base_url(
        project_id: &str,
        credentials: GcpCredentials,
        http: GcpHttpClient,
        base_url: &str,
    ) -> Self {
        Self {
            credentials,
            http,
            project_id: project_id.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Build Pub/Sub API URL for a project collection
    pub fn project_url(&self, project_id: &str, collection: &str) -> String {
        format!("{}/v1/projects/{}/{}", self.base_url, project_id, collection)
    }

    async fn get_page<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        page_token: Option<&str>,
    ) -> Result<T> {
        let token = self.credentials.get_token().await?;
        let mut query = vec![("pageSize", PAGE_SIZE)];
        if let Some(page_token) = page_token {
            query.push(("pageToken", page_token));
        }
        self.http.get_json(url, token.as_deref(), &query).await
    }

    /// Fetch one page of topics
    pub async fn list_topics_page(
        &self,
        project_id: &str,
        page_token: Option<String>,
    ) -> Result<Page<TopicEntry>> {
        let url = self.project_url(project_id, "topics");
        let response: ListTopicsResponse = self.get_page(&url, page_token.as_deref()).await?;
        tracing::debug!("Fetched {} topics from {}", response.topics.len(), project_id);

        Ok(Page {
            items: response.topics,
            next_page_token: response.next_page_token,
        })
    }

    /// Fetch one page of subscriptions
    pub async fn list_subscriptions_page(
        &self,
        project_id: &str,
        page_token: Option<String>,
    ) -> Result<Page<SubscriptionEntry>> {
        let url = self.project_url(project_id, "subscriptions");
        let response: ListSubscriptionsResponse =
            self.get_page(&url, page_token.as_deref()).await?;
        tracing::debug!(
            "Fetched {} subscriptions from {}",
            response.subscriptions.len(),
            project_id
        );

        Ok(Page {
            items: response.subscriptions,
            next_page_token: response.next_page_token,
        })
    }
}

#[async_trait]
impl PubSubApi for PubSubClient {
    fn list_topics<'a>(&'a self, project_id: &'a str) -> BoxStream<'a, Result<TopicEntry>> {
        paginate(move |token| self.list_topics_page(project_id, token))
    }

    fn list_subscriptions<'a>(
        &'a self,
        project_id: &'a str,
    ) -> BoxStream<'a, Result<SubscriptionEntry>> {
        paginate(move |token| self.list_subscriptions_page(project_id, token))
    }

    async fn close(&self) -> Result<()> {
        // reqwest pools are released on drop; nothing is held per project
        tracing::debug!("Closed Pub/Sub client for {}", self.project_id);
        Ok(())
    }
}

/// Creates [`PubSubClient`]s that share one credential source and HTTP pool.
pub struct GcpClientProvider {
    credentials: GcpCredentials,
    http: GcpHttpClient,
    base_url: String,
    /// Fetch a token while creating each client so auth failures surface
    /// against the project rather than mid-listing
    verify_token: bool,
}

impl GcpClientProvider {
    /// Provider using ADC, or the emulator when `PUBSUB_EMULATOR_HOST` is set.
    pub async fn from_environment() -> Result<Self> {
        let http = GcpHttpClient::new()?;

        if let Some(host) = std::env::var(EMULATOR_HOST_ENV)
            .ok()
            .filter(|h| !h.is_empty())
        {
            let endpoint = url::Url::parse(&format!("http://{host}"))
                .with_context(|| format!("invalid {EMULATOR_HOST_ENV} value {host:?}"))?;
            tracing::info!("Using Pub/Sub emulator at {}", endpoint);
            return Ok(Self::new(GcpCredentials::anonymous(), http, endpoint.as_str()));
        }

        let credentials = GcpCredentials::new().await?;
        let mut provider = Self::new(credentials, http, PUBSUB_ENDPOINT);
        provider.verify_token = true;
        Ok(provider)
    }

    pub fn new(credentials: GcpCredentials, http: GcpHttpClient, base_url: &str) -> Self {
        Self {
            credentials,
            http,
            base_url: base_url.to_string(),
            verify_token: false,
        }
    }

    pub fn credentials(&self) -> &GcpCredentials {
        &self.credentials
    }

    pub fn http(&self) -> &GcpHttpClient {
        &self.http
    }
}

#[async_trait]
impl ClientProvider for GcpClientProvider {
    async fn get_client(&self, project_id: &str) -> Result<std::sync::Arc<dyn PubSubApi>> {
        if self.verify_token {
            self.credentials.get_token().await.with_context(|| {
                format!("failed to create pubsub client for project {project_id}")
            })?;
        }

        tracing::debug!("Created Pub/Sub client for {}", project_id);
        Ok(std::sync::Arc::new(PubSubClient::with_base_url(
            project_id,
            self.credentials.clone(),
            self.http.clone(),
            &self.base_url,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_url_trims_trailing_slash() {
        let client = PubSubClient::with_base_url(
            "shop-prod",
            GcpCredentials::anonymous(),
            GcpHttpClient::new().unwrap(),
            "http://localhost:8085/",
        );
        assert_eq!(
            client.project_url("shop-prod", "topics"),
            "http://localhost:8085/v1/projects/shop-prod/topics"
        );
    }

    #[test]
    fn test_subscription_entry_decodes_camel_case() {
        let response: ListSubscriptionsResponse = serde_json::from_str(
            r#"{"subscriptions":[{"name":"projects/b/subscriptions/s","topic":"projects/a/topics/t","ackDeadlineSeconds":10}],"nextPageToken":"abc"}"#,
        )
        .unwrap();
        assert_eq!(response.subscriptions[0].topic, "projects/a/topics/t");
        assert_eq!(response.next_page_token.as_deref(), Some("abc"));

        let empty: ListTopicsResponse = serde_json::from_str("{}").unwrap();
        assert!(empty.topics.is_empty());
        assert!(empty.next_page_token.is_none());
    }
}
