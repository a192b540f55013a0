//! Resource graph
//!
//! Rebuilds a directed subscription → topic graph from stored resources, with
//! one cluster per project. Built fresh for every render and never persisted.
//!
//! A subscription whose topic is not among the loaded topics (its project was
//! never scanned, or the topic was deleted) still gets an edge. It points at a
//! placeholder topic node flagged `unresolved`, and the reference is listed in
//! [`Graph::unresolved`] so callers can report it.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::storage::{Store, Subscription, Topic};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Topic,
    Subscription,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Topic => "topic",
            NodeKind::Subscription => "subscription",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Subscribes,
    CrossProject,
}

impl EdgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeKind::Subscribes => "subscribes",
            EdgeKind::CrossProject => "cross_project",
        }
    }
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Node {
    pub id: String,
    pub label: String,
    pub kind: NodeKind,
    pub project_id: String,
    /// Placeholder for a topic that was referenced but not loaded
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub unresolved: bool,
}

/// Directed from a subscription node to a topic node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub kind: EdgeKind,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cluster {
    pub project_id: String,
    pub node_ids: BTreeSet<String>,
}

/// A subscription whose topic was not among the loaded topics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnresolvedReference {
    pub subscription: String,
    pub topic_full_resource_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Graph {
    pub nodes: BTreeMap<String, Node>,
    pub edges: Vec<Edge>,
    pub clusters: BTreeMap<String, Cluster>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unresolved: Vec<UnresolvedReference>,
}

impl Graph {
    /// Build from already-loaded resources.
    ///
    /// Inputs are sorted by full resource name first, so the same resources
    /// always produce the same edge order.
    pub fn from_resources(topics: &[Topic], subscriptions: &[Subscription]) -> Self {
        let mut graph = Graph::default();

        let mut topics: Vec<&Topic> = topics.iter().collect();
        topics.sort_by(|a, b| a.full_resource_name.cmp(&b.full_resource_name));
        for topic in topics {
            graph.add_node(Node {
                id: node_id(NodeKind::Topic, &topic.project_id, &topic.name),
                label: topic.name.clone(),
                kind: NodeKind::Topic,
                project_id: topic.project_id.clone(),
                unresolved: false,
            });
        }

        let mut subscriptions: Vec<&Subscription> = subscriptions.iter().collect();
        subscriptions.sort_by(|a, b| a.full_resource_name.cmp(&b.full_resource_name));
        for sub in subscriptions {
            let sub_id = node_id(NodeKind::Subscription, &sub.project_id, &sub.name);
            graph.add_node(Node {
                id: sub_id.clone(),
                label: sub.name.clone(),
                kind: NodeKind::Subscription,
                project_id: sub.project_id.clone(),
                unresolved: false,
            });

            let topic_ref = sub.topic_full_resource_name.as_str();
            let (topic_project, topic_id) = match parse_topic_reference(topic_ref) {
                Some((project, name)) => (project, node_id(NodeKind::Topic, project, name)),
                // Kept apart from real topic IDs so `abc` never resolves to topic `abc`
                None => (
                    sub.project_id.as_str(),
                    format!("unresolved:{}:{}", sub.project_id, topic_ref),
                ),
            };

            let resolved = graph.nodes.get(&topic_id).map(|node| !node.unresolved);
            if resolved != Some(true) {
                tracing::warn!(
                    "Subscription {} references topic {:?} which is not loaded",
                    sub.full_resource_name,
                    topic_ref
                );
                graph.unresolved.push(UnresolvedReference {
                    subscription: sub_id.clone(),
                    topic_full_resource_name: topic_ref.to_string(),
                });
                if resolved.is_none() {
                    graph.add_node(Node {
                        id: topic_id.clone(),
                        label: placeholder_label(topic_ref),
                        kind: NodeKind::Topic,
                        project_id: topic_project.to_string(),
                        unresolved: true,
                    });
                }
            }

            let kind = if topic_project == sub.project_id {
                EdgeKind::Subscribes
            } else {
                EdgeKind::CrossProject
            };
            graph.edges.push(Edge {
                from: sub_id,
                to: topic_id,
                kind,
                label: kind.as_str().to_string(),
            });
        }

        graph
    }

    fn add_node(&mut self, node: Node) {
        self.clusters
            .entry(node.project_id.clone())
            .or_insert_with(|| Cluster {
                project_id: node.project_id.clone(),
                node_ids: BTreeSet::new(),
            })
            .node_ids
            .insert(node.id.clone());
        self.nodes.insert(node.id.clone(), node);
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn cross_project_edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges
            .iter()
            .filter(|e| e.kind == EdgeKind::CrossProject)
    }

    /// Number of nodes of each kind, placeholders excluded
    pub fn count(&self, kind: NodeKind) -> usize {
        self.nodes
            .values()
            .filter(|n| n.kind == kind && !n.unresolved)
            .count()
    }
}

/// Reads everything in scope from the store and builds a [`Graph`].
pub struct GraphBuilder {
    store: Arc<dyn Store>,
}

impl GraphBuilder {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Build the graph for `projects`, or for every stored project when empty.
    pub async fn build(&self, cancel: &CancellationToken, projects: &[String]) -> Result<Graph> {
        let topics = self
            .store
            .get_all_topics(cancel, projects)
            .await
            .context("failed to load topics")?;
        let subscriptions = self
            .store
            .get_all_subscriptions(cancel, projects)
            .await
            .context("failed to load subscriptions")?;

        let graph = Graph::from_resources(&topics, &subscriptions);
        tracing::info!(
            "Built graph: {} nodes, {} edges, {} clusters, {} unresolved",
            graph.nodes.len(),
            graph.edges.len(),
            graph.clusters.len(),
            graph.unresolved.len()
        );
        Ok(graph)
    }
}

/// Stable node ID: `kind:project:name`.
///
/// Project IDs and resource names never contain `:`, so IDs are unique across
/// projects holding same-named resources.
pub fn node_id(kind: NodeKind, project_id: &str, name: &str) -> String {
    format!("{kind}:{project_id}:{name}")
}

/// Split `projects/{project}/topics/{name}` into `(project, name)`.
pub fn parse_topic_reference(full_resource_name: &str) -> Option<(&str, &str)> {
    let mut parts = full_resource_name.split('/');
    match (parts.next(), parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some("projects"), Some(project), Some("topics"), Some(name), None)
            if !project.is_empty() && !name.is_empty() =>
        {
            Some((project, name))
        }
        _ => None,
    }
}

fn placeholder_label(topic_ref: &str) -> String {
    match parse_topic_reference(topic_ref) {
        Some((_, name)) => name.to_string(),
        None if topic_ref.is_empty() => "(no topic)".to_string(),
        None => topic_ref.to_string(),
    }
}
