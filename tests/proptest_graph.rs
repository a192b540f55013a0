//! Property-based tests using proptest
//!
//! These tests check resource-name parsing and the structural invariants of
//! the graph built from arbitrary topics and subscriptions.

use std::collections::{BTreeMap, BTreeSet};

use gcp_pubsub_graph::collector::extract_resource_name;
use gcp_pubsub_graph::graph::{parse_topic_reference, EdgeKind, Graph, NodeKind};
use gcp_pubsub_graph::storage::{Subscription, Topic};
use proptest::prelude::*;

const PROJECTS: &[&str] = &["proj-alpha", "proj-beta", "proj-gamma"];

fn arb_project() -> impl Strategy<Value = &'static str> {
    prop::sample::select(PROJECTS)
}

fn arb_name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,8}"
}

/// Topics keyed by full resource name so duplicates collapse
fn arb_topics() -> impl Strategy<Value = Vec<Topic>> {
    prop::collection::vec((arb_project(), arb_name()), 0..20).prop_map(|pairs| {
        pairs
            .into_iter()
            .map(|(project, name)| {
                let full = format!("projects/{project}/topics/{name}");
                (full.clone(), Topic::new(&name, project, &full))
            })
            .collect::<BTreeMap<_, _>>()
            .into_values()
            .collect()
    })
}

/// A subscription's topic reference: well-formed, deleted, empty or garbage
fn arb_topic_reference() -> impl Strategy<Value = String> {
    prop_oneof![
        6 => (arb_project(), arb_name())
            .prop_map(|(project, name)| format!("projects/{project}/topics/{name}")),
        1 => Just("_deleted-topic_".to_string()),
        1 => Just(String::new()),
        1 => "[a-z/]{1,12}",
    ]
}

fn arb_subscriptions() -> impl Strategy<Value = Vec<Subscription>> {
    prop::collection::vec((arb_project(), arb_name(), arb_topic_reference()), 0..30).prop_map(
        |triples| {
            triples
                .into_iter()
                .map(|(project, name, topic_ref)| {
                    let full = format!("projects/{project}/subscriptions/{name}");
                    (full.clone(), Subscription::new(&name, project, &topic_ref, &full))
                })
                .collect::<BTreeMap<_, _>>()
                .into_values()
                .collect()
        },
    )
}

proptest! {
    /// Never panics and never returns a path separator
    #[test]
    fn extract_resource_name_has_no_separator(path in ".*") {
        let name = extract_resource_name(&path);
        prop_assert!(!name.contains('/'));
    }

    /// Matches the last non-empty segment
    #[test]
    fn extract_resource_name_is_last_segment(
        segments in prop::collection::vec("[a-z0-9_-]{0,6}", 0..6),
        trailing in 0usize..3,
    ) {
        let path = format!("{}{}", segments.join("/"), "/".repeat(trailing));
        let expected = segments
            .iter()
            .rev()
            .find(|s| !s.is_empty())
            .map(String::as_str)
            .unwrap_or("");
        prop_assert_eq!(extract_resource_name(&path), expected);
    }

    /// Well-formed topic names parse back to their parts
    #[test]
    fn topic_reference_parses_well_formed(project in "[a-z][a-z0-9-]{5,20}", name in arb_name()) {
        let full = format!("projects/{project}/topics/{name}");
        prop_assert_eq!(parse_topic_reference(&full), Some((project.as_str(), name.as_str())));
    }

    /// Every edge joins two existing nodes and runs from a subscription to a topic
    #[test]
    fn edges_reference_existing_nodes(topics in arb_topics(), subs in arb_subscriptions()) {
        let graph = Graph::from_resources(&topics, &subs);

        prop_assert_eq!(graph.edges.len(), subs.len());
        for edge in &graph.edges {
            let from = graph.nodes.get(&edge.from);
            let to = graph.nodes.get(&edge.to);
            prop_assert!(from.is_some(), "missing source {}", edge.from);
            prop_assert!(to.is_some(), "missing target {}", edge.to);
            prop_assert_eq!(from.unwrap().kind, NodeKind::Subscription);
            prop_assert_eq!(to.unwrap().kind, NodeKind::Topic);
        }
    }

    /// An edge is cross-project exactly when its endpoints sit in different projects
    #[test]
    fn cross_project_matches_endpoint_projects(topics in arb_topics(), subs in arb_subscriptions()) {
        let graph = Graph::from_resources(&topics, &subs);

        for edge in &graph.edges {
            let from = &graph.nodes[&edge.from];
            let to = &graph.nodes[&edge.to];
            let crosses = from.project_id != to.project_id;
            prop_assert_eq!(edge.kind == EdgeKind::CrossProject, crosses);
        }
        let counted = graph.cross_project_edges().count();
        let expected = graph.edges.iter().filter(|e| e.kind == EdgeKind::CrossProject).count();
        prop_assert_eq!(counted, expected);
    }

    /// Clusters partition the nodes by project
    #[test]
    fn clusters_partition_nodes(topics in arb_topics(), subs in arb_subscriptions()) {
        let graph = Graph::from_resources(&topics, &subs);

        let mut seen = BTreeSet::new();
        for (project, cluster) in &graph.clusters {
            prop_assert_eq!(project, &cluster.project_id);
            prop_assert!(!cluster.node_ids.is_empty());
            for id in &cluster.node_ids {
                prop_assert_eq!(&graph.nodes[id].project_id, project);
                prop_assert!(seen.insert(id.clone()), "{} in two clusters", id);
            }
        }
        let all: BTreeSet<String> = graph.nodes.keys().cloned().collect();
        prop_assert_eq!(seen, all);
    }

    /// Loaded resources are counted once; placeholders only for missing topics
    #[test]
    fn counts_match_inputs(topics in arb_topics(), subs in arb_subscriptions()) {
        let graph = Graph::from_resources(&topics, &subs);

        prop_assert_eq!(graph.count(NodeKind::Topic), topics.len());
        prop_assert_eq!(graph.count(NodeKind::Subscription), subs.len());

        let loaded: BTreeSet<&str> = topics.iter().map(|t| t.full_resource_name.as_str()).collect();
        let dangling = subs
            .iter()
            .filter(|s| !loaded.contains(s.topic_full_resource_name.as_str()))
            .count();
        prop_assert_eq!(graph.unresolved.len(), dangling);
    }

    /// Input order does not change the result
    #[test]
    fn build_is_order_independent(topics in arb_topics(), subs in arb_subscriptions()) {
        let forward = Graph::from_resources(&topics, &subs);

        let mut rev_topics = topics.clone();
        rev_topics.reverse();
        let mut rev_subs = subs.clone();
        rev_subs.reverse();
        let backward = Graph::from_resources(&rev_topics, &rev_subs);

        prop_assert_eq!(forward, backward);
    }
}
