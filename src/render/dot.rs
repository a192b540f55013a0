//! Graphviz DOT output

use std::fmt::Write;

use crate::graph::{EdgeKind, Graph, Node, NodeKind};

const TOPIC_FILL: &str = "#d6e6ff";
const SUBSCRIPTION_FILL: &str = "#e3f4dc";
const CROSS_PROJECT_COLOR: &str = "#d93025";

/// Render the graph as DOT source.
///
/// Each project becomes a `cluster_N` subgraph labelled with the project ID.
/// Cross-project edges are drawn dashed and red; placeholder topics dotted.
pub fn to_dot(graph: &Graph) -> String {
    let mut out = String::new();

    out.push_str("digraph pubsub {\n");
    out.push_str("  graph [rankdir=LR, fontname=\"Helvetica\", fontsize=12];\n");
    out.push_str("  node [fontname=\"Helvetica\", fontsize=10];\n");
    out.push_str("  edge [fontname=\"Helvetica\", fontsize=8];\n");

    for (index, cluster) in graph.clusters.values().enumerate() {
        let _ = writeln!(out, "\n  subgraph cluster_{index} {{");
        let _ = writeln!(out, "    label={};", quote(&cluster.project_id));
        out.push_str("    style=rounded;\n    color=\"#9aa0a6\";\n");

        for node in cluster.node_ids.iter().filter_map(|id| graph.nodes.get(id)) {
            let _ = writeln!(out, "    {} [{}];", quote(&node.id), node_attributes(node));
        }
        out.push_str("  }\n");
    }

    if !graph.edges.is_empty() {
        out.push('\n');
    }
    for edge in &graph.edges {
        let style = match edge.kind {
            EdgeKind::Subscribes => String::new(),
            EdgeKind::CrossProject => {
                format!(", style=dashed, color=\"{CROSS_PROJECT_COLOR}\", fontcolor=\"{CROSS_PROJECT_COLOR}\"")
            }
        };
        let _ = writeln!(
            out,
            "  {} -> {} [label={}{}];",
            quote(&edge.from),
            quote(&edge.to),
            quote(&edge.label),
            style
        );
    }

    out.push_str("}\n");
    out
}

fn node_attributes(node: &Node) -> String {
    let label = quote(&node.label);
    match (node.kind, node.unresolved) {
        (NodeKind::Topic, false) => {
            format!("label={label}, shape=box, style=\"rounded,filled\", fillcolor=\"{TOPIC_FILL}\"")
        }
        (NodeKind::Topic, true) => {
            format!("label={label}, shape=box, style=\"rounded,dotted\", tooltip=\"not scanned\"")
        }
        (NodeKind::Subscription, _) => {
            format!("label={label}, shape=ellipse, style=filled, fillcolor=\"{SUBSCRIPTION_FILL}\"")
        }
    }
}

/// Quote a DOT ID, escaping backslashes and quotes.
fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        match c {
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            c => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Subscription, Topic};

    fn sample() -> Graph {
        let topics = [Topic::new("invoices", "billing", "projects/billing/topics/invoices")];
        let subs = [
            Subscription::new(
                "invoice-watch",
                "orders",
                "projects/billing/topics/invoices",
                "projects/orders/subscriptions/invoice-watch",
            ),
            Subscription::new(
                "ledger",
                "orders",
                "projects/finance/topics/ledger",
                "projects/orders/subscriptions/ledger",
            ),
        ];
        Graph::from_resources(&topics, &subs)
    }

    #[test]
    fn test_one_cluster_per_project() {
        let dot = to_dot(&sample());
        assert_eq!(dot.matches("subgraph cluster_").count(), 3);
        assert!(dot.contains("label=\"billing\";"));
        assert!(dot.contains("label=\"finance\";"));
        assert!(dot.contains("label=\"orders\";"));
        assert!(dot.ends_with("}\n"));
    }

    #[test]
    fn test_edge_styles() {
        let dot = to_dot(&sample());
        let edge = dot
            .lines()
            .find(|l| l.contains("\"subscription:orders:invoice-watch\" -> \"topic:billing:invoices\""))
            .unwrap();
        assert!(edge.contains("style=dashed"));
        assert!(edge.contains("label=\"cross_project\""));

        let placeholder = dot
            .lines()
            .find(|l| l.trim_start().starts_with("\"topic:finance:ledger\" ["))
            .unwrap();
        assert!(placeholder.contains("dotted"));
    }

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote(r#"a"b\c"#), r#""a\"b\\c""#);
        assert_eq!(quote(""), "\"\"");
    }
}
