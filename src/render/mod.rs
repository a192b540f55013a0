//! Graph output
//!
//! Turns a built [`Graph`] into bytes in the requested format.
//!
//! # Module Structure
//!
//! - [`dot`] - Graphviz DOT text with one cluster per project
//! - [`graphviz`] - runs a Graphviz layout engine over DOT for image formats

pub mod dot;
pub mod graphviz;

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::graph::Graph;

/// Output format for `generate`
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Svg,
    Png,
    Pdf,
    Dot,
    Json,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Svg => "svg",
            OutputFormat::Png => "png",
            OutputFormat::Pdf => "pdf",
            OutputFormat::Dot => "dot",
            OutputFormat::Json => "json",
        }
    }

    /// Formats produced by a Graphviz layout engine rather than in-process
    pub fn needs_graphviz(&self) -> bool {
        matches!(self, OutputFormat::Svg | OutputFormat::Png | OutputFormat::Pdf)
    }

    /// Binary formats cannot be written to a terminal
    pub fn is_binary(&self) -> bool {
        matches!(self, OutputFormat::Png | OutputFormat::Pdf)
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Graphviz layout engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    /// Force-directed, keeps clusters compact
    Fdp,
    /// Hierarchical
    Dot,
    /// Spring model
    Neato,
}

impl Layout {
    /// Name of the Graphviz executable
    pub fn program(&self) -> &'static str {
        match self {
            Layout::Fdp => "fdp",
            Layout::Dot => "dot",
            Layout::Neato => "neato",
        }
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.program())
    }
}

/// Render `graph` as `format`, laying out image formats with `layout`.
pub async fn render(graph: &Graph, format: OutputFormat, layout: Layout) -> Result<Vec<u8>> {
    match format {
        OutputFormat::Json => {
            serde_json::to_vec_pretty(graph).context("failed to encode graph as JSON")
        }
        OutputFormat::Dot => Ok(dot::to_dot(graph).into_bytes()),
        image => {
            let source = dot::to_dot(graph);
            graphviz::Graphviz::new(layout)
                .render(&source, image)
                .await
        }
    }
}

/// Write rendered output to `path`, or to stdout when no path is given.
pub async fn write_output(bytes: &[u8], path: Option<&Path>, format: OutputFormat) -> Result<()> {
    match path {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            tokio::fs::write(path, bytes)
                .await
                .with_context(|| format!("failed to write {}", path.display()))?;
            tracing::info!("Wrote {} bytes of {} to {}", bytes.len(), format, path.display());
        }
        None => {
            if format.is_binary() {
                anyhow::bail!("{format} output is binary; pass --output to write it to a file");
            }
            let mut stdout = tokio::io::stdout();
            stdout.write_all(bytes).await?;
            stdout.flush().await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_cli_value() {
        assert_eq!(OutputFormat::from_str("svg", true), Ok(OutputFormat::Svg));
        assert_eq!(OutputFormat::from_str("JSON", true), Ok(OutputFormat::Json));
        assert!(OutputFormat::from_str("html", true).is_err());
        assert!(OutputFormat::Pdf.needs_graphviz());
        assert!(!OutputFormat::Dot.needs_graphviz());
    }

    #[test]
    fn test_layout_serde_names() {
        let layout: Layout = serde_yaml::from_str("neato").unwrap();
        assert_eq!(layout, Layout::Neato);
        assert_eq!(serde_yaml::to_string(&Layout::Fdp).unwrap().trim(), "fdp");
    }

    #[tokio::test]
    async fn test_render_json_and_dot_in_process() {
        let graph = Graph::default();
        let json = render(&graph, OutputFormat::Json, Layout::Fdp).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&json).unwrap();
        assert!(value["nodes"].as_object().unwrap().is_empty());

        let dot = render(&graph, OutputFormat::Dot, Layout::Fdp).await.unwrap();
        assert!(String::from_utf8(dot).unwrap().starts_with("digraph pubsub {"));
    }

    #[tokio::test]
    async fn test_write_output_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("graph.dot");

        write_output(b"digraph {}", Some(&path), OutputFormat::Dot)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"digraph {}");
    }

    #[tokio::test]
    async fn test_binary_output_needs_a_file() {
        let err = write_output(b"\x89PNG", None, OutputFormat::Png)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("--output"));
    }
}
