//! Graphviz process runner
//!
//! Pipes DOT source through a layout engine (`fdp`, `dot`, `neato`) and
//! returns the rendered image bytes.

use std::io::ErrorKind;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{Layout, OutputFormat};

pub struct Graphviz {
    program: String,
}

impl Graphviz {
    pub fn new(layout: Layout) -> Self {
        Self {
            program: layout.program().to_string(),
        }
    }

    /// Use a specific executable instead of the one on `PATH`
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub async fn render(&self, source: &str, format: OutputFormat) -> Result<Vec<u8>> {
        let mut child = match Command::new(&self.program)
            .arg(format!("-T{}", format.as_str()))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                anyhow::bail!(
                    "Graphviz `{}` not found; install graphviz or use --format dot",
                    self.program
                )
            },
            Err(e) => {
                return Err(e).with_context(|| format!("failed to run {}", self.program));
            },
        };

        let mut stdin = child
            .stdin
            .take()
            .context("graphviz stdin was not captured")?;
        let input = source.as_bytes().to_vec();

        // Feed stdin while reading stdout so large graphs can't fill both pipes
        let feed = async move {
            stdin.write_all(&input).await?;
            stdin.shutdown().await
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output.with_context(|| format!("failed to wait for {}", self.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            );
        }
        fed.with_context(|| format!("failed to write graph to {}", self.program))?;

        tracing::debug!(
            "{} produced {} bytes of {}",
            self.program,
            output.stdout.len(),
            format
        );
        Ok(output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_program_suggests_dot_output() {
        let err = Graphviz::with_program("graphviz-binary-that-does-not-exist")
            .render("digraph {}", OutputFormat::Svg)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("--format dot"), "{err}");
    }

    #[test]
    fn test_layout_selects_program() {
        assert_eq!(Graphviz::new(Layout::Neato).program, "neato");
    }
}
