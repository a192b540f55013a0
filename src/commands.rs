//! Command implementations
//!
//! The binary parses arguments and hands off here. Each command takes its
//! collaborators explicitly so the pipeline can run against fakes in tests.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::collector::{Collector, ProjectPool};
use crate::config::Config;
use crate::gcp::auth::{self, GcpCredentials};
use crate::gcp::client::{ClientProvider, GcpClientProvider};
use crate::gcp::http::{format_gcp_error, GcpHttpClient};
use crate::gcp::projects::ProjectLister;
use crate::graph::{Graph, GraphBuilder};
use crate::render::{self, Layout, OutputFormat};
use crate::storage::{ProjectRecord, Store};

/// Where projects to scan come from, in priority order
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    pub projects: Vec<String>,
    /// Discover every accessible project through Resource Manager
    pub all: bool,
    pub organization_id: Option<String>,
    /// Rescan projects even if their cached data is fresh
    pub force: bool,
}

/// Outcome of a scan that ran to completion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub collected: Vec<String>,
    /// Fresh enough to skip
    pub skipped: Vec<String>,
    /// Project ID → rendered error
    pub failed: BTreeMap<String, String>,
}

impl ScanReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn print_summary(&self) {
        println!(
            "Scanned {} project(s), skipped {} fresh, {} failed",
            self.collected.len() + self.failed.len(),
            self.skipped.len(),
            self.failed.len()
        );
        for (project, error) in &self.failed {
            println!("  {project}: {error}");
        }
    }
}

/// Decide which projects a scan covers.
///
/// Explicit projects win, then `--all` discovery, then the configured list,
/// then the gcloud default project.
pub async fn resolve_projects(options: &ScanOptions, config: &Config) -> Result<Vec<String>> {
    let mut projects = if !options.projects.is_empty() {
        options.projects.clone()
    } else if options.all {
        let organization = options
            .organization_id
            .as_deref()
            .or(config.organization_id.as_deref());
        let lister = ProjectLister::new(GcpCredentials::new().await?, GcpHttpClient::new()?);
        lister
            .list_project_ids(organization)
            .await
            .map_err(|e| anyhow::anyhow!(format_gcp_error(&e)))
            .context("failed to list projects")?
    } else if !config.projects.is_empty() {
        config.projects.clone()
    } else {
        auth::get_default_project().into_iter().collect()
    };

    projects.sort();
    projects.dedup();

    if projects.is_empty() {
        anyhow::bail!(
            "No projects to scan. Pass --projects, use --all, set projects in the config file or GCP_VISUALIZER_PROJECTS"
        );
    }
    if let Some(bad) = projects.iter().find(|p| !auth::validate_project_id(p)) {
        anyhow::bail!("invalid project ID: {bad:?}");
    }
    Ok(projects)
}

/// Split `projects` into those needing a scan and those still fresh.
pub async fn partition_fresh(
    cancel: &CancellationToken,
    store: &dyn Store,
    projects: &[String],
    ttl: chrono::Duration,
) -> Result<(Vec<String>, Vec<String>)> {
    let records: HashMap<String, ProjectRecord> = store
        .get_project_records(cancel)
        .await
        .context("failed to read project sync times")?
        .into_iter()
        .map(|r| (r.project_id.clone(), r))
        .collect();

    let now = Utc::now();
    let (stale, fresh): (Vec<String>, Vec<String>) = projects.iter().cloned().partition(|p| {
        records
            .get(p)
            .map_or(true, |record| record.is_older_than(ttl, now))
    });
    Ok((stale, fresh))
}

/// Collect `projects` with the given provider, skipping fresh ones unless
/// `force` is set.
pub async fn run_scan(
    cancel: &CancellationToken,
    store: Arc<dyn Store>,
    provider: Arc<dyn ClientProvider>,
    config: &Config,
    projects: &[String],
    force: bool,
) -> Result<ScanReport> {
    let (to_scan, skipped) = if force {
        (projects.to_vec(), Vec::new())
    } else {
        partition_fresh(cancel, store.as_ref(), projects, config.ttl()).await?
    };

    for project in &skipped {
        tracing::info!("Skipping {}: synced within the last {}h", project, config.cache.ttl_hours);
    }

    let mut report = ScanReport {
        skipped,
        ..Default::default()
    };
    if to_scan.is_empty() {
        return Ok(report);
    }

    let limits = &config.rate_limits;
    let collector = Arc::new(Collector::new(provider, store, limits.requests_per_second));
    let pool = ProjectPool::new(limits.requests_per_second, limits.max_concurrent);

    let outcome = pool.collect_all(cancel, collector.clone(), &to_scan).await;

    if let Err(e) = collector.close().await {
        tracing::warn!("{:#}", e);
    }

    let errors = pool.errors();
    if let Err(summary) = outcome {
        tracing::error!("{}", summary);
    }

    for project in to_scan {
        match errors.get(&project) {
            Some(err) => {
                report.failed.insert(project, format!("{:#}", err));
            },
            None => report.collected.push(project),
        }
    }

    Ok(report)
}

/// `scan`: collect the requested projects into the store.
pub async fn scan(
    cancel: &CancellationToken,
    store: Arc<dyn Store>,
    config: &Config,
    options: &ScanOptions,
) -> Result<ScanReport> {
    let projects = resolve_projects(options, config).await?;
    println!("Scanning {} project(s)...", projects.len());

    let provider = Arc::new(GcpClientProvider::from_environment().await?);
    run_scan(cancel, store, provider, config, &projects, options.force).await
}

/// `sync`: rescan every cached project older than the TTL.
pub async fn sync(
    cancel: &CancellationToken,
    store: Arc<dyn Store>,
    config: &Config,
) -> Result<ScanReport> {
    let known = store.get_all_projects(cancel).await?;
    if known.is_empty() {
        anyhow::bail!("No cached projects to sync. Run `scan` first");
    }

    let (stale, fresh) = partition_fresh(cancel, store.as_ref(), &known, config.ttl()).await?;
    if stale.is_empty() {
        println!("All {} cached project(s) are fresh", fresh.len());
        return Ok(ScanReport {
            skipped: fresh,
            ..Default::default()
        });
    }

    println!("Refreshing {} stale project(s)...", stale.len());
    let provider = Arc::new(GcpClientProvider::from_environment().await?);
    let mut report = run_scan(cancel, store, provider, config, &stale, true).await?;
    report.skipped = fresh;
    Ok(report)
}

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub projects: Vec<String>,
    pub format: OutputFormat,
    pub layout: Layout,
    /// `None` writes to stdout
    pub output: Option<PathBuf>,
}

/// Build the graph for the requested scope, warning about stale projects.
///
/// Fails when the store holds nothing for the scope.
pub async fn load_graph(
    cancel: &CancellationToken,
    store: Arc<dyn Store>,
    projects: &[String],
    max_age: chrono::Duration,
) -> Result<Graph> {
    let records = store.get_project_records(cancel).await?;
    let in_scope: Vec<&ProjectRecord> = records
        .iter()
        .filter(|r| projects.is_empty() || projects.contains(&r.project_id))
        .collect();

    if in_scope.is_empty() {
        anyhow::bail!("No cached data found. Run `scan` first");
    }
    for missing in projects
        .iter()
        .filter(|p| !in_scope.iter().any(|r| &r.project_id == *p))
    {
        tracing::warn!("Project {} has never been scanned", missing);
    }

    let now = Utc::now();
    let stale: Vec<&str> = in_scope
        .iter()
        .filter(|r| r.is_older_than(max_age, now))
        .map(|r| r.project_id.as_str())
        .collect();
    if !stale.is_empty() {
        tracing::warn!(
            "Cached data older than {}h for: {}. Run `sync` to refresh",
            max_age.num_hours(),
            stale.join(", ")
        );
    }

    let graph = GraphBuilder::new(store).build(cancel, projects).await?;
    if graph.is_empty() {
        anyhow::bail!("No topics or subscriptions cached for the selected projects");
    }
    Ok(graph)
}

/// `generate`: render cached data.
pub async fn generate(
    cancel: &CancellationToken,
    store: Arc<dyn Store>,
    config: &Config,
    options: &GenerateOptions,
) -> Result<()> {
    let graph = load_graph(cancel, store, &options.projects, config.max_age()).await?;

    if !graph.unresolved.is_empty() {
        eprintln!(
            "warning: {} subscription(s) reference topics that were not scanned",
            graph.unresolved.len()
        );
    }

    let bytes = render::render(&graph, options.format, options.layout).await?;
    render::write_output(&bytes, options.output.as_deref(), options.format).await?;

    if let Some(path) = &options.output {
        println!(
            "Wrote {} nodes, {} edges ({} cross-project) to {}",
            graph.nodes.len(),
            graph.edges.len(),
            graph.cross_project_edges().count(),
            path.display()
        );
    }
    Ok(())
}

/// `projects`: list cached projects and their age.
pub async fn list_projects(
    cancel: &CancellationToken,
    store: &dyn Store,
    config: &Config,
) -> Result<()> {
    let records = store.get_project_records(cancel).await?;
    if records.is_empty() {
        println!("No cached projects");
        return Ok(());
    }

    let now = Utc::now();
    let width = records
        .iter()
        .map(|r| r.project_id.len())
        .max()
        .unwrap_or(0);
    for record in &records {
        let Some(synced) = record.last_synced else {
            println!("{:width$}  never completed", record.project_id);
            continue;
        };
        let flag = if record.is_older_than(config.max_age(), now) {
            " (stale)"
        } else {
            ""
        };
        println!(
            "{:width$}  {}  {}{}",
            record.project_id,
            synced.format("%Y-%m-%d %H:%M:%S UTC"),
            format_age(now - synced),
            flag,
        );
    }
    Ok(())
}

/// `config show`: print the effective configuration.
pub fn config_show(config: &Config, path: Option<&std::path::Path>) -> Result<()> {
    if let Some(path) = path {
        println!("# {}", path.display());
    }
    print!("{}", config.to_yaml()?);
    Ok(())
}

/// `config init`: write the defaults, refusing to clobber an existing file.
pub fn config_init(path: &std::path::Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists; pass --force to overwrite", path.display());
    }
    Config::default().save_to(path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

fn format_age(age: chrono::Duration) -> String {
    if age.num_days() > 0 {
        format!("{}d ago", age.num_days())
    } else if age.num_hours() > 0 {
        format!("{}h ago", age.num_hours())
    } else if age.num_minutes() > 0 {
        format!("{}m ago", age.num_minutes())
    } else {
        "just now".to_string()
    }
}
