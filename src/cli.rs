use anyhow::{Context, Result};
use bytesize::ByteSize;
use chrono::{DateTime, Utc};
use std::path::Path;

use crate::config::Config;
use crate::github::GitHubClient;
use crate::http::ReqwestTransport;
use crate::pipeline::{Collector, measure_tags, summarize_pulls};
use crate::registry::RegistryClient;
use crate::report::write_report;
use crate::snapshots;
use crate::store::Store;

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")
}

fn github_client(config: &Config) -> Result<GitHubClient<ReqwestTransport>> {
    let transport = ReqwestTransport::new(config.http_timeout)?;
    if config.github.token.is_none() {
        tracing::warn!("GITHUB_TOKEN is not set; requests are rate limited and logs are unavailable");
    }
    Ok(GitHubClient::new(transport, &config.github))
}

/// Collect workflow durations, package build times and image sizes into the
/// dashboard report.
pub fn collect(config: &Config, output: Option<&Path>) -> Result<()> {
    let store = Store::open(config)?;
    let github = github_client(config)?;
    let output = output.unwrap_or(config.output_path.as_path());

    let rt = runtime()?;
    let report = rt.block_on(async {
        let registry = RegistryClient::authenticate(
            ReqwestTransport::new(config.http_timeout)?,
            &config.registry,
        )
        .await?;
        Collector::new(config, &store, &github, &registry)
            .collect_report()
            .await
    })?;

    write_report(output, &report)?;

    let runs: usize = report.workflow_time.values().map(Vec::len).sum();
    let points: usize = report.docker_images.values().map(Vec::len).sum();
    eprintln!(
        "[ci-telemetry] wrote {} ({} workflows, {} runs, {} image size points)",
        output.display(),
        report.workflow_time.len(),
        runs,
        points
    );
    Ok(())
}

/// Size the configured tags and record a snapshot if anything changed.
pub fn images(config: &Config, output_dir: Option<&Path>, dry_run: bool) -> Result<()> {
    let data_dir = output_dir.unwrap_or(config.data_dir.as_path());

    let rt = runtime()?;
    let snapshot = rt.block_on(async {
        let registry = RegistryClient::authenticate(
            ReqwestTransport::new(config.http_timeout)?,
            &config.registry,
        )
        .await?;
        anyhow::Ok(measure_tags(&registry, config).await)
    })?;

    let failed = snapshot.images.iter().filter(|i| i.is_error()).count();
    println!(
        "Measured {} tags ({} failed) from {}/{}/{}",
        snapshot.images.len(),
        failed,
        snapshot.registry,
        snapshot.org,
        snapshot.image
    );

    let previous = match snapshots::latest_snapshot(data_dir) {
        Ok(previous) => previous,
        Err(e) => {
            tracing::warn!("cannot read previous snapshot, treating data as new: {:#}", e);
            None
        }
    };
    if !snapshots::has_new_data(&snapshot, previous.as_ref()) {
        println!("No changes since the last snapshot.");
        return Ok(());
    }

    if dry_run {
        let path = snapshots::snapshot_path(data_dir, snapshot.timestamp);
        println!("Would write {}", path.display());
        return Ok(());
    }
    let path = snapshots::write_snapshot(data_dir, &snapshot)?;
    println!("Wrote {}", path.display());
    Ok(())
}

/// Print pull request counts and the median time to close.
pub fn pulls(config: &Config) -> Result<()> {
    let github = github_client(config)?;
    let repo = &config.github.repo;

    let rt = runtime()?;
    let pulls = rt
        .block_on(github.list_pull_requests(repo))
        .with_context(|| format!("listing pull requests of {repo}"))?;
    let summary = summarize_pulls(&pulls);

    println!("{repo}");
    println!("  Total:   {}", summary.total);
    println!("  Open:    {}", summary.open);
    println!("  Closed:  {}", summary.closed);
    match summary.median_time_to_close {
        Some(median) => println!("  Median time to close: {}", format_span(median)),
        None => println!("  Median time to close: -"),
    }
    if let Some(number) = summary.oldest_open {
        println!("  Oldest open: #{number}");
    }
    Ok(())
}

fn format_span(span: chrono::Duration) -> String {
    let hours = span.num_hours();
    if hours >= 48 {
        format!("{:.1} days", span.num_minutes() as f64 / 1440.0)
    } else {
        format!("{:.1} hours", span.num_seconds() as f64 / 3600.0)
    }
}

/// List cached fetch results.
pub fn cache_list(config: &Config) -> Result<()> {
    let store = Store::open(config)?;
    let entries = store.list_entries()?;

    if entries.is_empty() {
        println!("No cached entries.");
        return Ok(());
    }

    println!("{:<60} {:>10} {:>20}", "Entry", "Size", "Modified");
    println!("{}", "-".repeat(92));
    for entry in &entries {
        let modified = entry
            .modified
            .map(|m| DateTime::<Utc>::from(m).format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<60} {:>10} {:>20}",
            entry.file_name,
            ByteSize(entry.size).to_string(),
            modified
        );
    }

    let total: u64 = entries.iter().map(|e| e.size).sum();
    println!(
        "\n{} entries, {} in {}",
        entries.len(),
        ByteSize(total),
        store.root().display()
    );
    Ok(())
}

/// Remove every cached fetch result.
pub fn cache_purge(config: &Config) -> Result<()> {
    let store = Store::open(config)?;
    let size = store.total_size()?;
    let removed = store.purge()?;
    println!("Removed {removed} entries ({}).", ByteSize(size));
    Ok(())
}
