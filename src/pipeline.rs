use anyhow::Result;
use chrono::{DateTime, Utc};
use report_schema::{ImageSizeRecord, Report, RunRecord, SizeSnapshot};

use crate::build_log::{extract_intervals, package_durations};
use crate::config::{Config, WorkflowSettings};
use crate::github::{GitHubClient, PullRequest};
use crate::http::{FetchError, Transport};
use crate::logs::{fetch_logs_cached, is_within_retention, select_build_log};
use crate::registry::{ImageSizeOutcome, RegistryClient};
use crate::report::{ImageObservation, ReportBuilder, RunDetails, run_records};
use crate::snapshots;
use crate::store::Store;
use crate::workflows::{WorkflowRun, filter_by_duration, list_runs};

/// Everything one collection pass needs, borrowed from the CLI.
pub struct Collector<'a, G, R> {
    pub config: &'a Config,
    pub store: &'a Store,
    pub github: &'a GitHubClient<G>,
    pub registry: &'a RegistryClient<R>,
    pub now: DateTime<Utc>,
}

impl<'a, G: Transport, R: Transport> Collector<'a, G, R> {
    pub fn new(
        config: &'a Config,
        store: &'a Store,
        github: &'a GitHubClient<G>,
        registry: &'a RegistryClient<R>,
    ) -> Self {
        Collector {
            config,
            store,
            github,
            registry,
            now: Utc::now(),
        }
    }

    /// Build the full dashboard report. Fails only when a run listing or the
    /// package listing fails; individual runs and tags are skipped instead.
    pub async fn collect_report(&self) -> Result<Report> {
        let taxonomy = self.config.registry.taxonomy;
        let mut builder = ReportBuilder::new(taxonomy.categories());

        for workflow in &self.config.workflows {
            let records = self.collect_workflow(workflow).await?;
            tracing::info!("{}: {} runs", workflow.name, records.len());
            builder.add_workflow(&workflow.name, records);
        }

        let mut filed = 0;
        for observation in self.collect_image_observations().await? {
            filed += usize::from(builder.add_image(observation));
        }
        for observation in
            snapshots::load_history(&self.config.data_dir, self.config.since, taxonomy)?
        {
            filed += usize::from(builder.add_image(observation));
        }
        tracing::info!("{} image size points", filed);

        Ok(builder.build())
    }

    /// Runs of one workflow as report rows.
    pub async fn collect_workflow(&self, workflow: &WorkflowSettings) -> Result<Vec<RunRecord>> {
        let repo = &self.config.github.repo;
        let mut runs = list_runs(
            self.github,
            repo,
            &workflow.id,
            workflow.mode,
            self.config.since,
        )
        .await?;
        if let Some(bounds) = workflow.bounds {
            let before = runs.len();
            runs = filter_by_duration(runs, bounds);
            tracing::debug!(
                "{}: {} of {} runs outside duration bounds",
                workflow.name,
                before - runs.len(),
                before
            );
        }

        let details = self.collect_run_details(&runs, workflow).await;
        Ok(run_records(&runs, &workflow.job_aliases, &details))
    }

    /// Per-package build durations for every run whose log is still
    /// retained and contains a build log.
    pub async fn collect_run_details(
        &self,
        runs: &[WorkflowRun],
        workflow: &WorkflowSettings,
    ) -> RunDetails {
        let mut details = RunDetails::new();
        if workflow.log_patterns.is_empty() {
            return details;
        }
        let repo = &self.config.github.repo;

        for run in runs {
            if !is_within_retention(run.created_at, self.now, self.config.log_retention_days) {
                continue;
            }
            let bundle = match fetch_logs_cached(self.store, self.github, repo, run.id).await {
                Ok(bundle) => bundle,
                Err(e) => {
                    let expired = e
                        .downcast_ref::<FetchError>()
                        .is_some_and(FetchError::is_not_found);
                    if expired {
                        tracing::info!("log for run_id={} is gone", run.id);
                    } else {
                        tracing::warn!("log for run_id={} cannot be fetched: {:#}", run.id, e);
                    }
                    continue;
                }
            };
            let Some(text) = select_build_log(&bundle, &workflow.log_patterns) else {
                tracing::info!("log for run_id={} not found", run.id);
                continue;
            };

            let mut intervals = Vec::new();
            for entry in extract_intervals(text) {
                match entry {
                    Ok(interval) => intervals.push(interval),
                    Err(e) => tracing::debug!("run {}: {}", run.id, e),
                }
            }
            details.insert(run.id, package_durations(&intervals));
        }
        details
    }

    /// Compressed size of every classifiable package version.
    pub async fn collect_image_observations(&self) -> Result<Vec<ImageObservation>> {
        let registry = &self.config.registry;
        let versions = self
            .github
            .list_package_versions(&registry.org, &registry.image)
            .await?;
        tracing::info!("{} package versions", versions.len());

        let mut observations = Vec::new();
        for version in &versions {
            let Some(tag) = version.first_tag() else {
                continue;
            };
            let Some(category) = registry.taxonomy.classify(tag) else {
                tracing::debug!("no category for {}", tag);
                continue;
            };
            let Some(date) = version.updated_at() else {
                tracing::warn!("package version {} has no usable updated_at", version.id);
                continue;
            };

            tracing::info!("fetching manifest for {}", tag);
            // Version tags are immutable, so their manifests are cached.
            match self.registry.resolve_image(tag, Some(self.store)).await {
                ImageSizeOutcome::Measured(image) => observations.push(ImageObservation {
                    category,
                    size: image.compressed_size,
                    date,
                    tag: image.tag,
                }),
                ImageSizeOutcome::Error { .. } => continue,
            }
        }
        Ok(observations)
    }
}

/// Measure the configured tags for a snapshot. Tags are re-resolved every
/// time since they move.
pub async fn measure_tags<R: Transport>(
    registry: &RegistryClient<R>,
    config: &Config,
) -> SizeSnapshot {
    let settings = &config.registry;
    let mut images: Vec<ImageSizeRecord> = Vec::with_capacity(settings.tags.len());
    for tag in &settings.tags {
        tracing::info!("processing {}", tag);
        images.push(registry.resolve_image(tag, None).await.into());
    }
    SizeSnapshot {
        registry: settings.service.clone(),
        org: settings.org.clone(),
        image: settings.image.clone(),
        tags: settings.tags.clone(),
        timestamp: Utc::now(),
        images,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PullSummary {
    pub total: usize,
    pub open: usize,
    pub closed: usize,
    pub median_time_to_close: Option<chrono::Duration>,
    /// Number of the longest-open pull request.
    pub oldest_open: Option<u64>,
}

pub fn summarize_pulls(pulls: &[PullRequest]) -> PullSummary {
    let mut close_times: Vec<chrono::Duration> = pulls
        .iter()
        .filter_map(|pr| Some(pr.closed_at? - pr.created_at))
        .collect();
    close_times.sort();
    let median_time_to_close = match close_times.len() {
        0 => None,
        n if n % 2 == 1 => Some(close_times[n / 2]),
        n => Some((close_times[n / 2 - 1] + close_times[n / 2]) / 2),
    };
    PullSummary {
        total: pulls.len(),
        open: pulls.iter().filter(|pr| pr.state == "open").count(),
        closed: close_times.len(),
        median_time_to_close,
        oldest_open: pulls
            .iter()
            .filter(|pr| pr.state == "open")
            .min_by_key(|pr| pr.created_at)
            .map(|pr| pr.number),
    }
}
