use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::github::{GitHubClient, JobSummary, PER_PAGE, RunSummary, parse_timestamp};
use crate::http::Transport;

/// How a run's duration is reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurationMode {
    /// `updated_at - created_at`: one field read, but includes queue time.
    Approximate,
    /// Sum of per-job execution times; one extra request per run.
    Accurate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conclusion {
    Success,
    Failure,
    Other(String),
}

impl Conclusion {
    fn parse(s: &str) -> Self {
        match s {
            "success" => Conclusion::Success,
            "failure" => Conclusion::Failure,
            other => Conclusion::Other(other.to_string()),
        }
    }
}

/// A successful run with its reconciled duration.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowRun {
    pub id: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub conclusion: Conclusion,
    /// Job name → seconds. Only present for accurate-mode runs whose jobs
    /// were fetched.
    pub jobs: Option<BTreeMap<String, f64>>,
    /// Seconds.
    pub duration: f64,
}

impl WorkflowRun {
    fn wall_clock_secs(&self) -> f64 {
        seconds_between(self.created_at, self.updated_at)
    }
}

/// Exclusive duration window used to drop noise and stuck runs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DurationBounds {
    pub min_secs: f64,
    pub max_secs: f64,
}

impl DurationBounds {
    pub fn contains(&self, secs: f64) -> bool {
        self.min_secs < secs && secs < self.max_secs
    }
}

fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_milliseconds() as f64 / 1000.0
}

/// Fetch every completed run of a workflow, keep the successful ones created
/// after `date_threshold`, and compute their durations.
///
/// The result is sorted by `created_at`, oldest first; monthly bucketing on
/// the dashboard relies on that. Failing to list runs is fatal: a partial
/// listing would produce a report that looks complete.
pub async fn list_runs<T: Transport>(
    github: &GitHubClient<T>,
    repo: &str,
    workflow_id: &str,
    mode: DurationMode,
    date_threshold: Option<DateTime<Utc>>,
) -> Result<Vec<WorkflowRun>> {
    tracing::info!("fetching runs of {} in {}", workflow_id, repo);

    let first = github
        .workflow_runs_page(repo, workflow_id, 1)
        .await
        .with_context(|| format!("listing runs of {workflow_id}"))?;
    let pages = first.total_count.div_ceil(PER_PAGE as u64);

    let mut summaries = first.workflow_runs;
    for page in 2..=pages {
        let next = github
            .workflow_runs_page(repo, workflow_id, page)
            .await
            .with_context(|| format!("listing runs of {workflow_id} (page {page})"))?;
        // Older pages go in front so the list does not depend on fetch order.
        summaries.splice(0..0, next.workflow_runs);
    }

    let mut runs: Vec<WorkflowRun> = summaries
        .iter()
        .filter_map(successful_run)
        .filter(|run| date_threshold.is_none_or(|threshold| run.created_at > threshold))
        .collect();
    runs.sort_by_key(|run| run.created_at);

    match mode {
        DurationMode::Approximate => {
            for run in &mut runs {
                run.duration = run.wall_clock_secs();
            }
        }
        DurationMode::Accurate => {
            let jobs_urls: BTreeMap<u64, &str> = summaries
                .iter()
                .filter_map(|s| s.jobs_url.as_deref().map(|url| (s.id, url)))
                .collect();
            let total = runs.len();
            for (index, run) in runs.iter_mut().enumerate() {
                let Some(url) = jobs_urls.get(&run.id) else {
                    tracing::warn!("run {} has no jobs_url, using wall-clock duration", run.id);
                    run.duration = run.wall_clock_secs();
                    continue;
                };
                match github.jobs(url).await {
                    Ok(list) => {
                        let (jobs, duration) = job_durations(&list.jobs);
                        run.jobs = Some(jobs);
                        run.duration = duration;
                    }
                    Err(e) => {
                        tracing::warn!("fetching jobs for run {} failed: {}", run.id, e);
                        run.duration = run.wall_clock_secs();
                        continue;
                    }
                }
                tracing::info!(
                    "{}/{}: {} {}m {}s",
                    index + 1,
                    total,
                    run.created_at,
                    (run.duration / 60.0).floor(),
                    (run.duration % 60.0).floor()
                );
            }
        }
    }

    Ok(runs)
}

/// Keep runs inside `bounds`. Outlier rejection is the caller's call.
pub fn filter_by_duration(runs: Vec<WorkflowRun>, bounds: DurationBounds) -> Vec<WorkflowRun> {
    runs.into_iter()
        .filter(|run| bounds.contains(run.duration))
        .collect()
}

fn successful_run(summary: &RunSummary) -> Option<WorkflowRun> {
    let conclusion = Conclusion::parse(summary.conclusion.as_deref()?);
    if conclusion != Conclusion::Success {
        return None;
    }
    let created_at = parse_timestamp(summary.created_at.as_deref()?)?;
    let updated_at = parse_timestamp(summary.updated_at.as_deref()?)?;
    Some(WorkflowRun {
        id: summary.id,
        created_at,
        updated_at,
        conclusion,
        jobs: None,
        duration: 0.0,
    })
}

/// Per-job seconds and their sum. Jobs without both timestamps (skipped,
/// cancelled before start, still queued) are left out one by one.
pub fn job_durations(jobs: &[JobSummary]) -> (BTreeMap<String, f64>, f64) {
    let mut by_name = BTreeMap::new();
    let mut total = 0.0;
    for job in jobs {
        let started = job.started_at.as_deref().and_then(parse_timestamp);
        let completed = job.completed_at.as_deref().and_then(parse_timestamp);
        let (Some(started), Some(completed)) = (started, completed) else {
            tracing::debug!("skipping job {:?} with unparseable timestamps", job.name);
            continue;
        };
        let secs = seconds_between(started, completed);
        by_name.insert(job.name.clone(), secs);
        total += secs;
    }
    (by_name, total)
}
