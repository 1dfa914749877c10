use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use report_schema::{DASHBOARD_DATE_FORMAT, ImageSizePoint, Report, RunRecord};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use crate::config::JobAlias;
use crate::taxonomy::ImageCategory;
use crate::workflows::WorkflowRun;

/// Package name → build seconds, per run id.
pub type RunDetails = BTreeMap<u64, BTreeMap<String, f64>>;

/// One sized image version, before it is filed into a series.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageObservation {
    pub category: ImageCategory,
    pub size: u64,
    pub date: DateTime<Utc>,
    pub tag: String,
}

/// Turn collected runs into report rows, keeping their order.
///
/// Without aliases the raw per-job map is exported. With aliases, job names
/// are projected onto the alias legs; a run that has none of the aliased
/// jobs is left out of the series. A run whose jobs are unknown is always
/// kept, with `jobs: null`.
pub fn run_records(
    runs: &[WorkflowRun],
    aliases: &[JobAlias],
    details: &RunDetails,
) -> Vec<RunRecord> {
    runs.iter()
        .filter_map(|run| {
            let jobs = match &run.jobs {
                None => None,
                Some(jobs) if aliases.is_empty() => {
                    Some(jobs.iter().map(|(k, v)| (k.clone(), Some(*v))).collect())
                }
                Some(jobs) => Some(project_jobs(jobs, aliases)?),
            };
            Some(RunRecord {
                run_id: run.id,
                date: run.created_at.format(DASHBOARD_DATE_FORMAT).to_string(),
                duration: run.duration / 3600.0,
                jobs,
                details: details.get(&run.id).cloned(),
            })
        })
        .collect()
}

/// Alias → seconds of the job it matched (`None` if none did). Each job is
/// given to the first alias whose pattern it contains; `None` overall when no
/// job matched any alias.
fn project_jobs(
    jobs: &BTreeMap<String, f64>,
    aliases: &[JobAlias],
) -> Option<BTreeMap<String, Option<f64>>> {
    let mut projected: BTreeMap<String, Option<f64>> =
        aliases.iter().map(|a| (a.alias.clone(), None)).collect();
    let mut matched = false;
    for (name, secs) in jobs {
        if let Some(alias) = aliases.iter().find(|a| name.contains(a.job.as_str())) {
            projected.insert(alias.alias.clone(), Some(*secs));
            matched = true;
        }
    }
    matched.then_some(projected)
}

/// Assembles the dashboard report.
pub struct ReportBuilder {
    workflow_time: BTreeMap<String, Vec<RunRecord>>,
    images: BTreeMap<ImageCategory, Vec<ImageObservation>>,
}

impl ReportBuilder {
    /// `categories` are the image series the report carries; each starts out
    /// empty so the dashboard sees every series even without data.
    pub fn new(categories: impl IntoIterator<Item = ImageCategory>) -> Self {
        ReportBuilder {
            workflow_time: BTreeMap::new(),
            images: categories.into_iter().map(|c| (c, Vec::new())).collect(),
        }
    }

    pub fn add_workflow(&mut self, name: &str, records: Vec<RunRecord>) -> &mut Self {
        self.workflow_time
            .entry(name.to_string())
            .or_default()
            .extend(records);
        self
    }

    /// File an observation under its category. Returns false (and drops it)
    /// when the category is not one the report carries.
    pub fn add_image(&mut self, observation: ImageObservation) -> bool {
        match self.images.get_mut(&observation.category) {
            Some(series) => {
                series.push(observation);
                true
            }
            None => {
                tracing::debug!(
                    "dropping {}: category {} is not reported",
                    observation.tag,
                    observation.category
                );
                false
            }
        }
    }

    pub fn build(self) -> Report {
        let docker_images = self
            .images
            .into_iter()
            .map(|(category, mut observations)| {
                observations.sort_by_key(|o| o.date);
                let points = observations
                    .into_iter()
                    .map(|o| ImageSizePoint {
                        size: o.size,
                        date: o.date.format(DASHBOARD_DATE_FORMAT).to_string(),
                        tag: o.tag,
                    })
                    .collect();
                (category, points)
            })
            .collect();
        Report {
            workflow_time: self.workflow_time,
            docker_images,
        }
    }
}

/// Write the report as pretty JSON, replacing `path` atomically.
pub fn write_report(path: &Path, report: &Report) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let json = serde_json::to_string_pretty(report).context("serializing report")?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).context("creating temp report file")?;
    tmp.write_all(json.as_bytes())
        .context("writing temp report file")?;
    tmp.persist(path)
        .with_context(|| format!("writing report {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflows::Conclusion;
    use chrono::TimeZone;

    fn run(id: u64, day: u32, duration: f64, jobs: Option<Vec<(&str, f64)>>) -> WorkflowRun {
        let created_at = Utc.with_ymd_and_hms(2024, 3, day, 8, 30, 0).unwrap();
        WorkflowRun {
            id,
            created_at,
            updated_at: created_at,
            conclusion: Conclusion::Success,
            jobs: jobs.map(|jobs| {
                jobs.into_iter()
                    .map(|(name, secs)| (name.to_string(), secs))
                    .collect()
            }),
            duration,
        }
    }

    fn health_check_aliases() -> Vec<JobAlias> {
        [
            ("main-amd64", "docker-build (main)"),
            ("nightly-amd64", "docker-build (nightly)"),
            ("main-arm64", "docker-build (main-arm64)"),
        ]
        .iter()
        .map(|(alias, job)| JobAlias {
            alias: alias.to_string(),
            job: job.to_string(),
        })
        .collect()
    }

    #[test]
    fn test_run_records_with_details() {
        let runs = vec![
            run(1, 1, 7200.0, Some(vec![("build-main (cuda)", 7200.0)])),
            run(2, 2, 3600.0, None),
        ];
        let details = RunDetails::from([(1, BTreeMap::from([("pkg_a".to_string(), 32.3)]))]);
        let records = run_records(&runs, &[], &details);

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].date, "2024/03/01 08:30:00");
        assert_eq!(records[0].duration, 2.0);
        assert_eq!(records[0].jobs.as_ref().unwrap()["build-main (cuda)"], Some(7200.0));
        assert_eq!(records[0].details.as_ref().unwrap()["pkg_a"], 32.3);
        assert!(records[1].jobs.is_none());
        assert!(records[1].details.is_none());
    }

    #[test]
    fn test_aliases_project_jobs_and_keep_runs_without_jobs() {
        let runs = vec![
            run(
                1,
                1,
                100.0,
                Some(vec![
                    ("docker-build (main) / build", 60.0),
                    ("docker-build (main-arm64)", 40.0),
                    ("lint", 5.0),
                ]),
            ),
            run(2, 2, 100.0, Some(vec![("lint", 5.0)])),
            run(3, 3, 100.0, None),
        ];
        let records = run_records(&runs, &health_check_aliases(), &RunDetails::new());

        // Run 2 matched no alias; run 3 has no jobs at all and stays.
        let ids: Vec<u64> = records.iter().map(|r| r.run_id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert!(records[1].jobs.is_none());
        let jobs = records[0].jobs.as_ref().unwrap();
        assert_eq!(jobs.len(), 3);
        assert_eq!(jobs["main-amd64"], Some(60.0));
        // `docker-build (main)` is not a substring of `docker-build (main-arm64)`.
        assert_eq!(jobs["main-arm64"], Some(40.0));
        assert_eq!(jobs["nightly-amd64"], None);
    }

    #[test]
    fn test_builder_seeds_and_sorts_image_series() {
        let mut builder = ReportBuilder::new(["core-devel".to_string(), "universe".to_string()]);
        let day = |d| Utc.with_ymd_and_hms(2024, 5, d, 0, 0, 0).unwrap();
        assert!(builder.add_image(ImageObservation {
            category: "core-devel".to_string(),
            size: 2,
            date: day(3),
            tag: "core-devel-b".to_string(),
        }));
        assert!(builder.add_image(ImageObservation {
            category: "core-devel".to_string(),
            size: 1,
            date: day(1),
            tag: "core-devel-a".to_string(),
        }));
        assert!(!builder.add_image(ImageObservation {
            category: "universe-common".to_string(),
            size: 9,
            date: day(2),
            tag: "universe-common-x".to_string(),
        }));
        builder.add_workflow("health-check", Vec::new());

        let report = builder.build();
        let core: Vec<&str> = report.docker_images["core-devel"]
            .iter()
            .map(|p| p.tag.as_str())
            .collect();
        assert_eq!(core, vec!["core-devel-a", "core-devel-b"]);
        assert_eq!(report.docker_images["core-devel"][0].date, "2024/05/01 00:00:00");
        assert!(report.docker_images["universe"].is_empty());
        assert!(!report.docker_images.contains_key("universe-common"));
        assert!(report.workflow_time["health-check"].is_empty());
    }

    #[test]
    fn test_write_report_round_trips_with_nulls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/github_action_data.json");
        let mut builder = ReportBuilder::new(Vec::new());
        builder.add_workflow(
            "build-main",
            run_records(&[run(5, 4, 1800.0, None)], &[], &RunDetails::new()),
        );
        let report = builder.build();

        write_report(&path, &report).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"details\": null"));
        let back: Report = serde_json::from_str(&text).unwrap();
        assert_eq!(back, report);
    }
}
