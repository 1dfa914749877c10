use anyhow::{Context, Result, bail};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::registry::UncompressedStrategy;
use crate::taxonomy::Taxonomy;
use crate::workflows::{DurationBounds, DurationMode};

#[derive(Debug, Clone)]
pub struct Config {
    pub cache_dir: PathBuf,
    /// Where `collect` writes the dashboard report.
    pub output_path: PathBuf,
    /// Directory holding image-size snapshots.
    pub data_dir: PathBuf,
    /// Only runs created strictly after this instant are collected.
    pub since: Option<DateTime<Utc>>,
    /// GitHub keeps run logs this many days; older runs are not fetched.
    pub log_retention_days: i64,
    pub http_timeout: Duration,
    pub github: GitHubSettings,
    pub registry: RegistrySettings,
    pub workflows: Vec<WorkflowSettings>,
}

#[derive(Debug, Clone)]
pub struct GitHubSettings {
    pub api_url: String,
    pub token: Option<String>,
    /// `owner/name`.
    pub repo: String,
    pub log_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub url: String,
    /// `service` parameter of the token endpoint.
    pub service: String,
    pub org: String,
    pub image: String,
    pub arch: String,
    /// Tags measured by the `images` command.
    pub tags: Vec<String>,
    pub credential: Option<String>,
    pub uncompressed: UncompressedStrategy,
    pub taxonomy: Taxonomy,
}

#[derive(Debug, Clone)]
pub struct WorkflowSettings {
    /// Workflow file name or numeric id, e.g. `build-main.yaml`.
    pub id: String,
    /// Series name in the report.
    pub name: String,
    pub mode: DurationMode,
    pub bounds: Option<DurationBounds>,
    /// Archive path suffixes of the build log, most preferred first. Empty
    /// means logs are not fetched for this workflow.
    pub log_patterns: Vec<String>,
    pub job_aliases: Vec<JobAlias>,
}

/// Projects a raw job name (by substring) onto a dashboard leg.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct JobAlias {
    pub alias: String,
    pub job: String,
}

/// Named bundle of defaults for the two dashboards this tool feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    /// Docker build workflows and the universe image family.
    Docker,
    /// `build-main` workflows with per-package build logs and CUDA images.
    BuildMain,
}

impl Preset {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "docker" => Ok(Preset::Docker),
            "build-main" => Ok(Preset::BuildMain),
            other => bail!("unknown preset {other:?} (expected \"docker\" or \"build-main\")"),
        }
    }

    fn taxonomy(self) -> Taxonomy {
        match self {
            Preset::Docker => Taxonomy::Universe,
            Preset::BuildMain => Taxonomy::CudaRuntime,
        }
    }

    fn since(self) -> Option<DateTime<Utc>> {
        match self {
            Preset::Docker => NaiveDate::from_ymd_opt(2024, 1, 1)
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|t| t.and_utc()),
            Preset::BuildMain => None,
        }
    }

    fn workflows(self) -> Vec<WorkflowSettings> {
        match self {
            Preset::Docker => {
                let bounds = Some(DurationBounds {
                    min_secs: 60.0 * 3.0,
                    max_secs: 3600.0 * 10.0,
                });
                vec![
                    WorkflowSettings {
                        id: "health-check.yaml".to_string(),
                        name: "health-check".to_string(),
                        mode: DurationMode::Accurate,
                        bounds,
                        log_patterns: Vec::new(),
                        job_aliases: aliases(&[
                            ("main-amd64", "docker-build (main)"),
                            ("nightly-amd64", "docker-build (nightly)"),
                            ("main-arm64", "docker-build (main-arm64)"),
                        ]),
                    },
                    WorkflowSettings {
                        id: "docker-build-and-push.yaml".to_string(),
                        name: "docker-build-and-push".to_string(),
                        mode: DurationMode::Accurate,
                        bounds,
                        log_patterns: Vec::new(),
                        job_aliases: aliases(&[
                            ("main-amd64", "docker-build-and-push (amd64)"),
                            ("main-arm64", "docker-build-and-push (arm64)"),
                            ("cuda-amd64", "docker-build-and-push-cuda (amd64)"),
                            ("cuda-arm64", "docker-build-and-push-cuda (arm64)"),
                            ("tools-amd64", "docker-build-and-push-tools (amd64)"),
                            ("tools-arm64", "docker-build-and-push-tools (arm64)"),
                        ]),
                    },
                ]
            }
            Preset::BuildMain => {
                let bounds = Some(DurationBounds {
                    min_secs: 60.0,
                    max_secs: 3600.0 * 100.0,
                });
                vec![
                    WorkflowSettings {
                        id: "build-main.yaml".to_string(),
                        name: "build-main".to_string(),
                        mode: DurationMode::Accurate,
                        bounds,
                        log_patterns: vec![
                            "build-main/9_Build.txt".to_string(),
                            "build-main (cuda)/5_Build 'autoware-universe'.txt".to_string(),
                            "build-main (cuda)/7_Build 'autoware-universe'.txt".to_string(),
                            "build-main (cuda)/5_Build 'Autoware'.txt".to_string(),
                        ],
                        job_aliases: Vec::new(),
                    },
                    WorkflowSettings {
                        id: "build-main-self-hosted.yaml".to_string(),
                        name: "build-main-self-hosted".to_string(),
                        mode: DurationMode::Accurate,
                        bounds,
                        log_patterns: vec!["build-main-self-hosted/9_Build.txt".to_string()],
                        job_aliases: Vec::new(),
                    },
                ]
            }
        }
    }
}

fn aliases(pairs: &[(&str, &str)]) -> Vec<JobAlias> {
    pairs
        .iter()
        .map(|(alias, job)| JobAlias {
            alias: alias.to_string(),
            job: job.to_string(),
        })
        .collect()
}

// ── File config ──────────────────────────────────────────

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub(crate) struct FileConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) preset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) cache_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) data_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) since: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) log_retention_days: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) http_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) github: Option<GitHubFileConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) registry: Option<RegistryFileConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) workflows: Option<Vec<WorkflowFileConfig>>,
}

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub(crate) struct GitHubFileConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) api_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) repo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) log_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub(crate) struct RegistryFileConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) service: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) org: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) arch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) credential: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) uncompressed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) taxonomy: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub(crate) struct WorkflowFileConfig {
    pub(crate) id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) name: Option<String>,
    #[serde(default)]
    pub(crate) accurate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) min_duration_secs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) max_duration_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) log_patterns: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) job_aliases: Vec<JobAlias>,
}

impl WorkflowFileConfig {
    fn into_settings(self) -> WorkflowSettings {
        let bounds = match (self.min_duration_secs, self.max_duration_secs) {
            (None, None) => None,
            (min, max) => Some(DurationBounds {
                min_secs: min.unwrap_or(f64::NEG_INFINITY),
                max_secs: max.unwrap_or(f64::INFINITY),
            }),
        };
        let name = self
            .name
            .unwrap_or_else(|| self.id.trim_end_matches(".yaml").trim_end_matches(".yml").to_string());
        WorkflowSettings {
            id: self.id,
            name,
            mode: if self.accurate {
                DurationMode::Accurate
            } else {
                DurationMode::Approximate
            },
            bounds,
            log_patterns: self.log_patterns,
            job_aliases: self.job_aliases,
        }
    }
}

// ── Loading ──────────────────────────────────────────────

impl Config {
    pub fn load() -> Result<Self> {
        let file_config = Self::load_file_config(&config_file_path())?;
        Self::resolve(file_config, |name| std::env::var(name).ok())
    }

    /// Layer environment overrides over the file config over preset defaults.
    pub(crate) fn resolve(
        file_config: FileConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let env = |name: &str| env(name).filter(|v| !v.trim().is_empty());

        let preset = file_config
            .preset
            .as_deref()
            .map(Preset::parse)
            .transpose()?
            .unwrap_or(Preset::Docker);

        let cache_dir = env("CI_TELEMETRY_CACHE_DIR")
            .map(PathBuf::from)
            .or_else(|| file_config.cache_dir.as_deref().map(shellexpand))
            .unwrap_or_else(default_cache_dir);

        let output_path = env("CI_TELEMETRY_OUTPUT")
            .map(PathBuf::from)
            .or_else(|| file_config.output.as_deref().map(shellexpand))
            .unwrap_or_else(|| PathBuf::from("github_action_data.json"));

        let data_dir = env("CI_TELEMETRY_DATA_DIR")
            .map(PathBuf::from)
            .or_else(|| file_config.data_dir.as_deref().map(shellexpand))
            .unwrap_or_else(|| PathBuf::from("data/docker_image_sizes"));

        let since = match env("CI_TELEMETRY_SINCE").or_else(|| file_config.since.clone()) {
            Some(s) => parse_since(&s)?,
            None => preset.since(),
        };

        let log_retention_days = file_config.log_retention_days.unwrap_or(90);
        let http_timeout = Duration::from_secs(file_config.http_timeout_secs.unwrap_or(30));

        let github_file = file_config.github.unwrap_or_default();
        let github_token = env("GITHUB_TOKEN").or(github_file.token);
        let github = GitHubSettings {
            api_url: github_file
                .api_url
                .unwrap_or_else(|| "https://api.github.com".to_string()),
            token: github_token.clone(),
            repo: github_file
                .repo
                .unwrap_or_else(|| "autowarefoundation/autoware".to_string()),
            log_timeout: Duration::from_secs(github_file.log_timeout_secs.unwrap_or(600)),
        };

        let registry_file = file_config.registry.unwrap_or_default();
        let uncompressed = match registry_file.uncompressed.as_deref() {
            Some(s) => s.parse()?,
            None => UncompressedStrategy::None,
        };
        let taxonomy = match registry_file.taxonomy.as_deref() {
            Some(s) => s.parse()?,
            None => preset.taxonomy(),
        };
        let registry = RegistrySettings {
            url: registry_file
                .url
                .unwrap_or_else(|| "https://ghcr.io".to_string()),
            service: registry_file.service.unwrap_or_else(|| "ghcr.io".to_string()),
            org: registry_file
                .org
                .unwrap_or_else(|| "autowarefoundation".to_string()),
            image: registry_file.image.unwrap_or_else(|| "autoware".to_string()),
            arch: registry_file.arch.unwrap_or_else(|| "amd64".to_string()),
            tags: registry_file.tags.unwrap_or_else(|| {
                ["universe-devel", "universe-devel-cuda", "core-devel"]
                    .iter()
                    .map(|t| t.to_string())
                    .collect()
            }),
            // The registry accepts a GitHub token in exchange for a pull token.
            credential: env("CI_TELEMETRY_REGISTRY_TOKEN")
                .or(registry_file.credential)
                .or(github_token),
            uncompressed,
            taxonomy,
        };

        let workflows = match file_config.workflows {
            Some(list) => list.into_iter().map(WorkflowFileConfig::into_settings).collect(),
            None => preset.workflows(),
        };

        Ok(Config {
            cache_dir,
            output_path,
            data_dir,
            since,
            log_retention_days,
            http_timeout,
            github,
            registry,
            workflows,
        })
    }

    pub(crate) fn load_file_config(config_path: &Path) -> Result<FileConfig> {
        if !config_path.exists() {
            return Ok(FileConfig::default());
        }
        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("reading config file {}", config_path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("parsing config file {}", config_path.display()))
    }
}

/// Accepts `YYYY-MM-DD` (midnight UTC) or an RFC 3339 timestamp.
pub fn parse_since(s: &str) -> Result<Option<DateTime<Utc>>> {
    let s = s.trim();
    if s.is_empty() || s.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        && let Some(midnight) = date.and_hms_opt(0, 0, 0)
    {
        return Ok(Some(midnight.and_utc()));
    }
    let ts = DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("invalid date {s:?} (expected YYYY-MM-DD or RFC 3339)"))?;
    Ok(Some(ts.with_timezone(&Utc)))
}

pub(crate) fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("ci-telemetry")
}

pub(crate) fn config_file_path() -> PathBuf {
    // XDG layout everywhere, macOS included.
    let config_base = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".config")
        });
    config_base.join("ci-telemetry").join("config.toml")
}

fn shellexpand(s: &str) -> PathBuf {
    if s.starts_with("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(&s[2..]);
    }
    PathBuf::from(s)
}
