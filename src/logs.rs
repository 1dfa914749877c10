use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::io::{Cursor, Read};

use crate::github::GitHubClient;
use crate::http::{FetchError, Transport};
use crate::store::Store;

/// Archive path → decoded text of one run's log bundle.
pub type LogBundle = BTreeMap<String, String>;

/// Download and unpack the log bundle of a run.
///
/// Expired bundles come back as [`FetchError::NotFound`]; callers skip the
/// run.
pub async fn fetch_logs<T: Transport>(
    github: &GitHubClient<T>,
    repo: &str,
    run_id: u64,
) -> Result<LogBundle, FetchError> {
    let archive = github.run_logs_archive(repo, run_id).await?;
    unpack(&archive).map_err(|e| FetchError::Decode {
        url: format!("logs of run {run_id}"),
        message: e.to_string(),
    })
}

/// [`fetch_logs`] memoized under `{repo}-{run_id}`. Bundles never change once
/// a run has completed.
pub async fn fetch_logs_cached<T: Transport>(
    store: &Store,
    github: &GitHubClient<T>,
    repo: &str,
    run_id: u64,
) -> Result<LogBundle> {
    let key = format!("{repo}-{run_id}");
    if !store.contains(&key) {
        tracing::info!("downloading logs for run_id={}", run_id);
    }
    store
        .get_or_compute(&key, move || async move {
            Ok(fetch_logs(github, repo, run_id).await?)
        })
        .await
}

fn unpack(archive: &[u8]) -> zip::result::ZipResult<LogBundle> {
    let mut zip = zip::ZipArchive::new(Cursor::new(archive))?;
    let mut bundle = LogBundle::new();
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        if entry.is_dir() {
            continue;
        }
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes)?;
        bundle.insert(
            entry.name().to_string(),
            String::from_utf8_lossy(&bytes).into_owned(),
        );
    }
    Ok(bundle)
}

/// The build log of a bundle: the first pattern, in order, that is a suffix
/// of some archive path.
pub fn select_build_log<'a>(bundle: &'a LogBundle, patterns: &[String]) -> Option<&'a str> {
    patterns.iter().find_map(|pattern| {
        bundle
            .iter()
            .find(|(path, _)| path.ends_with(pattern.as_str()))
            .map(|(_, text)| text.as_str())
    })
}

/// Whether a run is recent enough for GitHub to still hold its logs.
pub fn is_within_retention(created_at: DateTime<Utc>, now: DateTime<Utc>, days: i64) -> bool {
    (now - created_at).num_days() <= days
}
