use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use report_schema::{ImageSizeRecord, SizeSnapshot};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::report::ImageObservation;
use crate::taxonomy::Taxonomy;

const FILE_PREFIX: &str = "docker_image_sizes_";
const FILE_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

pub fn snapshot_path(data_dir: &Path, timestamp: DateTime<Utc>) -> PathBuf {
    data_dir.join(format!(
        "{FILE_PREFIX}{}.json",
        timestamp.format(FILE_TIMESTAMP_FORMAT)
    ))
}

/// Snapshot files in `data_dir`, oldest first. A missing directory has none.
pub fn list_snapshots(data_dir: &Path) -> Result<Vec<PathBuf>> {
    if !data_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut paths = Vec::new();
    for entry in fs::read_dir(data_dir)
        .with_context(|| format!("reading {}", data_dir.display()))?
    {
        let path = entry?.path();
        let is_snapshot = path.file_name().and_then(|n| n.to_str()).is_some_and(|name| {
            name.starts_with(FILE_PREFIX) && name.ends_with(".json")
        });
        if is_snapshot && path.is_file() {
            paths.push(path);
        }
    }
    // The timestamp format sorts lexicographically.
    paths.sort();
    Ok(paths)
}

pub fn read_snapshot(path: &Path) -> Result<SizeSnapshot> {
    let content =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}

/// The most recent snapshot, if any.
pub fn latest_snapshot(data_dir: &Path) -> Result<Option<SizeSnapshot>> {
    match list_snapshots(data_dir)?.last() {
        Some(path) => read_snapshot(path).map(Some),
        None => Ok(None),
    }
}

/// Whether `current` differs from `previous` in anything but timestamps:
/// the number of images, or per position the compressed size, uncompressed
/// size, layer count or whether it failed.
pub fn has_new_data(current: &SizeSnapshot, previous: Option<&SizeSnapshot>) -> bool {
    let Some(previous) = previous else {
        return true;
    };
    if current.images.len() != previous.images.len() {
        return true;
    }
    current
        .images
        .iter()
        .zip(&previous.images)
        .any(|(now, before)| match (now, before) {
            (ImageSizeRecord::Measured(a), ImageSizeRecord::Measured(b)) => {
                a.compressed_size_bytes != b.compressed_size_bytes
                    || a.uncompressed_size_bytes != b.uncompressed_size_bytes
                    || a.num_layers != b.num_layers
            }
            (ImageSizeRecord::Failed { .. }, ImageSizeRecord::Failed { .. }) => false,
            _ => true,
        })
}

/// Write `snapshot` under its own timestamp. Returns the path written.
pub fn write_snapshot(data_dir: &Path, snapshot: &SizeSnapshot) -> Result<PathBuf> {
    fs::create_dir_all(data_dir).with_context(|| format!("creating {}", data_dir.display()))?;
    let path = snapshot_path(data_dir, snapshot.timestamp);
    let json = serde_json::to_string_pretty(snapshot).context("serializing snapshot")?;

    let mut tmp = tempfile::NamedTempFile::new_in(data_dir).context("creating temp snapshot")?;
    tmp.write_all(json.as_bytes()).context("writing temp snapshot")?;
    tmp.persist(&path)
        .with_context(|| format!("writing snapshot {}", path.display()))?;
    Ok(path)
}

/// Size observations from every snapshot taken at or after `since`, filed by
/// category. Failed tags, unclassifiable tags and unreadable files are
/// skipped.
pub fn load_history(
    data_dir: &Path,
    since: Option<DateTime<Utc>>,
    taxonomy: Taxonomy,
) -> Result<Vec<ImageObservation>> {
    let mut observations = Vec::new();
    for path in list_snapshots(data_dir)? {
        let snapshot = match read_snapshot(&path) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("skipping snapshot: {:#}", e);
                continue;
            }
        };
        if since.is_some_and(|since| snapshot.timestamp < since) {
            continue;
        }
        for record in &snapshot.images {
            let ImageSizeRecord::Measured(image) = record else {
                continue;
            };
            let Some(category) = taxonomy.classify(&image.tag) else {
                tracing::debug!("no category for {}", image.tag);
                continue;
            };
            observations.push(ImageObservation {
                category,
                size: image.compressed_size_bytes,
                date: snapshot.timestamp,
                tag: image.tag.clone(),
            });
        }
    }
    Ok(observations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use report_schema::MeasuredImage;

    fn measured(tag: &str, compressed: u64, layers: usize) -> ImageSizeRecord {
        ImageSizeRecord::Measured(MeasuredImage {
            tag: tag.to_string(),
            compressed_size_bytes: compressed,
            compressed_size_gb: 0.0,
            uncompressed_size_bytes: None,
            uncompressed_size_gb: None,
            num_layers: layers,
            digest: None,
            fetched_at: Utc::now(),
        })
    }

    fn failed(tag: &str) -> ImageSizeRecord {
        ImageSizeRecord::Failed {
            tag: tag.to_string(),
            error: "HTTP 500".to_string(),
            fetched_at: Utc::now(),
        }
    }

    fn snapshot(day: u32, images: Vec<ImageSizeRecord>) -> SizeSnapshot {
        SizeSnapshot {
            registry: "ghcr.io".to_string(),
            org: "autowarefoundation".to_string(),
            image: "autoware".to_string(),
            tags: images.iter().map(|i| i.tag().to_string()).collect(),
            timestamp: Utc.with_ymd_and_hms(2025, 3, day, 6, 0, 0).unwrap(),
            images,
        }
    }

    #[test]
    fn test_snapshot_path_format() {
        let ts = Utc.with_ymd_and_hms(2025, 3, 1, 6, 5, 9).unwrap();
        assert_eq!(
            snapshot_path(Path::new("data"), ts),
            PathBuf::from("data/docker_image_sizes_20250301_060509.json")
        );
    }

    #[test]
    fn test_has_new_data() {
        let base = snapshot(1, vec![measured("core-devel", 100, 3), failed("universe-devel")]);
        assert!(has_new_data(&base, None));

        let same = snapshot(2, vec![measured("core-devel", 100, 3), failed("universe-devel")]);
        assert!(!has_new_data(&same, Some(&base)));

        let grown = snapshot(2, vec![measured("core-devel", 101, 3), failed("universe-devel")]);
        assert!(has_new_data(&grown, Some(&base)));

        let relayered = snapshot(2, vec![measured("core-devel", 100, 4), failed("universe-devel")]);
        assert!(has_new_data(&relayered, Some(&base)));

        let recovered = snapshot(2, vec![measured("core-devel", 100, 3), measured("universe-devel", 0, 0)]);
        assert!(has_new_data(&recovered, Some(&base)));

        let fewer = snapshot(2, vec![measured("core-devel", 100, 3)]);
        assert!(has_new_data(&fewer, Some(&base)));
    }

    #[test]
    fn test_write_list_and_latest() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data/docker_image_sizes");
        assert!(list_snapshots(&data_dir).unwrap().is_empty());
        assert!(latest_snapshot(&data_dir).unwrap().is_none());

        write_snapshot(&data_dir, &snapshot(2, vec![measured("core-devel", 2, 1)])).unwrap();
        write_snapshot(&data_dir, &snapshot(1, vec![measured("core-devel", 1, 1)])).unwrap();
        fs::write(data_dir.join("README.md"), "not a snapshot").unwrap();

        let paths = list_snapshots(&data_dir).unwrap();
        assert_eq!(paths.len(), 2);
        assert!(paths[0].ends_with("docker_image_sizes_20250301_060000.json"));

        let latest = latest_snapshot(&data_dir).unwrap().unwrap();
        assert_eq!(latest.timestamp.format("%d").to_string(), "02");
    }

    #[test]
    fn test_load_history_filters_and_classifies() {
        let dir = tempfile::tempdir().unwrap();
        write_snapshot(
            dir.path(),
            &snapshot(1, vec![measured("core-devel", 10, 1)]),
        )
        .unwrap();
        write_snapshot(
            dir.path(),
            &snapshot(
                5,
                vec![
                    measured("universe-devel-cuda", 30, 2),
                    measured("mystery", 1, 1),
                    failed("core-devel"),
                ],
            ),
        )
        .unwrap();
        fs::write(dir.path().join("docker_image_sizes_broken.json"), "{").unwrap();

        let since = Utc.with_ymd_and_hms(2025, 3, 2, 0, 0, 0).unwrap();
        let history = load_history(dir.path(), Some(since), Taxonomy::Universe).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].category, "universe-devel-cuda");
        assert_eq!(history[0].size, 30);

        let all = load_history(dir.path(), None, Taxonomy::Universe).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].category, "core-devel");
    }
}
