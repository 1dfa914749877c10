//! Per-package build timings from colcon console output.
//!
//! A GitHub Actions log line looks like
//! `2023-10-24T12:34:34.2585864Z Finished <<< component_interface_specs [32.3s]`:
//! the runner prefixes every line with a timestamp, and colcon prints a
//! `Starting >>>` / `Finished <<<` marker pair around each package.

use chrono::NaiveDateTime;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

/// Length of the runner timestamp prefix we read (microsecond precision).
const TIMESTAMP_LEN: usize = 26;
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

fn start_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Starting >>> ([\w_]+)").expect("valid start marker regex"))
}

fn finish_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Finished <<< ([\w_]+)").expect("valid finish marker regex"))
}

#[derive(Debug, Clone, PartialEq)]
pub struct PackageBuildInterval {
    pub package: String,
    pub start: NaiveDateTime,
    /// Seconds.
    pub duration: f64,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LogParseError {
    #[error("line {line}: package {package} finished without starting")]
    UnmatchedFinish { package: String, line: usize },
    #[error("line {line}: unparseable timestamp in {text:?}")]
    BadTimestamp { line: usize, text: String },
}

/// What a single line contributed.
#[derive(Debug, Clone, PartialEq)]
pub enum LineEvent {
    Started { package: String },
    Finished(PackageBuildInterval),
}

/// Pairs start and finish markers across a log, one line at a time.
#[derive(Debug, Default)]
pub struct BuildLogParser {
    in_flight: HashMap<String, NaiveDateTime>,
    line_no: usize,
}

impl BuildLogParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next line. Lines without a marker yield `None`.
    ///
    /// A repeated `Starting` for the same package overwrites the earlier
    /// start time. A line carrying both markers counts as a start.
    pub fn feed_line(&mut self, line: &str) -> Option<Result<LineEvent, LogParseError>> {
        self.line_no += 1;

        if let Some(caps) = start_regex().captures(line) {
            let package = caps[1].to_string();
            return Some(self.timestamp(line).map(|start| {
                self.in_flight.insert(package.clone(), start);
                LineEvent::Started { package }
            }));
        }

        let caps = finish_regex().captures(line)?;
        let package = caps[1].to_string();
        let Some(start) = self.in_flight.get(&package).copied() else {
            return Some(Err(LogParseError::UnmatchedFinish {
                package,
                line: self.line_no,
            }));
        };
        Some(self.timestamp(line).map(|end| {
            let duration = (end - start)
                .num_microseconds()
                .map(|us| us as f64 / 1_000_000.0)
                .unwrap_or_else(|| (end - start).num_milliseconds() as f64 / 1000.0);
            LineEvent::Finished(PackageBuildInterval {
                package,
                start,
                duration,
            })
        }))
    }

    /// Packages that started but have not finished yet.
    pub fn unfinished(&self) -> impl Iterator<Item = &str> {
        self.in_flight.keys().map(|k| k.as_str())
    }

    fn timestamp(&self, line: &str) -> Result<NaiveDateTime, LogParseError> {
        line.get(..TIMESTAMP_LEN)
            .and_then(|prefix| NaiveDateTime::parse_from_str(prefix, TIMESTAMP_FORMAT).ok())
            .ok_or_else(|| LogParseError::BadTimestamp {
                line: self.line_no,
                text: line.chars().take(TIMESTAMP_LEN).collect(),
            })
    }
}

/// Every finished package interval in the log, in order of the finish
/// markers. A malformed entry becomes an `Err` in place and does not affect
/// the others.
pub fn extract_intervals(text: &str) -> Vec<Result<PackageBuildInterval, LogParseError>> {
    let mut parser = BuildLogParser::new();
    let mut out = Vec::new();
    for line in text.lines() {
        match parser.feed_line(line) {
            Some(Ok(LineEvent::Finished(interval))) => out.push(Ok(interval)),
            Some(Err(e)) => out.push(Err(e)),
            Some(Ok(LineEvent::Started { package })) => {
                tracing::trace!("{} started", package);
            }
            None => {}
        }
    }
    for package in parser.unfinished() {
        tracing::debug!("{} started but never finished", package);
    }
    out
}

/// Collapse intervals to one duration per package.
///
/// Intervals are ordered by descending duration before collapsing, so when a
/// package finished more than once the shortest interval is the one kept.
pub fn package_durations(intervals: &[PackageBuildInterval]) -> BTreeMap<String, f64> {
    let mut sorted: Vec<&PackageBuildInterval> = intervals.iter().collect();
    sorted.sort_by(|a, b| b.duration.total_cmp(&a.duration));
    sorted
        .into_iter()
        .map(|i| (i.package.clone(), i.duration))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32, s: u32, micro: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2023, 10, 24)
            .unwrap()
            .and_hms_micro_opt(h, m, s, micro)
            .unwrap()
    }

    #[test]
    fn test_single_package() {
        let log = "2023-10-24T12:00:00.000000Z Starting >>> pkg_a\n\
                   2023-10-24T12:00:32.300000Z Finished <<< pkg_a [32.3s]\n";
        let intervals = extract_intervals(log);
        assert_eq!(
            intervals,
            vec![Ok(PackageBuildInterval {
                package: "pkg_a".to_string(),
                start: at(12, 0, 0, 0),
                duration: 32.3,
            })]
        );
    }

    #[test]
    fn test_runner_timestamps_with_seven_fraction_digits() {
        // The runner prints 100ns precision; only the first 26 chars are read.
        let log = "2023-10-24T12:34:01.1000000Z Starting >>> component_interface_specs\n\
                   2023-10-24T12:34:34.2585864Z Finished <<< component_interface_specs [32.3s]";
        let intervals = extract_intervals(log);
        let interval = intervals[0].as_ref().unwrap();
        assert_eq!(interval.start, at(12, 34, 1, 100_000));
        assert!((interval.duration - 33.158586).abs() < 1e-9);
    }

    #[test]
    fn test_n_pairs_yield_n_non_negative_intervals() {
        let mut log = String::new();
        for i in 0..5 {
            log.push_str(&format!("2023-10-24T12:00:0{i}.000000Z Starting >>> pkg_{i}\n"));
            log.push_str("2023-10-24T12:00:09.000000Z some compiler chatter\n");
        }
        for i in (0..5).rev() {
            log.push_str(&format!("2023-10-24T12:01:0{i}.500000Z Finished <<< pkg_{i} [1s]\n"));
        }

        let intervals: Vec<PackageBuildInterval> = extract_intervals(&log)
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(intervals.len(), 5);
        assert!(intervals.iter().all(|i| i.duration >= 0.0));
        // Finish-marker order.
        assert_eq!(intervals[0].package, "pkg_4");
        assert_eq!(intervals[4].package, "pkg_0");
    }

    #[test]
    fn test_unmatched_finish_fails_only_that_entry() {
        let log = "2023-10-24T12:00:00.000000Z Starting >>> pkg_a\n\
                   2023-10-24T12:00:05.000000Z Finished <<< ghost\n\
                   2023-10-24T12:00:10.000000Z Finished <<< pkg_a [10s]\n";
        let intervals = extract_intervals(log);
        assert_eq!(intervals.len(), 2);
        assert_eq!(
            intervals[0],
            Err(LogParseError::UnmatchedFinish {
                package: "ghost".to_string(),
                line: 2
            })
        );
        assert_eq!(intervals[1].as_ref().unwrap().duration, 10.0);
    }

    #[test]
    fn test_bad_timestamp_is_per_entry() {
        let log = "Starting >>> pkg_a\n\
                   2023-10-24T12:00:00.000000Z Starting >>> pkg_b\n\
                   2023-10-24T12:00:01.000000Z Finished <<< pkg_a\n\
                   2023-10-24T12:00:04.000000Z Finished <<< pkg_b\n";
        let intervals = extract_intervals(log);
        assert!(matches!(
            intervals[0],
            Err(LogParseError::BadTimestamp { line: 1, .. })
        ));
        // pkg_a never got a start time, so its finish is unmatched.
        assert!(matches!(
            intervals[1],
            Err(LogParseError::UnmatchedFinish { .. })
        ));
        assert_eq!(intervals[2].as_ref().unwrap().duration, 4.0);
    }

    #[test]
    fn test_restart_overwrites_start() {
        let mut parser = BuildLogParser::new();
        let started = parser.feed_line("2023-10-24T12:00:00.000000Z Starting >>> pkg_a");
        assert_eq!(
            started,
            Some(Ok(LineEvent::Started {
                package: "pkg_a".to_string()
            }))
        );
        parser.feed_line("2023-10-24T12:00:20.000000Z Starting >>> pkg_a");
        assert_eq!(parser.unfinished().collect::<Vec<_>>(), vec!["pkg_a"]);
        let event = parser
            .feed_line("2023-10-24T12:00:30.000000Z Finished <<< pkg_a")
            .unwrap()
            .unwrap();
        match event {
            LineEvent::Finished(interval) => assert_eq!(interval.duration, 10.0),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_non_marker_lines_are_ignored() {
        let mut parser = BuildLogParser::new();
        assert!(parser.feed_line("").is_none());
        assert!(parser.feed_line("Summary: 3 packages finished").is_none());
        assert!(extract_intervals("").is_empty());
    }

    #[test]
    fn test_package_durations_keeps_shortest_duplicate() {
        let start = at(12, 0, 0, 0);
        let intervals = vec![
            PackageBuildInterval {
                package: "pkg_a".to_string(),
                start,
                duration: 5.0,
            },
            PackageBuildInterval {
                package: "pkg_b".to_string(),
                start,
                duration: 40.0,
            },
            PackageBuildInterval {
                package: "pkg_a".to_string(),
                start,
                duration: 12.0,
            },
        ];
        let durations = package_durations(&intervals);
        assert_eq!(durations.len(), 2);
        assert_eq!(durations["pkg_a"], 5.0);
        assert_eq!(durations["pkg_b"], 40.0);
    }
}
