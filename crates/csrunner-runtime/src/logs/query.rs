//! Read-side queries over log files: tail, search, run listing.
//!
//! Readers open files independently of the writer and tolerate concurrent
//! appends; a torn final line simply fails to parse and is skipped.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use csrunner_core::SupervisorError;
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{StreamTag, parse_line};

/// One parsed log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub ts: DateTime<Utc>,
    pub stream: StreamTag,
    pub text: String,
}

/// One search hit with a line of context either side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchMatch {
    /// File name the match was found in (`current.log` or an archive).
    pub file: String,
    /// 1-based line number within that file.
    pub line_number: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<DateTime<Utc>>,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_before: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_after: Option<String>,
}

/// Metadata for one archived run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunInfo {
    pub run_id: String,
    pub file: String,
    pub size_bytes: u64,
    pub modified_at: DateTime<Utc>,
}

/// Last `lines` parseable entries of `path`. A missing current file is an
/// empty tail, not an error.
pub fn tail_file(path: &Path, lines: usize) -> Result<Vec<LogEntry>, SupervisorError> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(SupervisorError::internal(format!(
                "cannot read {}: {e}",
                path.display()
            )));
        }
    };

    let mut entries: Vec<LogEntry> = contents
        .lines()
        .filter_map(|line| {
            parse_line(line).map(|(ts, stream, text)| LogEntry { ts, stream, text })
        })
        .collect();
    if entries.len() > lines {
        entries.drain(..entries.len() - lines);
    }
    Ok(entries)
}

/// Search `files` (assumed newest-first) for `pattern`, scanning each file
/// bottom-up so results come back in reverse chronological order. The
/// pattern falls back to a literal match when it is not a valid regex.
pub fn search_files(
    files: &[PathBuf],
    pattern: &str,
    max_results: usize,
    case_sensitive: bool,
) -> Result<Vec<SearchMatch>, SupervisorError> {
    let regex = RegexBuilder::new(pattern)
        .case_insensitive(!case_sensitive)
        .build()
        .or_else(|_| {
            debug!(pattern = %pattern, "Pattern is not a valid regex, searching literally");
            RegexBuilder::new(&regex::escape(pattern))
                .case_insensitive(!case_sensitive)
                .build()
        })
        .map_err(|e| SupervisorError::internal(format!("literal pattern failed to compile: {e}")))?;

    let mut matches = Vec::new();
    for path in files {
        if matches.len() >= max_results {
            break;
        }
        let Ok(contents) = fs::read_to_string(path) else {
            continue;
        };
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let lines: Vec<&str> = contents.lines().collect();

        for idx in (0..lines.len()).rev() {
            if matches.len() >= max_results {
                break;
            }
            let parsed = parse_line(lines[idx]);
            let text = parsed
                .as_ref()
                .map_or_else(|| lines[idx].to_string(), |(_, _, t)| t.clone());
            if !regex.is_match(&text) {
                continue;
            }
            matches.push(SearchMatch {
                file: file_name.clone(),
                line_number: idx + 1,
                ts: parsed.map(|(ts, _, _)| ts),
                text,
                context_before: idx
                    .checked_sub(1)
                    .and_then(|i| lines.get(i))
                    .map(|l| context_text(l)),
                context_after: lines.get(idx + 1).map(|l| context_text(l)),
            });
        }
    }
    Ok(matches)
}

fn context_text(line: &str) -> String {
    parse_line(line).map_or_else(|| line.to_string(), |(_, _, text)| text)
}

/// Archive metadata under `dir`, newest-first. Run file names are
/// timestamp-shaped, so lexicographic order is chronological order.
pub fn list_runs(dir: &Path) -> Vec<RunInfo> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };

    let mut runs: Vec<RunInfo> = entries
        .flatten()
        .filter_map(|entry| {
            let path = entry.path();
            let name = path.file_name()?.to_str()?.to_string();
            if name == "current.log" || !name.ends_with(".log") {
                return None;
            }
            let meta = entry.metadata().ok()?;
            let modified_at = meta.modified().ok().map_or_else(Utc::now, DateTime::from);
            Some(RunInfo {
                run_id: name.trim_end_matches(".log").to_string(),
                file: name,
                size_bytes: meta.len(),
                modified_at,
            })
        })
        .collect();

    runs.sort_by(|a, b| b.run_id.cmp(&a.run_id));
    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_log(dir: &Path, name: &str, lines: &[&str]) -> PathBuf {
        let path = dir.join(name);
        let body: String = lines
            .iter()
            .enumerate()
            .map(|(i, text)| {
                format!("2024-01-01T00:00:{:02}.000Z stdout {text}\n", i % 60)
            })
            .collect();
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn tail_returns_trailing_entries() {
        let temp = TempDir::new().unwrap();
        let path = write_log(temp.path(), "current.log", &["a", "b", "c", "d"]);
        let entries = tail_file(&path, 2).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].text, "c");
        assert_eq!(entries[1].text, "d");
    }

    #[test]
    fn tail_skips_torn_lines() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("current.log");
        fs::write(
            &path,
            "2024-01-01T00:00:00.000Z stdout fine\npartial line with no timest",
        )
        .unwrap();
        let entries = tail_file(&path, 10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].text, "fine");
    }

    #[test]
    fn tail_missing_file_is_empty() {
        let temp = TempDir::new().unwrap();
        let entries = tail_file(&temp.path().join("current.log"), 10).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn search_reports_context_and_line_numbers() {
        let temp = TempDir::new().unwrap();
        let path = write_log(temp.path(), "current.log", &["before", "target", "after"]);
        let matches = search_files(&[path], "target", 10, true).unwrap();
        assert_eq!(matches.len(), 1);
        let m = &matches[0];
        assert_eq!(m.line_number, 2);
        assert_eq!(m.context_before.as_deref(), Some("before"));
        assert_eq!(m.context_after.as_deref(), Some("after"));
        assert!(m.ts.is_some());
    }

    #[test]
    fn search_is_case_insensitive_when_asked() {
        let temp = TempDir::new().unwrap();
        let path = write_log(temp.path(), "current.log", &["Hello World"]);
        assert!(search_files(&[path.clone()], "hello", 10, true).unwrap().is_empty());
        assert_eq!(search_files(&[path], "hello", 10, false).unwrap().len(), 1);
    }

    #[test]
    fn search_respects_max_results() {
        let temp = TempDir::new().unwrap();
        let path = write_log(temp.path(), "current.log", &["x1", "x2", "x3", "x4"]);
        let matches = search_files(&[path], "x", 2, true).unwrap();
        assert_eq!(matches.len(), 2);
        // Bottom-up scan: newest lines first
        assert_eq!(matches[0].text, "x4");
        assert_eq!(matches[1].text, "x3");
    }

    #[test]
    fn list_runs_sorts_newest_first() {
        let temp = TempDir::new().unwrap();
        write_log(temp.path(), "2024-01-01-00-00-01.log", &["a"]);
        write_log(temp.path(), "2024-01-02-00-00-01.log", &["b"]);
        write_log(temp.path(), "current.log", &["c"]);

        let runs = list_runs(temp.path());
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].run_id, "2024-01-02-00-00-01");
        assert_eq!(runs[1].run_id, "2024-01-01-00-00-01");
        assert!(runs[0].size_bytes > 0);
    }
}
