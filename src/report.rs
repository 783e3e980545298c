//! Completion report written at the end of every acquisition.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::ewf::error2::sector_runs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Completed,
    Aborted,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionReport {
    pub status:           ReportStatus,
    pub elapsed_secs:     f64,
    pub sectors_written:  u64,
    pub sectors_expected: u64,
    pub chunks_written:   u64,
    pub segments:         Vec<PathBuf>,
    pub md5:              Option<String>,
    pub sha1:             Option<String>,
    pub bad_sectors:      Vec<u64>,
    /// Set when the container writer hit an IO error.
    pub error:            Option<String>,
}

impl AcquisitionReport {
    pub fn elapsed(&self) -> Duration {
        Duration::from_secs_f64(self.elapsed_secs.max(0.0))
    }

    pub fn is_complete(&self) -> bool {
        self.status == ReportStatus::Completed && self.sectors_written == self.sectors_expected
    }

    /// Human-readable lines, in the order they are logged.
    pub fn lines(&self) -> Vec<String> {
        let mut lines = vec![
            format!("Status: {:?}", self.status),
            format!("Output {} of an expected {} sectors.", self.sectors_written, self.sectors_expected),
            format!("Completed in {}", pretty_duration(self.elapsed())),
        ];
        if let Some(md5) = &self.md5 {
            lines.push(format!("MD5 Hash: {}", md5.to_uppercase()));
        }
        if let Some(sha1) = &self.sha1 {
            lines.push(format!("SHA1 Hash: {}", sha1.to_uppercase()));
        }
        if self.bad_sectors.is_empty() {
            lines.push("No bad sectors.".into());
        } else {
            lines.push(format!("{} bad sectors:", self.bad_sectors.len()));
            for (first, count) in sector_runs(&self.bad_sectors) {
                if count == 1 {
                    lines.push(format!("  sector {first}"));
                } else {
                    lines.push(format!("  sectors {}-{}", first, first + count - 1));
                }
            }
        }
        if let Some(err) = &self.error {
            lines.push(format!("Error: {err}"));
        }
        for segment in &self.segments {
            lines.push(format!("Segment: {}", segment.display()));
        }
        lines
    }

    pub fn log(&self) {
        for line in self.lines() {
            info!(target: "ewfacq::report", "{line}");
        }
    }

    pub fn write_json(&self, path: &Path) -> io::Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        fs::write(path, json)
    }
}

/// `N seconds.` under a minute, `mm:ss` under an hour, `hh:mm:ss` under a
/// day, `D days hh:mm:ss` beyond.
pub fn pretty_duration(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs < 60 {
        return format!("{secs} seconds.");
    }
    let (days, hours, minutes, seconds) = (secs / 86_400, secs % 86_400 / 3600, secs % 3600 / 60, secs % 60);
    let mut out = String::new();
    if days > 0 {
        out.push_str(&format!("{days} days "));
    }
    if secs >= 3600 {
        out.push_str(&format!("{hours:02}:"));
    }
    out.push_str(&format!("{minutes:02}:{seconds:02}"));
    out
}
