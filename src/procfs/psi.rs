//! `/proc/pressure/*` stall averages.
//!
//! These are the sliding-window percentages the kernel computes itself, as
//! opposed to the trigger fds in [`crate::pressure::psi`]. The decision
//! engine samples them to detect a critical full stall and to attach PSI
//! context to kill records.

use super::FileReader;
use crate::error::{Error, Result};

/// Memory pressure file.
pub const PSI_MEMORY: &str = "/proc/pressure/memory";
/// I/O pressure file.
pub const PSI_IO: &str = "/proc/pressure/io";
/// CPU pressure file.
pub const PSI_CPU: &str = "/proc/pressure/cpu";

/// Which stall line of a pressure file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PsiKind {
    /// At least one task stalled.
    Some = 0,
    /// All non-idle tasks stalled.
    Full = 1,
}

/// One `some`/`full` line of a pressure file.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct PsiStats {
    /// Percent of time stalled over the last 10 seconds.
    pub avg10: f32,
    /// Percent of time stalled over the last 60 seconds.
    pub avg60: f32,
    /// Percent of time stalled over the last 300 seconds.
    pub avg300: f32,
    /// Total stall time in microseconds.
    pub total: u64,
}

impl PsiStats {
    fn parse(line: &str, kind: PsiKind) -> Result<Self> {
        let mut tokens = line.split_whitespace();
        let tag = tokens.next().unwrap_or("");
        let expected = match kind {
            PsiKind::Some => "some",
            PsiKind::Full => "full",
        };
        if tag != expected {
            return Err(Error::Parse {
                file: "/proc/pressure",
                reason: format!("expected {expected} line, got {tag:?}"),
            });
        }

        let mut stats = Self::default();
        for token in tokens {
            let Some((key, value)) = token.split_once('=') else {
                continue;
            };
            match key {
                "avg10" => stats.avg10 = value.parse().unwrap_or(0.0),
                "avg60" => stats.avg60 = value.parse().unwrap_or(0.0),
                "avg300" => stats.avg300 = value.parse().unwrap_or(0.0),
                "total" => stats.total = value.parse().unwrap_or(0),
                _ => {}
            }
        }
        Ok(stats)
    }
}

/// Stall averages for one resource: `[some, full]`.
pub type ResourceStats = [PsiStats; 2];

/// The PSI context sampled around a kill decision.
#[derive(Debug, Default, Clone, Copy)]
pub struct PsiData {
    /// Memory pressure.
    pub mem: ResourceStats,
    /// I/O pressure.
    pub io: ResourceStats,
    /// CPU pressure (the kernel only reports `some`).
    pub cpu: ResourceStats,
}

fn parse_resource(content: &str, full: bool) -> Result<ResourceStats> {
    let mut lines = content.lines();
    let some_line = lines.next().ok_or_else(|| Error::Parse {
        file: "/proc/pressure",
        reason: "empty pressure file".into(),
    })?;
    let mut stats = [PsiStats::parse(some_line, PsiKind::Some)?, PsiStats::default()];
    if full {
        let full_line = lines.next().ok_or_else(|| Error::Parse {
            file: "/proc/pressure",
            reason: "missing full line".into(),
        })?;
        stats[1] = PsiStats::parse(full_line, PsiKind::Full)?;
    }
    Ok(stats)
}

/// Cached readers for all three pressure files.
///
/// PSI may be compiled out of the kernel; failed reads surface as errors the
/// caller downgrades to "no PSI data".
pub struct PsiReaders {
    mem: FileReader,
    io: FileReader,
    cpu: FileReader,
}

impl PsiReaders {
    /// Create readers against the live procfs.
    pub fn new() -> Self {
        Self {
            mem: FileReader::new(PSI_MEMORY, PSI_MEMORY),
            io: FileReader::new(PSI_IO, PSI_IO),
            cpu: FileReader::new(PSI_CPU, PSI_CPU),
        }
    }

    /// Memory stall averages.
    pub fn read_mem(&mut self) -> Result<ResourceStats> {
        parse_resource(self.mem.read()?, true)
    }

    /// I/O stall averages.
    pub fn read_io(&mut self) -> Result<ResourceStats> {
        parse_resource(self.io.read()?, true)
    }

    /// CPU stall averages.
    pub fn read_cpu(&mut self) -> Result<ResourceStats> {
        parse_resource(self.cpu.read()?, false)
    }
}

impl Default for PsiReaders {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "some avg10=1.25 avg60=0.50 avg300=0.10 total=123456\n\
                          full avg10=0.75 avg60=0.25 avg300=0.05 total=654321\n";

    #[test]
    fn test_parse_some_and_full() {
        let stats = parse_resource(SAMPLE, true).unwrap();
        assert_eq!(stats[PsiKind::Some as usize].avg10, 1.25);
        assert_eq!(stats[PsiKind::Full as usize].avg10, 0.75);
        assert_eq!(stats[PsiKind::Full as usize].total, 654321);
    }

    #[test]
    fn test_parse_some_only() {
        let stats = parse_resource("some avg10=2.00 avg60=0 avg300=0 total=1\n", false).unwrap();
        assert_eq!(stats[PsiKind::Some as usize].avg10, 2.0);
        assert_eq!(stats[PsiKind::Full as usize], PsiStats::default());
    }

    #[test]
    fn test_parse_wrong_tag() {
        assert!(parse_resource("full avg10=0 avg60=0 avg300=0 total=0\n", true).is_err());
    }
}
