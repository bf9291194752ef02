//! Per-process `/proc/<pid>` accessors.
//!
//! These files are consulted at registration and kill time, not on the
//! polling fast path, so each call opens and closes its file.

use super::parse_i64;
use std::io::ErrorKind;
use std::path::PathBuf;

const STATUS_TGID: &str = "Tgid:";
const STATUS_RSS: &str = "VmRSS:";
const STATUS_SWAP: &str = "VmSwap:";

/// Fields extracted from `/proc/<pid>/status`.
#[derive(Debug, Clone, Copy)]
pub struct ProcStatus {
    /// Thread group id; differs from the pid for non-leader threads.
    pub tgid: i64,
    /// Resident set size in kB. Absent for zombies.
    pub rss_kb: Option<i64>,
    /// Swapped-out size in kB. Absent for zombies.
    pub swap_kb: Option<i64>,
}

/// Read and scan `/proc/<pid>/status`.
///
/// Returns `None` when the process is gone or the Tgid field is missing.
pub fn proc_status(pid: i32) -> Option<ProcStatus> {
    let content = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    parse_status(&content)
}

fn parse_status(content: &str) -> Option<ProcStatus> {
    Some(ProcStatus {
        tgid: status_tag(content, STATUS_TGID)?,
        rss_kb: status_tag(content, STATUS_RSS),
        swap_kb: status_tag(content, STATUS_SWAP),
    })
}

/// Find `tag` at a line start and parse the integer that follows.
fn status_tag(content: &str, tag: &str) -> Option<i64> {
    content
        .lines()
        .find_map(|line| line.strip_prefix(tag))
        .and_then(parse_i64)
}

/// RSS in pages from `/proc/<pid>/statm` (second field).
pub fn proc_statm_rss(pid: i32) -> Option<i64> {
    let content = std::fs::read_to_string(format!("/proc/{pid}/statm")).ok()?;
    let mut fields = content.split_whitespace();
    fields.next()?;
    parse_i64(fields.next()?)
}

/// Process name from `/proc/<pid>/cmdline`, truncated at the first space
/// or NUL.
pub fn proc_cmdline_name(pid: i32) -> Option<String> {
    let bytes = std::fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    if bytes.is_empty() {
        return None;
    }
    let end = bytes
        .iter()
        .position(|&b| b == b' ' || b == 0)
        .unwrap_or(bytes.len());
    Some(String::from_utf8_lossy(&bytes[..end]).into_owned())
}

/// Outcome of writing `/proc/<pid>/oom_score_adj`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OomAdjWrite {
    /// Value written.
    Done,
    /// The file does not exist; the process is already dead.
    ProcessDead,
    /// Write failed for another reason.
    Failed,
}

/// Write the kernel OOM adjustment for `pid`.
pub fn write_oom_score_adj(pid: i32, adj: i32) -> OomAdjWrite {
    let path = PathBuf::from(format!("/proc/{pid}/oom_score_adj"));
    match std::fs::write(&path, adj.to_string()) {
        Ok(()) => OomAdjWrite::Done,
        Err(err) if err.kind() == ErrorKind::NotFound => OomAdjWrite::ProcessDead,
        Err(err) => {
            tracing::error!(pid, adj, %err, "oom_score_adj write failed");
            OomAdjWrite::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS: &str = "Name:\tcom.example.app\n\
                          Umask:\t0077\n\
                          State:\tS (sleeping)\n\
                          Tgid:\t4242\n\
                          Ngid:\t0\n\
                          Pid:\t4242\n\
                          VmRSS:\t  123456 kB\n\
                          VmSwap:\t    7890 kB\n";

    #[test]
    fn test_parse_status() {
        let st = parse_status(STATUS).unwrap();
        assert_eq!(st.tgid, 4242);
        assert_eq!(st.rss_kb, Some(123456));
        assert_eq!(st.swap_kb, Some(7890));
    }

    #[test]
    fn test_parse_status_zombie() {
        let st = parse_status("Name:\tdead\nTgid:\t99\nPid:\t99\n").unwrap();
        assert_eq!(st.tgid, 99);
        assert_eq!(st.rss_kb, None);
        assert_eq!(st.swap_kb, None);
    }

    #[test]
    fn test_status_tag_line_start_only() {
        // "Tgid:" embedded mid-line must not match.
        let content = "Name:\tfakeTgid: 1\nTgid:\t7\n";
        assert_eq!(status_tag(content, STATUS_TGID), Some(7));
    }

    #[test]
    fn test_self_lookups() {
        let pid = std::process::id() as i32;
        let st = proc_status(pid).unwrap();
        assert_eq!(st.tgid, pid as i64);
        assert!(proc_statm_rss(pid).unwrap() > 0);
        assert!(proc_cmdline_name(pid).is_some());
    }
}
