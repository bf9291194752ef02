//! Cached readers for `/proc` state files.
//!
//! The files polled during memory pressure (`meminfo`, `vmstat`, `zoneinfo`,
//! the PSI averages) are read through a [`FileReader`] that keeps its
//! descriptor open and its buffer grown to steady-state size, so re-reads
//! during a pressure spike neither open files nor allocate. `/proc` files
//! report `st_size == 0`, so the reader sizes its buffer by doubling until a
//! short read is observed instead of asking `fstat`.

mod meminfo;
mod process;
mod psi;
mod vmstat;
mod zoneinfo;

pub use meminfo::{MemInfo, MemInfoReader};
pub use process::{
    proc_cmdline_name, proc_statm_rss, proc_status, write_oom_score_adj, OomAdjWrite, ProcStatus,
};
pub use psi::{PsiData, PsiKind, PsiReaders, PsiStats, ResourceStats};
pub use vmstat::{VmStat, VmStatReader};
pub use zoneinfo::{Zone, ZoneInfo, ZoneInfoReader};

use crate::error::{Error, Result};
use rustix::fd::OwnedFd;
use rustix::fs::{open, Mode, OFlags};
use std::path::{Path, PathBuf};

/// A `/proc` file read repeatedly with a persistent descriptor and a
/// grow-as-needed buffer.
pub struct FileReader {
    path: PathBuf,
    name: &'static str,
    fd: Option<OwnedFd>,
    buf: Vec<u8>,
}

impl FileReader {
    /// Create a reader for `path`. The file is opened lazily on first read.
    pub fn new(path: impl Into<PathBuf>, name: &'static str) -> Self {
        Self {
            path: path.into(),
            name,
            fd: None,
            buf: vec![0; crate::page_size()],
        }
    }

    /// File this reader is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the whole file from offset 0 and return its content.
    ///
    /// The descriptor stays open across calls; on read failure it is dropped
    /// so the next call reopens. The buffer doubles until the content fits,
    /// then never shrinks.
    pub fn read(&mut self) -> Result<&str> {
        if self.fd.is_none() {
            let fd = open(&self.path, OFlags::RDONLY | OFlags::CLOEXEC, Mode::empty())?;
            self.fd = Some(fd);
        }

        let Self { fd, buf, name, .. } = self;
        let len = loop {
            let Some(file) = fd.as_ref() else {
                unreachable!()
            };
            match read_all(file, buf) {
                Ok(len) if len < buf.len() => break len,
                Ok(_) => {
                    // Filled the buffer; the file may be longer.
                    let new_len = buf.len() * 2;
                    buf.resize(new_len, 0);
                }
                Err(err) => {
                    *fd = None;
                    return Err(err.into());
                }
            }
        };

        std::str::from_utf8(&buf[..len]).map_err(|err| Error::Parse {
            file: *name,
            reason: err.to_string(),
        })
    }
}

/// Read from offset 0 up to `buf.len()` bytes or EOF, whichever comes first.
fn read_all(fd: &OwnedFd, buf: &mut [u8]) -> rustix::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = rustix::io::pread(fd, &mut buf[total..], total as u64)?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

/// Parse a leading signed 64-bit integer, ignoring any trailing text
/// (`"1234 kB"` parses as 1234).
pub(crate) fn parse_i64(s: &str) -> Option<i64> {
    let s = s.trim_start();
    let end = s
        .char_indices()
        .take_while(|(i, c)| c.is_ascii_digit() || (*i == 0 && (*c == '-' || *c == '+')))
        .map(|(i, c)| i + c.len_utf8())
        .last()?;
    s[..end].parse().ok()
}

/// Match `name` against a fixed field table and parse `value`.
///
/// Returns `Ok(None)` when the name is not in the table and an error when a
/// known field carries an unparsable value.
pub(crate) fn match_field(
    name: &str,
    value: &str,
    table: &[&'static str],
    file: &'static str,
) -> Result<Option<(usize, i64)>> {
    let Some(idx) = table.iter().position(|f| *f == name) else {
        return Ok(None);
    };
    match parse_i64(value) {
        Some(v) => Ok(Some((idx, v))),
        None => Err(Error::Parse {
            file,
            reason: format!("bad value {value:?} for field {name}"),
        }),
    }
}

/// Reader for the GPU memory accounting map exported by the graphics stack.
///
/// The map holds a single little-endian u64 byte total. Absence of the map
/// is normal (no GPU accounting); the first failed open disables the reader.
pub struct GpuMemReader {
    path: PathBuf,
    disabled: bool,
}

impl GpuMemReader {
    /// Create a reader for the accounting map at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), disabled: false }
    }

    /// Total GPU memory in kB, or 0 when unsupported.
    pub fn total_kb(&mut self) -> i64 {
        if self.disabled {
            return 0;
        }
        match std::fs::read(&self.path) {
            Ok(bytes) if bytes.len() >= 8 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&bytes[..8]);
                (u64::from_ne_bytes(raw) / 1024) as i64
            }
            _ => {
                self.disabled = true;
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_i64() {
        assert_eq!(parse_i64("1234"), Some(1234));
        assert_eq!(parse_i64("1234 kB"), Some(1234));
        assert_eq!(parse_i64("  -56"), Some(-56));
        assert_eq!(parse_i64("+7"), Some(7));
        assert_eq!(parse_i64("kB"), None);
        assert_eq!(parse_i64(""), None);
    }

    #[test]
    fn test_match_field() {
        let table = ["MemFree:", "Cached:"];
        assert_eq!(
            match_field("Cached:", "42 kB", &table, "test").unwrap(),
            Some((1, 42))
        );
        assert_eq!(match_field("Bogus:", "42", &table, "test").unwrap(), None);
        assert!(match_field("MemFree:", "xyz", &table, "test").is_err());
    }

    #[test]
    fn test_file_reader_reread() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "MemFree: 100 kB\n").unwrap();
        file.flush().unwrap();

        let mut reader = FileReader::new(file.path(), "test");
        assert_eq!(reader.read().unwrap(), "MemFree: 100 kB\n");
        // Second read returns the same content without reopening.
        assert_eq!(reader.read().unwrap(), "MemFree: 100 kB\n");
    }

    #[test]
    fn test_file_reader_grows() {
        let mut file = NamedTempFile::new().unwrap();
        let big = "x".repeat(crate::page_size() * 3 + 17);
        write!(file, "{big}").unwrap();
        file.flush().unwrap();

        let mut reader = FileReader::new(file.path(), "test");
        assert_eq!(reader.read().unwrap().len(), big.len());
    }

    #[test]
    fn test_gpu_reader_missing_disables() {
        let mut reader = GpuMemReader::new("/nonexistent/gpu_map");
        assert_eq!(reader.total_kb(), 0);
        assert_eq!(reader.total_kb(), 0);
    }

    #[test]
    fn test_gpu_reader_value() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&(4096u64 * 1024).to_ne_bytes()).unwrap();
        file.flush().unwrap();
        let mut reader = GpuMemReader::new(file.path());
        assert_eq!(reader.total_kb(), 4096);
    }
}
