//! Kernel memory-event stream listener.
//!
//! The memory-event accessor exports a nonblocking descriptor delivering
//! fixed-size records for reclaim state transitions, vendor-requested kills
//! and zoneinfo updates. The listener is started only after boot completes,
//! so daemon startup never contends with event-program loading.
//!
//! Record layout, native endian, 16 bytes:
//!
//! ```text
//! ┌──────────┬──────────┬──────────────────┐
//! │   type   │   arg0   │       arg1       │
//! │ (4 bytes)│ (4 bytes)│     (8 bytes)    │
//! └──────────┴──────────┴──────────────────┘
//! ```

use crate::error::{Error, Result};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::fs::{open, Mode, OFlags};
use smallvec::SmallVec;
use std::path::Path;

/// Size of one wire record.
pub const RECORD_SIZE: usize = 16;

const EV_DIRECT_RECLAIM_BEGIN: u32 = 0;
const EV_DIRECT_RECLAIM_END: u32 = 1;
const EV_KSWAPD_WAKE: u32 = 2;
const EV_KSWAPD_SLEEP: u32 = 3;
const EV_VENDOR_KILL: u32 = 4;
const EV_UPDATE_ZONEINFO: u32 = 5;

/// A decoded memory event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemEvent {
    /// An allocating task entered direct reclaim.
    DirectReclaimBegin,
    /// Direct reclaim finished.
    DirectReclaimEnd,
    /// kswapd woke up.
    KswapdWake,
    /// kswapd went back to sleep.
    KswapdSleep,
    /// The vendor requests a kill with its own reason code and floor.
    VendorKill {
        /// Vendor-defined reason code.
        reason: i32,
        /// Minimum OOM adjustment of processes to consider.
        min_oom_score_adj: i32,
    },
    /// Zone watermarks changed; re-read zoneinfo.
    UpdateZoneinfo,
}

/// Decode one 16-byte record. Unknown types yield `None`.
pub fn decode_record(raw: &[u8; RECORD_SIZE]) -> Option<MemEvent> {
    let ty = u32::from_ne_bytes(raw[0..4].try_into().ok()?);
    let arg0 = i32::from_ne_bytes(raw[4..8].try_into().ok()?);
    let arg1 = i64::from_ne_bytes(raw[8..16].try_into().ok()?);
    match ty {
        EV_DIRECT_RECLAIM_BEGIN => Some(MemEvent::DirectReclaimBegin),
        EV_DIRECT_RECLAIM_END => Some(MemEvent::DirectReclaimEnd),
        EV_KSWAPD_WAKE => Some(MemEvent::KswapdWake),
        EV_KSWAPD_SLEEP => Some(MemEvent::KswapdSleep),
        EV_VENDOR_KILL => Some(MemEvent::VendorKill {
            reason: arg0,
            min_oom_score_adj: arg1 as i32,
        }),
        EV_UPDATE_ZONEINFO => Some(MemEvent::UpdateZoneinfo),
        _ => None,
    }
}

/// Decode a buffer of records; short trailing bytes are dropped.
pub fn decode_events(buf: &[u8]) -> SmallVec<[MemEvent; 8]> {
    buf.chunks_exact(RECORD_SIZE)
        .filter_map(|chunk| {
            let raw: &[u8; RECORD_SIZE] = chunk.try_into().ok()?;
            decode_record(raw)
        })
        .collect()
}

/// Listener over the memory-event stream descriptor.
pub struct MemEventListener {
    fd: OwnedFd,
    buf: Vec<u8>,
    /// Whether the kernel delivers zoneinfo-update events; when it does not,
    /// watermarks fall back to periodic refresh.
    pub update_zoneinfo_supported: bool,
}

impl MemEventListener {
    /// Open the stream at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let fd = open(path, OFlags::RDONLY | OFlags::NONBLOCK | OFlags::CLOEXEC, Mode::empty())
            .map_err(|err| {
                Error::Init(format!("memory-event stream {} unavailable: {err}", path.display()))
            })?;
        Ok(Self {
            fd,
            buf: vec![0; RECORD_SIZE * 64],
            // Capability is learned from the first event of that type.
            update_zoneinfo_supported: false,
        })
    }

    /// The stream descriptor, for epoll registration.
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// Drain all pending events.
    pub fn read_events(&mut self) -> Result<SmallVec<[MemEvent; 8]>> {
        let mut events = SmallVec::new();
        loop {
            match rustix::io::read(&self.fd, &mut self.buf) {
                Ok(0) => break,
                Ok(n) => events.extend(decode_events(&self.buf[..n])),
                Err(rustix::io::Errno::WOULDBLOCK) => break,
                Err(rustix::io::Errno::INTR) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        for event in &events {
            if *event == MemEvent::UpdateZoneinfo {
                self.update_zoneinfo_supported = true;
            }
        }
        Ok(events)
    }
}
