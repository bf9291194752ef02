//! Legacy memcg pressure-level eventfds.
//!
//! On v1 cgroup hierarchies the kernel delivers `memory.pressure_level`
//! notifications through eventfds armed via `cgroup.event_control`. One
//! eventfd is armed per level; when any of them fires, all three are drained
//! and the reported level is promoted to the highest that fired.

use super::PressureLevel;
use crate::error::{Error, Result};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::fs::{open, Mode, OFlags};
use std::path::Path;

/// One armed memcg pressure eventfd.
pub struct MemcgMonitor {
    evfd: OwnedFd,
    // The pressure-level descriptor must stay open for the registration to
    // remain active.
    _mpfd: OwnedFd,
    level: PressureLevel,
}

impl MemcgMonitor {
    /// Arm a monitor for `level` under the given memcg root.
    pub fn arm(memcg_root: &Path, level: PressureLevel) -> Result<Self> {
        let pressure_path = memcg_root.join("memory.pressure_level");
        let control_path = memcg_root.join("cgroup.event_control");

        let mpfd = open(&pressure_path, OFlags::RDONLY | OFlags::CLOEXEC, Mode::empty())
            .map_err(|err| {
                Error::Init(format!("no memory.pressure_level support: {err}"))
            })?;
        let evctlfd = open(&control_path, OFlags::WRONLY | OFlags::CLOEXEC, Mode::empty())
            .map_err(|err| Error::Init(format!("no cgroup event control: {err}")))?;
        let evfd = rustix::event::eventfd(
            0,
            rustix::event::EventfdFlags::NONBLOCK | rustix::event::EventfdFlags::CLOEXEC,
        )?;

        use rustix::fd::AsRawFd;
        let registration =
            format!("{} {} {}", evfd.as_raw_fd(), mpfd.as_raw_fd(), level.name());
        rustix::io::write(&evctlfd, registration.as_bytes()).map_err(|err| {
            Error::Init(format!(
                "cgroup.event_control write failed for level {}: {err}",
                level.name()
            ))
        })?;

        Ok(Self { evfd, _mpfd: mpfd, level })
    }

    /// Level this monitor reports.
    pub fn level(&self) -> PressureLevel {
        self.level
    }

    /// The eventfd, for epoll registration.
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.evfd.as_fd()
    }

    /// Drain the eventfd counter; true if it had fired.
    pub fn consume(&self) -> bool {
        let mut buf = [0u8; 8];
        matches!(rustix::io::read(&self.evfd, &mut buf), Ok(8))
    }
}

/// Drain every monitor and promote `level` to the highest that fired.
pub fn promote_level(monitors: &[MemcgMonitor], level: PressureLevel) -> PressureLevel {
    let mut highest = level;
    for monitor in monitors {
        if monitor.consume() && monitor.level() > highest {
            highest = monitor.level();
        }
    }
    highest
}
