//! The reaper: kill delivery plus asynchronous address-space reaping.
//!
//! `SIGKILL` is sent synchronously on the caller's thread so the kill
//! decision path observes delivery errors directly. Reclaiming the victim's
//! address space with `process_mrelease` can take a while, so that part is
//! queued to a worker thread. When the worker finds the victim still alive
//! after a failed release, it reports the pid through the failure pipe the
//! reactor polls.

use crate::error::{Error, Result};
use rustix::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use rustix::pipe::{pipe_with, PipeFlags};
use rustix::process::{Pid, Signal};
use std::sync::Arc;
use std::thread;

/// One queued reap job.
struct ReapJob {
    pid: i32,
    pidfd: OwnedFd,
}

struct Shared {
    fail_write: OwnedFd,
}

impl Shared {
    /// Report a kill that did not take effect.
    fn notify_failure(&self, pid: i32) {
        if rustix::io::write(&self.fail_write, &pid.to_ne_bytes()).is_err() {
            tracing::error!(pid, "cannot report kill failure to the reactor");
        }
    }
}

/// Kill dispatcher with a reaping worker thread.
pub struct Reaper {
    shared: Arc<Shared>,
    jobs: kanal::Sender<ReapJob>,
}

impl Reaper {
    /// Spawn the worker. Returns the reaper and the read end of the failure
    /// pipe for epoll registration.
    pub fn new() -> Result<(Self, OwnedFd)> {
        let (fail_read, fail_write) = pipe_with(PipeFlags::CLOEXEC | PipeFlags::NONBLOCK)?;
        let shared = Arc::new(Shared { fail_write });
        let (tx, rx) = kanal::bounded::<ReapJob>(16);

        let worker_shared = Arc::clone(&shared);
        thread::Builder::new()
            .name("reaper".into())
            .spawn(move || worker_loop(rx, worker_shared))
            .map_err(|err| Error::Init(format!("cannot spawn reaper thread: {err}")))?;

        Ok((Self { shared, jobs: tx }, fail_read))
    }

    /// Deliver `SIGKILL` to `pid` and queue address-space reaping.
    ///
    /// Called from the reactor for ordinary kills and from the watchdog for
    /// emergency ones.
    pub fn kill(&self, pid: i32, pidfd: Option<BorrowedFd<'_>>) -> Result<()> {
        match pidfd {
            Some(fd) => {
                rustix::process::pidfd_send_signal(fd, Signal::Kill)?;
                // Hand the worker its own descriptor; the record's copy may
                // be closed before reaping finishes.
                match rustix::io::fcntl_dupfd_cloexec(fd, 0) {
                    Ok(dup) => {
                        let queued = self.jobs.try_send(ReapJob { pid, pidfd: dup });
                        if !queued.unwrap_or(false) {
                            tracing::warn!(pid, "reaper queue unavailable, skipping mrelease");
                        }
                    }
                    Err(err) => tracing::warn!(pid, %err, "cannot duplicate pidfd for reaping"),
                }
            }
            None => {
                let target = Pid::from_raw(pid).ok_or(rustix::io::Errno::SRCH)?;
                rustix::process::kill_process(target, Signal::Kill)?;
            }
        }
        Ok(())
    }

    /// Report a failed kill directly (used when delivery itself failed on
    /// a path that cannot return the error inline).
    pub fn notify_failure(&self, pid: i32) {
        self.shared.notify_failure(pid);
    }
}

fn worker_loop(rx: kanal::Receiver<ReapJob>, shared: Arc<Shared>) {
    while let Ok(job) = rx.recv() {
        if !release_address_space(&job.pidfd) && process_alive(job.pid) {
            tracing::warn!(pid = job.pid, "victim still alive after failed release");
            shared.notify_failure(job.pid);
        }
    }
}

/// `process_mrelease`; true when the address space is gone (or already was).
fn release_address_space(pidfd: &OwnedFd) -> bool {
    // SAFETY: plain syscall on an owned descriptor.
    let ret = unsafe { libc::syscall(libc::SYS_process_mrelease, pidfd.as_fd().as_raw_fd(), 0) };
    if ret == 0 {
        return true;
    }
    let errno = std::io::Error::last_os_error();
    // ESRCH means the process is fully dead, which is the goal.
    errno.raw_os_error() == Some(libc::ESRCH)
}

fn process_alive(pid: i32) -> bool {
    std::path::Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_pipe_roundtrip() {
        let (reaper, fail_read) = Reaper::new().unwrap();
        let mut buf = [0u8; 4];
        // Empty pipe must not block the reactor.
        assert_eq!(rustix::io::read(&fail_read, &mut buf), Err(rustix::io::Errno::WOULDBLOCK));

        reaper.notify_failure(4242);
        assert_eq!(rustix::io::read(&fail_read, &mut buf), Ok(4));
        assert_eq!(i32::from_ne_bytes(buf), 4242);
    }

    #[test]
    fn test_kill_rejects_bad_pid() {
        let (reaper, _fail_read) = Reaper::new().unwrap();
        assert!(reaper.kill(0, None).is_err());
    }
}
