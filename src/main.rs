//! lowmemd entry point.
//!
//! With no arguments, runs the daemon. `--reinit` and `--boot-completed`
//! instead connect to a running instance as control clients, deliver the
//! corresponding command, and exit with a status reflecting the reply.

use argh::FromArgs;
use lowmemd::control;
use lowmemd::daemon::Daemon;
use lowmemd::props::PropertyStore;
use tracing_subscriber::EnvFilter;

/// Userspace low-memory killer daemon.
#[derive(FromArgs)]
struct Args {
    /// ask a running instance to reload properties, then exit
    #[argh(switch)]
    reinit: bool,
    /// notify a running instance that boot completed, then exit
    #[argh(switch)]
    boot_completed: bool,
}

fn main() {
    let args: Args = argh::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let code = if args.reinit {
        issue_reinit()
    } else if args.boot_completed {
        notify_boot_completed()
    } else {
        run_daemon()
    };
    std::process::exit(code);
}

fn issue_reinit() -> i32 {
    match control::roundtrip(&control::socket_path(), &[control::cmd::UPDATE_PROPS]) {
        Ok(0) => {
            tracing::info!("properties updated successfully");
            0
        }
        Ok(result) => {
            tracing::error!(result, "daemon failed to update its properties");
            1
        }
        Err(err) => {
            tracing::error!(%err, "reinit request failed");
            1
        }
    }
}

fn notify_boot_completed() -> i32 {
    match control::roundtrip(&control::socket_path(), &[control::cmd::BOOT_COMPLETED]) {
        Ok(0) => 0,
        Ok(1) => {
            tracing::warn!("daemon already handled boot-completed operations");
            1
        }
        Ok(result) => {
            tracing::error!(result, "daemon failed to handle boot-completed");
            1
        }
        Err(err) => {
            tracing::error!(%err, "boot-completed request failed");
            1
        }
    }
}

fn run_daemon() -> i32 {
    let props = PropertyStore::load_default();
    let mut daemon = match Daemon::new(&props) {
        Ok(daemon) => daemon,
        Err(err) => {
            tracing::error!(%err, "initialization failed");
            return 1;
        }
    };

    lock_and_boost();

    match daemon.run() {
        Ok(()) => 0,
        Err(err) => {
            tracing::error!(%err, "reactor failed");
            1
        }
    }
}

/// Pin our pages and request real-time scheduling so the killer itself
/// cannot be stalled by the pressure it is supposed to relieve.
fn lock_and_boost() {
    // MCL_ONFAULT pins pages as they fault in; old kernels reject it with
    // EINVAL, which is fine to ignore.
    // SAFETY: plain syscalls with constant arguments.
    unsafe {
        if libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE | libc::MCL_ONFAULT) != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINVAL) {
                tracing::warn!(%err, "mlockall failed");
            }
        }

        let param = libc::sched_param { sched_priority: 99 };
        if libc::sched_setscheduler(0, libc::SCHED_RR, &param) != 0 {
            tracing::warn!(err = %std::io::Error::last_os_error(), "cannot set SCHED_RR");
        }
    }
}
