//! Control socket wire protocol.
//!
//! Packets are sequences of native-endian `i32` words: a command code
//! followed by command-specific fields. The same framing carries replies and
//! the asynchronous notifications pushed to subscribed clients.

use crate::error::{Error, Result};
use crate::targets::{Target, MAX_TARGETS};
use crate::{OOM_SCORE_ADJ_MAX, OOM_SCORE_ADJ_MIN};
use smallvec::SmallVec;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

/// Default control socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/run/lowmemd.sock";
/// Environment variable overriding the socket path.
pub const SOCKET_ENV: &str = "LOWMEMD_SOCKET";

/// At most this many control clients; a further connect evicts everyone.
pub const MAX_DATA_CONN: usize = 3;

/// Largest packet: one command word plus 32 argument words.
pub const MAX_PACKET_WORDS: usize = 33;
/// Largest packet in bytes.
pub const MAX_PACKET_BYTES: usize = MAX_PACKET_WORDS * 4;
/// Largest `PROCS_PRIO` batch.
pub const MAX_PROCS_PRIO: usize = 8;

/// Command codes.
pub mod cmd {
    /// Replace the minfree target table.
    pub const TARGET: i32 = 0;
    /// Register a process or update its adjustment.
    pub const PROCPRIO: i32 = 1;
    /// Unregister a process.
    pub const PROCREMOVE: i32 = 2;
    /// Drop all records owned by the caller.
    pub const PROCPURGE: i32 = 3;
    /// Query kill counters.
    pub const GETKILLCNT: i32 = 4;
    /// Subscribe to asynchronous notifications.
    pub const SUBSCRIBE: i32 = 5;
    /// Asynchronous kill notification (daemon to client only).
    pub const PROCKILL: i32 = 6;
    /// Re-read properties and rebuild monitors.
    pub const UPDATE_PROPS: i32 = 7;
    /// Boot has completed; start the memory-event listener.
    pub const BOOT_COMPLETED: i32 = 8;
    /// Arm pressure monitors that were deferred past boot.
    pub const START_MONITORING: i32 = 9;
    /// Bulk PROCPRIO.
    pub const PROCS_PRIO: i32 = 10;
    /// Asynchronous kill statistics (daemon to client only).
    pub const KILLSTAT: i32 = 11;
}

/// Process types a client may register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcType {
    /// An application process.
    App,
    /// A long-lived service.
    Service,
}

impl ProcType {
    fn from_word(word: i32) -> Result<Self> {
        match word {
            0 => Ok(ProcType::App),
            1 => Ok(ProcType::Service),
            other => Err(Error::BadPacket(format!("invalid process type {other}"))),
        }
    }
}

/// Asynchronous notification classes clients subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncEvent {
    /// A process was killed.
    Kill = 0,
    /// Structured kill statistics.
    Stat = 1,
}

impl AsyncEvent {
    fn from_word(word: i32) -> Result<Self> {
        match word {
            0 => Ok(AsyncEvent::Kill),
            1 => Ok(AsyncEvent::Stat),
            other => Err(Error::BadPacket(format!("invalid event type {other}"))),
        }
    }

    /// Bit in a connection's subscription mask.
    pub fn mask_bit(self) -> u32 {
        1 << (self as u32)
    }
}

/// One registration entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcPrio {
    /// Target pid; must be a thread-group leader.
    pub pid: i32,
    /// Effective uid.
    pub uid: u32,
    /// New OOM adjustment.
    pub oom_adj: i32,
    /// Process type.
    pub ptype: ProcType,
}

impl ProcPrio {
    fn parse(words: &[i32]) -> Result<Self> {
        let ptype = match words.len() {
            // Type field is optional for older clients.
            3 => ProcType::App,
            4 => ProcType::from_word(words[3])?,
            n => return Err(Error::BadPacket(format!("procprio with {n} fields"))),
        };
        let oom_adj = words[2];
        if !(OOM_SCORE_ADJ_MIN..=OOM_SCORE_ADJ_MAX).contains(&oom_adj) {
            return Err(Error::BadPacket(format!("oom_score_adj {oom_adj} out of range")));
        }
        Ok(Self { pid: words[0], uid: words[1] as u32, oom_adj, ptype })
    }
}

/// A decoded control command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Replace the target table.
    Target(SmallVec<[Target; MAX_TARGETS]>),
    /// Register or update one process.
    ProcPrio(ProcPrio),
    /// Unregister one process.
    ProcRemove {
        /// The pid to drop.
        pid: i32,
    },
    /// Drop everything the caller owns.
    ProcPurge,
    /// Query kill counters over an adjustment range.
    GetKillCnt {
        /// Inclusive lower bound (sentinel above max = grand total).
        min_adj: i32,
        /// Inclusive upper bound.
        max_adj: i32,
    },
    /// Subscribe the connection to a notification class.
    Subscribe(AsyncEvent),
    /// Reload configuration.
    UpdateProps,
    /// Boot completed.
    BootCompleted,
    /// Arm deferred monitors.
    StartMonitoring,
    /// Bulk registration.
    ProcsPrio(SmallVec<[ProcPrio; MAX_PROCS_PRIO]>),
}

/// Decode raw bytes into words. Short or unaligned packets are rejected.
pub fn decode_words(bytes: &[u8]) -> Result<SmallVec<[i32; MAX_PACKET_WORDS]>> {
    if bytes.is_empty() || bytes.len() % 4 != 0 || bytes.len() > MAX_PACKET_BYTES {
        return Err(Error::BadPacket(format!("bad packet length {}", bytes.len())));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| i32::from_ne_bytes(chunk.try_into().unwrap_or([0; 4])))
        .collect())
}

/// Parse a decoded packet into a command.
pub fn parse_command(words: &[i32]) -> Result<Command> {
    let (&code, args) = words
        .split_first()
        .ok_or_else(|| Error::BadPacket("empty packet".into()))?;
    let expect = |n: usize| {
        if args.len() == n {
            Ok(())
        } else {
            Err(Error::BadPacket(format!("command {code} with {} fields", args.len())))
        }
    };

    match code {
        cmd::TARGET => {
            if args.is_empty() || args.len() % 2 != 0 || args.len() / 2 > MAX_TARGETS {
                return Err(Error::BadPacket(format!("target list of {} words", args.len())));
            }
            Ok(Command::Target(
                args.chunks_exact(2)
                    .map(|pair| Target { minfree_pages: pair[0], oom_adj: pair[1] })
                    .collect(),
            ))
        }
        cmd::PROCPRIO => Ok(Command::ProcPrio(ProcPrio::parse(args)?)),
        cmd::PROCREMOVE => {
            expect(1)?;
            Ok(Command::ProcRemove { pid: args[0] })
        }
        cmd::PROCPURGE => {
            expect(0)?;
            Ok(Command::ProcPurge)
        }
        cmd::GETKILLCNT => {
            expect(2)?;
            Ok(Command::GetKillCnt { min_adj: args[0], max_adj: args[1] })
        }
        cmd::SUBSCRIBE => {
            expect(1)?;
            Ok(Command::Subscribe(AsyncEvent::from_word(args[0])?))
        }
        cmd::PROCKILL => Err(Error::BadPacket("unexpected PROCKILL from client".into())),
        cmd::UPDATE_PROPS => {
            expect(0)?;
            Ok(Command::UpdateProps)
        }
        cmd::BOOT_COMPLETED => {
            expect(0)?;
            Ok(Command::BootCompleted)
        }
        cmd::START_MONITORING => {
            expect(0)?;
            Ok(Command::StartMonitoring)
        }
        cmd::PROCS_PRIO => {
            if args.is_empty() || args.len() % 4 != 0 || args.len() / 4 > MAX_PROCS_PRIO {
                return Err(Error::BadPacket(format!("procs_prio with {} words", args.len())));
            }
            let mut procs = SmallVec::new();
            for chunk in args.chunks_exact(4) {
                procs.push(ProcPrio::parse(chunk)?);
            }
            Ok(Command::ProcsPrio(procs))
        }
        other => Err(Error::BadPacket(format!("unknown command code {other}"))),
    }
}

/// Encode a list of words into wire bytes.
pub fn encode_words(words: &[i32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(words.len() * 4);
    for word in words {
        bytes.extend_from_slice(&word.to_ne_bytes());
    }
    bytes
}

/// `[PROCKILL, pid, uid, rss_kb]` pushed to kill subscribers.
pub fn encode_kill_notification(pid: i32, uid: u32, rss_kb: i64) -> Vec<u8> {
    encode_words(&[cmd::PROCKILL, pid, uid as i32, rss_kb.min(i32::MAX as i64) as i32])
}

/// Structured kill statistics pushed to stat subscribers.
#[allow(clippy::too_many_arguments)]
pub fn encode_kill_stat(
    uid: u32,
    oom_adj: i32,
    min_oom_adj: i32,
    free_mem_kb: i64,
    free_swap_kb: i64,
    reason_code: i32,
    thrashing: i64,
    max_thrashing: i64,
) -> Vec<u8> {
    encode_words(&[
        cmd::KILLSTAT,
        uid as i32,
        oom_adj,
        min_oom_adj,
        free_mem_kb.min(i32::MAX as i64) as i32,
        free_swap_kb.min(i32::MAX as i64) as i32,
        reason_code,
        thrashing.min(i32::MAX as i64) as i32,
        max_thrashing.min(i32::MAX as i64) as i32,
    ])
}

/// Resolve the control socket path, honoring the environment override.
pub fn socket_path() -> std::path::PathBuf {
    std::env::var(SOCKET_ENV)
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| std::path::PathBuf::from(DEFAULT_SOCKET_PATH))
}

/// Client side: connect, send one command, read one reply word pair.
///
/// Used by the one-shot CLI modes to talk to a running daemon.
pub fn roundtrip(path: &Path, request: &[i32]) -> Result<i32> {
    let mut stream = UnixStream::connect(path)
        .map_err(|err| Error::Init(format!("cannot connect to {}: {err}", path.display())))?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    stream.write_all(&encode_words(request))?;

    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply)?;
    let words = decode_words(&reply)?;
    if words[0] != request[0] {
        return Err(Error::BadPacket(format!(
            "reply command {} does not match request {}",
            words[0], request[0]
        )));
    }
    Ok(words[1])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_words(words: &[i32]) -> Command {
        parse_command(&decode_words(&encode_words(words)).unwrap()).unwrap()
    }

    #[test]
    fn test_target_roundtrip() {
        let command = roundtrip_words(&[cmd::TARGET, 4096, 900, 8192, 600]);
        match command {
            Command::Target(targets) => {
                assert_eq!(targets.len(), 2);
                assert_eq!(targets[0], Target { minfree_pages: 4096, oom_adj: 900 });
                assert_eq!(targets[1], Target { minfree_pages: 8192, oom_adj: 600 });
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_target_odd_words_rejected() {
        assert!(parse_command(&[cmd::TARGET, 4096, 900, 8192]).is_err());
    }

    #[test]
    fn test_procprio_optional_type() {
        let short = roundtrip_words(&[cmd::PROCPRIO, 123, 1000, 900]);
        assert_eq!(
            short,
            Command::ProcPrio(ProcPrio { pid: 123, uid: 1000, oom_adj: 900, ptype: ProcType::App })
        );
        let long = roundtrip_words(&[cmd::PROCPRIO, 123, 1000, 900, 1]);
        match long {
            Command::ProcPrio(p) => assert_eq!(p.ptype, ProcType::Service),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_procprio_validation() {
        assert!(parse_command(&[cmd::PROCPRIO, 123, 1000, 1500]).is_err());
        assert!(parse_command(&[cmd::PROCPRIO, 123, 1000, 900, 9]).is_err());
        assert!(parse_command(&[cmd::PROCPRIO, 123, 1000]).is_err());
    }

    #[test]
    fn test_procs_prio() {
        let command =
            roundtrip_words(&[cmd::PROCS_PRIO, 1, 1000, 900, 0, 2, 1001, 800, 1]);
        match command {
            Command::ProcsPrio(procs) => {
                assert_eq!(procs.len(), 2);
                assert_eq!(procs[1].pid, 2);
                assert_eq!(procs[1].ptype, ProcType::Service);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_simple_commands() {
        assert_eq!(roundtrip_words(&[cmd::PROCREMOVE, 55]), Command::ProcRemove { pid: 55 });
        assert_eq!(roundtrip_words(&[cmd::PROCPURGE]), Command::ProcPurge);
        assert_eq!(
            roundtrip_words(&[cmd::GETKILLCNT, 0, 1000]),
            Command::GetKillCnt { min_adj: 0, max_adj: 1000 }
        );
        assert_eq!(roundtrip_words(&[cmd::SUBSCRIBE, 0]), Command::Subscribe(AsyncEvent::Kill));
        assert_eq!(roundtrip_words(&[cmd::UPDATE_PROPS]), Command::UpdateProps);
        assert_eq!(roundtrip_words(&[cmd::BOOT_COMPLETED]), Command::BootCompleted);
        assert_eq!(roundtrip_words(&[cmd::START_MONITORING]), Command::StartMonitoring);
    }

    #[test]
    fn test_prockill_from_client_rejected() {
        assert!(parse_command(&[cmd::PROCKILL]).is_err());
    }

    #[test]
    fn test_unknown_and_malformed() {
        assert!(parse_command(&[99]).is_err());
        assert!(parse_command(&[]).is_err());
        assert!(decode_words(&[1, 2, 3]).is_err());
        assert!(decode_words(&[]).is_err());
    }

    #[test]
    fn test_kill_notification_encoding() {
        let bytes = encode_kill_notification(123, 10001, 45678);
        let words = decode_words(&bytes).unwrap();
        assert_eq!(words.as_slice(), &[cmd::PROCKILL, 123, 10001, 45678]);
    }

    #[test]
    fn test_subscription_mask_bits() {
        assert_eq!(AsyncEvent::Kill.mask_bit(), 1);
        assert_eq!(AsyncEvent::Stat.mask_bit(), 2);
    }
}
