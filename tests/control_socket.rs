//! Wire-protocol tests against a live unix socket.

use lowmemd::control::{self, cmd, Command};
use std::io::{Read, Write};
use std::os::unix::net::UnixListener;
use std::thread;

#[test]
fn test_getkillcnt_roundtrip_over_socket() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lowmemd.sock");
    let listener = UnixListener::bind(&path).unwrap();

    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = [0u8; control::MAX_PACKET_BYTES];
        let len = stream.read(&mut buf).unwrap();
        let words = control::decode_words(&buf[..len]).unwrap();
        let command = control::parse_command(&words).unwrap();
        assert_eq!(command, Command::GetKillCnt { min_adj: 0, max_adj: 1000 });
        stream
            .write_all(&control::encode_words(&[cmd::GETKILLCNT, 7]))
            .unwrap();
    });

    let reply = control::roundtrip(&path, &[cmd::GETKILLCNT, 0, 1000]).unwrap();
    assert_eq!(reply, 7);
    server.join().unwrap();
}

#[test]
fn test_bulk_registration_packet_over_socket() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lowmemd.sock");
    let listener = UnixListener::bind(&path).unwrap();

    let client = thread::spawn({
        let path = path.clone();
        move || {
            let mut stream = std::os::unix::net::UnixStream::connect(&path).unwrap();
            let packet =
                control::encode_words(&[cmd::PROCS_PRIO, 10, 1000, 900, 0, 11, 1001, 200, 1]);
            stream.write_all(&packet).unwrap();
        }
    });

    let (mut stream, _) = listener.accept().unwrap();
    let mut buf = [0u8; control::MAX_PACKET_BYTES];
    let len = stream.read(&mut buf).unwrap();
    let words = control::decode_words(&buf[..len]).unwrap();
    match control::parse_command(&words).unwrap() {
        Command::ProcsPrio(procs) => {
            assert_eq!(procs.len(), 2);
            assert_eq!(procs[0].pid, 10);
            assert_eq!(procs[0].oom_adj, 900);
            assert_eq!(procs[1].pid, 11);
            assert_eq!(procs[1].oom_adj, 200);
        }
        other => panic!("unexpected command {other:?}"),
    }
    client.join().unwrap();
}

#[test]
fn test_roundtrip_rejects_missing_daemon() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nobody-home.sock");
    assert!(control::roundtrip(&path, &[cmd::UPDATE_PROPS]).is_err());
}
