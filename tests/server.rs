//! End-to-end tests over a real socket.
//!
//! Each test runs its own server on paths inside a scratch directory and
//! drives it with a minimal client speaking the wire protocol.

use std::io;
use std::io::Read;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use chatd::BackgroundServer;
use chatd::Config;
use chatd::Server;
use chatd::Stats;
use chatd::ll::abi;
use chatd::ll::abi::Op;
use chatd::ll::codec;
use chatd::ll::codec::RawMessage;
use tempfile::TempDir;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn config_in(dir: &TempDir) -> Config {
    Config::new()
        .socket_path(dir.path().join("sock"))
        .db_path(dir.path().join("chat.db"))
        .blob_dir(dir.path().join("blobs"))
        .stats_path(dir.path().join("stats.txt"))
        .workers(4)
}

fn start(config: Config) -> BackgroundServer {
    Server::new(config).unwrap().spawn().unwrap()
}

fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

struct Client {
    name: String,
    stream: UnixStream,
}

impl Client {
    fn connect(socket: &Path, name: &str) -> Client {
        Client {
            name: name.to_owned(),
            stream: UnixStream::connect(socket).unwrap(),
        }
    }

    fn send(&mut self, op: Op, receiver: &str, payload: &[u8]) {
        codec::write_message(&mut self.stream, op.into(), &self.name, receiver, payload).unwrap();
    }

    fn send_data(&mut self, receiver: &str, payload: &[u8]) {
        codec::write_data(&mut self.stream, receiver, payload).unwrap();
    }

    fn recv_ack(&mut self) -> Op {
        let (op, _) = codec::read_ack(&mut self.stream).unwrap().unwrap();
        Op::try_from(op).unwrap()
    }

    fn recv_message(&mut self) -> RawMessage {
        codec::read_message(&mut self.stream).unwrap().unwrap()
    }

    /// Registers and returns the online-user list from the reply.
    fn register(socket: &Path, name: &str) -> (Client, Vec<String>) {
        let mut client = Client::connect(socket, name);
        client.send(Op::Register, "", &[]);
        let reply = client.recv_message();
        assert_eq!(reply.op, i32::from(Op::Ok), "registration of {name}");
        let names = name_slots(&reply.payload);
        (client, names)
    }

    /// Asserts that nothing arrives on this connection for a little while.
    fn assert_silent(&mut self) {
        self.stream
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        let mut byte = [0u8; 1];
        match self.stream.read(&mut byte) {
            Err(err) => assert!(
                matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut),
                "unexpected error: {err}"
            ),
            Ok(n) => panic!("unexpected {n} bytes on {}", self.name),
        }
        self.stream.set_read_timeout(None).unwrap();
    }
}

/// The user-list payload is a sequence of NUL-padded 33-byte name slots.
fn name_slots(payload: &[u8]) -> Vec<String> {
    assert_eq!(payload.len() % abi::NAME_FIELD, 0);
    payload
        .chunks(abi::NAME_FIELD)
        .map(|slot| {
            let end = slot.iter().position(|&b| b == 0).unwrap_or(slot.len());
            String::from_utf8_lossy(&slot[..end]).into_owned()
        })
        .collect()
}

fn stats(server: &BackgroundServer) -> Stats {
    server.stats().unwrap()
}

#[test]
fn register_connect_and_list() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let server = start(config_in(&dir));
    let socket = dir.path().join("sock");

    let (mut alice, names) = Client::register(&socket, "alice");
    assert_eq!(names, ["alice"]);

    let (_bob, names) = Client::register(&socket, "bob");
    assert_eq!(names, ["alice", "bob"]);

    alice.send(Op::UsrList, "", &[]);
    let reply = alice.recv_message();
    assert_eq!(reply.op, i32::from(Op::Ok));
    assert_eq!(name_slots(&reply.payload), ["alice", "bob"]);

    // A second registration under the same name is refused.
    let mut dup = Client::connect(&socket, "alice");
    dup.send(Op::Register, "", &[]);
    assert_eq!(dup.recv_ack(), Op::NickAlready);

    server.join().unwrap();
}

#[test]
fn peer_text_is_delivered_once() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let server = start(config_in(&dir));
    let socket = dir.path().join("sock");

    let (mut alice, _) = Client::register(&socket, "alice");
    let (mut bob, _) = Client::register(&socket, "bob");
    let before = stats(&server);

    alice.send(Op::PostTxt, "bob", b"hi\0");
    assert_eq!(alice.recv_ack(), Op::Ok);

    let delivery = bob.recv_message();
    assert_eq!(delivery.op, i32::from(Op::TxtMessage));
    assert_eq!(delivery.sender, "alice");
    assert_eq!(delivery.receiver, "bob");
    assert_eq!(delivery.payload, b"hi\0");

    let after = stats(&server);
    assert_eq!(after.delivered_txt, before.delivered_txt + 1);
    assert_eq!(after.errors, before.errors);

    // The sender never receives its own message.
    alice.assert_silent();

    server.join().unwrap();
}

#[test]
fn offline_text_is_stored_and_retrievable() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let server = start(config_in(&dir));
    let socket = dir.path().join("sock");

    let (mut alice, _) = Client::register(&socket, "alice");

    // Nobody called carol exists yet.
    alice.send(Op::PostTxt, "carol", b"hello?\0");
    assert_eq!(alice.recv_ack(), Op::Fail);
    assert_eq!(stats(&server).errors, 1);

    // Register carol, then let her go offline.
    let (mut carol, _) = Client::register(&socket, "carol");
    carol.send(Op::Disconnect, "", &[]);
    drop(carol);
    wait_until("carol to go offline", || stats(&server).online == 1);

    let before = stats(&server);
    alice.send(Op::PostTxt, "carol", b"for later\0");
    assert_eq!(alice.recv_ack(), Op::Ok);
    let after = stats(&server);
    assert_eq!(after.not_delivered_txt, before.not_delivered_txt + 1);
    assert_eq!(after.delivered_txt, before.delivered_txt);

    // Carol comes back and finds the message.
    let mut carol = Client::connect(&socket, "carol");
    carol.send(Op::Connect, "", &[]);
    let reply = carol.recv_message();
    assert_eq!(reply.op, i32::from(Op::Ok));

    carol.send(Op::GetPrevMsgs, "", &[]);
    let head = carol.recv_message();
    assert_eq!(head.op, i32::from(Op::Ok));
    let count = u64::from_le_bytes(head.payload.try_into().unwrap());
    assert_eq!(count, 1);
    let record = carol.recv_message();
    assert_eq!(record.op, i32::from(Op::TxtMessage));
    assert_eq!(record.sender, "alice");
    assert_eq!(record.receiver, "carol");
    assert_eq!(record.payload, b"for later\0");

    server.join().unwrap();
}

#[test]
fn oversized_text_is_refused_and_not_stored() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let server = start(config_in(&dir).max_msg_size(16));
    let socket = dir.path().join("sock");

    let (mut alice, _) = Client::register(&socket, "alice");
    let (mut bob, _) = Client::register(&socket, "bob");
    let before = stats(&server);

    alice.send(Op::PostTxt, "bob", &[b'x'; 17]);
    assert_eq!(alice.recv_ack(), Op::MsgTooLong);
    assert_eq!(stats(&server).errors, before.errors + 1);

    bob.send(Op::GetPrevMsgs, "", &[]);
    let head = bob.recv_message();
    assert_eq!(head.op, i32::from(Op::Ok));
    assert_eq!(u64::from_le_bytes(head.payload.try_into().unwrap()), 0);

    server.join().unwrap();
}

#[test]
fn group_lifecycle() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let server = start(config_in(&dir));
    let socket = dir.path().join("sock");

    let (mut alice, _) = Client::register(&socket, "alice");
    let (mut bob, _) = Client::register(&socket, "bob");

    alice.send(Op::CreateGroup, "g", &[]);
    assert_eq!(alice.recv_ack(), Op::Ok);
    bob.send(Op::AddGroup, "g", &[]);
    assert_eq!(bob.recv_ack(), Op::Ok);

    alice.send(Op::PostTxt, "g", b"hello\0");
    assert_eq!(alice.recv_ack(), Op::Ok);
    let delivery = bob.recv_message();
    assert_eq!(delivery.op, i32::from(Op::TxtMessage));
    assert_eq!(delivery.sender, "alice");
    assert_eq!(delivery.receiver, "g");
    assert_eq!(delivery.payload, b"hello\0");
    // Group posts do not come back to their sender.
    alice.assert_silent();

    // Posting from outside the group is refused.
    let (mut carol, _) = Client::register(&socket, "carol");
    carol.send(Op::PostTxt, "g", b"intruding\0");
    assert_eq!(carol.recv_ack(), Op::NickUnknown);

    // Only the creator may delete the group.
    bob.send(Op::UnregisterGroup, "g", &[]);
    assert_eq!(bob.recv_ack(), Op::Fail);
    alice.send(Op::UnregisterGroup, "g", &[]);
    assert_eq!(alice.recv_ack(), Op::Ok);

    bob.send(Op::PostTxt, "g", b"anyone?\0");
    assert_eq!(bob.recv_ack(), Op::Fail);

    server.join().unwrap();
}

#[test]
fn leaving_a_group() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let server = start(config_in(&dir));
    let socket = dir.path().join("sock");

    let (mut alice, _) = Client::register(&socket, "alice");
    let (mut bob, _) = Client::register(&socket, "bob");

    alice.send(Op::CreateGroup, "club", &[]);
    assert_eq!(alice.recv_ack(), Op::Ok);
    bob.send(Op::AddGroup, "club", &[]);
    assert_eq!(bob.recv_ack(), Op::Ok);
    // Joining twice is reported as such.
    bob.send(Op::AddGroup, "club", &[]);
    assert_eq!(bob.recv_ack(), Op::NickAlready);

    bob.send(Op::DelGroup, "club", &[]);
    assert_eq!(bob.recv_ack(), Op::Ok);
    // Once out, posting is a membership error.
    bob.send(Op::PostTxt, "club", b"still here?\0");
    assert_eq!(bob.recv_ack(), Op::NickUnknown);
    // Leaving a group one is not in, or one that does not exist, fails.
    bob.send(Op::DelGroup, "club", &[]);
    assert_eq!(bob.recv_ack(), Op::NickUnknown);
    bob.send(Op::DelGroup, "nowhere", &[]);
    assert_eq!(bob.recv_ack(), Op::NickUnknown);

    server.join().unwrap();
}

#[test]
fn broadcast_reaches_everyone_else() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let server = start(config_in(&dir));
    let socket = dir.path().join("sock");

    let (mut alice, _) = Client::register(&socket, "alice");
    let (mut bob, _) = Client::register(&socket, "bob");
    let (mut carol, _) = Client::register(&socket, "carol");
    let before = stats(&server);

    alice.send(Op::PostTxtAll, "", b"everyone\0");
    assert_eq!(alice.recv_ack(), Op::Ok);

    for peer in [&mut bob, &mut carol] {
        let delivery = peer.recv_message();
        assert_eq!(delivery.op, i32::from(Op::TxtMessage));
        assert_eq!(delivery.sender, "alice");
        assert_eq!(delivery.payload, b"everyone\0");
    }
    alice.assert_silent();
    assert_eq!(stats(&server).delivered_txt, before.delivered_txt + 2);

    server.join().unwrap();
}

#[test]
fn file_roundtrip() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let server = start(config_in(&dir));
    let socket = dir.path().join("sock");

    let (mut alice, _) = Client::register(&socket, "alice");
    let (mut bob, _) = Client::register(&socket, "bob");
    let content: Vec<u8> = (0..1024u32).map(|i| (i.wrapping_mul(31) % 251) as u8).collect();

    alice.send(Op::PostFile, "bob", b"/tmp/somewhere/photo.bin\0");
    alice.send_data("bob", &content);
    assert_eq!(alice.recv_ack(), Op::Ok);

    let notice = bob.recv_message();
    assert_eq!(notice.op, i32::from(Op::FileMessage));
    assert_eq!(notice.sender, "alice");
    assert_eq!(notice.payload, b"photo.bin\0");

    bob.send(Op::GetFile, "", b"photo.bin\0");
    let reply = bob.recv_message();
    assert_eq!(reply.op, i32::from(Op::Ok));
    assert_eq!(reply.payload, content);

    // Unknown names are a distinct failure.
    bob.send(Op::GetFile, "", b"nothing.bin\0");
    assert_eq!(bob.recv_ack(), Op::NoSuchFile);

    let after = stats(&server);
    assert_eq!(after.delivered_file, 1);

    server.join().unwrap();
}

#[test]
fn oversized_file_is_refused() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let server = start(config_in(&dir).max_file_size(1));
    let socket = dir.path().join("sock");

    let (mut alice, _) = Client::register(&socket, "alice");
    let (_bob, _) = Client::register(&socket, "bob");

    alice.send(Op::PostFile, "bob", b"big.bin\0");
    alice.send_data("bob", &vec![0u8; 2000]);
    assert_eq!(alice.recv_ack(), Op::MsgTooLong);

    server.join().unwrap();
}

#[test]
fn unknown_ops_fail_cleanly() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let server = start(config_in(&dir));
    let socket = dir.path().join("sock");

    let (mut alice, _) = Client::register(&socket, "alice");
    let before = stats(&server);

    // An op in the reply space is not a request.
    alice.send(Op::Ok, "", &[]);
    assert_eq!(alice.recv_ack(), Op::Fail);
    assert_eq!(stats(&server).errors, before.errors + 1);

    server.join().unwrap();
}

#[test]
fn frames_never_interleave_under_load() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let server = start(config_in(&dir));
    let socket = dir.path().join("sock");

    const SENDERS: usize = 4;
    const PER_SENDER: usize = 25;

    let (mut bob, _) = Client::register(&socket, "bob");
    let senders: Vec<_> = (0..SENDERS)
        .map(|i| {
            let name = format!("sender{i}");
            let (client, _) = Client::register(&socket, &name);
            (name, client)
        })
        .collect();

    let handles: Vec<_> = senders
        .into_iter()
        .map(|(name, mut client)| {
            thread::spawn(move || {
                for i in 0..PER_SENDER {
                    let payload = format!("{name}-{i}\0");
                    client.send(Op::PostTxt, "bob", payload.as_bytes());
                    assert_eq!(client.recv_ack(), Op::Ok, "post {i} from {name}");
                }
            })
        })
        .collect();

    // Every frame must parse whole and carry an intact payload.
    let mut seen = Vec::new();
    for _ in 0..SENDERS * PER_SENDER {
        let delivery = bob.recv_message();
        assert_eq!(delivery.op, i32::from(Op::TxtMessage));
        let text = String::from_utf8(delivery.payload).unwrap();
        let text = text.trim_end_matches('\0');
        assert!(
            text.starts_with(&delivery.sender),
            "payload {text:?} does not match sender {:?}",
            delivery.sender
        );
        seen.push(text.to_owned());
    }
    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), SENDERS * PER_SENDER);

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(stats(&server).delivered_txt, (SENDERS * PER_SENDER) as u64);

    server.join().unwrap();
}

#[test]
fn state_survives_a_restart() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let socket = dir.path().join("sock");

    {
        let server = start(config_in(&dir));
        let (mut alice, _) = Client::register(&socket, "alice");
        let (mut bob, _) = Client::register(&socket, "bob");
        alice.send(Op::PostTxt, "bob", b"persist\0");
        assert_eq!(alice.recv_ack(), Op::Ok);
        let delivery = bob.recv_message();
        assert_eq!(delivery.op, i32::from(Op::TxtMessage));
        server.join().unwrap();
    }

    let server = start(config_in(&dir));
    assert_eq!(stats(&server).users, 2);
    assert_eq!(stats(&server).online, 0);

    // Registered users reconnect rather than re-register.
    let mut bob = Client::connect(&socket, "bob");
    bob.send(Op::Register, "", &[]);
    assert_eq!(bob.recv_ack(), Op::NickAlready);
    bob.send(Op::Connect, "", &[]);
    let reply = bob.recv_message();
    assert_eq!(reply.op, i32::from(Op::Ok));

    bob.send(Op::GetPrevMsgs, "", &[]);
    let head = bob.recv_message();
    let count = u64::from_le_bytes(head.payload.try_into().unwrap());
    assert_eq!(count, 1);
    let record = bob.recv_message();
    assert_eq!(record.payload, b"persist\0");

    server.join().unwrap();
}

#[test]
fn stats_file_gets_appended() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let server = start(config_in(&dir));
    let socket = dir.path().join("sock");

    let (_alice, _) = Client::register(&socket, "alice");
    server.stats_reporter().append().unwrap();
    server.stats_reporter().append().unwrap();

    let contents = std::fs::read_to_string(dir.path().join("stats.txt")).unwrap();
    assert_eq!(contents.lines().count(), 2);

    server.join().unwrap();
}

#[test]
fn self_send_is_refused() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let server = start(config_in(&dir));
    let socket = dir.path().join("sock");

    let (mut alice, _) = Client::register(&socket, "alice");
    alice.send(Op::PostTxt, "alice", b"echo\0");
    assert_eq!(alice.recv_ack(), Op::Fail);

    server.join().unwrap();
}
