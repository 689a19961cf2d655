use std::time::Instant;

use mtp_crypto::AuthKey;
use mtp_crypto::rsa;
use mtp_proto::authentication::Error;
use mtp_proto::handshake::{Handshake, HandshakeError, Progress, State};
use mtp_proto::server::TestServer;
use mtp_proto::{Engine, EngineConfig, Event, Request, RequestId};

fn run(server: &mut TestServer, hs: &mut Handshake) -> Result<mtp_proto::authentication::Finished, HandshakeError> {
    let mut frame = hs.start();
    loop {
        let reply = server.handle_plaintext(&frame).expect("server accepts client frame");
        match hs.handle(&reply)? {
            Progress::Send(next) => frame = next,
            Progress::Done(done) => return Ok(done),
        }
    }
}

#[test]
fn both_sides_agree_on_the_key() {
    let mut server = TestServer::new();
    let mut hs = Handshake::new(vec![server.public_key()]);
    assert_eq!(hs.state(), State::Idle);

    let done = run(&mut server, &mut hs).unwrap();
    assert_eq!(hs.state(), State::Complete);

    let ours = AuthKey::from_bytes(done.auth_key);
    let theirs = server.auth_key().expect("server stored the key");
    assert_eq!(ours.key_id(), theirs.key_id());
    assert_eq!(done.first_salt, server.salt);
    assert!(done.time_offset.abs() <= 1);
}

#[test]
fn dh_gen_retry_is_answered() {
    let mut server = TestServer::new();
    server.retry_once = true;
    let mut hs = Handshake::new(vec![server.public_key()]);

    let done = run(&mut server, &mut hs).unwrap();
    assert_eq!(AuthKey::from_bytes(done.auth_key).key_id(), server.auth_key().unwrap().key_id());
}

#[test]
fn server_clock_skew_becomes_time_offset() {
    let mut server = TestServer::new();
    server.clock_skew = 3600;
    let mut hs = Handshake::new(vec![server.public_key()]);

    let done = run(&mut server, &mut hs).unwrap();
    assert!((3599..=3601).contains(&done.time_offset), "offset {}", done.time_offset);
}

#[test]
fn unknown_server_key_fails_the_attempt() {
    let mut server = TestServer::new();
    let mut hs = Handshake::new(rsa::builtin_keys(false));

    let err = run(&mut server, &mut hs).unwrap_err();
    assert!(matches!(err, HandshakeError::Auth(Error::UnknownFingerprints { .. })), "{err}");
    assert_eq!(hs.state(), State::Failed);
    assert_eq!(hs.handle(&[0; 24]).unwrap_err(), HandshakeError::NotWaiting);
    assert_eq!(hs.state(), State::Failed);
}

#[test]
fn idle_handshake_rejects_frames_without_changing_state() {
    let mut hs = Handshake::new(Vec::new());
    assert_eq!(hs.handle(&[0; 40]).unwrap_err(), HandshakeError::NotWaiting);
    assert_eq!(hs.state(), State::Idle);
}

#[test]
fn garbage_answer_fails_the_attempt() {
    let mut hs = Handshake::new(Vec::new());
    hs.start();
    assert!(matches!(hs.handle(&[1; 8]), Err(HandshakeError::Frame(_))));
    assert_eq!(hs.state(), State::Failed);
}

#[test]
fn new_key_carries_encrypted_traffic() {
    let mut server = TestServer::new();
    let mut hs = Handshake::new(vec![server.public_key()]);
    let done = run(&mut server, &mut hs).unwrap();

    let mut engine = Engine::new(EngineConfig::default());
    engine.set_time_offset(done.time_offset);
    engine.install_key(AuthKey::from_bytes(done.auth_key), done.first_salt);

    let now = Instant::now();
    engine.submit(RequestId(1), Request::new(vec![0xde, 0xad, 0xbe, 0xef]));
    let packet = engine.flush(now).unwrap();
    let msgs = server.decrypt(&packet).unwrap();
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].salt, done.first_salt);

    let answer = server.rpc_result(msgs[0].msg_id, &[1, 0, 0, 0]).unwrap();
    engine.handle_packet(&answer, now).unwrap();
    assert_eq!(engine.poll_event(), Some(Event::Response { id: RequestId(1), body: vec![1, 0, 0, 0] }));
    assert!(engine.key_checked());
}
