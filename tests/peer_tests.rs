use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use offload::app::AppPackage;
use offload::codec;
use offload::config::PeerConfig;
use offload::connection::{self, ChannelState, Registration};
use offload::demo::{self, Calculator};
use offload::invocation::{ErrorKind, InvocationOutcome};
use offload::peer::{PeerServer, PeerStats};
use offload::protocol::{self, PeerDescriptor, ResultContainer};

mod helpers;
use helpers::unique_test_temp_dir;

fn start_peer(label: &str) -> (PeerDescriptor, Arc<PeerStats>, PathBuf) {
    let apps = unique_test_temp_dir(label);
    let server = PeerServer::bind(
        &PeerConfig::new("127.0.0.1:0", &apps),
        Arc::new(demo::registry()),
    )
    .expect("bind reference peer");
    let peer = server.descriptor("127.0.0.1").expect("descriptor");
    let stats = server.stats();
    server.spawn().expect("spawn");
    (peer, stats, apps)
}

fn register_raw(sock: &mut TcpStream, app_id: &str, payload: &[u8]) -> u8 {
    protocol::write_opcode(sock, protocol::REGISTER_APP).unwrap();
    protocol::write_str(sock, app_id).unwrap();
    protocol::write_u64(sock, payload.len() as u64).unwrap();
    sock.flush().unwrap();
    let reply = protocol::read_opcode(sock).unwrap();
    if reply == protocol::APP_REQUEST {
        sock.write_all(payload).unwrap();
        sock.flush().unwrap();
        assert_eq!(protocol::read_opcode(sock).unwrap(), protocol::UPLOAD_ACK);
    }
    reply
}

fn connect_raw(peer: &PeerDescriptor) -> TcpStream {
    let sock = TcpStream::connect(peer.plaintext_endpoint()).expect("connect");
    sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    sock
}

#[test]
fn upload_is_stored_and_later_channels_find_it_present() {
    let (peer, stats, apps) = start_peer("peer-upload");
    let payload = b"application bytes".to_vec();

    let mut first = connect_raw(&peer);
    assert_eq!(register_raw(&mut first, "game", &payload), protocol::APP_REQUEST);
    let stored = std::fs::read(apps.join("game").join("app.bin")).unwrap();
    assert_eq!(stored, payload);

    let mut second = connect_raw(&peer);
    assert_eq!(register_raw(&mut second, "game", &payload), protocol::APP_PRESENT);

    let snap = stats.snapshot();
    assert_eq!(snap.registrations, 2);
    assert_eq!(snap.uploads, 1);
}

#[test]
fn size_mismatch_requests_a_fresh_upload() {
    let (peer, stats, apps) = start_peer("peer-resize");

    let mut sock = connect_raw(&peer);
    register_raw(&mut sock, "game", b"v1");
    let mut sock = connect_raw(&peer);
    assert_eq!(register_raw(&mut sock, "game", b"version-2"), protocol::APP_REQUEST);

    assert_eq!(std::fs::read(apps.join("game").join("app.bin")).unwrap(), b"version-2");
    assert_eq!(stats.snapshot().uploads, 2);
}

#[test]
fn channel_registration_reports_what_happened() {
    let (peer, _, _) = start_peer("peer-channel");
    let app = AppPackage::from_bytes("calc", vec![1_u8; 9_000]);

    let mut channel = connection::connect(&peer, false, None, Duration::from_secs(1)).unwrap();
    assert_eq!(channel.state(), ChannelState::Connecting);
    assert_eq!(
        channel.register(&app, 4096).unwrap(),
        Registration::Uploaded { bytes: 9_000 }
    );
    assert_eq!(channel.state(), ChannelState::Registered);

    let mut again = connection::connect(&peer, false, None, Duration::from_secs(1)).unwrap();
    assert_eq!(again.register(&app, 4096).unwrap(), Registration::AlreadyPresent);
}

#[test]
fn offload_runs_the_method_and_returns_post_call_state() {
    let (peer, stats, _) = start_peer("peer-offload");
    let app = AppPackage::from_bytes("calc", b"calc".to_vec());
    let mut channel = connection::connect(&peer, false, None, Duration::from_secs(1)).unwrap();
    channel.register(&app, 4096).unwrap();
    channel.mark_ready();

    let mut calc = Calculator::new(3);
    let container =
        codec::execute_remote(&mut channel, &Calculator::accumulate(), &[json!(4)], &mut calc)
            .unwrap();
    assert_eq!(container.function_result, InvocationOutcome::success(7));
    assert_eq!(
        container.state_delta,
        Some(json!({"accumulator": 7, "history": [4]}))
    );
    assert_eq!(calc.accumulator, 7);

    // Requests on one channel are served in order.
    let container =
        codec::execute_remote(&mut channel, &Calculator::accumulate(), &[json!(1)], &mut calc)
            .unwrap();
    assert_eq!(container.function_result, InvocationOutcome::success(8));
    assert_eq!(calc.history, vec![4, 1]);
    assert_eq!(stats.snapshot().offload_requests, 2);
}

#[test]
fn failed_remote_call_carries_no_state() {
    let (peer, _, _) = start_peer("peer-failed");
    let app = AppPackage::from_bytes("calc", b"calc".to_vec());
    let mut channel = connection::connect(&peer, false, None, Duration::from_secs(1)).unwrap();
    channel.register(&app, 4096).unwrap();
    channel.mark_ready();

    let mut calc = Calculator::new(3);
    let container =
        codec::execute_remote(&mut channel, &Calculator::divide(), &[json!(1), json!(0)], &mut calc)
            .unwrap();
    assert_eq!(
        container.function_result.error().map(|e| e.kind),
        Some(ErrorKind::Application)
    );
    assert!(container.state_delta.is_none());
    assert_eq!(calc.accumulator, 3);
}

#[test]
fn offload_before_registration_is_answered_with_a_failure() {
    let (peer, _, _) = start_peer("peer-unregistered");
    let mut sock = connect_raw(&peer);

    let calc = Calculator::new(0);
    let descriptor = codec::describe(&Calculator::add(), &[json!(1), json!(2)], &calc).unwrap();
    sock.write_all(&codec::encode_request(&descriptor).unwrap()).unwrap();
    let reply: ResultContainer = protocol::read_frame(&mut sock).unwrap();
    assert_eq!(
        reply.function_result.error().map(|e| e.kind),
        Some(ErrorKind::Internal)
    );
}

#[test]
fn unsupported_replica_count_closes_the_connection() {
    let (peer, _, _) = start_peer("peer-replicas");
    let mut sock = connect_raw(&peer);
    register_raw(&mut sock, "calc", b"calc");

    protocol::write_opcode(&mut sock, protocol::OFFLOAD_REQUEST).unwrap();
    protocol::write_u32(&mut sock, 3).unwrap();
    sock.flush().unwrap();

    let mut buf = [0_u8; 1];
    let n = sock.read(&mut buf).unwrap_or(0);
    assert_eq!(n, 0, "peer should close the connection");
}

#[test]
fn path_like_app_ids_are_refused() {
    let (peer, _, apps) = start_peer("peer-escape");
    let mut sock = connect_raw(&peer);
    protocol::write_opcode(&mut sock, protocol::REGISTER_APP).unwrap();
    protocol::write_str(&mut sock, "../escape").unwrap();
    protocol::write_u64(&mut sock, 4).unwrap();
    sock.flush().unwrap();

    let mut buf = [0_u8; 1];
    let n = sock.read(&mut buf).unwrap_or(0);
    assert_eq!(n, 0, "peer should close the connection");
    assert!(!apps.parent().unwrap().join("escape").exists());
}
