// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end handshake and rendezvous against a bound server, driving the
//! datagram path directly and reading replies from real client sockets.

mod common;

use std::time::Duration;

use common::*;
use rtmfp::amf::Value;
use rtmfp::codec::Cursor;
use rtmfp::flow::SIGNATURE_CONNECTION;

#[test]
fn client_server_handshake_establishes_session() {
    let mut server = start_server(false, None);
    let session = connect_session(&mut server, 0xaabb_ccdd);
    assert_eq!(server.session_count(), 1);
    assert_eq!(
        server.session_peer_id(session.near_id),
        Some(session.peer_id)
    );
}

#[test]
fn sessions_get_distinct_ids() {
    let mut server = start_server(false, None);
    let a = connect_session(&mut server, 0x1000_0001);
    let b = connect_session(&mut server, 0x1000_0002);
    assert_ne!(a.near_id, b.near_id);
    assert_eq!(server.session_count(), 2);
}

#[test]
fn keying_with_unknown_cookie_is_dropped() {
    let mut server = start_server(false, None);
    let socket = client_socket();
    socket
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    let addr = socket.local_addr().unwrap();
    let mut keying = Vec::new();
    keying.extend_from_slice(&0x1234_5678u32.to_be_bytes());
    rtmfp::codec::put_string7(&mut keying, &[0u8; 64]);
    rtmfp::codec::put_string7(&mut keying, &[1u8; 128]);
    rtmfp::codec::put_string7(&mut keying, &[2u8; 64]);
    keying.push(0x58);
    let now = server.now();
    server.process_datagram(&build_handshake(0x38, &keying), addr, now);
    assert!(try_recv_datagram(&socket).is_none(), "no reply expected");
    assert_eq!(server.session_count(), 0);
}

#[test]
fn cookie_expires_after_two_minutes() {
    let mut server = start_server(false, None);
    let socket = client_socket();
    socket
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    let addr = socket.local_addr().unwrap();
    let now = server.now();
    server.process_datagram(
        &build_handshake(0x30, &hello_payload(b"rtmfp://localhost/app", &[0u8; 16])),
        addr,
        now,
    );
    let (ty, payload) = open_handshake(&recv_datagram(&socket), 0);
    assert_eq!(ty, 0x70);
    let mut c = Cursor::new(&payload);
    let _tag = c.read_string8("tag").unwrap();
    let cookie = c.read_string8("cookie").unwrap().to_vec();

    // The sweep runs on the manage tick; 130 s later the cookie is gone.
    server.manage(now + Duration::from_secs(130));

    let mut keying = Vec::new();
    keying.extend_from_slice(&0xaabb_ccddu32.to_be_bytes());
    rtmfp::codec::put_string7(&mut keying, &cookie);
    rtmfp::codec::put_string7(&mut keying, &[1u8; 128]);
    rtmfp::codec::put_string7(&mut keying, &[2u8; 64]);
    keying.push(0x58);
    server.process_datagram(
        &build_handshake(0x38, &keying),
        addr,
        now + Duration::from_secs(131),
    );
    assert!(try_recv_datagram(&socket).is_none(), "cookie must be gone");
}

#[test]
fn connect_command_is_answered_with_success() {
    let mut server = start_server(false, None);
    let session = connect_session(&mut server, 0xaabb_cc01);

    let connect_obj = Value::Object(vec![
        ("app".to_string(), Value::String("app".into())),
        (
            "tcUrl".to_string(),
            Value::String("rtmfp://localhost/app".into()),
        ),
        ("objectEncoding".to_string(), Value::Number(3.0)),
    ]);
    let message = amf_command("connect", 1.0, &[connect_obj]);
    let chunk = user_data_chunk(2, 1, SIGNATURE_CONNECTION, &message);
    let now = server.now();
    server.process_datagram(
        &build_session_packet(&session, &[(0x10, chunk)]),
        session.socket.local_addr().unwrap(),
        now,
    );

    let chunks = open_session_packet(&session, &recv_datagram(&session.socket));
    let ack = chunks.iter().find(|(ty, _)| *ty == 0x51).expect("flow ack");
    // flow id 2, buffered marker, stage 1.
    assert_eq!(ack.1.as_slice(), &[0x02, 0x7f, 0x01]);
    let result = chunks
        .iter()
        .find(|(ty, _)| *ty == 0x10)
        .expect("result message");
    let needle = b"NetConnection.Connect.Success";
    assert!(
        result.1.windows(needle.len()).any(|w| w == needle),
        "success status expected in {:02x?}",
        result.1
    );
}

#[test]
fn set_peer_info_returns_keepalive_advertisement() {
    let mut server = start_server(false, None);
    let session = connect_session(&mut server, 0xaabb_cc02);

    let message = amf_command(
        "setPeerInfo",
        2.0,
        &[
            Value::Null,
            Value::String("192.168.5.5:7777".into()),
            Value::String("10.0.0.8:7778".into()),
        ],
    );
    let chunk = user_data_chunk(2, 1, SIGNATURE_CONNECTION, &message);
    let now = server.now();
    server.process_datagram(
        &build_session_packet(&session, &[(0x10, chunk)]),
        session.socket.local_addr().unwrap(),
        now,
    );

    let chunks = open_session_packet(&session, &recv_datagram(&session.socket));
    let reply = chunks
        .iter()
        .find(|(ty, _)| *ty == 0x10)
        .expect("keepalive advertisement");
    // Inside the raw-control envelope: u16 0x29, then the two intervals.
    let needle = [0x00u8, 0x29, 0x00, 0x00, 0x00, 15, 0x00, 0x00, 0x00, 10];
    assert!(
        reply.1.windows(needle.len()).any(|w| w == needle),
        "0x29 record expected in {:02x?}",
        reply.1
    );
}

#[test]
fn rendezvous_introduces_two_peers() {
    let mut server = start_server(false, None);
    let a = connect_session(&mut server, 0xaabb_cc11);
    let b = connect_session(&mut server, 0xaabb_cc22);

    // B announces a private address first.
    let message = amf_command(
        "setPeerInfo",
        2.0,
        &[Value::Null, Value::String("192.168.5.5:7777".into())],
    );
    let chunk = user_data_chunk(2, 1, SIGNATURE_CONNECTION, &message);
    let now = server.now();
    server.process_datagram(
        &build_session_packet(&b, &[(0x10, chunk)]),
        b.socket.local_addr().unwrap(),
        now,
    );
    let _ = recv_datagram(&b.socket); // ack + 0x29 advertisement

    // A asks for B by peer id.
    let tag = [7u8; 16];
    let now = server.now();
    server.process_datagram(
        &build_handshake(0x30, &peer_hello_payload(&b.peer_id, &tag)),
        a.socket.local_addr().unwrap(),
        now,
    );

    // A gets the redirect with B's public address, then B's private one.
    let (ty, payload) = open_handshake(&recv_datagram(&a.socket), 0);
    assert_eq!(ty, 0x71);
    let mut c = Cursor::new(&payload);
    let echoed = c.read_string8("tag").unwrap();
    assert_eq!(echoed, tag);
    let flag = c.read_u8("flag").unwrap();
    assert_eq!(flag & 0x7f, 0x02, "public address flag");
    let b_public = b.socket.local_addr().unwrap();
    let ip = c.read_bytes(4, "ip").unwrap();
    assert_eq!(ip, [127, 0, 0, 1]);
    assert_eq!(c.read_u16("port").unwrap(), b_public.port());
    let flag = c.read_u8("private flag").unwrap();
    assert_eq!(flag & 0x7f, 0x01, "private address flag");
    assert_eq!(c.read_bytes(4, "ip").unwrap(), [192, 168, 5, 5]);
    assert_eq!(c.read_u16("port").unwrap(), 7777);

    // B gets the forwarded hello carrying A's identity, address and the tag.
    let chunks = open_session_packet(&b, &recv_datagram(&b.socket));
    let forwarded = chunks
        .iter()
        .find(|(ty, _)| *ty == 0x0f)
        .expect("forwarded hello");
    assert_eq!(&forwarded.1[..3], &[0x22, 0x21, 0x0f]);
    assert_eq!(&forwarded.1[3..35], &a.peer_id);
    let mut c = Cursor::new(&forwarded.1[35..]);
    let addr = c.read_address("initiator address").unwrap();
    assert_eq!(addr, a.socket.local_addr().unwrap());
    assert_eq!(c.rest(), tag);
}

#[test]
fn rendezvous_for_unknown_peer_is_silent() {
    let mut server = start_server(false, None);
    let a = connect_session(&mut server, 0xaabb_cc33);
    a.socket
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    let now = server.now();
    server.process_datagram(
        &build_handshake(0x30, &peer_hello_payload(&[9u8; 32], &[1u8; 16])),
        a.socket.local_addr().unwrap(),
        now,
    );
    assert!(try_recv_datagram(&a.socket).is_none());
}

#[test]
fn group_join_returns_best_peers() {
    let mut server = start_server(false, None);
    let a = connect_session(&mut server, 0xaabb_cc41);
    let b = connect_session(&mut server, 0xaabb_cc42);

    let group_signature = b"\x00\x47\x43\x14\x12";
    let group_id = [0xabu8; 16];
    // Raw record 0x01: the group id as a 7-bit length-prefixed string.
    let mut join = vec![0x01];
    join.push(group_id.len() as u8);
    join.extend_from_slice(&group_id);

    // A joins first: nobody to advertise.
    let chunk = user_data_chunk(3, 1, group_signature, &join);
    let now = server.now();
    server.process_datagram(
        &build_session_packet(&a, &[(0x10, chunk.clone())]),
        a.socket.local_addr().unwrap(),
        now,
    );
    let chunks = open_session_packet(&a, &recv_datagram(&a.socket));
    assert!(chunks.iter().any(|(ty, _)| *ty == 0x51), "join is acked");

    // B joins second and learns about A.
    let now = server.now();
    server.process_datagram(
        &build_session_packet(&b, &[(0x10, chunk)]),
        b.socket.local_addr().unwrap(),
        now,
    );
    let chunks = open_session_packet(&b, &recv_datagram(&b.socket));
    let member = chunks
        .iter()
        .filter(|(ty, _)| *ty == 0x10)
        .find(|(_, payload)| {
            payload
                .windows(33)
                .any(|w| w[0] == 0x0b && w[1..] == a.peer_id)
        });
    assert!(member.is_some(), "expected 0x0b member record for A");
}
