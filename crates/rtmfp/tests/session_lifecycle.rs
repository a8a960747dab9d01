// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Keepalive probing, timeout and teardown, driven through fabricated
//! manage-tick times.

mod common;

use std::time::Duration;

use common::*;

fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

#[test]
fn idle_session_gets_keepalive_probe() {
    let mut server = start_server(false, None);
    let session = connect_session(&mut server, 0xaabb_cd01);
    let base = server.now();

    server.manage(base + secs(125));
    let chunks = open_session_packet(&session, &recv_datagram(&session.socket));
    assert!(
        chunks.iter().any(|(ty, payload)| *ty == 0x01 && payload.is_empty()),
        "keepalive probe expected, got {chunks:?}"
    );
    assert!(server.has_session(session.near_id));
}

#[test]
fn keepalive_reply_keeps_the_session_alive() {
    let mut server = start_server(false, None);
    let session = connect_session(&mut server, 0xaabb_cd02);
    let base = server.now();

    server.manage(base + secs(125));
    let _ = recv_datagram(&session.socket); // the probe

    // Reply 0x41; this also refreshes the receive timestamp.
    server.process_datagram(
        &build_session_packet(&session, &[(0x41, Vec::new())]),
        session.socket.local_addr().unwrap(),
        base + secs(126),
    );
    for step in 0..20u64 {
        server.manage(base + secs(128 + 2 * step));
    }
    assert!(server.has_session(session.near_id), "session must survive");
}

#[test]
fn unanswered_keepalives_close_and_remove_the_session() {
    let mut server = start_server(false, None);
    let session = connect_session(&mut server, 0xaabb_cd03);
    session
        .socket
        .set_read_timeout(Some(Duration::from_millis(100)))
        .unwrap();
    let base = server.now();

    // Ten probes 2 s apart, then the close signals, then the reap.
    let mut saw_probe = false;
    let mut saw_close = false;
    for step in 0..40u64 {
        server.manage(base + secs(125 + 2 * step));
        while let Some(datagram) = try_recv_datagram(&session.socket) {
            for (ty, _) in open_session_packet(&session, &datagram) {
                match ty {
                    0x01 => saw_probe = true,
                    0x0c => saw_close = true,
                    _ => {}
                }
            }
        }
        if !server.has_session(session.near_id) {
            break;
        }
    }
    assert!(saw_probe, "expected keepalive probes");
    assert!(saw_close, "expected 0x0c close chunks");
    assert!(
        !server.has_session(session.near_id),
        "session must be reaped"
    );
}

#[test]
fn peer_close_request_fails_the_session() {
    let mut server = start_server(false, None);
    let session = connect_session(&mut server, 0xaabb_cd04);
    let base = server.now();

    server.process_datagram(
        &build_session_packet(&session, &[(0x0c, Vec::new())]),
        session.socket.local_addr().unwrap(),
        base + secs(1),
    );
    // The failed session emits close chunks from the manage tick and is
    // reaped after ten of them.
    for step in 0..15u64 {
        server.manage(base + secs(3 + 2 * step));
    }
    assert!(!server.has_session(session.near_id));
}

#[test]
fn peer_death_ack_kills_immediately() {
    let mut server = start_server(false, None);
    let session = connect_session(&mut server, 0xaabb_cd05);
    let now = server.now();
    server.process_datagram(
        &build_session_packet(&session, &[(0x4c, Vec::new())]),
        session.socket.local_addr().unwrap(),
        now,
    );
    assert!(!server.has_session(session.near_id));
}

#[test]
fn buffer_probe_gets_zero_ack_and_session_survives() {
    let mut server = start_server(false, None);
    let session = connect_session(&mut server, 0xaabb_cd06);
    let now = server.now();
    server.process_datagram(
        &build_session_packet(&session, &[(0x18, vec![0x02])]),
        session.socket.local_addr().unwrap(),
        now,
    );
    let chunks = open_session_packet(&session, &recv_datagram(&session.socket));
    let ack = chunks.iter().find(|(ty, _)| *ty == 0x51).expect("zero ack");
    assert_eq!(ack.1.as_slice(), &[0x02, 0x00, 0x00]);
    assert!(server.has_session(session.near_id), "probe must not be fatal");
}
