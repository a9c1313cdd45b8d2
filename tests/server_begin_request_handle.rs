// Copyright 2022 jmjoy
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! §8 "A BEGIN_REQUEST followed by a terminal empty PARAMS, STDIN (and DATA
//! for FILTER role) produces exactly one handle whose environment equals
//! the decoded PARAMS" and "After complete(0), the wire produces: empty
//! STDOUT record, empty STDERR record, END_REQUEST(...) in that order."

mod common;

use bytes::Bytes;
use common::RawPeer;
use fcgi_runtime::codec::encode_header;
use fcgi_runtime::protocol::{ProtocolStatus, RecordType, Role};

const FCGI_ID: u16 = 1;

async fn send_begin_request(peer: &mut RawPeer, role: Role, keep_conn: bool) {
    let mut body = Vec::with_capacity(8);
    body.extend_from_slice(&(role as u16).to_be_bytes());
    body.push(if keep_conn { 1 } else { 0 });
    body.extend_from_slice(&[0u8; 5]);
    let header = encode_header(RecordType::BeginRequest as u8, FCGI_ID, body.len() as u16, 0);
    peer.write_raw(&header).await;
    peer.write_raw(&body).await;
}

async fn send_params(peer: &mut RawPeer, pairs: &[(&[u8], &[u8])]) {
    let mut content = Vec::new();
    for (name, value) in pairs {
        fcgi_runtime::codec::encode_nv_pair(name, value, &mut content).unwrap();
    }
    let header = encode_header(RecordType::Params as u8, FCGI_ID, content.len() as u16, 0);
    peer.write_raw(&header).await;
    peer.write_raw(&content).await;
    peer.write_header_only(RecordType::Params as u8, FCGI_ID).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn begin_request_with_terminal_streams_produces_matching_handle() {
    common::setup();

    let (iface, addr) = common::bind_server(10, 10);
    let (join, mut rx) = common::spawn_collector(iface);

    let mut peer = RawPeer::connect(addr).await;
    send_begin_request(&mut peer, Role::Responder, false).await;
    send_params(&mut peer, &[(b"QUERY_STRING", b"a=1")]).await;
    peer.write_header_only(RecordType::Stdin as u8, FCGI_ID).await;
    peer.write_header_only(RecordType::Data as u8, FCGI_ID).await;

    let mut handle = rx.recv().await.expect("server should produce exactly one handle");
    assert_eq!(handle.role(), Role::Responder as u16);
    assert!(!handle.keep_conn());
    assert_eq!(
        handle.environment().get(&Bytes::from_static(b"QUERY_STRING")),
        Some(&Bytes::from_static(b"a=1"))
    );
    assert_eq!(handle.get_stdin().len(), 0);
    assert_eq!(handle.get_data().len(), 0);

    assert!(handle.complete(0).await, "complete should succeed exactly once");
    assert!(!handle.complete(0).await, "complete is idempotent: false thereafter");

    let stdout = peer.next_record().await;
    assert_eq!(stdout.header.record_type, RecordType::Stdout as u8);
    assert_eq!(stdout.content.len(), 0);

    let stderr = peer.next_record().await;
    assert_eq!(stderr.header.record_type, RecordType::Stderr as u8);
    assert_eq!(stderr.content.len(), 0);

    let end = peer.next_record().await;
    assert_eq!(end.header.record_type, RecordType::EndRequest as u8);
    assert_eq!(end.content.len(), 8);
    let app_status = u32::from_be_bytes([end.content[0], end.content[1], end.content[2], end.content[3]]);
    assert_eq!(app_status, 0);
    assert_eq!(end.content[4], ProtocolStatus::RequestComplete as u8);

    common::stop_collector(join).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn filter_role_requires_all_three_streams_before_dispatch() {
    common::setup();

    let (iface, addr) = common::bind_server(10, 10);
    let (join, mut rx) = common::spawn_collector(iface);

    let mut peer = RawPeer::connect(addr).await;
    send_begin_request(&mut peer, Role::Filter, false).await;
    send_params(&mut peer, &[]).await;
    peer.write_header_only(RecordType::Stdin as u8, FCGI_ID).await;

    // DATA hasn't terminated yet: no handle should be produced.
    let still_pending = tokio::time::timeout(std::time::Duration::from_millis(200), rx.recv()).await;
    assert!(still_pending.is_err(), "handle must not be emitted before FCGI_DATA terminates");

    peer.write_header_only(RecordType::Data as u8, FCGI_ID).await;
    let mut handle = rx.recv().await.expect("handle should appear once DATA terminates");
    assert_eq!(handle.role(), Role::Filter as u16);
    assert!(handle.complete(0).await);

    common::stop_collector(join).await;
}
