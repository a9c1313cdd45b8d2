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

//! §8 client-side scenario 6: "Sending an END_REQUEST record manually
//! forged with an unknown protocol status byte yields an InvalidRecord
//! event, not an FcgiResponse."
//!
//! The peer here is a hand-written non-conforming server (not this crate's
//! `ServerInterface`, which never emits a protocol status outside the four
//! defined values) so the test can forge exactly the malformed record
//! §4.5.6 describes.

mod common;

use bytes::Bytes;
use fcgi_runtime::codec::encode_header;
use fcgi_runtime::protocol::RecordType;
use fcgi_runtime::{ClientInterface, Event, FcgiRequest};
use std::collections::HashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

#[tokio::test(flavor = "multi_thread")]
async fn forged_protocol_status_is_reported_as_invalid_record() {
    common::setup();

    let listener = TcpListener::bind(("127.0.0.1", 0)).await.expect("bind");
    let addr = listener.local_addr().expect("local_addr");

    let fake_server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        // Drain whatever the client wrote (BEGIN_REQUEST + DATA/STDIN/PARAMS
        // terminators) without trying to parse it.
        let mut buf = [0u8; 4096];
        let _ = stream.read(&mut buf).await;

        // Terminate stdout/stderr normally so the forged END_REQUEST is
        // rejected specifically for its protocol status, not merely for
        // arriving before stdout completed.
        stream.write_all(&encode_header(RecordType::Stdout as u8, 1, 0, 0)).await.expect("write stdout terminator");
        stream.write_all(&encode_header(RecordType::Stderr as u8, 1, 0, 0)).await.expect("write stderr terminator");

        let mut body = Vec::with_capacity(8);
        body.extend_from_slice(&0u32.to_be_bytes());
        body.push(99); // not one of the four defined protocol status values.
        body.extend_from_slice(&[0, 0, 0]);
        let header = encode_header(RecordType::EndRequest as u8, 1, body.len() as u16, 0);
        stream.write_all(&header).await.expect("write header");
        stream.write_all(&body).await.expect("write body");
    });

    let mut client = ClientInterface::new();
    let conn = client.connect(&addr.ip().to_string(), addr.port()).await.expect("connect");
    let request_id = client
        .send_request(conn, FcgiRequest::responder(HashMap::new(), Bytes::new()))
        .await
        .expect("send_request");
    assert!(!request_id.is_null());

    let event = client.retrieve_server_event().await.expect("retrieve_server_event");
    match event {
        Event::InvalidRecord { connection, .. } => assert_eq!(connection, conn),
        other => panic!("expected InvalidRecord, got {other:?}"),
    }

    fake_server.await.expect("fake server task should not panic");
}
