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

//! §8 client-side scenario 3: "A request with role=RESPONDER, empty stdin,
//! empty data, params={"QUERY":"1"} against an echo server produces an
//! FcgiResponse whose stdout equals the echoed payload and app_status=0,
//! protocol_status=REQUEST_COMPLETE."
//!
//! The "echo server" is this crate's own `ServerInterface`, since nothing
//! in this workspace spawns an external FastCGI application for tests
//! (§A.4 — there is no PHP-FPM or other external application binary
//! available here to exercise these tests against).

mod common;

use bytes::Bytes;
use fcgi_runtime::protocol::ProtocolStatus;
use fcgi_runtime::server::handle::Stream;
use fcgi_runtime::{ClientInterface, Event, FcgiRequest};
use std::collections::HashMap;

#[tokio::test(flavor = "multi_thread")]
async fn echo_request_round_trips_through_client_and_server() {
    common::setup();

    let (iface, addr) = common::bind_server(10, 10);
    let (join, mut rx) = common::spawn_collector(iface);

    let echo_task = tokio::spawn(async move {
        let mut handle = rx.recv().await.expect("server should produce a handle");
        let value = handle
            .environment()
            .get(&Bytes::from_static(b"QUERY"))
            .cloned()
            .unwrap_or_default();
        assert!(handle.write(&value, Stream::Stdout).await);
        assert!(handle.complete(0).await);
    });

    let mut client = ClientInterface::new();
    let conn = client.connect(&addr.ip().to_string(), addr.port()).await.expect("connect");

    let mut params = HashMap::new();
    params.insert(Bytes::from_static(b"QUERY"), Bytes::from_static(b"1"));
    let req = FcgiRequest::responder(params, Bytes::new());
    let request_id = client.send_request(conn, req).await.expect("send_request");
    assert!(!request_id.is_null());

    let event = client.retrieve_server_event().await.expect("retrieve_server_event");
    match event {
        Event::FcgiResponse(response) => {
            assert_eq!(response.request, request_id);
            assert_eq!(response.stdout, Bytes::from_static(b"1"));
            assert_eq!(response.stderr, Bytes::new());
            assert_eq!(response.app_status, 0);
            assert_eq!(response.protocol_status, ProtocolStatus::RequestComplete);
        }
        other => panic!("expected FcgiResponse, got {other:?}"),
    }

    echo_task.await.expect("echo task should not panic");
    common::stop_collector(join).await;
}
