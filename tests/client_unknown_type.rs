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

//! §8 client-side scenario 5: "send_binary_management(conn, type=99,
//! bytes=[0x01]) to a conforming server yields an UnknownType event with
//! unknown_type=99."

mod common;

use fcgi_runtime::{ClientInterface, Event};

#[tokio::test(flavor = "multi_thread")]
async fn unrecognized_management_type_yields_unknown_type_event() {
    common::setup();

    let (iface, addr) = common::bind_server(10, 10);
    let (join, _rx) = common::spawn_collector(iface);

    let mut client = ClientInterface::new();
    let conn = client.connect(&addr.ip().to_string(), addr.port()).await.expect("connect");

    let sent = client.send_binary_management(conn, 99, &[0x01]).await.expect("send_binary_management");
    assert!(sent);

    let event = client.retrieve_server_event().await.expect("retrieve_server_event");
    match event {
        Event::UnknownType { unknown_type, .. } => assert_eq!(unknown_type, 99),
        other => panic!("expected UnknownType, got {other:?}"),
    }

    common::stop_collector(join).await;
}
