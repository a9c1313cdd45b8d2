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

//! Shared test scaffolding: a `tracing` subscriber installed once per test
//! binary, a helper that drives a `ServerInterface`'s accept loop on a
//! background task and forwards every completed handle over a channel, and
//! a tiny raw FastCGI record reader/writer for tests that need to inspect
//! the wire directly instead of going through `ClientInterface`.

use std::sync::Once;

use fcgi_runtime::codec::{encode_header, ParsedRecord, RecordParser};
use fcgi_runtime::server::{RequestHandle, ServerInterface};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

static START: Once = Once::new();

/// Installs a `tracing` subscriber once per test binary, matching the
/// teacher's `tests/common.rs::setup()`.
#[allow(dead_code)]
pub fn setup() {
    START.call_once(|| {
        let subscriber = FmtSubscriber::builder().with_max_level(Level::DEBUG).finish();
        tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
    });
}

/// Binds a loopback TCP listener and hands it to a fresh `ServerInterface`,
/// returning the interface's local address alongside it. Callers are
/// responsible for driving `accept_requests` (see [`spawn_collector`]).
#[allow(dead_code)]
pub fn bind_server(
    max_connections: u32, max_requests_per_connection: u32,
) -> (ServerInterface, std::net::SocketAddr) {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).expect("bind loopback listener");
    let addr = listener.local_addr().expect("local_addr");
    let iface = ServerInterface::from_tcp_listener(listener, max_connections, max_requests_per_connection)
        .expect("construct ServerInterface");
    (iface, addr)
}

/// Spawns a background task that drives `iface.accept_requests()` in a loop
/// and forwards every completed [`RequestHandle`] over an unbounded
/// channel. Returns the join handle (abort it to tear the interface down)
/// and the receiving end of the channel.
#[allow(dead_code)]
pub fn spawn_collector(mut iface: ServerInterface) -> (JoinHandle<()>, mpsc::UnboundedReceiver<RequestHandle>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let join = tokio::spawn(async move {
        loop {
            match iface.accept_requests().await {
                Ok(handles) => {
                    for handle in handles {
                        if tx.send(handle).is_err() {
                            return;
                        }
                    }
                }
                Err(_) => return,
            }
        }
    });
    (join, rx)
}

/// Stops a collector task started by [`spawn_collector`] and waits for its
/// `ServerInterface` to actually drop, so the next test in the same binary
/// never races the process-wide "one live interface" slot.
#[allow(dead_code)]
pub async fn stop_collector(join: JoinHandle<()>) {
    join.abort();
    let _ = join.await;
}

/// A minimal raw FastCGI peer used by tests that need to inspect or forge
/// records below `ClientInterface`'s validation layer (§4.5.5 is exactly
/// what several tests want to deliberately violate).
#[allow(dead_code)]
pub struct RawPeer {
    pub stream: TcpStream,
    parser: RecordParser,
    pending: std::collections::VecDeque<ParsedRecord>,
}

#[allow(dead_code)]
impl RawPeer {
    pub async fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect to test server");
        Self {
            stream,
            parser: RecordParser::new(),
            pending: std::collections::VecDeque::new(),
        }
    }

    pub async fn write_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("write_all");
    }

    pub async fn write_header_only(&mut self, record_type: u8, fcgi_id: u16) {
        let header = encode_header(record_type, fcgi_id, 0, 0);
        self.write_raw(&header).await;
    }

    /// Reads from the socket until at least one record is available,
    /// returning the oldest one; subsequent records found in the same read
    /// are buffered for later calls.
    pub async fn next_record(&mut self) -> ParsedRecord {
        loop {
            if let Some(record) = self.pending.pop_front() {
                return record;
            }
            let mut buf = [0u8; 4096];
            let n = self.stream.read(&mut buf).await.expect("read from test server");
            assert!(n > 0, "peer closed before a record arrived");
            self.pending.extend(self.parser.feed(&buf[..n]));
        }
    }
}
