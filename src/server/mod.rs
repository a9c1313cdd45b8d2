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

//! The application-side server interface (§4.3): accepts connections on a
//! pre-bound listening socket, demultiplexes FastCGI records across
//! connections and requests, and hands completed requests to the
//! application as [`handle::RequestHandle`]s.

pub mod connection;
pub mod handle;
pub mod request_data;

pub use handle::{RequestHandle, Stream};

use crate::codec::{encode_header, extract_nv_pairs, CodecError};
use crate::error::{ServerConfigError, ServerConfigResult};
use crate::protocol::{
    BeginRequestBody, ProtocolStatus, RecordType, Role, FCGI_MAX_CONNS, FCGI_MAX_REQS,
    FCGI_MPXS_CONNS, NULL_REQUEST_ID,
};
use crate::request_id::RequestId;
use bytes::Bytes;
use connection::{Connection, ConnWriter};
use request_data::{RequestData, RequestStatus};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tracing::{debug, error, warn};

/// Process-wide "one live interface at a time" registry (§4.3.1, §9 "the
/// interface identifier"). A real socket-level descriptor is this
/// process's single point of truth for "is *this* `ServerInterface` still
/// the one a `RequestHandle` was built from" — handles compare their
/// captured id against this slot rather than holding a pointer that could
/// dangle, which Rust's ownership model makes unnecessary, but the
/// same-generation check the original design relies on is still useful
/// application-visible behavior, so it is kept.
static LIVE_INTERFACE: OnceLock<std::sync::Mutex<Option<u64>>> = OnceLock::new();
static NEXT_INTERFACE_ID: AtomicU64 = AtomicU64::new(1);

fn live_interface_slot() -> &'static std::sync::Mutex<Option<u64>> {
    LIVE_INTERFACE.get_or_init(|| std::sync::Mutex::new(None))
}

/// Whether `id` is the currently live interface's identifier.
pub(crate) fn is_interface_live(id: u64) -> bool {
    *live_interface_slot().lock().unwrap() == Some(id)
}

fn claim_interface_slot() -> Result<u64, ServerConfigError> {
    let mut slot = live_interface_slot().lock().unwrap();
    if slot.is_some() {
        return Err(ServerConfigError::InterfaceAlreadyLive);
    }
    let id = NEXT_INTERFACE_ID.fetch_add(1, Ordering::SeqCst);
    *slot = Some(id);
    Ok(id)
}

fn release_interface_slot(id: u64) {
    let mut slot = live_interface_slot().lock().unwrap();
    if *slot == Some(id) {
        *slot = None;
    }
}

/// Shared mutable state guarded by a single mutex (§5): the request map,
/// the write-mutex locator per connection, and the housekeeping sets the
/// accept loop consults every iteration.
pub(crate) struct SharedState {
    pub requests: HashMap<RequestId, RequestData>,
    pub writers: HashMap<i32, Arc<AsyncMutex<ConnWriter>>>,
    pub request_counts: HashMap<i32, u32>,
    pub peer_closed_pending: HashSet<i32>,
    pub app_closure_requested: HashSet<i32>,
    pub overload: bool,
    pub bad_interface: bool,
}

impl SharedState {
    fn new() -> Self {
        Self {
            requests: HashMap::new(),
            writers: HashMap::new(),
            request_counts: HashMap::new(),
            peer_closed_pending: HashSet::new(),
            app_closure_requested: HashSet::new(),
            overload: false,
            bad_interface: false,
        }
    }
}

/// A listening socket this interface was constructed on, already checked
/// to be a bound, listening `SOCK_STREAM` socket (§4.3.1 construction
/// rule i).
enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

/// The application-side FastCGI server interface.
///
/// Construct one from an already-bound, already-listening socket with
/// [`ServerInterface::from_tcp_listener`] or
/// [`ServerInterface::from_unix_listener`], then drive it with
/// [`ServerInterface::accept_requests`]. At most one `ServerInterface` may
/// be live in a process at a time (§4.3.1).
pub struct ServerInterface {
    interface_id: u64,
    listener: Listener,
    shared: Arc<AsyncMutex<SharedState>>,
    notify: Arc<Notify>,
    max_connections: u32,
    max_requests_per_connection: u32,
    app_status_on_abort: u32,
    sg_limit: usize,
    allowed_peers: Option<Vec<std::net::IpAddr>>,
}

/// Address family of the listening socket, used to filter
/// `FCGI_WEB_SERVER_ADDRS` entries (§4.3.1 construction rule ii only
/// applies to `AF_INET`/`AF_INET6`; `AF_UNIX` listeners never filter).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AddrFamily {
    V4,
    V6,
}

/// `app_status` value reported on a synthesized `FCGI_END_REQUEST` when a
/// request never makes it to the application (§4.3.1 "app_status_on_abort
/// (default "failure")"). Matches the conventional C `EXIT_FAILURE`.
pub const APP_STATUS_FAILURE: u32 = 1;

impl ServerInterface {
    fn new(
        listener: Listener, family: Option<AddrFamily>, max_connections: u32,
        max_requests_per_connection: u32, app_status_on_abort: u32,
    ) -> ServerConfigResult<Self> {
        if max_connections == 0 {
            return Err(ServerConfigError::InvalidLimit {
                field: "max_connections",
                value: max_connections,
            });
        }
        if max_requests_per_connection == 0 {
            return Err(ServerConfigError::InvalidLimit {
                field: "max_requests_per_connection",
                value: max_requests_per_connection,
            });
        }

        let interface_id = claim_interface_slot()?;
        let allowed_peers = match family {
            Some(family) => parse_web_server_addrs(family)?,
            None => None,
        };

        Ok(Self {
            interface_id,
            listener,
            shared: Arc::new(AsyncMutex::new(SharedState::new())),
            notify: Arc::new(Notify::new()),
            max_connections,
            max_requests_per_connection,
            app_status_on_abort,
            sg_limit: crate::codec::scatter_gather_limit(),
            allowed_peers,
        })
    }

    /// Builds an interface from a TCP socket the caller has already bound
    /// and called `listen` on, using [`APP_STATUS_FAILURE`] as
    /// `app_status_on_abort`. Use
    /// [`ServerInterface::from_tcp_listener_with_abort_status`] to pick a
    /// different value.
    pub fn from_tcp_listener(
        listener: std::net::TcpListener, max_connections: u32, max_requests_per_connection: u32,
    ) -> ServerConfigResult<Self> {
        Self::from_tcp_listener_with_abort_status(
            listener,
            max_connections,
            max_requests_per_connection,
            APP_STATUS_FAILURE,
        )
    }

    /// Like [`ServerInterface::from_tcp_listener`], with an explicit
    /// `app_status_on_abort` (§4.3.1).
    pub fn from_tcp_listener_with_abort_status(
        listener: std::net::TcpListener, max_connections: u32, max_requests_per_connection: u32,
        app_status_on_abort: u32,
    ) -> ServerConfigResult<Self> {
        verify_listening_stream_socket(listener.as_raw_fd())?;
        let family = if listener.local_addr()?.is_ipv6() {
            AddrFamily::V6
        } else {
            AddrFamily::V4
        };
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        Self::new(
            Listener::Tcp(listener),
            Some(family),
            max_connections,
            max_requests_per_connection,
            app_status_on_abort,
        )
    }

    /// Builds an interface from a UNIX domain socket the caller has
    /// already bound and called `listen` on, using [`APP_STATUS_FAILURE`]
    /// as `app_status_on_abort`.
    pub fn from_unix_listener(
        listener: std::os::unix::net::UnixListener, max_connections: u32,
        max_requests_per_connection: u32,
    ) -> ServerConfigResult<Self> {
        Self::from_unix_listener_with_abort_status(
            listener,
            max_connections,
            max_requests_per_connection,
            APP_STATUS_FAILURE,
        )
    }

    /// Like [`ServerInterface::from_unix_listener`], with an explicit
    /// `app_status_on_abort` (§4.3.1).
    pub fn from_unix_listener_with_abort_status(
        listener: std::os::unix::net::UnixListener, max_connections: u32,
        max_requests_per_connection: u32, app_status_on_abort: u32,
    ) -> ServerConfigResult<Self> {
        verify_listening_stream_socket(listener.as_raw_fd())?;
        listener.set_nonblocking(true)?;
        let listener = UnixListener::from_std(listener)?;
        Self::new(
            Listener::Unix(listener),
            None,
            max_connections,
            max_requests_per_connection,
            app_status_on_abort,
        )
    }

    /// Number of connections currently tracked by this interface.
    pub async fn connection_count(&self) -> usize {
        self.shared.lock().await.writers.len()
    }

    /// Whether the interface currently considers itself overloaded
    /// (§4.3.3 "FCGI_OVERLOADED").
    pub async fn get_overload(&self) -> bool {
        self.shared.lock().await.overload
    }

    pub async fn set_overload(&self, overload: bool) {
        self.shared.lock().await.overload = overload;
    }

    /// `false` once a connection-handling error has put this interface
    /// into a permanently bad state (§4.3.5): no further requests will be
    /// produced, and outstanding handles observe themselves as aborted.
    pub async fn interface_status(&self) -> bool {
        !self.shared.lock().await.bad_interface
    }

    fn peer_allowed(&self, addr: &SocketAddr) -> bool {
        match &self.allowed_peers {
            None => true,
            Some(allowed) => allowed.iter().any(|ip| *ip == addr.ip()),
        }
    }

    /// Runs the accept/demultiplex loop until the interface is dropped or
    /// put into a bad state, yielding completed requests as
    /// [`RequestHandle`]s (§4.3.2, §4.3.4).
    ///
    /// This is the single entry point applications drive in a loop; it
    /// internally spawns one reader task per connection and communicates
    /// with them only through [`SharedState`], matching the "one
    /// interface thread plus N connection readers" shape of the original
    /// design (§5).
    pub async fn accept_requests(&mut self) -> ServerConfigResult<Vec<RequestHandle>> {
        loop {
            let connection_count = self.shared.lock().await.writers.len();
            if connection_count < self.max_connections as usize {
                tokio::select! {
                    accepted = self.accept_one() => {
                        match accepted {
                            Ok(Some(())) => {}
                            Ok(None) => continue,
                            Err(e) => {
                                error!(error = %e, "accept failed, interface entering bad state");
                                self.shared.lock().await.bad_interface = true;
                                return Err(e.into());
                            }
                        }
                    }
                    _ = self.notify.notified() => {}
                }
            } else {
                self.notify.notified().await;
            }

            let handles = self.collect_completed_requests().await;
            self.close_requested_connections().await;
            if !handles.is_empty() {
                return Ok(handles);
            }
        }
    }

    async fn accept_one(&mut self) -> std::io::Result<Option<()>> {
        match &self.listener {
            Listener::Tcp(listener) => match listener.accept().await {
                Ok((stream, addr)) => {
                    if !self.peer_allowed(&addr) {
                        debug!(%addr, "rejecting connection from unlisted web server address");
                        return Ok(None);
                    }
                    self.spawn_connection_reader_tcp(stream).await;
                    Ok(Some(()))
                }
                Err(e) => Err(e),
            },
            Listener::Unix(listener) => match listener.accept().await {
                Ok((stream, _addr)) => {
                    self.spawn_connection_reader_unix(stream).await;
                    Ok(Some(()))
                }
                Err(e) => Err(e),
            },
        }
    }

    async fn spawn_connection_reader_tcp(&mut self, stream: TcpStream) {
        let fd = stream.as_raw_fd();
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        self.spawn_connection_reader(fd, Box::new(read_half), Box::new(write_half)).await;
    }

    async fn spawn_connection_reader_unix(&mut self, stream: UnixStream) {
        let fd = stream.as_raw_fd();
        let (read_half, write_half) = stream.into_split();
        self.spawn_connection_reader(fd, Box::new(read_half), Box::new(write_half)).await;
    }

    async fn spawn_connection_reader(
        &mut self, fd: RawFd, mut read_half: Box<dyn tokio::io::AsyncRead + Unpin + Send>,
        write_half: Box<dyn tokio::io::AsyncWrite + Unpin + Send>,
    ) {
        let connection = Connection::new(write_half);
        let writer = connection.writer.clone();
        {
            let mut shared = self.shared.lock().await;
            shared.writers.insert(fd, writer);
            shared.request_counts.insert(fd, 0);
        }

        let shared = self.shared.clone();
        let notify = self.notify.clone();
        let sg_limit = self.sg_limit;
        let max_requests = self.max_requests_per_connection;
        let max_connections = self.max_connections;
        let app_status_on_abort = self.app_status_on_abort;

        tokio::spawn(async move {
            let mut parser = connection::RecordParser::new();
            let mut buf = [0u8; 8192];
            loop {
                let n = match read_half.read(&mut buf).await {
                    Ok(0) | Err(_) => 0,
                    Ok(n) => n,
                };
                if n == 0 {
                    let mut sh = shared.lock().await;
                    sh.peer_closed_pending.insert(fd);
                    mark_connection_closed_by_interface(&mut sh, fd);
                    drop(sh);
                    notify.notify_one();
                    return;
                }
                let records = parser.feed(&buf[..n]);
                for record in records {
                    handle_incoming_record(
                        fd,
                        record,
                        &shared,
                        &notify,
                        sg_limit,
                        max_requests,
                        max_connections,
                        app_status_on_abort,
                    )
                    .await;
                }
                // Wake the accept loop so it re-runs collect_completed_requests
                // promptly: a request may have just become complete, and
                // nothing else would otherwise cause accept_requests' select
                // to return (§5 "self-pipe").
                notify.notify_one();
            }
        });
        debug!(fd, "connection accepted");
    }

    /// Moves every request whose streams are all terminated (and whose
    /// params decoded cleanly) out of [`SharedState::requests`] and into
    /// a fresh [`RequestHandle`] (§4.3.4).
    async fn collect_completed_requests(&mut self) -> Vec<RequestHandle> {
        let mut shared = self.shared.lock().await;
        let ready: Vec<RequestId> = shared
            .requests
            .iter()
            .filter(|(_, rd)| rd.status == RequestStatus::Pending && rd.all_streams_done())
            .map(|(id, _)| *id)
            .collect();

        let mut handles = Vec::with_capacity(ready.len());
        for id in ready {
            let Some(writer) = shared.writers.get(&id.connection).cloned() else {
                shared.requests.remove(&id);
                continue;
            };
            let rd = shared.requests.get_mut(&id).expect("id came from requests map");
            rd.status = RequestStatus::Assigned;
            let environment = rd.params_parsed.clone();
            let stdin = rd.stdin.clone().freeze();
            let data = rd.data.clone().freeze();
            let role = rd.role;
            let keep_conn = rd.keep_conn;

            handles.push(RequestHandle::new(
                self.interface_id,
                self.shared.clone(),
                writer,
                self.notify.clone(),
                self.sg_limit,
                id,
                environment,
                stdin,
                data,
                role,
                keep_conn,
            ));
        }
        handles
    }

    /// Closes every connection named in `peer_closed_pending` or
    /// `app_closure_requested` that has no *assigned* requests left
    /// outstanding, draining both sets (§4.3.2 housekeeping, §4.3.5).
    ///
    /// A `Pending` request left on the connection never blocks closure: it
    /// has not been handed to the application, so nothing will ever observe
    /// it again. Such entries are purged here first, mirroring
    /// `UnassignedRequestCleanup` in the original design, which this is
    /// grounded on.
    async fn close_requested_connections(&mut self) {
        let mut shared = self.shared.lock().await;
        let mut to_close: HashSet<i32> = HashSet::new();
        to_close.extend(shared.peer_closed_pending.iter().copied());
        to_close.extend(shared.app_closure_requested.iter().copied());

        for fd in to_close {
            let pending_ids: Vec<RequestId> = shared
                .requests
                .iter()
                .filter(|(id, rd)| id.connection == fd && rd.status == RequestStatus::Pending)
                .map(|(id, _)| *id)
                .collect();
            if !pending_ids.is_empty() {
                let purged = pending_ids.len() as u32;
                for id in pending_ids {
                    shared.requests.remove(&id);
                }
                if let Some(count) = shared.request_counts.get_mut(&fd) {
                    *count = count.saturating_sub(purged);
                }
            }

            let still_has_requests = shared
                .requests
                .iter()
                .any(|(id, rd)| id.connection == fd && rd.status == RequestStatus::Assigned);
            if still_has_requests {
                continue;
            }
            shared.writers.remove(&fd);
            shared.request_counts.remove(&fd);
            shared.peer_closed_pending.remove(&fd);
            shared.app_closure_requested.remove(&fd);
            debug!(fd, "connection closed");
        }
    }
}

/// Marks every request still tracked on `fd` as having had its connection
/// closed by the interface (§9 `abort_status` contract), so that a
/// `RequestHandle` for a different, still-pending-or-assigned request on
/// the same multiplexed connection observes the closure even though it was
/// never itself aborted by the client.
pub(crate) fn mark_connection_closed_by_interface(sh: &mut SharedState, fd: i32) {
    for (id, rd) in sh.requests.iter_mut() {
        if id.connection == fd {
            rd.connection_closed_by_interface = true;
        }
    }
}

impl Drop for ServerInterface {
    /// §4.3.5: invalidates the interface identifier immediately so every
    /// outstanding [`RequestHandle`] observes destruction on its next
    /// operation. The full async teardown (closing sockets, waking
    /// readers) cannot run from a synchronous `Drop`; reader tasks notice
    /// the closed listener/socket on their own and exit.
    fn drop(&mut self) {
        release_interface_slot(self.interface_id);
        self.notify.notify_waiters();
    }
}

/// Handles one already-parsed record: updates [`SharedState`] and writes
/// any immediate reply (management records, `FCGI_END_REQUEST` for
/// rejected roles) (§4.3.3).
async fn handle_incoming_record(
    fd: i32, record: connection::ParsedRecord, shared: &Arc<AsyncMutex<SharedState>>,
    notify: &Arc<Notify>, sg_limit: usize, max_requests: u32, max_connections: u32,
    app_status_on_abort: u32,
) {
    let Some(record_type) = RecordType::from_byte(record.header.record_type) else {
        warn!(fd, raw_type = record.header.record_type, "unknown record type");
        reply_unknown_type(fd, record.header.record_type, shared).await;
        return;
    };

    match record_type {
        RecordType::BeginRequest => {
            handle_begin_request(fd, &record, shared, max_requests, app_status_on_abort).await;
        }
        RecordType::AbortRequest => {
            handle_abort_request(fd, &record, shared, notify, app_status_on_abort).await;
        }
        RecordType::Params => append_stream(fd, &record, shared, StreamSlot::Params).await,
        RecordType::Stdin => append_stream(fd, &record, shared, StreamSlot::Stdin).await,
        RecordType::Data => append_stream(fd, &record, shared, StreamSlot::Data).await,
        RecordType::GetValues => {
            handle_get_values(fd, &record, shared, sg_limit, max_connections, max_requests).await;
        }
        RecordType::EndRequest
        | RecordType::Stdout
        | RecordType::Stderr
        | RecordType::GetValuesResult
        | RecordType::UnknownType => {
            warn!(fd, %record_type, "record type not valid from a web server, ignoring");
        }
    }
}

enum StreamSlot {
    Params,
    Stdin,
    Data,
}

async fn handle_begin_request(
    fd: i32, record: &connection::ParsedRecord, shared: &Arc<AsyncMutex<SharedState>>,
    max_requests: u32, app_status_on_abort: u32,
) {
    if record.content.len() < 8 {
        warn!(fd, "truncated FCGI_BEGIN_REQUEST, ignoring");
        return;
    }
    let role = u16::from_be_bytes([record.content[0], record.content[1]]);
    let begin = BeginRequestBody {
        role,
        flags: record.content[2],
    };
    let id = RequestId::new(fd, record.header.request_id);

    let mut sh = shared.lock().await;
    if sh.requests.contains_key(&id) {
        warn!(fd, id = record.header.request_id, "duplicate FCGI_BEGIN_REQUEST, ignoring");
        return;
    }

    let current_count = *sh.request_counts.get(&fd).unwrap_or(&0);
    if current_count >= max_requests {
        let status = if max_requests == 1 {
            ProtocolStatus::CantMpxConn
        } else {
            ProtocolStatus::Overloaded
        };
        drop(sh);
        write_end_request(fd, id.fcgi_id, 0, status, shared).await;
        return;
    }
    if sh.overload {
        drop(sh);
        write_end_request(fd, id.fcgi_id, 0, ProtocolStatus::Overloaded, shared).await;
        return;
    }
    if Role::from_u16(role).is_none() {
        drop(sh);
        write_end_request(fd, id.fcgi_id, app_status_on_abort, ProtocolStatus::UnknownRole, shared).await;
        return;
    }

    sh.requests.insert(id, RequestData::new(role, begin.keep_conn()));
    sh.request_counts.insert(fd, current_count + 1);
}

/// §4.3.3 "ABORT_REQUEST": sets `client_aborted` on an already-assigned
/// request; for a still-pending one, synthesizes the terminal
/// `FCGI_END_REQUEST` immediately since the application never saw it.
/// A request that does not exist (already completed/removed, or a
/// duplicate abort) is ignored, per the open question in §9.
async fn handle_abort_request(
    fd: i32, record: &connection::ParsedRecord, shared: &Arc<AsyncMutex<SharedState>>,
    notify: &Arc<Notify>, app_status_on_abort: u32,
) {
    let id = RequestId::new(fd, record.header.request_id);
    let mut sh = shared.lock().await;
    let Some(rd) = sh.requests.get_mut(&id) else {
        return;
    };
    match rd.status {
        RequestStatus::Assigned => {
            rd.client_aborted = true;
            drop(sh);
            notify.notify_one();
        }
        RequestStatus::Pending => {
            if rd.client_aborted {
                // Duplicate abort on a request that hasn't been picked up
                // yet: ignored (§9 open question).
                return;
            }
            let keep_conn = rd.keep_conn;
            sh.requests.remove(&id);
            if let Some(count) = sh.request_counts.get_mut(&fd) {
                *count = count.saturating_sub(1);
            }
            if !keep_conn {
                sh.app_closure_requested.insert(fd);
                mark_connection_closed_by_interface(&mut sh, fd);
            }
            drop(sh);
            write_end_request(fd, id.fcgi_id, app_status_on_abort, ProtocolStatus::RequestComplete, shared).await;
            notify.notify_one();
        }
    }
}

/// Appends or terminates one of a request's three input streams (§4.3.3
/// "Stream records"). Once all three are terminated, decodes the
/// accumulated `FCGI_PARAMS` payload: success leaves the request `Pending`
/// for [`ServerInterface::collect_completed_requests`] to pick up; failure
/// synthesizes a `REQUEST_COMPLETE`/`failure` `FCGI_END_REQUEST` and
/// removes the request instead of ever handing it to the application.
async fn append_stream(
    fd: i32, record: &connection::ParsedRecord, shared: &Arc<AsyncMutex<SharedState>>, slot: StreamSlot,
) {
    let id = RequestId::new(fd, record.header.request_id);
    let mut sh = shared.lock().await;
    let Some(rd) = sh.requests.get_mut(&id) else {
        return;
    };
    let terminator = record.content.is_empty();
    match slot {
        StreamSlot::Params => {
            if terminator {
                rd.params_done = true;
            } else {
                rd.params_raw.extend_from_slice(&record.content);
            }
        }
        StreamSlot::Stdin => {
            if terminator {
                rd.stdin_done = true;
            } else {
                rd.stdin.extend_from_slice(&record.content);
            }
        }
        StreamSlot::Data => {
            if terminator {
                rd.data_done = true;
            } else {
                rd.data.extend_from_slice(&record.content);
            }
        }
    }

    if !rd.all_streams_done() {
        return;
    }

    match extract_nv_pairs(&rd.params_raw) {
        Ok(pairs) => {
            rd.params_parsed = pairs.into_iter().collect();
        }
        Err(CodecError::TruncatedPairs | CodecError::InvalidLength(_) | CodecError::BadArgs) => {
            warn!(fd, "malformed FCGI_PARAMS stream, failing request");
            let keep_conn = rd.keep_conn;
            sh.requests.remove(&id);
            if let Some(count) = sh.request_counts.get_mut(&fd) {
                *count = count.saturating_sub(1);
            }
            if !keep_conn {
                sh.app_closure_requested.insert(fd);
                mark_connection_closed_by_interface(&mut sh, fd);
            }
            drop(sh);
            write_end_request(
                fd,
                id.fcgi_id,
                crate::server::APP_STATUS_FAILURE,
                ProtocolStatus::RequestComplete,
                shared,
            )
            .await;
        }
    }
}

async fn handle_get_values(
    fd: i32, record: &connection::ParsedRecord, shared: &Arc<AsyncMutex<SharedState>>, sg_limit: usize,
    max_connections: u32, max_requests_per_connection: u32,
) {
    let queried = match extract_nv_pairs(&record.content) {
        Ok(pairs) => pairs,
        Err(_) => {
            warn!(fd, "malformed FCGI_GET_VALUES, ignoring");
            return;
        }
    };

    // At most one instance of each recognized name (§4.3.3 "GET_VALUES"),
    // even if the web server asked for it more than once.
    let mpxs = u8::from(max_requests_per_connection > 1);
    let mut reply_pairs: Vec<(Bytes, Bytes)> = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for (name, _value) in &queried {
        if !seen.insert(name.clone()) {
            continue;
        }
        let value = match name.as_ref() {
            FCGI_MAX_CONNS => Some(max_connections.to_string().into_bytes()),
            FCGI_MAX_REQS => Some(max_requests_per_connection.to_string().into_bytes()),
            FCGI_MPXS_CONNS => Some(mpxs.to_string().into_bytes()),
            _ => None,
        };
        if let Some(value) = value {
            reply_pairs.push((name.clone(), Bytes::from(value)));
        }
    }

    let plan = match crate::codec::encode_name_value_pairs(
        &reply_pairs,
        RecordType::GetValuesResult as u8,
        NULL_REQUEST_ID,
        sg_limit,
    ) {
        Ok(p) => p,
        Err(_) => return,
    };

    let mut wire = Vec::with_capacity(plan.total_bytes());
    for rec in &plan.records {
        wire.extend_from_slice(&rec.header);
        wire.extend_from_slice(&rec.body);
        wire.extend(std::iter::repeat(0u8).take(rec.padding_length as usize));
    }
    write_raw(fd, &wire, shared).await;
}

async fn reply_unknown_type(fd: i32, raw_type: u8, shared: &Arc<AsyncMutex<SharedState>>) {
    let mut body = vec![raw_type];
    body.extend_from_slice(&[0u8; 7]);
    let header = encode_header(RecordType::UnknownType as u8, NULL_REQUEST_ID, body.len() as u16, 0);
    let mut wire = Vec::with_capacity(header.len() + body.len());
    wire.extend_from_slice(&header);
    wire.extend_from_slice(&body);
    write_raw(fd, &wire, shared).await;
}

/// Writes the same terminal triple [`handle::RequestHandle::complete`] does
/// — empty `FCGI_STDOUT`, empty `FCGI_STDERR`, then `FCGI_END_REQUEST` — so
/// that a synthesized rejection (`CANT_MPX_CONN`/`OVERLOADED`/
/// `UNKNOWN_ROLE`/a request that never reached the application) satisfies
/// the client-side "stdout completed before END_REQUEST" rule (§4.5.5) the
/// same way a normal completion does.
async fn write_end_request(
    fd: i32, fcgi_id: u16, app_status: u32, status: ProtocolStatus, shared: &Arc<AsyncMutex<SharedState>>,
) {
    let mut wire = Vec::new();
    for stream_type in [RecordType::Stdout, RecordType::Stderr] {
        wire.extend_from_slice(&encode_header(stream_type as u8, fcgi_id, 0, 0));
    }
    let mut body = Vec::with_capacity(8);
    body.extend_from_slice(&app_status.to_be_bytes());
    body.push(status as u8);
    body.extend_from_slice(&[0, 0, 0]);
    let header = encode_header(RecordType::EndRequest as u8, fcgi_id, body.len() as u16, 0);
    wire.extend_from_slice(&header);
    wire.extend_from_slice(&body);
    write_raw(fd, &wire, shared).await;
}

async fn write_raw(fd: i32, wire: &[u8], shared: &Arc<AsyncMutex<SharedState>>) {
    let writer = {
        let sh = shared.lock().await;
        sh.writers.get(&fd).cloned()
    };
    let Some(writer) = writer else { return };
    let mut w = writer.lock().await;
    if w.corrupt {
        return;
    }
    if w.write_record(wire).await.is_err() {
        w.corrupt = true;
    }
}

/// Parses `FCGI_WEB_SERVER_ADDRS` (§4.3.1 construction rule ii): a
/// comma-separated list of IP literals of the listening socket's address
/// family. `Ok(None)` means "unset or empty", which disables address
/// filtering entirely. A non-empty value that contains no address of
/// `family` (either because every entry fails to parse, or every parsed
/// entry is of the other family) is a fatal construction error (§4.3.1
/// "Failure to find any valid address in a non-empty list is a fatal
/// construction error"); no normalization between IPv4 and IPv4-mapped
/// IPv6 literals is performed (§9 open question — see DESIGN.md).
fn parse_web_server_addrs(family: AddrFamily) -> ServerConfigResult<Option<Vec<std::net::IpAddr>>> {
    let raw = match std::env::var("FCGI_WEB_SERVER_ADDRS") {
        Ok(raw) if !raw.is_empty() => raw,
        _ => return Ok(None),
    };
    let addrs: Vec<std::net::IpAddr> = raw
        .split(',')
        .filter_map(|s| s.trim().parse::<std::net::IpAddr>().ok())
        .filter(|ip| match family {
            AddrFamily::V4 => ip.is_ipv4(),
            AddrFamily::V6 => ip.is_ipv6(),
        })
        .collect();
    if addrs.is_empty() {
        Err(ServerConfigError::InvalidWebServerAddrs)
    } else {
        Ok(Some(addrs))
    }
}

/// Verifies `fd` names a listening `SOCK_STREAM` socket (§4.3.1
/// construction rule i), used by callers that build their own
/// `std::net`/`std::os::unix::net` listener before handing it to
/// [`ServerInterface::from_tcp_listener`]/[`ServerInterface::from_unix_listener`].
#[cfg(unix)]
pub fn verify_listening_stream_socket(fd: RawFd) -> ServerConfigResult<()> {
    use nix::sys::socket::{getsockopt, sockopt};

    let socket_type = getsockopt(unsafe { &std::os::fd::BorrowedFd::borrow_raw(fd) }, sockopt::SockType)
        .map_err(|e| ServerConfigError::NotAListeningStreamSocket(e.to_string()))?;
    if socket_type != nix::sys::socket::SockType::Stream {
        return Err(ServerConfigError::NotAListeningStreamSocket(format!("{socket_type:?}")));
    }
    let accept_conn = getsockopt(unsafe { &std::os::fd::BorrowedFd::borrow_raw(fd) }, sockopt::AcceptConn)
        .map_err(|e| ServerConfigError::NotAListeningStreamSocket(e.to_string()))?;
    if !accept_conn {
        return Err(ServerConfigError::NotAListeningStreamSocket(
            "socket is not in the listening state".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn web_server_addrs_unset_accepts_any_peer() {
        std::env::remove_var("FCGI_WEB_SERVER_ADDRS");
        assert!(parse_web_server_addrs(AddrFamily::V4).unwrap().is_none());
    }

    #[test]
    fn web_server_addrs_parses_matching_family_only() {
        std::env::set_var("FCGI_WEB_SERVER_ADDRS", "127.0.0.1, ::1, 10.0.0.2");
        let addrs = parse_web_server_addrs(AddrFamily::V4).unwrap().expect("should parse");
        assert_eq!(addrs.len(), 2);
        assert!(addrs.iter().all(std::net::IpAddr::is_ipv4));
        std::env::remove_var("FCGI_WEB_SERVER_ADDRS");
    }

    #[test]
    fn web_server_addrs_with_no_matching_family_is_fatal() {
        std::env::set_var("FCGI_WEB_SERVER_ADDRS", "::1, ::2");
        assert!(matches!(
            parse_web_server_addrs(AddrFamily::V4),
            Err(ServerConfigError::InvalidWebServerAddrs)
        ));
        std::env::remove_var("FCGI_WEB_SERVER_ADDRS");
    }
}
