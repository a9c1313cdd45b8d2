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

//! The application-side client interface (§4.5): a single-threaded driver
//! that connects to FastCGI servers, sends application and management
//! requests, and surfaces typed [`event::Event`]s as their responses
//! arrive.

pub mod event;

mod connection;

use crate::codec::{encode_header, extract_nv_pairs, partition_bytes, scatter_gather_limit, ParsedRecord};
use crate::error::{ClientError, ClientResult};
use crate::protocol::{
    Header, ProtocolStatus, RecordType, FCGI_KEEP_CONN, MAX_CONTENT_LENGTH, NULL_REQUEST_ID, VERSION_1,
};
use crate::request_id::RequestId;
use bytes::{Bytes, BytesMut};
use connection::{ClientConnection, Transport};
use event::{Event, FcgiRequest, FcgiResponse, ManagementEntry};
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::net::{TcpStream, UnixStream};
use tracing::{debug, warn};

/// Longest UNIX socket path this crate will attempt to connect to,
/// including the terminating NUL (§4.5.1).
const MAX_UNIX_PATH_LEN: usize = 91;

/// A request sent but not yet answered with `FCGI_END_REQUEST`: the
/// output this connection has accumulated so far.
#[derive(Debug, Default)]
struct PendingRequest {
    stdout: BytesMut,
    stderr: BytesMut,
    stdout_done: bool,
    stderr_done: bool,
}

/// The application-side FastCGI client interface (§4.5).
///
/// Single-threaded: every method takes `&mut self` (or `&self` for the
/// read-only counters), so there is no internal locking to reason about,
/// unlike [`crate::server::ServerInterface`]. Drives one or more
/// connections to completion by repeatedly calling
/// [`ClientInterface::retrieve_server_event`].
#[derive(Default)]
pub struct ClientInterface {
    connections: HashMap<i32, ClientConnection>,
    pending: HashMap<RequestId, PendingRequest>,
    events: VecDeque<Event>,
    /// Descriptors a previous readiness scan found readable that have not
    /// yet been drained (§4.5.4 "select-continuation state").
    ready_fds: VecDeque<i32>,
}

impl ClientInterface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects to `address:port` (§4.5.1): `address` is tried as an IPv4
    /// or IPv6 literal first, then as a UNIX socket path. Returns the new
    /// connection's descriptor value, reusing any `IdAllocator` state left
    /// over from a previous connection that happened to land on the same
    /// descriptor.
    pub async fn connect(&mut self, address: &str, port: u16) -> ClientResult<i32> {
        let transport = match address.parse::<std::net::IpAddr>() {
            Ok(ip) => Transport::Tcp(TcpStream::connect((ip, port)).await?),
            Err(_) => {
                if address.len() + 1 > MAX_UNIX_PATH_LEN {
                    return Err(ClientError::InvalidAddress(address.to_string()));
                }
                Transport::Unix(UnixStream::connect(address).await?)
            }
        };
        let fd = transport.as_raw_fd();
        debug!(fd, address, port, "client connected");

        match self.connections.get_mut(&fd) {
            Some(existing) if !existing.connected => {
                // Same descriptor value as a prior, now-closed connection:
                // keep its IdAllocator (and completed_unreleased ids) so
                // outstanding accounting from before is still honored.
                existing.transport = Some(transport);
                existing.connected = true;
                existing.parser = crate::codec::RecordParser::new();
            }
            Some(_) => {
                // A live entry already claims this fd; should not happen
                // for a freshly connected socket, but don't clobber it.
            }
            None => {
                self.connections.insert(fd, ClientConnection::new(transport));
            }
        }
        Ok(fd)
    }

    /// Number of descriptors this interface currently tracks, connected or
    /// not yet fully released (§6 counters).
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of requests still awaiting `FCGI_END_REQUEST`.
    pub fn pending_request_count(&self) -> usize {
        self.pending.len()
    }

    /// Number of completed requests whose id has not yet been released.
    pub fn completed_request_count(&self) -> usize {
        self.connections.values().map(|c| c.completed_unreleased.len()).sum()
    }

    /// Number of management requests still awaiting a reply.
    pub fn management_request_count(&self) -> usize {
        self.connections.values().map(|c| c.management_fifo.len()).sum()
    }

    /// Number of events already queued and ready to be popped without
    /// blocking.
    pub fn ready_event_count(&self) -> usize {
        self.events.len()
    }

    /// Sends an application request (§4.5.2): `BEGIN_REQUEST`, then the
    /// `DATA`, `STDIN`, and `PARAMS` streams in that order, `PARAMS` last
    /// so the server cannot consider the request complete before every
    /// stream has been queued.
    ///
    /// Unlike the historical C client this crate's `ServerInterface`
    /// always waits for an explicit terminator on all three streams
    /// regardless of role (see `DESIGN.md`), so this always sends all
    /// three, including their terminators, rather than skipping `DATA`/
    /// `STDIN` for roles that conventionally omit them.
    pub async fn send_request(&mut self, conn: i32, req: FcgiRequest) -> ClientResult<RequestId> {
        let connection = self.connections.get_mut(&conn).ok_or(ClientError::UnknownConnection(conn))?;
        if !connection.connected {
            return Err(ClientError::UnknownConnection(conn));
        }
        let fcgi_id = connection.id_alloc.acquire().map_err(|_| ClientError::IdsExhausted(conn))?;
        let sg_limit = scatter_gather_limit();

        let mut wrote_any = false;
        let write_result = write_fcgi_request(connection, fcgi_id, &req, sg_limit, &mut wrote_any).await;

        match write_result {
            Ok(()) => {
                let id = RequestId::new(conn, fcgi_id);
                self.pending.insert(id, PendingRequest::default());
                Ok(id)
            }
            Err(err) => {
                let connection = self.connections.get_mut(&conn).expect("looked up above");
                if !wrote_any && err.kind() != std::io::ErrorKind::BrokenPipe {
                    let _ = connection.id_alloc.release(fcgi_id);
                    Err(ClientError::Io(err))
                } else {
                    warn!(conn, %err, "send_request write failed, closing connection");
                    self.close_connection(conn);
                    self.events.push_back(Event::ConnectionClosure { connection: conn });
                    Ok(RequestId::NULL)
                }
            }
        }
    }

    /// Writes `FCGI_ABORT_REQUEST` for `id` if it still names a pending
    /// request on a connected descriptor (§4.5.3); returns `false`
    /// otherwise, including on a write failure (which also closes the
    /// connection and enqueues a closure event).
    pub async fn send_abort(&mut self, id: RequestId) -> bool {
        if !self.pending.contains_key(&id) {
            return false;
        }
        let write_ok = {
            let Some(connection) = self.connections.get_mut(&id.connection) else {
                return false;
            };
            if !connection.connected {
                return false;
            }
            let header = encode_header(RecordType::AbortRequest as u8, id.fcgi_id, 0, 0);
            let transport = connection.transport.as_mut().expect("connected implies transport present");
            transport.write_all(&header).await.is_ok()
        };
        if !write_ok {
            self.fail_connection(id.connection);
            return false;
        }
        true
    }

    /// Sends `FCGI_GET_VALUES` querying `names` (§4.5.3). Fails and
    /// returns `false` if the encoded body would not fit in a single
    /// record, or on an unknown/disconnected/failed connection.
    pub async fn send_get_values(&mut self, conn: i32, names: &HashSet<Bytes>) -> bool {
        let Some(connection) = self.connections.get_mut(&conn) else {
            return false;
        };
        if !connection.connected {
            return false;
        }
        let mut content = Vec::new();
        for name in names {
            if crate::codec::encode_nv_pair(name, b"", &mut content).is_err() {
                return false;
            }
        }
        if content.len() > MAX_CONTENT_LENGTH {
            return false;
        }
        let header = encode_header(RecordType::GetValues as u8, NULL_REQUEST_ID, content.len() as u16, 0);
        let mut wire = Vec::with_capacity(header.len() + content.len());
        wire.extend_from_slice(&header);
        wire.extend_from_slice(&content);

        let transport = connection.transport.as_mut().expect("connected implies transport present");
        if transport.write_all(&wire).await.is_err() {
            self.fail_connection(conn);
            return false;
        }
        self.connections.get_mut(&conn).expect("looked up above").management_fifo.push_back(ManagementEntry::GetValues);
        true
    }

    /// Sends an arbitrary management record of `record_type` with body
    /// `bytes` (§4.5.3). `bytes.len()` must fit in one record's content
    /// length.
    pub async fn send_binary_management(&mut self, conn: i32, record_type: u8, bytes: &[u8]) -> ClientResult<bool> {
        if bytes.len() > MAX_CONTENT_LENGTH {
            return Err(ClientError::ManagementRequestTooLarge);
        }
        let Some(connection) = self.connections.get_mut(&conn) else {
            return Ok(false);
        };
        if !connection.connected {
            return Ok(false);
        }
        let padding_length = Header::padding_for(bytes.len());
        let header = encode_header(record_type, NULL_REQUEST_ID, bytes.len() as u16, padding_length);
        let mut wire = Vec::with_capacity(header.len() + bytes.len() + padding_length as usize);
        wire.extend_from_slice(&header);
        wire.extend_from_slice(bytes);
        wire.extend(std::iter::repeat(0u8).take(padding_length as usize));

        let transport = connection.transport.as_mut().expect("connected implies transport present");
        if transport.write_all(&wire).await.is_err() {
            self.fail_connection(conn);
            return Ok(false);
        }
        self.connections.get_mut(&conn).expect("looked up above").management_fifo.push_back(ManagementEntry::Binary);
        Ok(true)
    }

    /// Releases `id` from the completed-but-unreleased set (§4.5.7).
    pub fn release_id(&mut self, id: RequestId) {
        if let Some(connection) = self.connections.get_mut(&id.connection) {
            connection.completed_unreleased.remove(&id.fcgi_id);
        }
        self.prune_if_dead(id.connection);
    }

    /// Releases every completed-but-unreleased id on `conn` (§4.5.7).
    pub fn release_connection(&mut self, conn: i32) {
        if let Some(connection) = self.connections.get_mut(&conn) {
            connection.completed_unreleased.clear();
        }
        self.prune_if_dead(conn);
    }

    /// Closes `conn`'s descriptor and cancels its pending requests without
    /// notification (§4.5.7). The per-connection entry survives if
    /// completed-but-unreleased ids remain.
    pub fn close_connection(&mut self, conn: i32) {
        let Some(connection) = self.connections.get_mut(&conn) else {
            return;
        };
        connection.mark_closed();
        self.pending.retain(|id, _| id.connection != conn);
        self.prune_if_dead(conn);
    }

    fn fail_connection(&mut self, conn: i32) {
        self.close_connection(conn);
        self.events.push_back(Event::ConnectionClosure { connection: conn });
    }

    fn prune_if_dead(&mut self, conn: i32) {
        if self.connections.get(&conn).is_some_and(ClientConnection::is_dead) {
            self.connections.remove(&conn);
        }
    }

    /// Returns the next ready event, blocking (asynchronously) until one
    /// is available (§4.5.4). Fails if no descriptor is connected and the
    /// event queue is empty.
    pub async fn retrieve_server_event(&mut self) -> ClientResult<Event> {
        loop {
            if let Some(event) = self.events.pop_front() {
                return Ok(event);
            }

            if self.ready_fds.is_empty() {
                let fds: Vec<i32> = self
                    .connections
                    .iter()
                    .filter(|(_, c)| c.connected)
                    .map(|(fd, _)| *fd)
                    .collect();
                if fds.is_empty() {
                    return Err(ClientError::NoConnections);
                }
                let index = self.wait_for_readable(&fds).await?;
                self.ready_fds.push_back(fds[index]);
            }

            let fd = self.ready_fds.pop_front().expect("just pushed or left non-empty");
            self.drain_connection(fd).await;
        }
    }

    /// Waits for any of `fds` to become readable, returning the index of
    /// the first one (§4.5.4 step 3's `select`). `tokio`'s readiness API
    /// exposes one-at-a-time results rather than POSIX `select`'s whole
    /// `fd_set`, so unlike the original this reports a single descriptor
    /// per call instead of every simultaneously-ready one (see
    /// `DESIGN.md`).
    async fn wait_for_readable(&self, fds: &[i32]) -> ClientResult<usize> {
        use futures_util::future::select_all;

        let futs: Vec<_> = fds
            .iter()
            .map(|fd| {
                let connection = self.connections.get(fd).expect("fd came from self.connections");
                let transport = connection.transport.as_ref().expect("connected implies transport present");
                Box::pin(transport.readable())
            })
            .collect();
        let (result, index, _remaining) = select_all(futs).await;
        result?;
        Ok(index)
    }

    /// Reads from `fd` until it would block, feeding every byte to its
    /// parser and running each complete record through validation and
    /// processing (§4.5.4 step 4, §4.5.5, §4.5.6).
    async fn drain_connection(&mut self, fd: i32) {
        let mut buf = [0u8; 4096];
        loop {
            let read_result = {
                let Some(connection) = self.connections.get(&fd) else { return };
                let Some(transport) = connection.transport.as_ref() else { return };
                transport.try_read(&mut buf)
            };
            match read_result {
                Ok(0) => {
                    self.handle_peer_closed(fd);
                    return;
                }
                Ok(n) => {
                    let records = {
                        let connection = self.connections.get_mut(&fd).expect("fd tracked");
                        connection.parser.feed(&buf[..n])
                    };
                    for record in records {
                        self.process_record(fd, record);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!(fd, %e, "read error, treating connection as closed");
                    self.handle_peer_closed(fd);
                    return;
                }
            }
        }
    }

    fn handle_peer_closed(&mut self, fd: i32) {
        if let Some(connection) = self.connections.get_mut(&fd) {
            connection.mark_closed();
        }
        self.pending.retain(|id, _| id.connection != fd);
        self.prune_if_dead(fd);
        self.events.push_back(Event::ConnectionClosure { connection: fd });
    }

    fn process_record(&mut self, fd: i32, record: ParsedRecord) {
        if record.header.version != VERSION_1 {
            self.invalid(fd, format!("unsupported version {}", record.header.version));
            return;
        }
        let Some(record_type) = RecordType::from_byte(record.header.record_type) else {
            self.invalid(fd, format!("unrecognized record type {}", record.header.record_type));
            return;
        };
        match record_type {
            RecordType::EndRequest => self.process_end_request(fd, record),
            RecordType::Stdout => self.process_output_stream(fd, record, true),
            RecordType::Stderr => self.process_output_stream(fd, record, false),
            RecordType::GetValuesResult => self.process_get_values_result(fd, record),
            RecordType::UnknownType => self.process_unknown_type(fd, record),
            other => self.invalid(fd, format!("unexpected {other} from server")),
        }
    }

    fn invalid(&mut self, fd: i32, detail: String) {
        self.events.push_back(Event::InvalidRecord { connection: fd, detail });
    }

    fn process_end_request(&mut self, fd: i32, record: ParsedRecord) {
        let id = RequestId::new(fd, record.header.request_id);
        if record.content.len() != 8 {
            self.invalid(fd, "END_REQUEST content-length != 8".to_string());
            return;
        }
        let Some(pending) = self.pending.get(&id) else {
            self.invalid(fd, format!("END_REQUEST for unknown request {id}"));
            return;
        };
        if !pending.stdout_done {
            self.invalid(fd, format!("END_REQUEST for {id} before stdout completed"));
            return;
        }
        if !pending.stderr_done && !pending.stderr.is_empty() {
            self.invalid(fd, format!("END_REQUEST for {id} with incomplete stderr"));
            return;
        }

        let content = &record.content;
        let app_status = u32::from_be_bytes([content[0], content[1], content[2], content[3]]);
        let Some(protocol_status) = ProtocolStatus::from_byte(content[4]) else {
            self.invalid(fd, format!("END_REQUEST for {id} with unknown protocol status {}", content[4]));
            return;
        };

        let pending = self.pending.remove(&id).expect("checked present above");
        if let Some(connection) = self.connections.get_mut(&fd) {
            connection.completed_unreleased.insert(id.fcgi_id);
        }
        self.events.push_back(Event::FcgiResponse(FcgiResponse {
            request: id,
            stdout: pending.stdout.freeze(),
            stderr: pending.stderr.freeze(),
            app_status,
            protocol_status,
        }));
    }

    fn process_output_stream(&mut self, fd: i32, record: ParsedRecord, is_stdout: bool) {
        let id = RequestId::new(fd, record.header.request_id);
        let label = if is_stdout { "STDOUT" } else { "STDERR" };
        let Some(pending) = self.pending.get_mut(&id) else {
            self.invalid(fd, format!("{label} for unknown request {id}"));
            return;
        };
        let already_done = if is_stdout { pending.stdout_done } else { pending.stderr_done };
        if already_done {
            self.invalid(fd, format!("{label} for {id} after stream already completed"));
            return;
        }
        if record.content.is_empty() {
            if is_stdout {
                pending.stdout_done = true;
            } else {
                pending.stderr_done = true;
            }
        } else if is_stdout {
            pending.stdout.extend_from_slice(&record.content);
        } else {
            pending.stderr.extend_from_slice(&record.content);
        }
    }

    fn process_get_values_result(&mut self, fd: i32, record: ParsedRecord) {
        if record.header.request_id != NULL_REQUEST_ID {
            self.invalid(fd, "GET_VALUES_RESULT with nonzero fcgi_id".to_string());
            return;
        }
        let Some(connection) = self.connections.get_mut(&fd) else { return };
        match connection.management_fifo.front() {
            Some(ManagementEntry::GetValues) => {}
            _ => {
                self.invalid(fd, "GET_VALUES_RESULT with empty or mismatched management queue".to_string());
                return;
            }
        }
        connection.management_fifo.pop_front();
        let (values, corrupt) = decode_get_values_result(&record.content);
        self.events.push_back(Event::GetValuesResult { connection: fd, values, corrupt });
    }

    fn process_unknown_type(&mut self, fd: i32, record: ParsedRecord) {
        if record.header.request_id != NULL_REQUEST_ID {
            self.invalid(fd, "UNKNOWN_TYPE with nonzero fcgi_id".to_string());
            return;
        }
        if record.content.len() != 8 {
            self.invalid(fd, "UNKNOWN_TYPE content-length != 8".to_string());
            return;
        }
        let Some(connection) = self.connections.get_mut(&fd) else { return };
        match connection.management_fifo.front() {
            None => {
                self.invalid(fd, "UNKNOWN_TYPE with empty management queue".to_string());
                return;
            }
            Some(ManagementEntry::GetValues) => {
                self.invalid(fd, "UNKNOWN_TYPE answering a GET_VALUES request".to_string());
                return;
            }
            Some(ManagementEntry::Binary) => {}
        }
        connection.management_fifo.pop_front();
        let unknown_type = record.content[0];
        self.events.push_back(Event::UnknownType { connection: fd, unknown_type });
    }
}

/// Sorts the decoded pairs by name and rejects duplicates (§9 "Name-value
/// duplicates on GET_VALUES_RESULT"): `corrupt` is set on a decode
/// failure, an empty body, or any repeated name.
fn decode_get_values_result(content: &Bytes) -> (HashMap<Bytes, Bytes>, bool) {
    if content.is_empty() {
        return (HashMap::new(), true);
    }
    let Ok(mut pairs) = extract_nv_pairs(content) else {
        return (HashMap::new(), true);
    };
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    let mut values = HashMap::with_capacity(pairs.len());
    let mut corrupt = false;
    for (name, value) in pairs {
        if values.insert(name, value).is_some() {
            corrupt = true;
        }
    }
    (values, corrupt)
}

/// Writes `BEGIN_REQUEST` followed by the `DATA`, `STDIN`, and `PARAMS`
/// streams, in that order (§4.5.2). `wrote_any` is set as soon as the
/// first byte reaches the transport, so the caller can tell a
/// nothing-written failure from a partial one.
async fn write_fcgi_request(
    connection: &mut ClientConnection, fcgi_id: u16, req: &FcgiRequest, sg_limit: usize, wrote_any: &mut bool,
) -> std::io::Result<()> {
    let mut body = Vec::with_capacity(8);
    body.extend_from_slice(&req.role.to_be_bytes());
    body.push(if req.keep_conn { FCGI_KEEP_CONN } else { 0 });
    body.extend_from_slice(&[0u8; 5]);
    let header = encode_header(RecordType::BeginRequest as u8, fcgi_id, body.len() as u16, 0);

    let transport = connection.transport.as_mut().expect("connected implies transport present");
    transport.write_all(&header).await?;
    *wrote_any = true;
    transport.write_all(&body).await?;

    write_stream(connection, RecordType::Data as u8, fcgi_id, &req.data, sg_limit, wrote_any).await?;
    write_stream(connection, RecordType::Stdin as u8, fcgi_id, &req.stdin, sg_limit, wrote_any).await?;

    let mut params_content = Vec::new();
    for (name, value) in &req.params {
        crate::codec::encode_nv_pair(name, value, &mut params_content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    }
    write_stream(
        connection,
        RecordType::Params as u8,
        fcgi_id,
        &Bytes::from(params_content),
        sg_limit,
        wrote_any,
    )
    .await
}

/// Writes one stream's worth of content followed by its empty terminator
/// record (§4.1, §4.5.2).
async fn write_stream(
    connection: &mut ClientConnection, record_type: u8, fcgi_id: u16, content: &Bytes, sg_limit: usize,
    wrote_any: &mut bool,
) -> std::io::Result<()> {
    let transport = connection.transport.as_mut().expect("connected implies transport present");

    let mut begin = 0usize;
    while begin < content.len() {
        let plan = partition_bytes(content, begin, record_type, fcgi_id, sg_limit);
        for rec in &plan.records {
            let mut wire = Vec::with_capacity(rec.total_len());
            wire.extend_from_slice(&rec.header);
            wire.extend_from_slice(&rec.body);
            wire.extend(std::iter::repeat(0u8).take(rec.padding_length as usize));
            transport.write_all(&wire).await?;
            *wrote_any = true;
        }
        begin = plan.next_begin;
    }

    let terminator = partition_bytes(&Bytes::new(), 0, record_type, fcgi_id, sg_limit);
    for rec in &terminator.records {
        transport.write_all(&rec.header).await?;
        *wrote_any = true;
    }
    Ok(())
}
