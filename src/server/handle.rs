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

//! The application-facing request object (§4.4).
//!
//! A `RequestHandle` owns the decoded input of one request and is the only
//! way an application emits `FCGI_STDOUT`/`FCGI_STDERR`/`FCGI_END_REQUEST`
//! for it. It can be moved to a worker task and outlive its
//! `ServerInterface`; every operation checks the interface identifier
//! before touching shared state (§9 "Cyclic reference handle ↔
//! interface").

use crate::codec::{encode_header, partition_bytes};
use crate::protocol::{ProtocolStatus, RecordType};
use crate::request_id::RequestId;
use crate::server::connection::ConnWriter;
use crate::server::{mark_connection_closed_by_interface, SharedState};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tracing::warn;

/// Which output stream a [`RequestHandle::write`] call targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn record_type(self) -> u8 {
        match self {
            Stream::Stdout => RecordType::Stdout as u8,
            Stream::Stderr => RecordType::Stderr as u8,
        }
    }
}

/// The application-facing request handle. See the module docs.
pub struct RequestHandle {
    pub(crate) interface_id: u64,
    pub(crate) shared: Arc<AsyncMutex<SharedState>>,
    pub(crate) connection_writer: Arc<AsyncMutex<ConnWriter>>,
    pub(crate) notify: Arc<Notify>,
    pub(crate) sg_limit: usize,

    pub(crate) request_id: RequestId,
    pub(crate) connection: i32,

    environment: HashMap<Bytes, Bytes>,
    stdin: Bytes,
    data: Bytes,
    role: u16,
    keep_conn: bool,

    completed: bool,
    aborted: bool,
}

impl RequestHandle {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        interface_id: u64, shared: Arc<AsyncMutex<SharedState>>,
        connection_writer: Arc<AsyncMutex<ConnWriter>>, notify: Arc<Notify>, sg_limit: usize,
        request_id: RequestId, environment: HashMap<Bytes, Bytes>, stdin: Bytes, data: Bytes,
        role: u16, keep_conn: bool,
    ) -> Self {
        Self {
            interface_id,
            shared,
            connection_writer,
            notify,
            sg_limit,
            request_id,
            connection: request_id.connection,
            environment,
            stdin,
            data,
            role,
            keep_conn,
            completed: false,
            aborted: false,
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn environment(&self) -> &HashMap<Bytes, Bytes> {
        &self.environment
    }

    pub fn get_stdin(&self) -> &Bytes {
        &self.stdin
    }

    pub fn get_data(&self) -> &Bytes {
        &self.data
    }

    pub fn role(&self) -> u16 {
        self.role
    }

    pub fn keep_conn(&self) -> bool {
        self.keep_conn
    }

    fn interface_alive(&self) -> bool {
        crate::server::is_interface_live(self.interface_id)
    }

    /// True once the client sent `FCGI_ABORT_REQUEST` (§4.4), or the
    /// interface has been destroyed/gone bad, or the interface closed the
    /// connection out from under this request. The last three cases also
    /// mark the handle completed+aborted and remove the request from the
    /// interface.
    pub async fn abort_status(&mut self) -> bool {
        if self.completed {
            return self.aborted;
        }
        if !self.interface_alive() {
            self.completed = true;
            self.aborted = true;
            return true;
        }

        let mut shared = self.shared.lock().await;
        if shared.bad_interface {
            self.completed = true;
            self.aborted = true;
            return true;
        }
        let aborted = match shared.requests.get(&self.request_id) {
            Some(rd) => rd.client_aborted || rd.connection_closed_by_interface,
            None => true,
        };
        if aborted {
            shared.requests.remove(&self.request_id);
            self.completed = true;
            self.aborted = true;
        }
        aborted
    }

    /// Writes `bytes` to `stream`, partitioning it into records (§4.1).
    ///
    /// Returns `false` if a closed/corrupt connection was detected; the
    /// handle is then completed+aborted and removed from the interface.
    pub async fn write(&mut self, bytes: &[u8], stream: Stream) -> bool {
        if self.completed {
            return false;
        }
        if !self.interface_alive() {
            self.completed = true;
            self.aborted = true;
            return false;
        }

        let data = Bytes::copy_from_slice(bytes);
        let mut begin = 0usize;
        loop {
            let plan = partition_bytes(
                &data,
                begin,
                stream.record_type(),
                self.request_id.fcgi_id,
                self.sg_limit,
            );

            let mut writer = self.connection_writer.lock().await;
            if writer.corrupt {
                drop(writer);
                self.finish_aborted_on_corrupt(false).await;
                return false;
            }

            let mut ok = true;
            for rec in &plan.records {
                let mut wire = Vec::with_capacity(rec.total_len());
                wire.extend_from_slice(&rec.header);
                wire.extend_from_slice(&rec.body);
                wire.extend(std::iter::repeat(0u8).take(rec.padding_length as usize));
                if writer.write_record(&wire).await.is_err() {
                    writer.corrupt = true;
                    ok = false;
                    break;
                }
            }
            drop(writer);

            if !ok {
                self.finish_aborted_on_corrupt(true).await;
                return false;
            }

            begin = plan.next_begin;
            if begin == data.len() {
                break;
            }
        }
        true
    }

    /// §4.4.2: runs the corruption protocol. `set_by_us` distinguishes
    /// "we just found it corrupt" (still mandates the shared-state/
    /// write-mutex re-acquire sequence) from "someone else corrupted it
    /// first", which only needs bookkeeping.
    async fn finish_aborted_on_corrupt(&mut self, set_by_us: bool) {
        let mut shared = self.shared.lock().await;
        {
            let mut w = self.connection_writer.lock().await;
            w.corrupt = true;
        }
        if set_by_us {
            shared.app_closure_requested.insert(self.connection);
        }
        shared.requests.remove(&self.request_id);
        mark_connection_closed_by_interface(&mut shared, self.connection);
        drop(shared);
        self.notify.notify_one();
        self.completed = true;
        self.aborted = true;
        warn!(connection = self.connection, "connection marked corrupt by partial write");
    }

    /// Writes the terminal `FCGI_STDOUT`/`FCGI_STDERR`/`FCGI_END_REQUEST`
    /// triple as one write under the shared-state mutex (§4.4.1).
    /// Idempotent: any call after the first completion returns `false`.
    pub async fn complete(&mut self, app_status: u32) -> bool {
        if self.completed {
            return false;
        }
        if !self.interface_alive() {
            self.completed = true;
            self.aborted = true;
            return false;
        }

        let mut shared = self.shared.lock().await;
        if shared.bad_interface {
            self.completed = true;
            self.aborted = true;
            return false;
        }

        let mut writer = self.connection_writer.lock().await;
        if writer.corrupt {
            drop(writer);
            shared.requests.remove(&self.request_id);
            drop(shared);
            self.completed = true;
            self.aborted = true;
            return false;
        }

        let mut wire = Vec::new();
        for s in [RecordType::Stdout, RecordType::Stderr] {
            let plan = partition_bytes(&Bytes::new(), 0, s as u8, self.request_id.fcgi_id, self.sg_limit);
            for rec in &plan.records {
                wire.extend_from_slice(&rec.header);
            }
        }
        let mut end_body = Vec::with_capacity(8);
        end_body.extend_from_slice(&app_status.to_be_bytes());
        end_body.push(ProtocolStatus::RequestComplete as u8);
        end_body.extend_from_slice(&[0, 0, 0]);
        let end_header = encode_header(
            RecordType::EndRequest as u8,
            self.request_id.fcgi_id,
            end_body.len() as u16,
            0,
        );
        wire.extend_from_slice(&end_header);
        wire.extend_from_slice(&end_body);

        let write_result = writer.write_record(&wire).await;
        let keep_conn = self.keep_conn;
        match write_result {
            Ok(()) => {
                drop(writer);
                shared.requests.remove(&self.request_id);
                if !keep_conn {
                    shared.app_closure_requested.insert(self.connection);
                    mark_connection_closed_by_interface(&mut shared, self.connection);
                }
                drop(shared);
                self.notify.notify_one();
                self.completed = true;
                self.aborted = false;
                true
            }
            Err(_) => {
                writer.corrupt = true;
                drop(writer);
                shared.app_closure_requested.insert(self.connection);
                shared.requests.remove(&self.request_id);
                mark_connection_closed_by_interface(&mut shared, self.connection);
                drop(shared);
                self.notify.notify_one();
                self.completed = true;
                self.aborted = true;
                false
            }
        }
    }
}

impl Drop for RequestHandle {
    /// §4.4.3: if still outstanding, best-effort removal from the
    /// interface and a wake-up, run on a spawned task because `Drop`
    /// cannot `.await`. No-op if the interface is already gone (there is
    /// nothing left to clean up) or if called outside a Tokio runtime.
    fn drop(&mut self) {
        if self.completed || !self.interface_alive() {
            return;
        }
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            let shared = self.shared.clone();
            let notify = self.notify.clone();
            let request_id = self.request_id;
            let connection = self.connection;
            let keep_conn = self.keep_conn;
            rt.spawn(async move {
                let mut sh = shared.lock().await;
                if sh.bad_interface {
                    return;
                }
                sh.requests.remove(&request_id);
                if !keep_conn {
                    sh.app_closure_requested.insert(connection);
                    mark_connection_closed_by_interface(&mut sh, connection);
                }
                drop(sh);
                notify.notify_one();
            });
        }
    }
}
