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

//! Per-request accumulator owned by the interface until a [`RequestHandle`]
//! is built from it (§3 "RequestData").
//!
//! [`RequestHandle`]: crate::server::handle::RequestHandle

use bytes::{Bytes, BytesMut};
use std::collections::HashMap;

/// Whether a request is still waiting to be handed to the application, or
/// has already been turned into a `RequestHandle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Assigned,
}

/// Everything the server interface accumulates for one request before (and,
/// for the input buffers, momentarily after) it is handed to the
/// application as a [`RequestHandle`](crate::server::handle::RequestHandle).
#[derive(Debug)]
pub struct RequestData {
    pub role: u16,
    pub keep_conn: bool,

    pub params_raw: BytesMut,
    pub stdin: BytesMut,
    pub data: BytesMut,

    pub params_done: bool,
    pub stdin_done: bool,
    pub data_done: bool,

    /// Only meaningful once `params_done` and decoding of `params_raw`
    /// succeeded.
    pub params_parsed: HashMap<Bytes, Bytes>,

    pub status: RequestStatus,

    pub client_aborted: bool,
    pub connection_closed_by_interface: bool,
}

impl RequestData {
    pub fn new(role: u16, keep_conn: bool) -> Self {
        Self {
            role,
            keep_conn,
            params_raw: BytesMut::new(),
            stdin: BytesMut::new(),
            data: BytesMut::new(),
            params_done: false,
            stdin_done: false,
            data_done: false,
            params_parsed: HashMap::new(),
            status: RequestStatus::Pending,
            client_aborted: false,
            connection_closed_by_interface: false,
        }
    }

    /// A request is complete iff all three streams have been terminated
    /// and its params decoded successfully (§3 invariant).
    pub fn all_streams_done(&self) -> bool {
        self.params_done && self.stdin_done && self.data_done
    }
}
