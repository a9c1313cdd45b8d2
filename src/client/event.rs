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

//! Request/response value types and the typed event queue (§4.5, §4.6).

use crate::protocol::ProtocolStatus;
use crate::request_id::RequestId;
use bytes::Bytes;
use std::collections::HashMap;

/// An outgoing application request, as handed to
/// [`crate::client::ClientInterface::send_request`].
///
/// `role` selects `FCGI_RESPONDER`/`FCGI_AUTHORIZER`/`FCGI_FILTER`;
/// `params` becomes the `FCGI_PARAMS` environment stream.
#[derive(Debug, Clone)]
pub struct FcgiRequest {
    pub role: u16,
    pub keep_conn: bool,
    pub params: HashMap<Bytes, Bytes>,
    pub stdin: Bytes,
    pub data: Bytes,
}

impl FcgiRequest {
    pub fn responder(params: HashMap<Bytes, Bytes>, stdin: Bytes) -> Self {
        Self {
            role: crate::protocol::Role::Responder as u16,
            keep_conn: false,
            params,
            stdin,
            data: Bytes::new(),
        }
    }
}

/// A completed request's gathered response, moved out of the connection's
/// pending-request table once `FCGI_END_REQUEST` arrives (§4.5.6).
#[derive(Debug, Clone)]
pub struct FcgiResponse {
    pub request: RequestId,
    pub stdout: Bytes,
    pub stderr: Bytes,
    pub app_status: u32,
    pub protocol_status: ProtocolStatus,
}

/// One ready-to-pop entry of a connection's management FIFO (§4.5.3):
/// either a `FCGI_GET_VALUES` query (whose requested names are kept so
/// [`Event::GetValuesResult`] can be matched to its request) or an
/// arbitrary `send_binary_management` payload (kept only for its type
/// byte, reported back via [`Event::UnknownType`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ManagementEntry {
    GetValues,
    Binary,
}

/// Typed events surfaced by
/// [`crate::client::ClientInterface::retrieve_server_event`] (§4.5.4,
/// §4.6).
#[derive(Debug, Clone)]
pub enum Event {
    /// A request ran to completion with a well-formed `FCGI_END_REQUEST`.
    FcgiResponse(FcgiResponse),

    /// A record failed header validation (§4.5.5) or carried a protocol
    /// status this crate does not define (§4.5.6).
    InvalidRecord { connection: i32, detail: String },

    /// `FCGI_GET_VALUES_RESULT` arrived for the oldest pending
    /// `send_get_values` call. `corrupt` is set when the body failed to
    /// decode as name-value pairs, was empty, or contained a duplicate
    /// name (§9 "Name-value duplicates on GET_VALUES_RESULT") — `values`
    /// is then whatever the decode produced before the failure, possibly
    /// empty.
    GetValuesResult {
        connection: i32,
        values: HashMap<Bytes, Bytes>,
        corrupt: bool,
    },

    /// `FCGI_UNKNOWN_TYPE` arrived in answer to a `send_binary_management`
    /// call; `unknown_type` is the record type the server did not
    /// recognize.
    UnknownType { connection: i32, unknown_type: u8 },

    /// The peer closed (or this interface closed) a connection.
    ConnectionClosure { connection: i32 },
}
