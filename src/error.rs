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

//! Error types surfaced by the server and client interfaces.
//!
//! Narrower errors owned by leaf modules ([`crate::codec::CodecError`],
//! [`crate::id_allocator::AllocError`]) live next to the code that raises
//! them; this module holds the two top-level error enums applications
//! actually match on.

use thiserror::Error;

/// Result type alias for [`ServerConfigError`].
pub type ServerConfigResult<T> = Result<T, ServerConfigError>;

/// Fatal errors that can occur while constructing a `ServerInterface`.
///
/// None of these are recoverable; a failed construction leaves no
/// interface registered as live.
#[derive(Debug, Error)]
pub enum ServerConfigError {
    /// Another `ServerInterface` is already live in this process.
    #[error("a server interface is already live")]
    InterfaceAlreadyLive,

    /// `max_connections` or `max_requests_per_connection` was zero.
    #[error("{field} must be at least 1, got {value}")]
    InvalidLimit { field: &'static str, value: u32 },

    /// The supplied descriptor is not a listening `SOCK_STREAM` socket.
    #[error("listening socket is not a listening stream socket: {0}")]
    NotAListeningStreamSocket(String),

    /// `FCGI_WEB_SERVER_ADDRS` was set but contained no address this
    /// interface's address family could parse.
    #[error("FCGI_WEB_SERVER_ADDRS contained no valid address of the listening socket's family")]
    InvalidWebServerAddrs,

    /// An unrecoverable I/O error during construction (creating the
    /// self-pipe equivalent, querying the socket, etc).
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for [`ClientError`].
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced directly (not as queued events, see
/// [`crate::client::event::Event`]) by `ClientInterface` methods.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Wraps an unrecoverable `std::io::Error`.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// `connect` was given something that parses as neither an IPv4 nor an
    /// IPv6 literal nor a short-enough UNIX socket path.
    #[error("address `{0}` is not a valid IPv4/IPv6 literal or UNIX socket path")]
    InvalidAddress(String),

    /// `send_request`/`send_get_values`/`send_binary_management`/
    /// `send_abort` referenced a descriptor the interface has no record
    /// of.
    #[error("no connection for descriptor {0}")]
    UnknownConnection(i32),

    /// The id allocator for a connection is exhausted.
    #[error("no fcgi ids are free on connection {0}")]
    IdsExhausted(i32),

    /// A `send_get_values`/`send_binary_management` payload did not fit in
    /// a single record.
    #[error("management request body does not fit in one record")]
    ManagementRequestTooLarge,

    /// `retrieve_server_event` was called with no connection left open
    /// (§4.5.4 step 2).
    #[error("no connection is currently open")]
    NoConnections,
}
