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

//! Wire-level constants shared by the server and client interfaces.
//!
//! Everything here is a direct restatement of the FastCGI 1.0 record
//! framing (see the protocol summary in the crate's top-level docs):
//! fixed sizes, type tags, role and protocol-status codes, and the
//! well-known `FCGI_GET_VALUES` variable names.

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use std::fmt;

/// FastCGI protocol version this crate speaks.
pub const VERSION_1: u8 = 1;

/// Length in bytes of the fixed FastCGI record header.
pub const HEADER_LEN: usize = 8;

/// Largest content length a single record body may carry.
pub const MAX_CONTENT_LENGTH: usize = 0xffff;

/// Largest padding length a single record may carry.
pub const MAX_PADDING_LENGTH: usize = 0xff;

/// `FCGI_NULL_REQUEST_ID`: the id reserved for management records.
pub const NULL_REQUEST_ID: u16 = 0;

/// Bit 0 of `BeginRequestBody::flags`: keep the connection open after the
/// request completes.
pub const FCGI_KEEP_CONN: u8 = 1;

/// Largest length a name or value may have under the 1-byte length
/// encoding (values above this use the 4-byte form).
pub const NV_SINGLE_BYTE_LENGTH_MAX: u32 = (1 << 7) - 1;

/// Largest length a name or value may have at all.
pub const NV_FOUR_BYTE_LENGTH_MAX: u32 = (1 << 31) - 1;

/// Record types as defined by the FastCGI 1.0 protocol.
///
/// Values 1-11 are the only ones a conforming implementation emits or
/// recognizes; anything else on the wire is reported as
/// [`RecordType::Unknown`] carrying the raw byte (§4.3.3 "Unknown
/// management type").
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum RecordType {
    BeginRequest = 1,
    AbortRequest = 2,
    EndRequest = 3,
    Params = 4,
    Stdin = 5,
    Stdout = 6,
    Stderr = 7,
    Data = 8,
    GetValues = 9,
    GetValuesResult = 10,
    UnknownType = 11,
}

impl RecordType {
    /// Converts a raw header byte into a known type, or `None` when the
    /// byte does not name a type this protocol version defines.
    pub fn from_byte(b: u8) -> Option<Self> {
        FromPrimitive::from_u8(b)
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Application roles a `FCGI_BEGIN_REQUEST` record may select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u16)]
pub enum Role {
    Responder = 1,
    Authorizer = 2,
    Filter = 3,
}

impl Role {
    pub fn from_u16(v: u16) -> Option<Self> {
        FromPrimitive::from_u16(v)
    }
}

/// `protocolStatus` values carried by `FCGI_END_REQUEST`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum ProtocolStatus {
    RequestComplete = 0,
    CantMpxConn = 1,
    Overloaded = 2,
    UnknownRole = 3,
}

impl ProtocolStatus {
    pub fn from_byte(b: u8) -> Option<Self> {
        FromPrimitive::from_u8(b)
    }
}

/// Well-known `FCGI_GET_VALUES` variable names (§6).
pub const FCGI_MAX_CONNS: &[u8] = b"FCGI_MAX_CONNS";
pub const FCGI_MAX_REQS: &[u8] = b"FCGI_MAX_REQS";
pub const FCGI_MPXS_CONNS: &[u8] = b"FCGI_MPXS_CONNS";

/// The decoded fixed 8-byte record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    /// Raw type byte; use [`RecordType::from_byte`] to classify it.
    pub record_type: u8,
    pub request_id: u16,
    pub content_length: u16,
    pub padding_length: u8,
    pub reserved: u8,
}

impl Header {
    /// Padding needed to round `content_length` up to a multiple of 8.
    pub fn padding_for(content_length: usize) -> u8 {
        ((8 - (content_length % 8)) % 8) as u8
    }
}

/// Body of a decoded `FCGI_BEGIN_REQUEST` record.
#[derive(Debug, Clone, Copy)]
pub struct BeginRequestBody {
    pub role: u16,
    pub flags: u8,
}

impl BeginRequestBody {
    pub fn keep_conn(&self) -> bool {
        self.flags & FCGI_KEEP_CONN != 0
    }
}

/// Body of a decoded/encoded `FCGI_END_REQUEST` record.
#[derive(Debug, Clone, Copy)]
pub struct EndRequestBody {
    pub app_status: u32,
    pub protocol_status: u8,
}
