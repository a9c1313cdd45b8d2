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

//! Identifies one FastCGI request as the pair of its connection and its
//! `fcgi_id` on that connection.

use std::fmt;

/// `(connection_descriptor, fcgi_id)`. Ordering is lexicographic: by
/// connection first, then by id.
///
/// `fcgi_id == 0` is reserved for management records and never names an
/// application request; [`RequestId::NULL`] uses it to mean "no request".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId {
    pub connection: i32,
    pub fcgi_id: u16,
}

impl RequestId {
    /// The null request id: `(0, 0)`.
    pub const NULL: RequestId = RequestId {
        connection: 0,
        fcgi_id: 0,
    };

    pub fn new(connection: i32, fcgi_id: u16) -> Self {
        Self { connection, fcgi_id }
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.connection, self.fcgi_id)
    }
}
