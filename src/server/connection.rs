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

//! Per-connection write side and the write-side corruption protocol (§3
//! "Connection (server side)", §5 "Per-connection write mutex"). Record
//! parsing itself lives in [`crate::codec::RecordParser`], shared with the
//! client interface.

pub use crate::codec::{ParsedRecord, RecordParser};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;

/// The connection's shared write side: the actual socket writer paired
/// with the `corrupt` flag, so the flag is never observable outside the
/// mutex that guards the writer (§9 design notes).
pub struct ConnWriter {
    writer: Box<dyn AsyncWrite + Unpin + Send>,
    pub corrupt: bool,
}

impl ConnWriter {
    pub fn new(writer: Box<dyn AsyncWrite + Unpin + Send>) -> Self {
        Self {
            writer,
            corrupt: false,
        }
    }

    /// Writes a full record's bytes as a single `write_all`, reporting
    /// whether it completed. Partial completion must be treated by the
    /// caller as the connection-corruption case (§4.4.2): this method
    /// does not itself set `corrupt`, since the handle needs to run the
    /// shared-state-mutex-first protocol around that transition.
    pub async fn write_record(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await
    }
}

/// Per-connection server-side state: the record parser (read only by the
/// connection's own task) and the shared write mutex (§5).
pub struct Connection {
    pub parser: RecordParser,
    pub writer: Arc<AsyncMutex<ConnWriter>>,
    pub request_count: usize,
}

impl Connection {
    pub fn new(writer: Box<dyn AsyncWrite + Unpin + Send>) -> Self {
        Self {
            parser: RecordParser::new(),
            writer: Arc::new(AsyncMutex::new(ConnWriter::new(writer))),
            request_count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_starts_uncorrupted_with_empty_parser() {
        let conn = Connection::new(Box::new(tokio::io::sink()));
        assert_eq!(conn.request_count, 0);
    }
}
