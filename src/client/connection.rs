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

//! Per-descriptor client state (§3 "Connection (client side)"): the
//! transport, the request-id allocator, the record parser, and the
//! management FIFO.

use crate::client::event::ManagementEntry;
use crate::codec::RecordParser;
use crate::id_allocator::IdAllocator;
use std::collections::{HashSet, VecDeque};
use std::os::unix::io::AsRawFd;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UnixStream};

/// The two transports `ClientInterface::connect` can produce. Both
/// implement the handful of operations the send/receive paths need;
/// `tokio`'s `readable`/`try_read` are inherent rather than trait methods,
/// so this thin enum dispatches by hand instead of boxing a trait object.
pub(crate) enum Transport {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Transport {
    pub(crate) fn as_raw_fd(&self) -> i32 {
        match self {
            Transport::Tcp(s) => s.as_raw_fd(),
            Transport::Unix(s) => s.as_raw_fd(),
        }
    }

    pub(crate) async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Transport::Tcp(s) => s.write_all(buf).await,
            Transport::Unix(s) => s.write_all(buf).await,
        }
    }

    pub(crate) async fn readable(&self) -> std::io::Result<()> {
        match self {
            Transport::Tcp(s) => s.readable().await,
            Transport::Unix(s) => s.readable().await,
        }
    }

    pub(crate) fn try_read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Transport::Tcp(s) => s.try_read(buf),
            Transport::Unix(s) => s.try_read(buf),
        }
    }
}

/// Everything the client keeps for one connected (or recently connected)
/// descriptor.
///
/// `transport` is `None` once the descriptor has actually been closed
/// (explicitly via `close_connection`, or because the peer closed its end
/// and the read side observed EOF); the rest of the entry can still be
/// kept around afterward purely to track `completed_unreleased` ids
/// (§4.5.7).
pub(crate) struct ClientConnection {
    pub(crate) transport: Option<Transport>,
    pub(crate) connected: bool,
    pub(crate) id_alloc: IdAllocator<u16>,
    pub(crate) parser: RecordParser,
    pub(crate) management_fifo: VecDeque<ManagementEntry>,
    /// Request ids this connection completed but the application has not
    /// yet released (§4.5.7, §4.6 "Id uniqueness").
    pub(crate) completed_unreleased: HashSet<u16>,
}

impl ClientConnection {
    pub(crate) fn new(transport: Transport) -> Self {
        Self {
            transport: Some(transport),
            connected: true,
            id_alloc: IdAllocator::new(u16::MAX),
            parser: RecordParser::new(),
            management_fifo: VecDeque::new(),
            completed_unreleased: HashSet::new(),
        }
    }

    /// Marks this entry closed: drops the transport (closing the
    /// descriptor) and clears anything that only makes sense while
    /// connected.
    pub(crate) fn mark_closed(&mut self) {
        self.transport = None;
        self.connected = false;
        self.management_fifo.clear();
    }

    /// Whether the per-descriptor entry can be dropped entirely: not
    /// connected, and nothing outstanding still needs this state (§4.5.7).
    pub(crate) fn is_dead(&self) -> bool {
        !self.connected && self.completed_unreleased.is_empty()
    }
}
