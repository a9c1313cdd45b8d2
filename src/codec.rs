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

//! Pure, allocation-light encoding/decoding of FastCGI wire structures.
//!
//! This is the one module neither the server nor the client interface can
//! avoid: header framing, name-value pair length prefixes, and the
//! scatter/gather partitioning of an arbitrary byte range into a sequence
//! of records (§4.1 of the design notes). Nothing here touches a socket;
//! callers own the actual reads/writes.

use crate::protocol::{Header, HEADER_LEN, MAX_CONTENT_LENGTH, NV_FOUR_BYTE_LENGTH_MAX};
use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Errors raised while encoding or decoding FastCGI wire structures.
#[derive(Debug, Error)]
pub enum CodecError {
    /// A name or value length is negative or exceeds the 4-byte encoding's
    /// range (2^31 - 1).
    #[error("length {0} is not representable as a FastCGI name/value length")]
    InvalidLength(i64),

    /// `extract_nv_pairs` ran out of input mid-pair.
    #[error("name-value pair stream truncated")]
    TruncatedPairs,

    /// A null input pointer was paired with a nonzero or negative length.
    #[error("null input with nonzero length")]
    BadArgs,
}

type CodecResult<T> = Result<T, CodecError>;

/// Encodes an 8-byte FastCGI record header.
pub fn encode_header(
    record_type: u8, request_id: u16, content_length: u16, padding_length: u8,
) -> [u8; HEADER_LEN] {
    let id = request_id.to_be_bytes();
    let len = content_length.to_be_bytes();
    [
        crate::protocol::VERSION_1,
        record_type,
        id[0],
        id[1],
        len[0],
        len[1],
        padding_length,
        0,
    ]
}

/// Decodes an 8-byte buffer into a [`Header`].
pub fn decode_header(buf: &[u8; HEADER_LEN]) -> Header {
    Header {
        version: buf[0],
        record_type: buf[1],
        request_id: u16::from_be_bytes([buf[2], buf[3]]),
        content_length: u16::from_be_bytes([buf[4], buf[5]]),
        padding_length: buf[6],
        reserved: buf[7],
    }
}

/// Encodes a FastCGI name/value length prefix: one byte when `len` fits in
/// 7 bits, otherwise four bytes with the high bit of the first byte set.
///
/// Fails with [`CodecError::InvalidLength`] when `len` exceeds
/// `2^31 - 1`.
pub fn encode_nv_length(len: u32, out: &mut Vec<u8>) -> CodecResult<()> {
    if len > NV_FOUR_BYTE_LENGTH_MAX {
        return Err(CodecError::InvalidLength(len as i64));
    }
    if len <= 127 {
        out.push(len as u8);
    } else {
        let v = len | 0x8000_0000;
        out.extend_from_slice(&v.to_be_bytes());
    }
    Ok(())
}

/// Decodes a FastCGI name/value length prefix from the start of `input`.
///
/// Returns the decoded length and the number of bytes consumed (1 or 4).
/// Fails with [`CodecError::TruncatedPairs`] if `input` is shorter than
/// the encoding it starts to describe.
pub fn decode_nv_length(input: &[u8]) -> CodecResult<(u32, usize)> {
    let first = *input.first().ok_or(CodecError::TruncatedPairs)?;
    if first & 0x80 == 0 {
        Ok((first as u32, 1))
    } else {
        if input.len() < 4 {
            return Err(CodecError::TruncatedPairs);
        }
        let raw = u32::from_be_bytes([input[0], input[1], input[2], input[3]]);
        Ok((raw & 0x7fff_ffff, 4))
    }
}

/// Decodes a complete `FCGI_PARAMS`/`FCGI_GET_VALUES`-style name-value pair
/// stream into an ordered list of `(name, value)` pairs.
///
/// Fails with [`CodecError::TruncatedPairs`] if any length prefix or body
/// runs past the end of `content`.
pub fn extract_nv_pairs(content: &[u8]) -> CodecResult<Vec<(Bytes, Bytes)>> {
    let mut pairs = Vec::new();
    let mut pos = 0usize;
    while pos < content.len() {
        let (name_len, n) = decode_nv_length(&content[pos..])?;
        pos += n;
        let (value_len, n) = decode_nv_length(&content[pos..])?;
        pos += n;

        let name_len = name_len as usize;
        let value_len = value_len as usize;
        if pos + name_len + value_len > content.len() {
            return Err(CodecError::TruncatedPairs);
        }
        let name = Bytes::copy_from_slice(&content[pos..pos + name_len]);
        pos += name_len;
        let value = Bytes::copy_from_slice(&content[pos..pos + value_len]);
        pos += value_len;

        pairs.push((name, value));
    }
    Ok(pairs)
}

/// Encodes one name-value pair (length-prefixed name, length-prefixed
/// value, name bytes, value bytes) onto `out`.
pub fn encode_nv_pair(name: &[u8], value: &[u8], out: &mut Vec<u8>) -> CodecResult<()> {
    encode_nv_length(u32::try_from(name.len()).map_err(|_| CodecError::InvalidLength(name.len() as i64))?, out)?;
    encode_nv_length(u32::try_from(value.len()).map_err(|_| CodecError::InvalidLength(value.len() as i64))?, out)?;
    out.extend_from_slice(name);
    out.extend_from_slice(value);
    Ok(())
}

/// One record's worth of framing, ready to be written as a vectored write:
/// `header`, then `body` (possibly empty, borrowed zero-copy from the
/// original buffer via [`Bytes`]), then `padding` zero bytes.
#[derive(Debug, Clone)]
pub struct EncodedRecord {
    pub header: [u8; HEADER_LEN],
    pub body: Bytes,
    pub padding_length: u8,
}

impl EncodedRecord {
    /// Total on-wire length of this record (header + body + padding).
    pub fn total_len(&self) -> usize {
        HEADER_LEN + self.body.len() + self.padding_length as usize
    }
}

/// Result of a single [`partition_bytes`] call: the records to write, the
/// offset to resume at on a following call, and whether the whole input
/// range has now been encoded.
#[derive(Debug)]
pub struct PartitionResult {
    pub records: Vec<EncodedRecord>,
    pub next_begin: usize,
}

impl PartitionResult {
    pub fn total_bytes(&self) -> usize {
        self.records.iter().map(EncodedRecord::total_len).sum()
    }
}

/// Scatter/gather record limit for a single vectored write (§9 "Scatter/
/// gather limits"): `sysconf(_SC_IOV_MAX)` on unix, a conservative default
/// elsewhere. Shared by the server's per-connection writer and the
/// client's stream senders so both honor the same runtime limit.
#[cfg(unix)]
pub fn scatter_gather_limit() -> usize {
    let raw = unsafe { libc::sysconf(libc::_SC_IOV_MAX) };
    if raw <= 0 {
        16
    } else {
        raw as usize
    }
}

#[cfg(not(unix))]
pub fn scatter_gather_limit() -> usize {
    16
}

/// Largest content length used for a non-final chunk so that
/// `header + body` is itself a multiple of 8 and no padding is needed
/// except possibly on the last, shorter chunk (§4.1 rule i).
const ALIGNED_CHUNK_LEN: usize = MAX_CONTENT_LENGTH - HEADER_LEN + 1;

/// Partitions `data[begin..]` into a scatter/gather plan of FastCGI
/// records of the given `record_type`/`request_id`.
///
/// `sg_limit` bounds the number of iovec-equivalent slices
/// ([`EncodedRecord`]s count as up to 2 slices: header and body); one slot
/// is always implicitly reserved so a trailing padding buffer never
/// overruns the caller's real scatter/gather limit when these records are
/// flattened into a vectored write.
///
/// When `begin == data.len()` (including the case of an empty `data`),
/// exactly one header-only record is emitted: the stream terminator.
/// `next_begin` equals `data.len()` iff the entire range was encoded by
/// this call.
pub fn partition_bytes(
    data: &Bytes, begin: usize, record_type: u8, request_id: u16, sg_limit: usize,
) -> PartitionResult {
    assert!(begin <= data.len());

    // Each chunk may need up to 3 slices (header, body, padding); always
    // leave room for at least one chunk even under a pathological limit.
    let max_chunks = ((sg_limit.saturating_sub(1)) / 3).max(1);

    if begin == data.len() {
        let header = encode_header(record_type, request_id, 0, 0);
        return PartitionResult {
            records: vec![EncodedRecord {
                header,
                body: Bytes::new(),
                padding_length: 0,
            }],
            next_begin: begin,
        };
    }

    let mut records = Vec::new();
    let mut pos = begin;
    while pos < data.len() && records.len() < max_chunks {
        let remaining = data.len() - pos;
        let chunk_len = if remaining > ALIGNED_CHUNK_LEN {
            ALIGNED_CHUNK_LEN
        } else {
            remaining.min(MAX_CONTENT_LENGTH)
        };
        let padding_length = Header::padding_for(chunk_len);
        let header = encode_header(record_type, request_id, chunk_len as u16, padding_length);
        records.push(EncodedRecord {
            header,
            body: data.slice(pos..pos + chunk_len),
            padding_length,
        });
        pos += chunk_len;
    }

    PartitionResult {
        records,
        next_begin: pos,
    }
}

/// Serializes `pairs` as a FastCGI name-value stream and partitions it
/// exactly like [`partition_bytes`].
///
/// Fails if any single name or value exceeds `2^31 - 1` bytes.
pub fn encode_name_value_pairs(
    pairs: &[(Bytes, Bytes)], record_type: u8, request_id: u16, sg_limit: usize,
) -> CodecResult<PartitionResult> {
    let mut content = Vec::new();
    for (name, value) in pairs {
        encode_nv_pair(name, value, &mut content)?;
    }
    let content = Bytes::from(content);
    Ok(partition_bytes(&content, 0, record_type, request_id, sg_limit))
}

/// A fully decoded record: header plus its content (padding already
/// consumed and discarded).
#[derive(Debug, Clone)]
pub struct ParsedRecord {
    pub header: Header,
    pub content: Bytes,
}

#[derive(Debug)]
enum Phase {
    Header,
    Content,
    Padding,
}

/// Incremental FastCGI record parser: feed it raw bytes as they arrive on
/// a socket, get back zero or more complete records.
///
/// Shared by the server's per-connection reader and the client's
/// `retrieve_server_event` loop (§3 "Connection (server side)" / "Connection
/// (client side)" both describe the same parser state shape). Content is
/// always buffered in full before a record is yielded (every record body
/// is at most 65535 bytes by construction); the original `a-components`
/// parser avoids this copy for `FCGI_PARAMS`/`FCGI_STDIN`/`FCGI_DATA` by
/// appending straight into the request's buffers, but the bounded size
/// makes the copy here immaterial and keeps one parser implementation for
/// every record type (see DESIGN.md).
#[derive(Debug)]
pub struct RecordParser {
    phase: Phase,
    header_buf: [u8; HEADER_LEN],
    header_have: usize,
    current_header: Option<Header>,
    content_buf: BytesMut,
    padding_remaining: usize,
}

impl Default for RecordParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordParser {
    pub fn new() -> Self {
        Self {
            phase: Phase::Header,
            header_buf: [0; HEADER_LEN],
            header_have: 0,
            current_header: None,
            content_buf: BytesMut::new(),
            padding_remaining: 0,
        }
    }

    /// Feeds newly read bytes into the parser, returning every record that
    /// became complete as a result.
    pub fn feed(&mut self, mut input: &[u8]) -> Vec<ParsedRecord> {
        let mut out = Vec::new();
        while !input.is_empty() {
            match self.phase {
                Phase::Header => {
                    let need = HEADER_LEN - self.header_have;
                    let take = need.min(input.len());
                    self.header_buf[self.header_have..self.header_have + take]
                        .copy_from_slice(&input[..take]);
                    self.header_have += take;
                    input = &input[take..];

                    if self.header_have == HEADER_LEN {
                        let header = decode_header(&self.header_buf);
                        self.header_have = 0;
                        self.content_buf = BytesMut::with_capacity(header.content_length as usize);
                        self.padding_remaining = header.padding_length as usize;
                        self.current_header = Some(header);
                        self.phase = if header.content_length > 0 {
                            Phase::Content
                        } else if self.padding_remaining > 0 {
                            Phase::Padding
                        } else {
                            self.emit(&mut out);
                            Phase::Header
                        };
                    }
                }
                Phase::Content => {
                    let header = self.current_header.expect("header set in Content phase");
                    let need = header.content_length as usize - self.content_buf.len();
                    let take = need.min(input.len());
                    self.content_buf.extend_from_slice(&input[..take]);
                    input = &input[take..];

                    if self.content_buf.len() == header.content_length as usize {
                        self.phase = if self.padding_remaining > 0 {
                            Phase::Padding
                        } else {
                            self.emit(&mut out);
                            Phase::Header
                        };
                    }
                }
                Phase::Padding => {
                    let take = self.padding_remaining.min(input.len());
                    self.padding_remaining -= take;
                    input = &input[take..];

                    if self.padding_remaining == 0 {
                        self.emit(&mut out);
                        self.phase = Phase::Header;
                    }
                }
            }
        }
        out
    }

    fn emit(&mut self, out: &mut Vec<ParsedRecord>) {
        let header = self.current_header.take().expect("header set when emitting");
        out.push(ParsedRecord {
            header,
            content: self.content_buf.split().freeze(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RecordType;
    use std::collections::HashMap;

    #[test]
    fn header_round_trips() {
        for &(t, id, len, pad) in &[
            (RecordType::Stdout as u8, 0u16, 0u16, 0u8),
            (RecordType::Params as u8, 65535u16, 65535u16, 255u8),
            (RecordType::BeginRequest as u8, 1u16, 8u16, 0u8),
        ] {
            let buf = encode_header(t, id, len, pad);
            let header = decode_header(&buf);
            assert_eq!(header.version, 1);
            assert_eq!(header.record_type, t);
            assert_eq!(header.request_id, id);
            assert_eq!(header.content_length, len);
            assert_eq!(header.padding_length, pad);
        }
    }

    #[test]
    fn nv_length_short_form_round_trips() {
        for len in [0u32, 1, 127] {
            let mut buf = Vec::new();
            encode_nv_length(len, &mut buf).unwrap();
            assert_eq!(buf.len(), 1);
            let (decoded, consumed) = decode_nv_length(&buf).unwrap();
            assert_eq!(decoded, len);
            assert_eq!(consumed, 1);
        }
    }

    #[test]
    fn nv_length_long_form_round_trips() {
        for len in [128u32, 256, 65536, (1 << 31) - 2, (1 << 31) - 1] {
            let mut buf = Vec::new();
            encode_nv_length(len, &mut buf).unwrap();
            assert_eq!(buf.len(), 4);
            let (decoded, consumed) = decode_nv_length(&buf).unwrap();
            assert_eq!(decoded, len);
            assert_eq!(consumed, 4);
        }
    }

    #[test]
    fn nv_length_rejects_overflow() {
        assert!(encode_nv_length(1 << 31, &mut Vec::new()).is_err());
    }

    #[test]
    fn nv_pairs_round_trip_through_extract() {
        let mut map = HashMap::new();
        map.insert(Bytes::from_static(b"QUERY_STRING"), Bytes::from_static(b"a=1&b=2"));
        map.insert(Bytes::from_static(b"SHORT"), Bytes::from_static(b""));
        let long_value = Bytes::from(vec![b'x'; 300]);
        map.insert(Bytes::from_static(b"LONG"), long_value.clone());

        let pairs: Vec<_> = map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let mut content = Vec::new();
        for (name, value) in &pairs {
            encode_nv_pair(name, value, &mut content).unwrap();
        }

        let decoded = extract_nv_pairs(&content).unwrap();
        let decoded_map: HashMap<_, _> = decoded.into_iter().collect();
        assert_eq!(decoded_map, map);
    }

    #[test]
    fn extract_nv_pairs_rejects_truncation() {
        // Name length says 5 bytes but only 2 are present.
        let content = vec![5u8, 0, b'a', b'b'];
        assert!(matches!(
            extract_nv_pairs(&content),
            Err(CodecError::TruncatedPairs)
        ));
    }

    #[test]
    fn partition_bytes_empty_range_emits_terminator() {
        let data = Bytes::new();
        let plan = partition_bytes(&data, 0, RecordType::Stdin as u8, 1, 1024);
        assert_eq!(plan.records.len(), 1);
        assert_eq!(plan.records[0].body.len(), 0);
        assert_eq!(plan.next_begin, 0);
    }

    #[test]
    fn partition_bytes_preserves_content_and_alignment() {
        let data = Bytes::from(vec![7u8; 200_000]);
        let mut begin = 0;
        let mut reassembled = Vec::new();
        loop {
            let plan = partition_bytes(&data, begin, RecordType::Stdout as u8, 3, 16);
            for rec in &plan.records {
                assert!(rec.body.len() <= MAX_CONTENT_LENGTH);
                assert_eq!(rec.total_len() % 8, 0);
                reassembled.extend_from_slice(&rec.body);
            }
            begin = plan.next_begin;
            if begin == data.len() {
                break;
            }
        }
        assert_eq!(reassembled, data.to_vec());
    }

    #[test]
    fn encode_nv_pair_rejects_oversized_name_length() {
        // Actually allocating a name past NV_FOUR_BYTE_LENGTH_MAX is
        // impractical; go through the length-prefix path directly.
        assert!(matches!(
            encode_nv_length(NV_FOUR_BYTE_LENGTH_MAX + 1, &mut Vec::new()),
            Err(CodecError::InvalidLength(_))
        ));
    }

    #[test]
    fn parser_parses_header_only_record() {
        let mut parser = RecordParser::new();
        let bytes = encode_header(RecordType::Stdin as u8, 7, 0, 0);
        let records = parser.feed(&bytes);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].header.request_id, 7);
        assert_eq!(records[0].content.len(), 0);
    }

    #[test]
    fn parser_parses_record_split_across_many_feeds() {
        let data = Bytes::from_static(b"hello fastcgi");
        let plan = partition_bytes(&data, 0, RecordType::Stdin as u8, 1, 1024);
        let mut wire = Vec::new();
        for rec in &plan.records {
            wire.extend_from_slice(&rec.header);
            wire.extend_from_slice(&rec.body);
            wire.extend(std::iter::repeat(0u8).take(rec.padding_length as usize));
        }

        let mut parser = RecordParser::new();
        let mut records = Vec::new();
        for byte in wire {
            records.extend(parser.feed(&[byte]));
        }
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].content, data);
    }

    #[test]
    fn parser_parses_several_records_fed_at_once() {
        let a = Bytes::from_static(b"one");
        let b = Bytes::from_static(b"two");
        let mut wire = Vec::new();
        for (data, id) in [(&a, 1u16), (&b, 2u16)] {
            let plan = partition_bytes(data, 0, RecordType::Stdout as u8, id, 1024);
            for rec in &plan.records {
                wire.extend_from_slice(&rec.header);
                wire.extend_from_slice(&rec.body);
                wire.extend(std::iter::repeat(0u8).take(rec.padding_length as usize));
            }
        }
        let mut parser = RecordParser::new();
        let records = parser.feed(&wire);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].content, a);
        assert_eq!(records[1].content, b);
    }
}
