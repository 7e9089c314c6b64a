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

//! FastCGI protocol records, server side.
//!
//! This module contains the structures and constants used for parsing
//! incoming FastCGI v1.0 records (`BEGIN_REQUEST`, `PARAMS`, `STDIN`)
//! and generating outgoing ones (`STDOUT`, `END_REQUEST`).

use crate::{Error, Result};
use std::io::{self, Write};

/// FastCGI protocol version 1.
pub(crate) const VERSION_1: u8 = 1;
/// Maximum length for FastCGI record content.
pub(crate) const MAX_CONTENT: usize = 0xffff;
/// Length of a FastCGI record header in bytes.
pub(crate) const HEADER_LEN: usize = 8;
/// The only role this responder implements (FastCGI v1.0, section 6.2).
pub(crate) const ROLE_RESPONDER: u16 = 1;

/// FastCGI record types as defined in the protocol specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum RecordType {
    /// Begin request record type
    BeginRequest = 1,
    /// Abort request record type
    AbortRequest = 2,
    /// End request record type
    EndRequest = 3,
    /// Parameters record type
    Params = 4,
    /// Stdin record type
    Stdin = 5,
    /// Stdout record type
    Stdout = 6,
    /// Stderr record type
    Stderr = 7,
    /// Data record type
    Data = 8,
    /// Get values record type
    GetValues = 9,
    /// Get values result record type
    GetValuesResult = 10,
    /// Unknown type record type
    UnknownType = 11,
}

impl RecordType {
    /// Converts a u8 value to RecordType.
    pub(crate) fn from_u8(u: u8) -> Self {
        match u {
            1 => RecordType::BeginRequest,
            2 => RecordType::AbortRequest,
            3 => RecordType::EndRequest,
            4 => RecordType::Params,
            5 => RecordType::Stdin,
            6 => RecordType::Stdout,
            7 => RecordType::Stderr,
            8 => RecordType::Data,
            9 => RecordType::GetValues,
            10 => RecordType::GetValuesResult,
            _ => RecordType::UnknownType,
        }
    }
}

/// FastCGI protocol status codes carried by `END_REQUEST`.
#[derive(Debug, Clone, Copy)]
#[repr(u8)]
#[allow(dead_code)]
pub(crate) enum ProtocolStatus {
    /// Request completed successfully
    RequestComplete = 0,
    /// This app can't multiplex connections
    CantMpxConn = 1,
    /// New request rejected; too busy
    Overloaded = 2,
    /// Role value not known
    UnknownRole = 3,
}

/// The FastCGI record header.
#[derive(Debug, Clone)]
pub(crate) struct Header {
    /// FastCGI protocol version
    pub(crate) version: u8,
    /// Type of the FastCGI record
    pub(crate) rtype: RecordType,
    /// Request ID for this record
    pub(crate) request_id: u16,
    /// Length of the content data
    pub(crate) content_length: u16,
    /// Length of padding data
    pub(crate) padding_length: u8,
}

impl Header {
    /// Creates a header for outgoing content, padded to an 8-byte
    /// multiple.
    pub(crate) fn new(rtype: RecordType, request_id: u16, content: &[u8]) -> Self {
        let content_length = content.len().min(MAX_CONTENT);
        Self {
            version: VERSION_1,
            rtype,
            request_id,
            content_length: content_length as u16,
            padding_length: (content_length.wrapping_neg() & 7) as u8,
        }
    }

    /// Parses a header from the wire representation.
    ///
    /// The version is checked here because every record shares the
    /// requirement; type and request-id checks belong to the caller.
    pub(crate) fn parse(buf: &[u8; HEADER_LEN]) -> Result<Self> {
        if buf[0] != VERSION_1 {
            tracing::warn!(version = buf[0], "FastCGI: bad header version (want 1)");
            return Err(Error::Malformed("bad FastCGI version"));
        }
        Ok(Self {
            version: buf[0],
            rtype: RecordType::from_u8(buf[1]),
            request_id: u16::from_be_bytes([buf[2], buf[3]]),
            content_length: u16::from_be_bytes([buf[4], buf[5]]),
            padding_length: buf[6],
        })
    }

    /// Serializes the header into its wire representation.
    pub(crate) fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let rid = self.request_id.to_be_bytes();
        let len = self.content_length.to_be_bytes();
        [
            self.version,
            self.rtype as u8,
            rid[0],
            rid[1],
            len[0],
            len[1],
            self.padding_length,
            0,
        ]
    }
}

/// Begin request record body data (FastCGI v1.0, section 5.1).
#[derive(Debug)]
pub(crate) struct BeginRequestBody {
    /// The requested application role
    pub(crate) role: u16,
    /// Flags byte (bit 0 = keep alive flag)
    pub(crate) flags: u8,
}

impl BeginRequestBody {
    /// Parses the begin request body from record content.
    pub(crate) fn parse(content: &[u8]) -> Result<Self> {
        if content.len() < 8 {
            return Err(Error::Malformed("short FastCGI begin-request body"));
        }
        Ok(Self {
            role: u16::from_be_bytes([content[0], content[1]]),
            flags: content[2],
        })
    }
}

/// Decode one FastCGI name-value length at `pos`.
///
/// A set high bit on the first byte selects the four-byte network-order
/// form with the high bit cleared; otherwise the single byte is the
/// length (FastCGI v1.0, section 3.4).
pub(crate) fn nv_length(buf: &[u8], pos: &mut usize) -> Result<usize> {
    let b = *buf
        .get(*pos)
        .ok_or(Error::Malformed("truncated FastCGI parameter data"))?;
    if b >> 7 != 0 {
        if buf.len() - *pos <= 3 {
            return Err(Error::Malformed("truncated FastCGI parameter length"));
        }
        let len = (((b & 0x7f) as usize) << 24)
            + ((buf[*pos + 1] as usize) << 16)
            + ((buf[*pos + 2] as usize) << 8)
            + buf[*pos + 3] as usize;
        *pos += 4;
        Ok(len)
    } else {
        *pos += 1;
        Ok(b as usize)
    }
}

/// Write `content` as a sequence of records of the given type.
///
/// The stream is broken into chunks of at most [`MAX_CONTENT`] bytes,
/// each padded to an 8-byte multiple.  Empty content emits exactly one
/// zero-length record, which is how a FastCGI stream is closed.
pub(crate) fn write_stream<W: Write>(
    w: &mut W,
    rtype: RecordType,
    request_id: u16,
    content: &[u8],
) -> io::Result<()> {
    const PAD: [u8; 8] = [0; 8];
    let mut rest = content;
    loop {
        let take = rest.len().min(MAX_CONTENT);
        let (chunk, tail) = rest.split_at(take);
        let header = Header::new(rtype, request_id, chunk);
        w.write_all(&header.to_bytes())?;
        w.write_all(chunk)?;
        w.write_all(&PAD[..header.padding_length as usize])?;
        rest = tail;
        if rest.is_empty() {
            break;
        }
    }
    Ok(())
}

/// Write the `END_REQUEST` record that completes a response.
pub(crate) fn write_end_request<W: Write>(
    w: &mut W,
    request_id: u16,
    app_status: u32,
) -> io::Result<()> {
    let mut body = [0u8; 8];
    body[..4].copy_from_slice(&app_status.to_be_bytes());
    body[4] = ProtocolStatus::RequestComplete as u8;
    let header = Header::new(RecordType::EndRequest, request_id, &body);
    w.write_all(&header.to_bytes())?;
    w.write_all(&body)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let h = Header::new(RecordType::Stdout, 7, &[0u8; 13]);
        assert_eq!(h.content_length, 13);
        assert_eq!(h.padding_length, 3);
        let parsed = Header::parse(&h.to_bytes()).unwrap();
        assert_eq!(parsed.rtype, RecordType::Stdout);
        assert_eq!(parsed.request_id, 7);
        assert_eq!(parsed.content_length, 13);
        assert_eq!(parsed.padding_length, 3);
    }

    #[test]
    fn bad_version_rejected() {
        let mut raw = Header::new(RecordType::Stdin, 1, b"").to_bytes();
        raw[0] = 9;
        assert!(Header::parse(&raw).is_err());
    }

    #[test]
    fn nv_length_forms() {
        let mut pos = 0;
        assert_eq!(nv_length(&[0x7f], &mut pos).unwrap(), 127);
        assert_eq!(pos, 1);

        let mut pos = 0;
        let buf = [0x80, 0x00, 0x01, 0x00];
        assert_eq!(nv_length(&buf, &mut pos).unwrap(), 256);
        assert_eq!(pos, 4);
    }

    #[test]
    fn nv_length_truncated_is_malformed() {
        // High bit set but only two further bytes available.
        let mut pos = 0;
        assert!(nv_length(&[0x81, 0x00, 0x01], &mut pos).is_err());
    }

    #[test]
    fn stream_chunks_and_pads() {
        let mut out = Vec::new();
        write_stream(&mut out, RecordType::Stdout, 3, &vec![b'x'; MAX_CONTENT + 1]).unwrap();
        // First record: full content, pad to 8 (0xffff -> 1 byte pad).
        let first = Header::parse(out[..8].try_into().unwrap()).unwrap();
        assert_eq!(first.content_length as usize, MAX_CONTENT);
        assert_eq!(first.padding_length, 1);
        let second_off = 8 + MAX_CONTENT + 1;
        let second = Header::parse(out[second_off..second_off + 8].try_into().unwrap()).unwrap();
        assert_eq!(second.content_length, 1);
        assert_eq!(second.padding_length, 7);
        assert_eq!(out.len(), second_off + 8 + 1 + 7);
    }

    #[test]
    fn zero_length_stream_closes() {
        let mut out = Vec::new();
        write_stream(&mut out, RecordType::Stdout, 1, b"").unwrap();
        let h = Header::parse(out[..8].try_into().unwrap()).unwrap();
        assert_eq!(h.content_length, 0);
        assert_eq!(h.padding_length, 0);
        assert_eq!(out.len(), 8);
    }
}
