//! Wire-header codec.
//!
//! Messages on the substrate carry an optional MIME-ish header block in
//! front of the payload:
//!
//! ```text
//! NATS/1.0\r\n
//! Key: Value\r\n
//! Other-Key: Value\r\n
//! \r\n
//! <payload bytes>
//! ```
//!
//! This module is the single encode/decode pair for that block. Reserved
//! `$memphis_*` keys are recognized only through [`StationHeaders`]; nothing
//! else in the crate inspects raw header bytes.

use std::collections::BTreeMap;

use bytes::Bytes;
use thiserror::Error;

use crate::constants::{
    DLS_PRODUCER_MARKER, HDR_CONNECTION_ID, HDR_PRODUCED_BY, RESERVED_HDR_PREFIX,
};

const HDR_LINE: &str = "NATS/1.0";
const CRLF: &str = "\r\n";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeaderError {
    #[error("could not decode header")]
    BadHeader,
}

/// An ordered string-to-string header mapping.
///
/// Keys are opaque to the broker except for the reserved `$memphis` prefix.
/// A `BTreeMap` keeps encoding deterministic, which matters for the
/// substrate's producer-dedup window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap(BTreeMap<String, String>);

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Remove every reserved `$memphis*` key. Human-facing surfaces never
    /// expose reserved headers.
    pub fn strip_reserved(&mut self) {
        self.0.retain(|k, _| !k.starts_with(RESERVED_HDR_PREFIX));
    }

    /// Encode into a wire header block, including the trailing blank line.
    /// An empty map encodes to an empty buffer.
    pub fn encode(&self) -> Bytes {
        if self.0.is_empty() {
            return Bytes::new();
        }
        let mut out = String::with_capacity(32 + self.0.len() * 24);
        out.push_str(HDR_LINE);
        out.push_str(CRLF);
        for (k, v) in &self.0 {
            out.push_str(k);
            out.push_str(": ");
            out.push_str(v);
            out.push_str(CRLF);
        }
        out.push_str(CRLF);
        Bytes::from(out)
    }

    /// Decode a wire header block. Tolerates a missing block (empty input)
    /// and an inlined status token after the version line, which the
    /// substrate uses for flow-control replies.
    pub fn decode(buf: &[u8]) -> Result<Self, HeaderError> {
        if buf.is_empty() {
            return Ok(Self::default());
        }
        let text = std::str::from_utf8(buf).map_err(|_| HeaderError::BadHeader)?;
        let mut lines = text.split(CRLF);
        let first = lines.next().ok_or(HeaderError::BadHeader)?;
        if !first.starts_with(HDR_LINE) {
            return Err(HeaderError::BadHeader);
        }

        let mut map = BTreeMap::new();
        // Inlined status, e.g. "NATS/1.0 409 Exceeded MaxWaiting".
        let status = first[HDR_LINE.len()..].trim();
        if !status.is_empty() {
            let (code, descr) = match status.split_once(' ') {
                Some((c, d)) => (c, d.trim()),
                None => (status, ""),
            };
            map.insert("Status".to_string(), code.to_string());
            if !descr.is_empty() {
                map.insert("Description".to_string(), descr.to_string());
            }
        }

        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (key, value) = line.split_once(':').ok_or(HeaderError::BadHeader)?;
            if key.is_empty() {
                continue;
            }
            map.insert(key.to_string(), value.trim_start().to_string());
        }
        Ok(Self(map))
    }

    pub fn from_pairs<K: Into<String>, V: Into<String>>(
        pairs: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn into_inner(self) -> BTreeMap<String, String> {
        self.0
    }
}

impl FromIterator<(String, String)> for HeaderMap {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Position of the first byte after the header block in a raw frame
/// (header + payload), or `None` when the frame carries no blank-line
/// separator. The scan mirrors the substrate's own framing: the block ends
/// at the first CRLF CRLF.
pub fn header_end(frame: &[u8]) -> Option<usize> {
    frame
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|idx| idx + 4)
}

/// Split a raw frame into its header block and payload. Frames without a
/// header block come back with empty headers.
pub fn split_frame(frame: &[u8]) -> (Bytes, Bytes) {
    match header_end(frame) {
        Some(end) if frame.starts_with(HDR_LINE.as_bytes()) => (
            Bytes::copy_from_slice(&frame[..end]),
            Bytes::copy_from_slice(&frame[end..]),
        ),
        _ => (Bytes::new(), Bytes::copy_from_slice(frame)),
    }
}

/// The reserved headers native SDKs stamp on produced messages.
///
/// Absence is tolerated only for pre-`$memphis`-prefix SDKs, which used the
/// bare `connectionId`/`producedBy` keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StationHeaders {
    pub connection_id: String,
    pub produced_by: String,
}

impl StationHeaders {
    /// Extract the reserved pair, falling back to the legacy unprefixed
    /// keys. `None` means the message was not produced by a native SDK and
    /// must be skipped by DLS logic.
    pub fn from_map(headers: &HeaderMap) -> Option<Self> {
        let connection_id = headers
            .get(HDR_CONNECTION_ID)
            .or_else(|| headers.get("connectionId"))?;
        let produced_by = headers
            .get(HDR_PRODUCED_BY)
            .or_else(|| headers.get("producedBy"))?;
        if connection_id.is_empty() || produced_by.is_empty() {
            return None;
        }
        Some(Self {
            connection_id: connection_id.to_string(),
            produced_by: produced_by.to_string(),
        })
    }

    /// True when the message is itself a DLS resend.
    pub fn is_dls_resend(&self) -> bool {
        self.produced_by == DLS_PRODUCER_MARKER
    }
}
