//
// Copyright (c) 2026 whippet.dev (https://whippet.dev)
//
// This file is part of the Whippet Mail Search Project
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.


use std::fmt;

use bytes::{Bytes, BytesMut};
use serde_json::{json, Map, Value};

use crate::{
    modules::{
        error::{code::ErrorCode, WhippetResult},
        index::fields::{field_value_to_json, FieldEntry, F_BOX, F_UID, F_USER},
    },
    raise_error,
};

/// Fixed-length mailbox identifier, rendered as 32 hex characters on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MailboxGuid([u8; 16]);

impl MailboxGuid {
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn parse_hex(hex_str: &str) -> WhippetResult<Self> {
        let raw = hex::decode(hex_str).map_err(|e| {
            raise_error!(
                format!("Invalid mailbox guid '{hex_str}': {e}"),
                ErrorCode::InternalError
            )
        })?;
        let bytes: [u8; 16] = raw.try_into().map_err(|_| {
            raise_error!(
                format!("Mailbox guid '{hex_str}' is not 16 bytes"),
                ErrorCode::InternalError
            )
        })?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for MailboxGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Identity of one message document in the engine: `<uid>/<mailbox guid>/<user>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageKey {
    pub uid: u32,
    pub mailbox: MailboxGuid,
    pub user: String,
}

impl MessageKey {
    pub fn wire_id(&self) -> String {
        format!("{}/{}/{}", self.uid, self.mailbox, self.user)
    }
}

/// Serialize one index action: an action-header line naming the document id,
/// followed by the document line. Duplicate field names are merged with a
/// single space, the way repeated headers read in the original message.
pub fn encode_index(key: &MessageKey, fields: &[FieldEntry]) -> WhippetResult<Bytes> {
    let mut merged: Vec<(&str, Vec<u8>)> = Vec::with_capacity(fields.len());
    for entry in fields {
        match merged.iter_mut().find(|(name, _)| *name == entry.name) {
            Some((_, value)) => {
                value.push(b' ');
                value.extend_from_slice(&entry.value);
            }
            None => merged.push((entry.name.as_str(), entry.value.clone())),
        }
    }

    let mut doc = Map::new();
    doc.insert(F_UID.to_string(), json!(key.uid));
    doc.insert(F_BOX.to_string(), json!(key.mailbox.to_hex()));
    doc.insert(F_USER.to_string(), json!(key.user));
    for (name, value) in &merged {
        doc.insert(name.to_string(), field_value_to_json(value));
    }

    let header = json!({ "index": { "_id": key.wire_id() } });
    let mut out = to_line(&header)?;
    out.extend_from_slice(&to_line(&Value::Object(doc))?);
    Ok(out.freeze())
}

/// Serialize one delete action. Deletes carry no document line.
pub fn encode_delete(key: &MessageKey) -> WhippetResult<Bytes> {
    let header = json!({ "delete": { "_id": key.wire_id() } });
    Ok(to_line(&header)?.freeze())
}

fn to_line(value: &Value) -> WhippetResult<BytesMut> {
    let raw = serde_json::to_vec(value)
        .map_err(|e| raise_error!(format!("{e:#?}"), ErrorCode::InternalError))?;
    let mut line = BytesMut::with_capacity(raw.len() + 1);
    line.extend_from_slice(&raw);
    line.extend_from_slice(b"\n");
    Ok(line)
}

/// Append-only byte buffer of pending bulk fragments.
///
/// One instance belongs to exactly one session; `take` hands the accumulated
/// bytes to the transport and leaves the buffer empty, so at most one payload
/// per session is in flight at a time.
#[derive(Debug, Default)]
pub struct BulkBuffer {
    buf: BytesMut,
}

impl BulkBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Would appending `next_len` more bytes push the buffer past the
    /// threshold? An empty buffer never reports true: a single oversized
    /// fragment cannot be split, it simply becomes its own flush.
    pub fn would_exceed(&self, next_len: usize, threshold: usize) -> bool {
        !self.buf.is_empty() && self.buf.len() + next_len > threshold
    }

    /// The buffer has met or passed the threshold and is due for a flush.
    pub fn is_due(&self, threshold: usize) -> bool {
        self.buf.len() >= threshold
    }

    pub fn append(&mut self, fragment: &[u8]) {
        self.buf.extend_from_slice(fragment);
    }

    /// Hand off everything accumulated so far and leave an empty buffer.
    pub fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// Put back a payload whose submission failed, ahead of anything appended
    /// since, so no fragment is lost and order is preserved.
    pub fn restore(&mut self, payload: Bytes) {
        if self.buf.is_empty() {
            self.buf.extend_from_slice(&payload);
            return;
        }
        let mut restored = BytesMut::with_capacity(payload.len() + self.buf.len());
        restored.extend_from_slice(&payload);
        restored.extend_from_slice(&self.buf);
        self.buf = restored;
    }
}
