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


use base64::{engine::general_purpose, Engine as _};
use bytes::BytesMut;
use serde_json::{json, Value};

pub const F_UID: &str = "uid";
pub const F_BOX: &str = "box";
pub const F_USER: &str = "user";
pub const F_MESSAGE_ID: &str = "message_id";
pub const F_SUBJECT: &str = "subject";
pub const F_FROM: &str = "from";
pub const F_TO: &str = "to";
pub const F_CC: &str = "cc";
pub const F_BCC: &str = "bcc";
pub const F_DATE: &str = "date";
pub const F_BODY: &str = "body";
pub const F_ATTACHMENTS: &str = "attachments";

/// One finalized field of a message document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldEntry {
    pub name: String,
    pub value: Vec<u8>,
}

/// Ordered field collection for a single message.
///
/// The mail store streams header and body data in parts, so at most one field
/// is "open" for appending at a time; closing it turns the accumulated bytes
/// into an immutable entry. Violating the open/close protocol is a bug in the
/// caller, not a runtime condition, and panics.
#[derive(Debug, Default)]
pub struct FieldSet {
    entries: Vec<FieldEntry>,
    open: Option<(String, BytesMut)>,
}

impl FieldSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start collecting a new field. A previously opened field must have been
    /// closed first.
    pub fn open_field(&mut self, name: &str) {
        assert!(
            self.open.is_none(),
            "open_field('{name}') while another field is still open"
        );
        self.open = Some((name.to_string(), BytesMut::new()));
    }

    /// Append another chunk to the open field. Chunks concatenate in call
    /// order, which is what lets multi-part bodies stream through.
    pub fn append_bytes(&mut self, data: &[u8]) {
        let (_, value) = self
            .open
            .as_mut()
            .expect("append_bytes with no open field");
        value.extend_from_slice(data);
    }

    /// Finalize the open field into an immutable entry.
    pub fn close_field(&mut self) -> &FieldEntry {
        let (name, value) = self.open.take().expect("close_field with no open field");
        self.entries.push(FieldEntry {
            name,
            value: value.to_vec(),
        });
        self.entries.last().unwrap()
    }

    /// Open, fill and close a field in one call, for values that arrive whole.
    pub fn add_field(&mut self, name: &str, value: &[u8]) {
        self.open_field(name);
        self.append_bytes(value);
        self.close_field();
    }

    /// Name of the currently open field, if any.
    pub fn open_name(&self) -> Option<&str> {
        self.open.as_ref().map(|(name, _)| name.as_str())
    }

    pub fn entries(&self) -> &[FieldEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.open.is_none()
    }

    /// Drop everything, open cursor included, ready for the next message.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.open = None;
    }
}

/// Encode a field value for the JSON document line.
///
/// Valid UTF-8 goes out as a plain JSON string. Anything else is wrapped as
/// `{"b64": "<base64>"}` so arbitrary bytes survive a decode-after-encode
/// cycle unchanged.
pub fn field_value_to_json(value: &[u8]) -> Value {
    match std::str::from_utf8(value) {
        Ok(text) => Value::String(text.to_string()),
        Err(_) => json!({ "b64": general_purpose::STANDARD.encode(value) }),
    }
}

/// Inverse of [`field_value_to_json`]. Returns `None` for values that did not
/// come out of it.
pub fn field_value_from_json(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::String(text) => Some(text.as_bytes().to_vec()),
        Value::Object(map) => {
            let encoded = map.get("b64")?.as_str()?;
            general_purpose::STANDARD.decode(encoded).ok()
        }
        _ => None,
    }
}
