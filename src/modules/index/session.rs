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


use std::sync::Arc;

use crate::modules::{
    error::WhippetResult,
    index::{
        bulk::{encode_delete, encode_index, BulkBuffer, MailboxGuid, MessageKey},
        fields::{FieldSet, F_BODY},
    },
    settings::fts::FtsSettings,
    transport::SearchTransport,
};

#[derive(Debug)]
struct DraftMessage {
    uid: u32,
    fields: FieldSet,
    body_open: bool,
}

/// Per-transaction indexing state machine.
///
/// One session belongs to exactly one mail-store transaction and is never
/// shared across transactions. The host delivers its callbacks sequentially,
/// so the session moves Idle → MailboxBound → MessageOpen → MailboxBound and
/// finally to Closed at `commit`. Messages that are never explicitly finished
/// are never indexed. Out-of-order calls are integration bugs and panic.
pub struct IndexSession {
    settings: Arc<FtsSettings>,
    transport: Arc<SearchTransport>,
    user: String,
    mailbox: Option<MailboxGuid>,
    draft: Option<DraftMessage>,
    buffer: BulkBuffer,
    documents_added: bool,
    expunges: bool,
    highest_virtual_uid: u32,
    closed: bool,
}

impl IndexSession {
    pub fn new(
        settings: Arc<FtsSettings>,
        transport: Arc<SearchTransport>,
        user: impl Into<String>,
    ) -> Self {
        Self {
            settings,
            transport,
            user: user.into(),
            mailbox: None,
            draft: None,
            buffer: BulkBuffer::new(),
            documents_added: false,
            expunges: false,
            highest_virtual_uid: 0,
            closed: false,
        }
    }

    /// Bind the session to a mailbox. Rebinding with a message still open
    /// abandons that message: cross-mailbox message state is never valid.
    pub fn set_mailbox(&mut self, guid: MailboxGuid) {
        assert!(!self.closed, "set_mailbox on a closed session");
        if self.mailbox == Some(guid) {
            return;
        }
        if let Some(draft) = self.draft.take() {
            tracing::warn!(
                user = %self.user,
                uid = draft.uid,
                "mailbox rebound mid-message, abandoning unfinished message"
            );
        }
        self.mailbox = Some(guid);
    }

    /// Start collecting fields for one message.
    pub fn begin_message(&mut self, uid: u32) {
        assert!(!self.closed, "begin_message on a closed session");
        assert!(
            self.mailbox.is_some(),
            "begin_message before a mailbox is bound"
        );
        assert!(
            self.draft.is_none(),
            "begin_message while a message is still open"
        );
        self.draft = Some(DraftMessage {
            uid,
            fields: FieldSet::new(),
            body_open: false,
        });
    }

    /// Add a whole field value in one call.
    pub fn add_field(&mut self, name: &str, data: &[u8]) {
        let draft = self.draft.as_mut().expect("add_field with no open message");
        draft.fields.add_field(name, data);
    }

    /// Stream another chunk of field data for the open message. A chunk for
    /// a new name opens that field; chunks for the name already open append
    /// to it. Switching names requires `close_current_field` in between.
    pub fn add_field_part(&mut self, name: &str, data: &[u8]) {
        let draft = self
            .draft
            .as_mut()
            .expect("add_field_part with no open message");
        if draft.fields.open_name() != Some(name) {
            draft.fields.open_field(name);
        }
        draft.fields.append_bytes(data);
    }

    pub fn close_current_field(&mut self) {
        let draft = self
            .draft
            .as_mut()
            .expect("close_current_field with no open message");
        if draft.fields.open_name() == Some(F_BODY) {
            draft.body_open = false;
        }
        draft.fields.close_field();
    }

    /// Open the streamed body field. The body stays open until the message is
    /// finished, so the decoded parts of a multi-part body all land in one
    /// field.
    pub fn open_body(&mut self) {
        let draft = self.draft.as_mut().expect("open_body with no open message");
        assert!(!draft.body_open, "open_body while the body is already open");
        draft.fields.open_field(F_BODY);
        draft.body_open = true;
    }

    /// Stream another decoded chunk into the open body.
    pub fn append_body(&mut self, data: &[u8]) {
        let draft = self
            .draft
            .as_mut()
            .expect("append_body with no open message");
        assert!(draft.body_open, "append_body before open_body");
        draft.fields.append_bytes(data);
    }

    pub fn body_open(&self) -> bool {
        self.draft.as_ref().is_some_and(|draft| draft.body_open)
    }

    /// Seal the open message into an index fragment and append it to the
    /// pending buffer, flushing first if the fragment would push the buffer
    /// past the threshold.
    pub async fn finish_message(&mut self) -> WhippetResult<()> {
        let mut draft = self.draft.take().expect("finish_message with no open message");
        if draft.fields.open_name().is_some() {
            draft.fields.close_field();
        }
        let key = self.message_key(draft.uid);
        let fragment = encode_index(&key, draft.fields.entries())?;
        self.append_fragment(&fragment).await?;
        self.documents_added = true;
        self.flush_if_due().await
    }

    /// Append a delete action for an expunged message.
    pub async fn expunge(&mut self, uid: u32) -> WhippetResult<()> {
        assert!(!self.closed, "expunge on a closed session");
        assert!(
            self.draft.is_none(),
            "expunge while a message is still open"
        );
        let key = self.message_key(uid);
        let fragment = encode_delete(&key)?;
        self.append_fragment(&fragment).await?;
        self.expunges = true;
        self.flush_if_due().await
    }

    async fn append_fragment(&mut self, fragment: &[u8]) -> WhippetResult<()> {
        if self
            .buffer
            .would_exceed(fragment.len(), self.settings.bulk_size)
        {
            self.flush().await?;
        }
        self.buffer.append(fragment);
        Ok(())
    }

    /// Flush when the buffer has met or passed the threshold.
    pub async fn flush_if_due(&mut self) -> WhippetResult<()> {
        if self.buffer.is_due(self.settings.bulk_size) {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> WhippetResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let payload = self.buffer.take();
        if self.settings.debug {
            tracing::debug!(
                user = %self.user,
                bytes = payload.len(),
                "flushing bulk buffer"
            );
        }
        if let Err(e) = self.transport.submit_bulk(payload.clone()).await {
            // Nothing was accepted; keep the fragments so the caller can
            // retry or surface the failure.
            self.buffer.restore(payload);
            return Err(e);
        }
        Ok(())
    }

    /// End the transaction: discard any unfinished message, flush the rest of
    /// the buffer, and request an engine refresh per the configured policy.
    pub async fn commit(&mut self) -> WhippetResult<()> {
        assert!(!self.closed, "commit on a closed session");
        if let Some(draft) = self.draft.take() {
            tracing::warn!(
                user = %self.user,
                uid = draft.uid,
                "transaction committed with an unfinished message, not indexing it"
            );
        }
        self.flush().await?;
        if (self.documents_added || self.expunges) && self.settings.refresh_on_update
            || self.settings.refresh_by_fts
        {
            self.transport.request_refresh().await?;
        }
        self.closed = true;
        Ok(())
    }

    /// Roll back: drop the open message, pending fragments, and change flags.
    /// The mailbox binding survives so the session can keep being used.
    /// Idempotent and callable from any state.
    pub fn abort(&mut self) {
        self.draft = None;
        if !self.buffer.is_empty() {
            let dropped = self.buffer.take();
            tracing::debug!(
                user = %self.user,
                bytes = dropped.len(),
                "aborting transaction, dropping buffered fragments"
            );
        }
        self.documents_added = false;
        self.expunges = false;
    }

    /// Record a UID seen through a virtual view. Virtual views are not
    /// indexed themselves; only the high-water mark moves, and only forward.
    pub fn observe_virtual_uid(&mut self, uid: u32) {
        if uid > self.highest_virtual_uid {
            self.highest_virtual_uid = uid;
        }
    }

    pub fn highest_virtual_uid(&self) -> u32 {
        self.highest_virtual_uid
    }

    pub fn documents_added(&self) -> bool {
        self.documents_added
    }

    pub fn expunges(&self) -> bool {
        self.expunges
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }

    pub fn mailbox(&self) -> Option<MailboxGuid> {
        self.mailbox
    }

    fn message_key(&self, uid: u32) -> MessageKey {
        let mailbox = self.mailbox.expect("no mailbox bound");
        MessageKey {
            uid,
            mailbox,
            user: self.user.clone(),
        }
    }
}
