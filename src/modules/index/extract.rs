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


use std::borrow::Cow;

use mail_parser::{Addr, Address, MessageParser, MimeHeaders, PartType};

use crate::modules::{
    error::WhippetResult,
    index::{
        fields::{F_ATTACHMENTS, F_BCC, F_CC, F_DATE, F_FROM, F_MESSAGE_ID, F_SUBJECT, F_TO},
        session::IndexSession,
    },
};

/// Width handed to the HTML renderer. Indexed text has no line width to
/// speak of; a fixed one keeps the rendition stable.
const BODY_TEXT_WIDTH: usize = 80;

/// Parse one raw message and stream its searchable content into the session
/// as a single document: header fields in one shot, every textual body part
/// decoded into one streamed body field, then attachment names. The session
/// must already be bound to the message's mailbox.
///
/// Returns `Ok(false)` when the message cannot be parsed; the message is
/// skipped with a warning and the session is left untouched.
pub async fn index_message(
    session: &mut IndexSession,
    uid: u32,
    raw: &[u8],
) -> WhippetResult<bool> {
    let Some(message) = MessageParser::default().parse(raw) else {
        tracing::warn!(uid, "unparseable message, skipping it");
        return Ok(false);
    };

    session.begin_message(uid);

    if let Some(subject) = message.subject() {
        session.add_field(F_SUBJECT, subject.as_bytes());
    }
    for (name, header) in [
        (F_FROM, message.from()),
        (F_TO, message.to()),
        (F_CC, message.cc()),
        (F_BCC, message.bcc()),
    ] {
        if let Some(address) = header {
            session.add_field(name, render_addresses(address).as_bytes());
        }
    }
    if let Some(message_id) = message.message_id() {
        session.add_field(F_MESSAGE_ID, message_id.as_bytes());
    }
    if let Some(date) = message.date() {
        session.add_field(F_DATE, date.to_rfc3339().as_bytes());
    }

    // Body parts in document order. text_body and html_body point at the
    // same part when one rendition serves both, so merge and dedup the ids.
    let mut part_ids: Vec<u32> = message
        .text_body
        .iter()
        .chain(message.html_body.iter())
        .copied()
        .collect();
    part_ids.sort_unstable();
    part_ids.dedup();

    for part_id in part_ids {
        let Some(part) = message.parts.get(part_id as usize) else {
            continue;
        };
        let text: Cow<'_, str> = match &part.body {
            PartType::Text(text) => Cow::Borrowed(text.as_ref()),
            PartType::Html(html) => Cow::Owned(
                html2text::from_read(html.as_bytes(), BODY_TEXT_WIDTH)
                    .unwrap_or_else(|_| html.to_string()),
            ),
            _ => continue,
        };
        if session.body_open() {
            session.append_body(b"\n");
        } else {
            session.open_body();
        }
        session.append_body(text.as_bytes());
    }

    let attachment_names: Vec<&str> = message
        .attachments()
        .filter_map(|part| part.attachment_name())
        .collect();
    if !attachment_names.is_empty() {
        session.add_field(F_ATTACHMENTS, attachment_names.join(", ").as_bytes());
    }

    session.finish_message().await?;
    Ok(true)
}

fn render_addresses(address: &Address<'_>) -> String {
    let rendered: Vec<String> = match address {
        Address::List(addrs) => addrs.iter().map(render_addr).collect(),
        Address::Group(groups) => groups
            .iter()
            .flat_map(|group| group.addresses.iter().map(render_addr))
            .collect(),
    };
    rendered.join(", ")
}

fn render_addr(addr: &Addr<'_>) -> String {
    match (&addr.name, &addr.address) {
        (Some(name), Some(address)) => format!("{} <{}>", name, address),
        (None, Some(address)) => format!("<{}>", address),
        (Some(name), None) => name.to_string(),
        (None, None) => String::new(),
    }
}
