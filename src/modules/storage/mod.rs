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


use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::modules::{
    error::WhippetResult,
    index::{bulk::MailboxGuid, extract::index_message, session::IndexSession},
    settings::fts::FtsSettings,
    transport::SearchTransport,
};

#[cfg(test)]
mod hooks_tests;

/// Storage name the host gives aggregating virtual views. Messages seen
/// through such a view are never indexed directly.
pub const VIRTUAL_STORAGE_NAME: &str = "virtual";

/// Per-user plugin key holding the whippet settings string.
pub const PLUGIN_SETTING_KEY: &str = "fts_whippet";

/// Per-user plugin key naming the full-text backend to activate.
pub const BACKEND_SELECTOR_KEY: &str = "fts";

/// Selector value that activates this backend.
pub const BACKEND_NAME: &str = "whippet";

/// A mail-store user, as the host presents it to storage plugins.
pub trait MailUser: Send + Sync {
    fn username(&self) -> &str;

    /// Value of a per-user plugin setting, or None when unset.
    fn plugin_setting(&self, key: &str) -> Option<String>;
}

/// One namespace's mailbox list.
pub trait MailboxList: Send + Sync {
    /// Stable identity of the namespace this list serves.
    fn namespace_id(&self) -> u64;

    /// Namespace prefix, for log messages.
    fn namespace_prefix(&self) -> &str;

    /// Root directory for this namespace's index data, when the host can
    /// resolve one. Namespaces without index storage are never indexed.
    fn index_root_path(&self) -> Option<PathBuf>;

    fn user(&self) -> &dyn MailUser;
}

/// One message object inside a mail-store transaction.
pub trait MailStoreMail: Send + Sync {
    /// Stable identity of this mail object.
    fn object_id(&self) -> u64;

    /// Identity of the owning transaction.
    fn transaction_id(&self) -> u64;

    fn uid(&self) -> u32;

    fn mailbox_guid(&self) -> MailboxGuid;

    /// Name of the storage driver backing the mailbox.
    fn storage_name(&self) -> &str;

    fn namespace_id(&self) -> u64;

    fn user(&self) -> &dyn MailUser;

    /// The full raw message, for field extraction.
    fn raw_message(&self) -> WhippetResult<Vec<u8>>;
}

/// Lifecycle notifications a mail store delivers to its storage plugins.
///
/// Implementations that replace a previously registered collaborator must
/// keep invoking it while handling each notification, so stacked plugins
/// compose the way they were installed.
#[async_trait]
pub trait MailStorageHooks: Send + Sync {
    fn mail_user_created(&self, user: &dyn MailUser);

    fn mailbox_list_created(&self, list: &dyn MailboxList);

    async fn mailbox_list_destroyed(&self, list: &dyn MailboxList);

    fn mail_allocated(&self, mail: &dyn MailStoreMail);

    /// Delivered once per message, before its data is consumed elsewhere.
    async fn mail_precache(&self, mail: &dyn MailStoreMail) -> WhippetResult<()>;

    async fn mail_expunged(&self, mail: &dyn MailStoreMail) -> WhippetResult<()>;

    /// Delivered when the owning transaction commits or rolls back.
    async fn transaction_ended(&self, transaction_id: u64, committed: bool) -> WhippetResult<()>;
}

/// The whippet storage hooks.
///
/// Attachment state the host would otherwise carry on its own objects lives
/// in side tables keyed by the objects' stable identities: resolved settings
/// per user, one transport per indexed namespace, and one [`IndexSession`]
/// per transaction that has indexing work. Any hooks registered before this
/// plugin keep running; they are invoked from every notification.
pub struct WhippetHooks {
    http_client: reqwest::Client,
    inner: Option<Arc<dyn MailStorageHooks>>,
    users: DashMap<String, Arc<FtsSettings>>,
    namespaces: DashMap<u64, Arc<SearchTransport>>,
    sessions: DashMap<u64, Arc<Mutex<IndexSession>>>,
}

impl WhippetHooks {
    pub fn new(http_client: reqwest::Client, inner: Option<Arc<dyn MailStorageHooks>>) -> Self {
        Self {
            http_client,
            inner,
            users: DashMap::new(),
            namespaces: DashMap::new(),
            sessions: DashMap::new(),
        }
    }

    /// Whether resolved per-user settings enabled indexing for this user.
    pub fn user_indexing_enabled(&self, username: &str) -> bool {
        self.users.contains_key(username)
    }

    /// Whether the namespace has a search backend attached.
    pub fn namespace_indexing_enabled(&self, namespace_id: u64) -> bool {
        self.namespaces.contains_key(&namespace_id)
    }

    /// Number of transactions currently holding indexing state.
    pub fn open_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Highest UID observed through a virtual view within the transaction.
    pub async fn virtual_watermark(&self, transaction_id: u64) -> Option<u32> {
        let session = self
            .sessions
            .get(&transaction_id)
            .map(|entry| entry.value().clone())?;
        let session = session.lock().await;
        Some(session.highest_virtual_uid())
    }

    /// Release every namespace backend and drop leftover session state.
    /// Queued submissions are drained before the workers stop.
    pub async fn shutdown(&self) {
        self.sessions.clear();
        let namespace_ids: Vec<u64> = self.namespaces.iter().map(|entry| *entry.key()).collect();
        for namespace_id in namespace_ids {
            if let Some((_, transport)) = self.namespaces.remove(&namespace_id) {
                transport.shutdown().await;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn install_namespace_transport(
        &self,
        namespace_id: u64,
        transport: Arc<SearchTransport>,
    ) {
        self.namespaces.insert(namespace_id, transport);
    }

    fn user_settings(&self, username: &str) -> Option<Arc<FtsSettings>> {
        self.users.get(username).map(|entry| entry.value().clone())
    }

    fn namespace_transport(&self, namespace_id: u64) -> Option<Arc<SearchTransport>> {
        self.namespaces
            .get(&namespace_id)
            .map(|entry| entry.value().clone())
    }

    fn session_for(
        &self,
        transaction_id: u64,
        settings: &Arc<FtsSettings>,
        transport: &Arc<SearchTransport>,
        username: &str,
    ) -> Arc<Mutex<IndexSession>> {
        self.sessions
            .entry(transaction_id)
            .or_insert_with(|| {
                Arc::new(Mutex::new(IndexSession::new(
                    settings.clone(),
                    transport.clone(),
                    username,
                )))
            })
            .value()
            .clone()
    }

}

/// Mails seen through an aggregating virtual view are not indexed; their
/// backing real-mailbox copy is. A mail object's storage identity never
/// changes, so membership is recomputed wherever it is needed instead of
/// being recorded per object at allocation.
fn is_virtual_view(mail: &dyn MailStoreMail) -> bool {
    mail.storage_name() == VIRTUAL_STORAGE_NAME
}

#[async_trait]
impl MailStorageHooks for WhippetHooks {
    fn mail_user_created(&self, user: &dyn MailUser) {
        if let Some(inner) = &self.inner {
            inner.mail_user_created(user);
        }
        let username = user.username();
        if username.is_empty() {
            tracing::error!("mail user notification without a username, ignoring it");
            return;
        }
        let Some(raw) = user.plugin_setting(PLUGIN_SETTING_KEY) else {
            tracing::debug!(user = username, "no whippet settings, indexing disabled");
            return;
        };
        match FtsSettings::resolve(&raw) {
            Ok(settings) => {
                if settings.debug {
                    tracing::debug!(user = username, "whippet indexing configured");
                }
                self.users.insert(username.to_string(), Arc::new(settings));
            }
            Err(e) => {
                tracing::error!(
                    user = username,
                    error = %e,
                    "invalid whippet settings, indexing disabled"
                );
            }
        }
    }

    fn mailbox_list_created(&self, list: &dyn MailboxList) {
        if let Some(inner) = &self.inner {
            inner.mailbox_list_created(list);
        }
        let username = list.user().username();
        if username.is_empty() {
            tracing::error!("mailbox list notification without a username, ignoring it");
            return;
        }
        let Some(backend) = list.user().plugin_setting(BACKEND_SELECTOR_KEY) else {
            tracing::debug!(
                user = username,
                prefix = list.namespace_prefix(),
                "no fts backend selected, whippet disabled"
            );
            return;
        };
        if backend != BACKEND_NAME {
            tracing::debug!(
                user = username,
                backend = %backend,
                "selected fts backend is not whippet, leaving namespace alone"
            );
            return;
        }
        if list.index_root_path().is_none() {
            tracing::debug!(
                user = username,
                prefix = list.namespace_prefix(),
                "namespace has no index root, whippet disabled"
            );
            return;
        }
        let Some(settings) = self.user_settings(username) else {
            tracing::debug!(
                user = username,
                "whippet not configured for this user, namespace left unindexed"
            );
            return;
        };
        match SearchTransport::connect(self.http_client.clone(), &settings) {
            Ok(transport) => {
                if settings.debug {
                    tracing::debug!(
                        user = username,
                        namespace = list.namespace_id(),
                        prefix = list.namespace_prefix(),
                        url = %transport.url(),
                        "search backend attached to namespace"
                    );
                }
                self.namespaces.insert(list.namespace_id(), transport);
            }
            Err(e) => {
                tracing::error!(
                    user = username,
                    error = %e,
                    "failed to initialize whippet backend, indexing disabled"
                );
            }
        }
    }

    async fn mailbox_list_destroyed(&self, list: &dyn MailboxList) {
        if let Some((_, transport)) = self.namespaces.remove(&list.namespace_id()) {
            transport.shutdown().await;
            tracing::debug!(
                namespace = list.namespace_id(),
                prefix = list.namespace_prefix(),
                "search backend released"
            );
        }
        if let Some(inner) = &self.inner {
            inner.mailbox_list_destroyed(list).await;
        }
    }

    fn mail_allocated(&self, mail: &dyn MailStoreMail) {
        if let Some(inner) = &self.inner {
            inner.mail_allocated(mail);
        }
        // Virtual-view membership is derived from the storage name when the
        // mail is indexed or expunged; allocation records nothing.
    }

    async fn mail_precache(&self, mail: &dyn MailStoreMail) -> WhippetResult<()> {
        if let Some(inner) = &self.inner {
            inner.mail_precache(mail).await?;
        }
        if mail.uid() == 0 {
            tracing::error!("mail precache notification without a uid, ignoring it");
            return Ok(());
        }
        let username = mail.user().username();
        let Some(settings) = self.user_settings(username) else {
            return Ok(());
        };
        let Some(transport) = self.namespace_transport(mail.namespace_id()) else {
            if settings.debug {
                tracing::debug!(
                    user = username,
                    namespace = mail.namespace_id(),
                    "namespace has no search backend, not indexing"
                );
            }
            return Ok(());
        };
        let session = self.session_for(mail.transaction_id(), &settings, &transport, username);
        let mut session = session.lock().await;
        if is_virtual_view(mail) {
            session.observe_virtual_uid(mail.uid());
            return Ok(());
        }
        session.set_mailbox(mail.mailbox_guid());
        let raw = mail.raw_message()?;
        index_message(&mut session, mail.uid(), &raw).await?;
        Ok(())
    }

    async fn mail_expunged(&self, mail: &dyn MailStoreMail) -> WhippetResult<()> {
        // The delete must be enqueued even when a previously registered
        // collaborator fails; its error is surfaced afterwards.
        let inner_result = match &self.inner {
            Some(inner) => inner.mail_expunged(mail).await,
            None => Ok(()),
        };
        if mail.uid() == 0 {
            tracing::error!("mail expunge notification without a uid, ignoring it");
            return inner_result;
        }
        let username = mail.user().username();
        let Some(settings) = self.user_settings(username) else {
            return inner_result;
        };
        let Some(transport) = self.namespace_transport(mail.namespace_id()) else {
            return inner_result;
        };
        if is_virtual_view(mail) {
            return inner_result;
        }
        let session = self.session_for(mail.transaction_id(), &settings, &transport, username);
        let mut session = session.lock().await;
        session.set_mailbox(mail.mailbox_guid());
        session.expunge(mail.uid()).await.and(inner_result)
    }

    async fn transaction_ended(&self, transaction_id: u64, committed: bool) -> WhippetResult<()> {
        // The session must be settled whatever a previously registered
        // collaborator returns; its error is surfaced afterwards.
        let inner_result = match &self.inner {
            Some(inner) => inner.transaction_ended(transaction_id, committed).await,
            None => Ok(()),
        };
        let Some(session) = self
            .sessions
            .get(&transaction_id)
            .map(|entry| entry.value().clone())
        else {
            return inner_result;
        };
        if committed {
            // On failure the session stays behind, fragments intact, so the
            // host can deliver the notification again.
            session.lock().await.commit().await?;
        } else {
            session.lock().await.abort();
        }
        self.sessions.remove(&transaction_id);
        inner_result
    }
}
