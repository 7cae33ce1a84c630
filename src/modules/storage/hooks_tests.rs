use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::modules::error::{code::ErrorCode, WhippetResult};
use crate::modules::index::bulk::{encode_delete, MailboxGuid, MessageKey};
use crate::modules::storage::{
    MailStorageHooks, MailStoreMail, MailUser, MailboxList, WhippetHooks, BACKEND_NAME,
    BACKEND_SELECTOR_KEY, PLUGIN_SETTING_KEY, VIRTUAL_STORAGE_NAME,
};
use crate::modules::transport::{SearchTransport, TransportJob};
use crate::raise_error;

const USER: &str = "tester@example.com";
const NS: u64 = 4;
const TXN: u64 = 71;
const ENGINE: &str = "url=http://127.0.0.1:9200/mails refresh=never";
const RAW_MAIL: &[u8] = b"From: ada@example.com\r\nSubject: hello\r\n\r\nbody text\r\n";

#[derive(Clone)]
struct TestUser {
    username: String,
    settings: Vec<(String, String)>,
}

impl TestUser {
    fn new(username: &str, settings: &[(&str, &str)]) -> Self {
        Self {
            username: username.to_string(),
            settings: settings
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
        }
    }
}

impl MailUser for TestUser {
    fn username(&self) -> &str {
        &self.username
    }

    fn plugin_setting(&self, key: &str) -> Option<String> {
        self.settings
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.clone())
    }
}

struct TestList {
    namespace_id: u64,
    prefix: String,
    index_root: Option<PathBuf>,
    user: TestUser,
}

impl MailboxList for TestList {
    fn namespace_id(&self) -> u64 {
        self.namespace_id
    }

    fn namespace_prefix(&self) -> &str {
        &self.prefix
    }

    fn index_root_path(&self) -> Option<PathBuf> {
        self.index_root.clone()
    }

    fn user(&self) -> &dyn MailUser {
        &self.user
    }
}

struct TestMail {
    object_id: u64,
    transaction_id: u64,
    uid: u32,
    mailbox: MailboxGuid,
    storage_name: String,
    namespace_id: u64,
    user: TestUser,
    raw: Vec<u8>,
}

impl MailStoreMail for TestMail {
    fn object_id(&self) -> u64 {
        self.object_id
    }

    fn transaction_id(&self) -> u64 {
        self.transaction_id
    }

    fn uid(&self) -> u32 {
        self.uid
    }

    fn mailbox_guid(&self) -> MailboxGuid {
        self.mailbox
    }

    fn storage_name(&self) -> &str {
        &self.storage_name
    }

    fn namespace_id(&self) -> u64 {
        self.namespace_id
    }

    fn user(&self) -> &dyn MailUser {
        &self.user
    }

    fn raw_message(&self) -> WhippetResult<Vec<u8>> {
        Ok(self.raw.clone())
    }
}

/// Inner collaborator that records every notification it receives.
#[derive(Default)]
struct RecordingHooks {
    seen: std::sync::Mutex<Vec<String>>,
}

impl RecordingHooks {
    fn record(&self, event: String) {
        self.seen.lock().unwrap().push(event);
    }

    fn names(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailStorageHooks for RecordingHooks {
    fn mail_user_created(&self, user: &dyn MailUser) {
        self.record(format!("user_created:{}", user.username()));
    }

    fn mailbox_list_created(&self, list: &dyn MailboxList) {
        self.record(format!("list_created:{}", list.namespace_id()));
    }

    async fn mailbox_list_destroyed(&self, list: &dyn MailboxList) {
        self.record(format!("list_destroyed:{}", list.namespace_id()));
    }

    fn mail_allocated(&self, mail: &dyn MailStoreMail) {
        self.record(format!("allocated:{}", mail.object_id()));
    }

    async fn mail_precache(&self, mail: &dyn MailStoreMail) -> WhippetResult<()> {
        self.record(format!("precache:{}", mail.uid()));
        Ok(())
    }

    async fn mail_expunged(&self, mail: &dyn MailStoreMail) -> WhippetResult<()> {
        self.record(format!("expunged:{}", mail.uid()));
        Ok(())
    }

    async fn transaction_ended(&self, transaction_id: u64, committed: bool) -> WhippetResult<()> {
        self.record(format!("ended:{transaction_id}:{committed}"));
        Ok(())
    }
}

/// Inner collaborator whose expunge and transaction notifications fail.
struct FailingHooks;

#[async_trait]
impl MailStorageHooks for FailingHooks {
    fn mail_user_created(&self, _user: &dyn MailUser) {}

    fn mailbox_list_created(&self, _list: &dyn MailboxList) {}

    async fn mailbox_list_destroyed(&self, _list: &dyn MailboxList) {}

    fn mail_allocated(&self, _mail: &dyn MailStoreMail) {}

    async fn mail_precache(&self, _mail: &dyn MailStoreMail) -> WhippetResult<()> {
        Ok(())
    }

    async fn mail_expunged(&self, _mail: &dyn MailStoreMail) -> WhippetResult<()> {
        Err(raise_error!(
            "expunge rejected downstream".into(),
            ErrorCode::InternalError
        ))
    }

    async fn transaction_ended(&self, _transaction_id: u64, _committed: bool) -> WhippetResult<()> {
        Err(raise_error!(
            "transaction rejected downstream".into(),
            ErrorCode::InternalError
        ))
    }
}

fn mailbox() -> MailboxGuid {
    MailboxGuid::from_bytes([0x42; 16])
}

fn configured_user(raw_settings: &str) -> TestUser {
    TestUser::new(
        USER,
        &[
            (BACKEND_SELECTOR_KEY, BACKEND_NAME),
            (PLUGIN_SETTING_KEY, raw_settings),
        ],
    )
}

fn list_for(user: &TestUser) -> TestList {
    TestList {
        namespace_id: NS,
        prefix: "INBOX/".to_string(),
        index_root: Some(PathBuf::from("/var/index/tester")),
        user: user.clone(),
    }
}

fn mail(object_id: u64, uid: u32, storage_name: &str, user: &TestUser) -> TestMail {
    TestMail {
        object_id,
        transaction_id: TXN,
        uid,
        mailbox: mailbox(),
        storage_name: storage_name.to_string(),
        namespace_id: NS,
        user: user.clone(),
        raw: RAW_MAIL.to_vec(),
    }
}

/// Hooks with a configured user and a capture transport standing in for the
/// namespace backend.
fn enabled_hooks(raw_settings: &str) -> (WhippetHooks, mpsc::Receiver<TransportJob>, TestUser) {
    let hooks = WhippetHooks::new(reqwest::Client::new(), None);
    let user = configured_user(raw_settings);
    hooks.mail_user_created(&user);
    let (transport, receiver) = SearchTransport::capture();
    hooks.install_namespace_transport(NS, transport);
    (hooks, receiver, user)
}

fn enabled_hooks_with_inner(
    raw_settings: &str,
    inner: Arc<dyn MailStorageHooks>,
) -> (WhippetHooks, mpsc::Receiver<TransportJob>, TestUser) {
    let hooks = WhippetHooks::new(reqwest::Client::new(), Some(inner));
    let user = configured_user(raw_settings);
    hooks.mail_user_created(&user);
    let (transport, receiver) = SearchTransport::capture();
    hooks.install_namespace_transport(NS, transport);
    (hooks, receiver, user)
}

fn drain(receiver: &mut mpsc::Receiver<TransportJob>) -> Vec<TransportJob> {
    let mut jobs = Vec::new();
    while let Ok(job) = receiver.try_recv() {
        jobs.push(job);
    }
    jobs
}

#[test]
fn test_user_without_settings_stays_disabled() {
    let hooks = WhippetHooks::new(reqwest::Client::new(), None);
    hooks.mail_user_created(&TestUser::new(USER, &[]));
    assert!(!hooks.user_indexing_enabled(USER));
}

#[test]
fn test_invalid_user_settings_leave_indexing_disabled() {
    let hooks = WhippetHooks::new(reqwest::Client::new(), None);
    hooks.mail_user_created(&configured_user("url=http://127.0.0.1:9200 wat=nope"));
    assert!(!hooks.user_indexing_enabled(USER));
}

#[test]
fn test_valid_user_settings_enable_indexing() {
    let hooks = WhippetHooks::new(reqwest::Client::new(), None);
    hooks.mail_user_created(&configured_user(ENGINE));
    assert!(hooks.user_indexing_enabled(USER));
}

#[test]
fn test_user_notification_without_username_is_ignored() {
    let hooks = WhippetHooks::new(reqwest::Client::new(), None);
    hooks.mail_user_created(&TestUser::new("", &[(PLUGIN_SETTING_KEY, ENGINE)]));
    assert!(!hooks.user_indexing_enabled(""));
}

#[test]
fn test_namespace_without_backend_selector_stays_unindexed() {
    let hooks = WhippetHooks::new(reqwest::Client::new(), None);
    let user = TestUser::new(USER, &[(PLUGIN_SETTING_KEY, ENGINE)]);
    hooks.mail_user_created(&user);
    hooks.mailbox_list_created(&list_for(&user));
    assert!(!hooks.namespace_indexing_enabled(NS));
}

#[test]
fn test_namespace_for_other_backend_is_left_alone() {
    let hooks = WhippetHooks::new(reqwest::Client::new(), None);
    let user = TestUser::new(
        USER,
        &[(BACKEND_SELECTOR_KEY, "solr"), (PLUGIN_SETTING_KEY, ENGINE)],
    );
    hooks.mail_user_created(&user);
    hooks.mailbox_list_created(&list_for(&user));
    assert!(!hooks.namespace_indexing_enabled(NS));
}

#[test]
fn test_namespace_without_index_root_stays_unindexed() {
    let hooks = WhippetHooks::new(reqwest::Client::new(), None);
    let user = configured_user(ENGINE);
    hooks.mail_user_created(&user);
    let mut list = list_for(&user);
    list.index_root = None;
    hooks.mailbox_list_created(&list);
    assert!(!hooks.namespace_indexing_enabled(NS));
}

#[tokio::test]
async fn test_namespace_without_engine_url_stays_unindexed() {
    let hooks = WhippetHooks::new(reqwest::Client::new(), None);
    let user = configured_user("refresh=never");
    hooks.mail_user_created(&user);
    assert!(hooks.user_indexing_enabled(USER));
    hooks.mailbox_list_created(&list_for(&user));
    assert!(!hooks.namespace_indexing_enabled(NS));
}

#[tokio::test]
async fn test_namespace_backend_attach_and_release() {
    let hooks = WhippetHooks::new(reqwest::Client::new(), None);
    let user = configured_user(ENGINE);
    hooks.mail_user_created(&user);
    let list = list_for(&user);
    hooks.mailbox_list_created(&list);
    assert!(hooks.namespace_indexing_enabled(NS));
    hooks.mailbox_list_destroyed(&list).await;
    assert!(!hooks.namespace_indexing_enabled(NS));
}

#[tokio::test]
async fn test_precache_indexes_and_commit_flushes() {
    let (hooks, mut receiver, user) = enabled_hooks(ENGINE);
    let mail = mail(1, 11, "mdbox", &user);
    hooks.mail_allocated(&mail);
    hooks.mail_precache(&mail).await.unwrap();
    assert_eq!(hooks.open_sessions(), 1);
    // Nothing leaves the session before the transaction ends.
    assert!(drain(&mut receiver).is_empty());

    hooks.transaction_ended(TXN, true).await.unwrap();
    assert_eq!(hooks.open_sessions(), 0);

    let jobs = drain(&mut receiver);
    assert_eq!(jobs.len(), 1);
    let payload = match &jobs[0] {
        TransportJob::Bulk(payload) => payload,
        other => panic!("unexpected job: {other:?}"),
    };
    let text = std::str::from_utf8(payload).unwrap();
    let mut lines = text.lines();
    let action: serde_json::Value = serde_json::from_str(lines.next().unwrap()).unwrap();
    assert_eq!(
        action["index"]["_id"],
        format!("11/{}/{}", mailbox().to_hex(), USER)
    );
    let doc: serde_json::Value = serde_json::from_str(lines.next().unwrap()).unwrap();
    assert_eq!(doc["subject"], "hello");
    assert_eq!(doc["user"], USER);
    assert!(doc["body"].as_str().unwrap().contains("body text"));
}

#[tokio::test]
async fn test_virtual_mails_only_move_the_watermark() {
    let (hooks, mut receiver, user) = enabled_hooks(ENGINE);
    let first = mail(1, 9, VIRTUAL_STORAGE_NAME, &user);
    hooks.mail_allocated(&first);
    hooks.mail_precache(&first).await.unwrap();
    let second = mail(2, 5, VIRTUAL_STORAGE_NAME, &user);
    hooks.mail_allocated(&second);
    hooks.mail_precache(&second).await.unwrap();

    assert_eq!(hooks.virtual_watermark(TXN).await, Some(9));
    hooks.transaction_ended(TXN, true).await.unwrap();
    assert!(drain(&mut receiver).is_empty());
}

#[tokio::test]
async fn test_allocation_alone_retains_no_state() {
    let (hooks, mut receiver, user) = enabled_hooks(ENGINE);
    // Ordinary fetch traffic: mails are allocated but never precached.
    for object_id in 1..=1000u64 {
        hooks.mail_allocated(&mail(object_id, object_id as u32, "mdbox", &user));
    }
    assert_eq!(hooks.open_sessions(), 0);
    assert!(drain(&mut receiver).is_empty());

    // Virtual views are recognized without an allocation notification.
    let unannounced = mail(2000, 90, VIRTUAL_STORAGE_NAME, &user);
    hooks.mail_precache(&unannounced).await.unwrap();
    assert_eq!(hooks.virtual_watermark(TXN).await, Some(90));
    assert!(drain(&mut receiver).is_empty());
}

#[tokio::test]
async fn test_expunge_enqueues_a_delete_action() {
    let (hooks, mut receiver, user) = enabled_hooks(ENGINE);
    let mail = mail(3, 21, "mdbox", &user);
    hooks.mail_allocated(&mail);
    hooks.mail_expunged(&mail).await.unwrap();
    hooks.transaction_ended(TXN, true).await.unwrap();

    let jobs = drain(&mut receiver);
    assert_eq!(jobs.len(), 1);
    let expected = encode_delete(&MessageKey {
        uid: 21,
        mailbox: mailbox(),
        user: USER.to_string(),
    })
    .unwrap();
    match &jobs[0] {
        TransportJob::Bulk(payload) => assert_eq!(payload, &expected),
        other => panic!("unexpected job: {other:?}"),
    }
}

#[tokio::test]
async fn test_rollback_discards_buffered_work() {
    let (hooks, mut receiver, user) = enabled_hooks(ENGINE);
    let mail = mail(4, 30, "mdbox", &user);
    hooks.mail_allocated(&mail);
    hooks.mail_precache(&mail).await.unwrap();

    hooks.transaction_ended(TXN, false).await.unwrap();
    assert_eq!(hooks.open_sessions(), 0);
    assert!(drain(&mut receiver).is_empty());
}

#[tokio::test]
async fn test_unconfigured_user_is_never_indexed() {
    let hooks = WhippetHooks::new(reqwest::Client::new(), None);
    let user = TestUser::new(USER, &[]);
    let mail = mail(5, 40, "mdbox", &user);
    hooks.mail_allocated(&mail);
    hooks.mail_precache(&mail).await.unwrap();
    hooks.mail_expunged(&mail).await.unwrap();
    hooks.transaction_ended(TXN, true).await.unwrap();
    assert_eq!(hooks.open_sessions(), 0);
}

#[tokio::test]
async fn test_previously_registered_hooks_keep_running() {
    let recorder = Arc::new(RecordingHooks::default());
    let hooks = WhippetHooks::new(reqwest::Client::new(), Some(recorder.clone()));

    let user = TestUser::new(USER, &[]);
    hooks.mail_user_created(&user);
    hooks.mailbox_list_created(&list_for(&user));
    let mail = mail(6, 50, "mdbox", &user);
    hooks.mail_allocated(&mail);
    hooks.mail_precache(&mail).await.unwrap();
    hooks.mail_expunged(&mail).await.unwrap();
    hooks.transaction_ended(TXN, true).await.unwrap();
    hooks.mailbox_list_destroyed(&list_for(&user)).await;

    assert_eq!(
        recorder.names(),
        vec![
            format!("user_created:{USER}"),
            format!("list_created:{NS}"),
            "allocated:6".to_string(),
            "precache:50".to_string(),
            "expunged:50".to_string(),
            format!("ended:{TXN}:true"),
            format!("list_destroyed:{NS}"),
        ]
    );
}

#[tokio::test]
async fn test_rollback_with_failing_inner_still_releases_the_session() {
    let (hooks, mut receiver, user) = enabled_hooks_with_inner(ENGINE, Arc::new(FailingHooks));
    let mail = mail(12, 80, "mdbox", &user);
    hooks.mail_precache(&mail).await.unwrap();
    assert_eq!(hooks.open_sessions(), 1);

    let err = hooks.transaction_ended(TXN, false).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InternalError);
    // The rollback is honored no matter what the chain returned.
    assert_eq!(hooks.open_sessions(), 0);
    assert!(drain(&mut receiver).is_empty());
}

#[tokio::test]
async fn test_commit_with_failing_inner_still_flushes() {
    let (hooks, mut receiver, user) = enabled_hooks_with_inner(ENGINE, Arc::new(FailingHooks));
    let mail = mail(13, 81, "mdbox", &user);
    hooks.mail_precache(&mail).await.unwrap();

    let err = hooks.transaction_ended(TXN, true).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InternalError);
    assert_eq!(hooks.open_sessions(), 0);

    let jobs = drain(&mut receiver);
    assert_eq!(jobs.len(), 1);
    assert!(matches!(jobs[0], TransportJob::Bulk(_)));
}

#[tokio::test]
async fn test_failing_inner_cannot_drop_a_delete() {
    let (hooks, mut receiver, user) = enabled_hooks_with_inner(ENGINE, Arc::new(FailingHooks));
    let mail = mail(14, 82, "mdbox", &user);

    let err = hooks.mail_expunged(&mail).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InternalError);

    // The delete was enqueued before the chain's error surfaced.
    let err = hooks.transaction_ended(TXN, true).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InternalError);
    let jobs = drain(&mut receiver);
    assert_eq!(jobs.len(), 1);
    let expected = encode_delete(&MessageKey {
        uid: 82,
        mailbox: mailbox(),
        user: USER.to_string(),
    })
    .unwrap();
    match &jobs[0] {
        TransportJob::Bulk(payload) => assert_eq!(payload, &expected),
        other => panic!("unexpected job: {other:?}"),
    }
}

#[tokio::test]
async fn test_commit_failure_keeps_the_session_for_retry() {
    let (hooks, receiver, user) = enabled_hooks(ENGINE);
    let mail = mail(7, 60, "mdbox", &user);
    hooks.mail_allocated(&mail);
    hooks.mail_precache(&mail).await.unwrap();
    drop(receiver);

    let err = hooks.transaction_ended(TXN, true).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::TransportClosed);
    // The fragments survive for another delivery of the notification.
    assert_eq!(hooks.open_sessions(), 1);
    let err = hooks.transaction_ended(TXN, true).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::TransportClosed);
}

#[tokio::test]
async fn test_precache_without_uid_reports_and_skips() {
    let (hooks, mut receiver, user) = enabled_hooks(ENGINE);
    let mail = mail(8, 0, "mdbox", &user);
    hooks.mail_allocated(&mail);
    hooks.mail_precache(&mail).await.unwrap();
    assert_eq!(hooks.open_sessions(), 0);
    assert!(drain(&mut receiver).is_empty());
}

#[tokio::test]
async fn test_shutdown_releases_every_backend() {
    let (hooks, _receiver, user) = enabled_hooks(ENGINE);
    let (transport, _other) = SearchTransport::capture();
    hooks.install_namespace_transport(9, transport);
    let mail = mail(10, 70, "mdbox", &user);
    hooks.mail_allocated(&mail);
    hooks.mail_precache(&mail).await.unwrap();

    hooks.shutdown().await;
    assert_eq!(hooks.open_sessions(), 0);
    assert!(!hooks.namespace_indexing_enabled(NS));
    assert!(!hooks.namespace_indexing_enabled(9));
}
