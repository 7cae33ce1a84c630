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

use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use tokio::{
    sync::{mpsc, Mutex},
    task::{self, JoinHandle},
};
use url::Url;

use crate::{
    modules::{
        error::{code::ErrorCode, WhippetResult},
        settings::{cli::SETTINGS, fts::FtsSettings},
        transport::rawlog::Rawlog,
    },
    raise_error,
};

pub mod rawlog;

const NDJSON: &str = "application/x-ndjson";

/// The slice of the engine's bulk response worth looking at.
#[derive(Debug, Deserialize)]
struct BulkSummary {
    #[serde(default)]
    took: u64,
    #[serde(default)]
    errors: bool,
}

#[derive(Debug)]
pub enum TransportJob {
    Bulk(Bytes),
    Refresh,
    Shutdown,
}

/// Asynchronous submission path to the search engine.
///
/// Callers hand payloads to a bounded queue and move on; a single worker task
/// drains the queue and performs the HTTP requests, which keeps submissions
/// for one backend strictly ordered. The worker logs engine failures and does
/// not retry. Enqueueing succeeding is what callers may rely on, not delivery.
pub struct SearchTransport {
    sender: mpsc::Sender<TransportJob>,
    worker: Mutex<Option<JoinHandle<()>>>,
    url: Url,
}

impl SearchTransport {
    /// Build the `_bulk`/`_refresh` endpoints from the configured engine URL
    /// and start the worker task on the shared HTTP client.
    pub fn connect(client: reqwest::Client, settings: &FtsSettings) -> WhippetResult<Arc<Self>> {
        let base = settings.required_url()?;
        let bulk_url = endpoint(base, "_bulk")?;
        let refresh_url = endpoint(base, "_refresh")?;
        let rawlog = settings.rawlog_dir.as_deref().and_then(Rawlog::open);
        let debug = settings.debug;

        let (sender, mut receiver) = mpsc::channel::<TransportJob>(SETTINGS.whippet_queue_depth);
        let handle = task::spawn(async move {
            while let Some(job) = receiver.recv().await {
                match job {
                    TransportJob::Bulk(payload) => {
                        if debug {
                            tracing::debug!(bytes = payload.len(), url = %bulk_url, "submitting bulk request");
                        }
                        if let Err(e) =
                            post_bulk(&client, &bulk_url, payload, rawlog.as_ref()).await
                        {
                            tracing::error!(error = %e, url = %bulk_url, "bulk indexing request failed");
                        }
                    }
                    TransportJob::Refresh => {
                        if debug {
                            tracing::debug!(url = %refresh_url, "requesting index refresh");
                        }
                        if let Err(e) = post_refresh(&client, &refresh_url, rawlog.as_ref()).await {
                            tracing::error!(error = %e, url = %refresh_url, "index refresh request failed");
                        }
                    }
                    TransportJob::Shutdown => break,
                }
            }
        });

        Ok(Arc::new(Self {
            sender,
            worker: Mutex::new(Some(handle)),
            url: base.clone(),
        }))
    }

    /// Transport that records jobs instead of performing them.
    #[cfg(test)]
    pub fn capture() -> (Arc<Self>, mpsc::Receiver<TransportJob>) {
        let (sender, receiver) = mpsc::channel(64);
        let transport = Arc::new(Self {
            sender,
            worker: Mutex::new(None),
            url: Url::parse("http://capture.invalid/").unwrap(),
        });
        (transport, receiver)
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Queue a bulk payload. Returns an error only when the worker is gone,
    /// in which case the payload was not accepted.
    pub async fn submit_bulk(&self, payload: Bytes) -> WhippetResult<()> {
        self.sender
            .send(TransportJob::Bulk(payload))
            .await
            .map_err(|_| {
                raise_error!(
                    "Search transport is shut down, bulk payload not accepted".into(),
                    ErrorCode::TransportClosed
                )
            })
    }

    /// Queue a refresh request, ordered after everything queued before it.
    pub async fn request_refresh(&self) -> WhippetResult<()> {
        self.sender.send(TransportJob::Refresh).await.map_err(|_| {
            raise_error!(
                "Search transport is shut down, refresh not accepted".into(),
                ErrorCode::TransportClosed
            )
        })
    }

    /// Drain everything already queued, then stop the worker.
    pub async fn shutdown(&self) {
        if self.sender.send(TransportJob::Shutdown).await.is_err() {
            return;
        }
        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "search transport worker ended abnormally");
            }
        }
    }
}

async fn post_bulk(
    client: &reqwest::Client,
    url: &Url,
    payload: Bytes,
    rawlog: Option<&Rawlog>,
) -> WhippetResult<()> {
    if let Some(rawlog) = rawlog {
        rawlog.dump_request("bulk", &payload).await;
    }
    let response = client
        .post(url.clone())
        .header(CONTENT_TYPE, NDJSON)
        .body(payload)
        .send()
        .await
        .map_err(|e| raise_error!(format!("{e:#}"), ErrorCode::NetworkError))?;
    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|e| raise_error!(format!("{e:#}"), ErrorCode::NetworkError))?;
    if let Some(rawlog) = rawlog {
        rawlog.dump_response("bulk", status.as_u16(), &body).await;
    }
    if !status.is_success() {
        return Err(raise_error!(
            format!("Search engine returned {status} for bulk request"),
            ErrorCode::HttpResponseError
        ));
    }
    // 200 with "errors": true means individual actions were rejected.
    if let Ok(summary) = serde_json::from_slice::<BulkSummary>(&body) {
        if summary.errors {
            tracing::warn!(
                took_ms = summary.took,
                "search engine reported item-level errors in bulk response"
            );
        }
    }
    Ok(())
}

async fn post_refresh(
    client: &reqwest::Client,
    url: &Url,
    rawlog: Option<&Rawlog>,
) -> WhippetResult<()> {
    if let Some(rawlog) = rawlog {
        rawlog.dump_request("refresh", b"").await;
    }
    let response = client
        .post(url.clone())
        .send()
        .await
        .map_err(|e| raise_error!(format!("{e:#}"), ErrorCode::NetworkError))?;
    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|e| raise_error!(format!("{e:#}"), ErrorCode::NetworkError))?;
    if let Some(rawlog) = rawlog {
        rawlog.dump_response("refresh", status.as_u16(), &body).await;
    }
    if !status.is_success() {
        return Err(raise_error!(
            format!("Search engine returned {status} for refresh request"),
            ErrorCode::HttpResponseError
        ));
    }
    Ok(())
}

/// Resolve an endpoint under the configured engine URL, which may carry an
/// index path with or without a trailing slash.
fn endpoint(base: &Url, leaf: &str) -> WhippetResult<Url> {
    let mut url = base.clone();
    if !url.path().ends_with('/') {
        url.set_path(&format!("{}/", url.path()));
    }
    url.join(leaf).map_err(|e| {
        raise_error!(
            format!("Cannot build {leaf} endpoint from '{base}': {e}"),
            ErrorCode::InvalidSetting
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoints_respect_index_path() {
        let base = Url::parse("http://localhost:9200/mails").unwrap();
        assert_eq!(
            endpoint(&base, "_bulk").unwrap().as_str(),
            "http://localhost:9200/mails/_bulk"
        );
        let slashed = Url::parse("http://localhost:9200/mails/").unwrap();
        assert_eq!(
            endpoint(&slashed, "_refresh").unwrap().as_str(),
            "http://localhost:9200/mails/_refresh"
        );
        let bare = Url::parse("http://localhost:9200").unwrap();
        assert_eq!(
            endpoint(&bare, "_bulk").unwrap().as_str(),
            "http://localhost:9200/_bulk"
        );
    }

    #[tokio::test]
    async fn test_capture_transport_preserves_submission_order() {
        let (transport, mut receiver) = SearchTransport::capture();
        transport.submit_bulk(Bytes::from_static(b"a\n")).await.unwrap();
        transport.submit_bulk(Bytes::from_static(b"b\n")).await.unwrap();
        transport.request_refresh().await.unwrap();

        match receiver.recv().await.unwrap() {
            TransportJob::Bulk(payload) => assert_eq!(&payload[..], b"a\n"),
            other => panic!("unexpected job: {other:?}"),
        }
        match receiver.recv().await.unwrap() {
            TransportJob::Bulk(payload) => assert_eq!(&payload[..], b"b\n"),
            other => panic!("unexpected job: {other:?}"),
        }
        assert!(matches!(
            receiver.recv().await.unwrap(),
            TransportJob::Refresh
        ));
    }

    #[tokio::test]
    async fn test_submission_fails_once_receiver_is_gone() {
        let (transport, receiver) = SearchTransport::capture();
        drop(receiver);
        let err = transport
            .submit_bulk(Bytes::from_static(b"a\n"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::TransportClosed);
    }
}
