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


use std::{sync::Arc, time::Duration};

use crate::{
    modules::{
        error::{code::ErrorCode, WhippetResult},
        logger,
        settings::cli::SETTINGS,
        storage::{MailStorageHooks, WhippetHooks},
    },
    raise_error,
};

/// Process-lifetime root of the plugin.
///
/// The host constructs one context at plugin load and keeps it until unload.
/// It owns the HTTP connection pool every namespace backend submits through
/// and the storage hooks the host registers with its mail store.
pub struct PluginContext {
    http_client: reqwest::Client,
    hooks: Arc<WhippetHooks>,
}

impl PluginContext {
    /// Plugin load: install logging, build the shared HTTP client, and wire
    /// the storage hooks, wrapping any previously registered collaborator.
    pub fn init(previous: Option<Arc<dyn MailStorageHooks>>) -> WhippetResult<Self> {
        logger::initialize_logging();
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(SETTINGS.whippet_http_timeout_secs))
            .build()
            .map_err(|e| raise_error!(format!("{e:#}"), ErrorCode::BackendInitFailed))?;
        let hooks = Arc::new(WhippetHooks::new(http_client.clone(), previous));
        tracing::info!("whippet plugin initialized");
        Ok(Self { http_client, hooks })
    }

    /// The hooks to register with the mail store.
    pub fn hooks(&self) -> Arc<WhippetHooks> {
        self.hooks.clone()
    }

    /// The engine-facing HTTP client, shared across namespace backends.
    pub fn http_client(&self) -> &reqwest::Client {
        &self.http_client
    }

    /// Plugin unload: release every namespace backend, draining queued
    /// submissions before the workers stop.
    pub async fn shutdown(&self) {
        self.hooks.shutdown().await;
        tracing::info!("whippet plugin shut down");
    }
}
