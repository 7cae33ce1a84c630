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


use std::sync::OnceLock;

use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{InitError, RollingFileAppender, Rotation},
};
use tracing_subscriber::EnvFilter;

use crate::modules::settings::cli::SETTINGS;

// Keeps the non-blocking writer alive for the lifetime of the process.
static LOG_GUARD: OnceLock<Option<WorkerGuard>> = OnceLock::new();

/// Install the tracing subscriber according to the process settings.
///
/// Safe to call more than once, and a no-op when the host process already
/// installed its own global subscriber.
pub fn initialize_logging() {
    LOG_GUARD.get_or_init(init_subscriber);
}

fn init_subscriber() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&SETTINGS.whippet_log_level));

    if SETTINGS.whippet_log_to_file {
        match rolling_appender() {
            Ok(appender) => {
                let (writer, guard) = tracing_appender::non_blocking(appender);
                if SETTINGS.whippet_json_logs {
                    let _ = tracing_subscriber::fmt()
                        .json()
                        .with_env_filter(filter)
                        .with_writer(writer)
                        .with_ansi(false)
                        .try_init();
                } else {
                    let _ = tracing_subscriber::fmt()
                        .with_env_filter(filter)
                        .with_writer(writer)
                        .with_ansi(false)
                        .try_init();
                }
                return Some(guard);
            }
            Err(e) => {
                eprintln!(
                    "whippet: cannot write logs under {}: {e}, falling back to stdout",
                    SETTINGS.whippet_log_dir
                );
            }
        }
    }

    if SETTINGS.whippet_json_logs {
        let _ = tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(SETTINGS.whippet_ansi_logs)
            .try_init();
    }
    None
}

fn rolling_appender() -> Result<RollingFileAppender, InitError> {
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("whippet")
        .filename_suffix("log")
        .max_log_files(SETTINGS.whippet_max_log_files)
        .build(&SETTINGS.whippet_log_dir)
}
