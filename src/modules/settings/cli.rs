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


use clap::Parser;
use std::sync::LazyLock;

// The host process owns argv, so only environment variables are read here.
#[cfg(not(test))]
pub static SETTINGS: LazyLock<Settings> = LazyLock::new(|| Settings::parse_from(["whippet"]));

#[cfg(test)]
pub static SETTINGS: LazyLock<Settings> = LazyLock::new(|| Settings {
    whippet_log_level: "debug".to_string(),
    whippet_ansi_logs: true,
    whippet_log_to_file: false,
    whippet_json_logs: false,
    whippet_log_dir: "/tmp/whippet_test/logs".to_string(),
    whippet_max_log_files: 5,
    whippet_http_timeout_secs: 5,
    whippet_queue_depth: 32,
});

#[derive(Debug, Parser)]
#[clap(
    name = "whippet",
    about = "Mail store full-text search indexing connector",
    version = env!("CARGO_PKG_VERSION")
)]
pub struct Settings {
    /// whippet log level (default: "info")
    #[clap(
        long,
        default_value = "info",
        env,
        help = "Set the log level for whippet"
    )]
    pub whippet_log_level: String,

    /// Enable ANSI logs (default: true)
    #[clap(long, default_value = "true", env, help = "Enable ANSI formatted logs")]
    pub whippet_ansi_logs: bool,

    /// Enable log file output (default: false)
    /// If false, logs will be printed to stdout
    #[clap(
        long,
        default_value = "false",
        env,
        help = "Enable log file output (otherwise logs go to stdout)"
    )]
    pub whippet_log_to_file: bool,

    /// Enable JSON logs (default: false)
    #[clap(
        long,
        default_value = "false",
        env,
        help = "Enable JSON formatted logs"
    )]
    pub whippet_json_logs: bool,

    /// Directory for log files when file output is enabled
    #[clap(
        long,
        default_value = "/var/log/whippet",
        env,
        help = "Set the directory for whippet log files"
    )]
    pub whippet_log_dir: String,

    /// Maximum number of log files (default: 5)
    #[clap(
        long,
        default_value = "5",
        env,
        help = "Set the maximum number of rotated log files to keep"
    )]
    pub whippet_max_log_files: usize,

    /// Timeout for each request to the search engine, in seconds
    #[clap(
        long,
        default_value = "30",
        env,
        help = "Set the HTTP request timeout for the search engine, in seconds"
    )]
    pub whippet_http_timeout_secs: u64,

    /// Depth of the per-backend submission queue
    #[clap(
        long,
        default_value = "32",
        env,
        help = "Set the number of bulk requests that may be queued before submitters block"
    )]
    pub whippet_queue_depth: usize,
}
