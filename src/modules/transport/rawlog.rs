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


use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use chrono::Utc;
use tokio::{fs::File, io::AsyncWriteExt};

/// Dumps every request and response body exchanged with the search engine
/// into its own file, for protocol debugging. Write failures are logged and
/// otherwise ignored; rawlogging must never interfere with indexing.
#[derive(Debug)]
pub struct Rawlog {
    dir: PathBuf,
    seq: AtomicU64,
}

impl Rawlog {
    /// Returns `None` (with a warning) when the directory does not exist, the
    /// same way a missing rawlog directory disables rawlogging rather than
    /// failing the backend.
    pub fn open(dir: &Path) -> Option<Self> {
        if !dir.is_dir() {
            tracing::warn!(
                dir = %dir.display(),
                "rawlog_dir does not exist, rawlog disabled"
            );
            return None;
        }
        Some(Self {
            dir: dir.to_path_buf(),
            seq: AtomicU64::new(0),
        })
    }

    /// Record an outgoing request body.
    pub async fn dump_request(&self, kind: &str, payload: &[u8]) {
        let path = self.next_path(kind, "out");
        if let Err(e) = write_file(&path, payload).await {
            tracing::warn!(path = %path.display(), error = %e, "failed to write rawlog file");
        }
    }

    /// Record a response, prefixed with the HTTP status line.
    pub async fn dump_response(&self, kind: &str, status: u16, payload: &[u8]) {
        let path = self.next_path(kind, "in");
        let mut contents = format!("HTTP {status}\n").into_bytes();
        contents.extend_from_slice(payload);
        if let Err(e) = write_file(&path, &contents).await {
            tracing::warn!(path = %path.display(), error = %e, "failed to write rawlog file");
        }
    }

    fn next_path(&self, kind: &str, direction: &str) -> PathBuf {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let stamp = Utc::now().format("%Y%m%d-%H%M%S");
        self.dir
            .join(format!("{stamp}.{seq:06}.{kind}.{direction}"))
    }
}

async fn write_file(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path).await?;
    file.write_all(contents).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_dumps_request_and_response_files() {
        let dir = tempdir().unwrap();
        let rawlog = Rawlog::open(dir.path()).unwrap();
        rawlog.dump_request("bulk", b"{\"index\":{}}\n").await;
        rawlog.dump_response("bulk", 200, b"{\"errors\":false}").await;

        let mut names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert_eq!(names.len(), 2);
        assert!(names[0].ends_with(".bulk.out"));
        assert!(names[1].ends_with(".bulk.in"));

        let response = std::fs::read(dir.path().join(&names[1])).unwrap();
        assert!(response.starts_with(b"HTTP 200\n"));
    }

    #[test]
    fn test_missing_directory_disables_rawlog() {
        assert!(Rawlog::open(Path::new("/nonexistent/rawlog/dir")).is_none());
    }
}
