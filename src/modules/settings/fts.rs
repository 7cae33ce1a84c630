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


use std::path::PathBuf;

use url::Url;

use crate::{
    modules::error::{code::ErrorCode, WhippetResult},
    raise_error,
};

/// Bytes of encoded bulk payload a session may accumulate before a flush is forced.
pub const DEFAULT_BULK_SIZE: usize = 5 * 1024 * 1024;

/// Per-user indexing settings, resolved from the plugin settings string the
/// mail store hands us (e.g. `"url=http://localhost:9200/mails/ bulk_size=100"`).
///
/// Resolution is all-or-nothing: any unknown or malformed token rejects the
/// whole string, and indexing stays disabled for that user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtsSettings {
    /// Base URL of the search engine, including the index path.
    /// Indexing cannot be enabled without it.
    pub url: Option<Url>,
    /// Flush threshold in bytes for buffered bulk payload.
    pub bulk_size: usize,
    /// Request an engine refresh at transaction commit when documents were
    /// added or expunged.
    pub refresh_on_update: bool,
    /// Request an engine refresh whenever the search layer asks for one.
    pub refresh_by_fts: bool,
    /// Log indexing decisions at debug level even when tracing is quieter.
    pub debug: bool,
    /// Directory for raw request/response dumps, mainly for protocol debugging.
    pub rawlog_dir: Option<PathBuf>,
}

impl Default for FtsSettings {
    fn default() -> Self {
        Self {
            url: None,
            bulk_size: DEFAULT_BULK_SIZE,
            refresh_on_update: false,
            refresh_by_fts: true,
            debug: false,
            rawlog_dir: None,
        }
    }
}

impl FtsSettings {
    /// Resolve a plugin settings string into a validated settings value.
    ///
    /// Recognized tokens: `url=<value>`, `debug`, `rawlog_dir=<path>`,
    /// `bulk_size=<positive integer>`, `refresh=never|update|fts`.
    /// When the same token repeats, the last occurrence wins.
    pub fn resolve(raw: &str) -> WhippetResult<Self> {
        let mut settings = Self::default();
        for token in raw.split_ascii_whitespace() {
            if let Some(value) = token.strip_prefix("url=") {
                let url = Url::parse(value).map_err(|e| {
                    raise_error!(
                        format!("Invalid url '{value}' in plugin settings: {e}"),
                        ErrorCode::InvalidSetting
                    )
                })?;
                settings.url = Some(url);
            } else if token == "debug" {
                settings.debug = true;
            } else if let Some(value) = token.strip_prefix("rawlog_dir=") {
                settings.rawlog_dir = Some(PathBuf::from(value));
            } else if let Some(value) = token.strip_prefix("bulk_size=") {
                settings.bulk_size = match value.parse::<usize>() {
                    Ok(size) if size > 0 => size,
                    _ => {
                        return Err(raise_error!(
                            format!("bulk_size='{value}' must be a positive integer"),
                            ErrorCode::InvalidSetting
                        ))
                    }
                };
            } else if let Some(value) = token.strip_prefix("refresh=") {
                match value {
                    "never" => {
                        settings.refresh_on_update = false;
                        settings.refresh_by_fts = false;
                    }
                    "update" => settings.refresh_on_update = true,
                    "fts" => settings.refresh_by_fts = true,
                    other => {
                        return Err(raise_error!(
                            format!("Invalid refresh value '{other}', expected never, update or fts"),
                            ErrorCode::InvalidSetting
                        ))
                    }
                }
            } else {
                return Err(raise_error!(
                    format!("Invalid plugin setting: {token}"),
                    ErrorCode::InvalidSetting
                ));
            }
        }
        Ok(settings)
    }

    /// The engine URL, or an error when indexing was configured without one.
    pub fn required_url(&self) -> WhippetResult<&Url> {
        self.url.as_ref().ok_or_else(|| {
            raise_error!(
                "Plugin settings have no url=, indexing cannot be enabled".into(),
                ErrorCode::MissingConfiguration
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_string_yields_defaults() {
        let settings = FtsSettings::resolve("").unwrap();
        assert_eq!(settings.url, None);
        assert_eq!(settings.bulk_size, DEFAULT_BULK_SIZE);
        assert!(!settings.refresh_on_update);
        assert!(settings.refresh_by_fts);
        assert!(!settings.debug);
        assert_eq!(settings.rawlog_dir, None);
    }

    #[test]
    fn test_full_settings_string() {
        let settings =
            FtsSettings::resolve("url=http://localhost:9200 bulk_size=100 refresh=never").unwrap();
        assert_eq!(
            settings.url.as_ref().map(|u| u.as_str()),
            Some("http://localhost:9200/")
        );
        assert_eq!(settings.bulk_size, 100);
        assert!(!settings.refresh_on_update);
        assert!(!settings.refresh_by_fts);
        assert!(!settings.debug);
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let raw = "url=http://search.example.com:9200/mails/ debug rawlog_dir=/tmp/rawlog";
        let first = FtsSettings::resolve(raw).unwrap();
        let second = FtsSettings::resolve(raw).unwrap();
        assert_eq!(first, second);
        assert!(first.debug);
        assert_eq!(first.rawlog_dir, Some(PathBuf::from("/tmp/rawlog")));
    }

    #[test]
    fn test_refresh_update_keeps_engine_default() {
        // refresh=update only raises the on-update flag, the engine-side
        // default stays in effect.
        let settings = FtsSettings::resolve("refresh=update").unwrap();
        assert!(settings.refresh_on_update);
        assert!(settings.refresh_by_fts);
    }

    #[test]
    fn test_both_refresh_tokens_set_both_flags() {
        let settings = FtsSettings::resolve("refresh=never refresh=update refresh=fts").unwrap();
        assert!(settings.refresh_on_update);
        assert!(settings.refresh_by_fts);
    }

    #[test]
    fn test_refresh_never_clears_both_flags() {
        let settings = FtsSettings::resolve("refresh=update refresh=never").unwrap();
        assert!(!settings.refresh_on_update);
        assert!(!settings.refresh_by_fts);
    }

    #[test]
    fn test_unknown_token_rejects_whole_string() {
        let err = FtsSettings::resolve("url=http://localhost:9200 no_such_option").unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidSetting);
    }

    #[test]
    fn test_bad_refresh_value_is_rejected() {
        let err = FtsSettings::resolve("refresh=sometimes").unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidSetting);
    }

    #[test]
    fn test_bulk_size_must_be_positive_integer() {
        for raw in ["bulk_size=0", "bulk_size=-1", "bulk_size=10MB", "bulk_size="] {
            let err = FtsSettings::resolve(raw).unwrap_err();
            assert_eq!(err.code(), ErrorCode::InvalidSetting, "{raw}");
        }
        let settings = FtsSettings::resolve("bulk_size=1048576").unwrap();
        assert_eq!(settings.bulk_size, 1048576);
    }

    #[test]
    fn test_malformed_url_is_rejected() {
        let err = FtsSettings::resolve("url=not-a-url").unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidSetting);
    }

    #[test]
    fn test_last_token_wins() {
        let settings =
            FtsSettings::resolve("bulk_size=10 bulk_size=20 url=http://a:1 url=http://b:2")
                .unwrap();
        assert_eq!(settings.bulk_size, 20);
        assert_eq!(settings.url.as_ref().map(|u| u.as_str()), Some("http://b:2/"));
    }

    #[test]
    fn test_required_url_missing() {
        let settings = FtsSettings::resolve("debug").unwrap();
        let err = settings.required_url().unwrap_err();
        assert_eq!(err.code(), ErrorCode::MissingConfiguration);
    }
}
