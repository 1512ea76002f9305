// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use super::error::LoadError;

/// Extensions of container formats that typically carry raw production media and are worth
/// handing to a transcoder when direct decoding fails.
const RAW_MEDIA_EXTENSIONS: &[&str] = &["mxf", "mov", "mp4", "m4v", "mkv", "avi", "ts", "dv"];

/// Where a track's media comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceRef {
    Path(PathBuf),
    Url(String),
}

impl SourceRef {
    /// Parses a user supplied location. Anything with a scheme is treated as a URL.
    pub fn parse(location: &str) -> SourceRef {
        if location.contains("://") {
            SourceRef::Url(location.to_string())
        } else {
            SourceRef::Path(PathBuf::from(location))
        }
    }

    /// The lowercase file extension, used as a demuxer hint.
    pub fn extension(&self) -> Option<String> {
        let name = match self {
            SourceRef::Path(path) => path.file_name()?.to_str()?.to_string(),
            SourceRef::Url(url) => {
                let without_query = url.split(['?', '#']).next().unwrap_or(url);
                without_query.rsplit('/').next()?.to_string()
            }
        };
        let (_, extension) = name.rsplit_once('.')?;
        Some(extension.to_ascii_lowercase())
    }

    /// Returns true if this looks like raw production media that a transcoder can help with.
    pub fn is_raw_media(&self) -> bool {
        self.extension()
            .is_some_and(|extension| RAW_MEDIA_EXTENSIONS.contains(&extension.as_str()))
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceRef::Path(path) => write!(f, "{}", path.display()),
            SourceRef::Url(url) => f.write_str(url),
        }
    }
}

/// Retrieves the raw bytes of a media source.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, source: &SourceRef) -> Result<Vec<u8>, LoadError>;
}

/// Converts media the local decoders can't handle into a canonical format they can.
pub trait Transcoder: Send + Sync {
    fn transcode(&self, source: &SourceRef, media: &[u8]) -> Result<Vec<u8>, LoadError>;
}

/// Fetches from the local filesystem. Understands plain paths and `file://` URLs only.
#[derive(Default)]
pub struct FileFetcher {
    /// Relative paths are resolved against this directory when set.
    root: Option<PathBuf>,
}

impl FileFetcher {
    pub fn new() -> FileFetcher {
        FileFetcher { root: None }
    }

    /// Creates a fetcher that resolves relative paths against the given directory.
    pub fn rooted_at(root: &Path) -> FileFetcher {
        FileFetcher {
            root: Some(root.to_path_buf()),
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }
}

impl Fetcher for FileFetcher {
    fn fetch(&self, source: &SourceRef) -> Result<Vec<u8>, LoadError> {
        let path = match source {
            SourceRef::Path(path) => self.resolve(path),
            SourceRef::Url(url) => match url.strip_prefix("file://") {
                Some(path) => PathBuf::from(path),
                None => {
                    return Err(LoadError::SourceUnavailable(format!(
                        "{}: no fetcher for this scheme",
                        url
                    )))
                }
            },
        };

        fs::read(&path)
            .map_err(|e| LoadError::SourceUnavailable(format!("{}: {}", path.display(), e)))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_and_extension() {
        let path = SourceRef::parse("media/Master.WAV");
        assert_eq!(path, SourceRef::Path(PathBuf::from("media/Master.WAV")));
        assert_eq!(path.extension().as_deref(), Some("wav"));
        assert!(!path.is_raw_media());

        let url = SourceRef::parse("https://media.example/reel1/dub.mxf?token=abc");
        assert!(matches!(url, SourceRef::Url(_)));
        assert_eq!(url.extension().as_deref(), Some("mxf"));
        assert!(url.is_raw_media());

        assert_eq!(SourceRef::parse("noextension").extension(), None);
    }

    #[test]
    fn test_file_fetcher_missing_file() {
        let fetcher = FileFetcher::new();
        let result = fetcher.fetch(&SourceRef::parse("/definitely/not/here.wav"));
        assert!(matches!(result, Err(LoadError::SourceUnavailable(_))));
    }

    #[test]
    fn test_file_fetcher_rejects_remote_urls() {
        let fetcher = FileFetcher::new();
        let result = fetcher.fetch(&SourceRef::parse("https://media.example/a.wav"));
        assert!(matches!(result, Err(LoadError::SourceUnavailable(_))));
    }

    #[test]
    fn test_file_fetcher_rooted() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("a.bin"), [1u8, 2, 3])?;

        let fetcher = FileFetcher::rooted_at(dir.path());
        assert_eq!(fetcher.fetch(&SourceRef::parse("a.bin"))?, vec![1, 2, 3]);

        let url = format!("file://{}", dir.path().join("a.bin").display());
        assert_eq!(FileFetcher::new().fetch(&SourceRef::parse(&url))?, vec![1, 2, 3]);
        Ok(())
    }
}
