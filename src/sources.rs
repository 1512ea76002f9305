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
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{info, span, warn, Level};

use crate::track::{Track, TrackId, TrackRole, TrackSource};

pub mod decode;
pub mod error;
pub mod fetch;
pub mod stream;

pub use error::LoadError;
pub use fetch::{FileFetcher, Fetcher, SourceRef, Transcoder};
pub use stream::StreamingDecoder;

/// Which fallback tier produced a track's playable source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadTier {
    /// The fetched bytes decoded directly.
    Decoded,
    /// The bytes decoded after a transcode to a canonical format.
    Transcoded,
    /// Nothing decoded up front; the track is a metadata-only stream handle.
    Streaming,
}

impl fmt::Display for LoadTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadTier::Decoded => f.write_str("decoded"),
            LoadTier::Transcoded => f.write_str("transcoded"),
            LoadTier::Streaming => f.write_str("streaming"),
        }
    }
}

/// A request to load one track.
#[derive(Clone, Debug)]
pub struct LoadRequest {
    pub id: TrackId,
    pub source: SourceRef,
    pub role: TrackRole,
}

impl LoadRequest {
    pub fn new(id: impl Into<TrackId>, source: SourceRef, role: TrackRole) -> LoadRequest {
        LoadRequest {
            id: id.into(),
            source,
            role,
        }
    }
}

/// A successfully loaded track together with the tier that produced it.
#[derive(Debug)]
pub struct Loaded {
    pub track: Track,
    pub tier: LoadTier,
}

/// Turns source references into playable tracks.
pub struct AudioSourceManager {
    fetcher: Arc<dyn Fetcher>,
    transcoder: Option<Arc<dyn Transcoder>>,
}

impl Default for AudioSourceManager {
    fn default() -> Self {
        AudioSourceManager::new(Arc::new(FileFetcher::new()), None)
    }
}

impl AudioSourceManager {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        transcoder: Option<Arc<dyn Transcoder>>,
    ) -> AudioSourceManager {
        AudioSourceManager {
            fetcher,
            transcoder,
        }
    }

    /// Loads a track, falling through decode -> transcode -> stream handle. A missing source is
    /// fatal; decode failures only surface once every tier has failed.
    pub fn load(&self, request: &LoadRequest) -> Result<Loaded, LoadError> {
        let span = span!(Level::INFO, "load", track = %request.id);
        let _enter = span.enter();

        let media: Arc<[u8]> = Arc::from(self.fetcher.fetch(&request.source)?);
        let hint = request.source.extension();

        let (source, tier) = self.resolve(&request.source, media, hint.as_deref())?;
        info!(
            source = %request.source,
            tier = %tier,
            duration = ?source.duration(),
            "Loaded track."
        );

        Ok(Loaded {
            track: Track::new(request.id.clone(), request.role, source),
            tier,
        })
    }

    /// Walks the fallback tiers. Each tier owns its decode context for the duration of its call,
    /// so a failed tier has released everything before the next one starts.
    fn resolve(
        &self,
        source_ref: &SourceRef,
        media: Arc<[u8]>,
        hint: Option<&str>,
    ) -> Result<(TrackSource, LoadTier), LoadError> {
        let decode_err = match decode::decode_to_buffer(media.clone(), hint) {
            Ok(buffer) => return Ok((TrackSource::Buffer(Arc::new(buffer)), LoadTier::Decoded)),
            Err(e) => e,
        };
        warn!(source = %source_ref, err = %decode_err, "Direct decode failed.");

        let mut transcode_err = None;
        if let (Some(transcoder), true) = (&self.transcoder, source_ref.is_raw_media()) {
            match transcoder.transcode(source_ref, &media).and_then(|transcoded| {
                decode::decode_to_buffer(Arc::from(transcoded), None).map_err(|e| {
                    LoadError::Transcode(format!("transcoded media didn't decode: {}", e))
                })
            }) {
                Ok(buffer) => {
                    return Ok((
                        TrackSource::Buffer(Arc::new(buffer)),
                        LoadTier::Transcoded,
                    ))
                }
                Err(e) => {
                    warn!(source = %source_ref, err = %e, "Transcoded decode failed.");
                    transcode_err = Some(e);
                }
            }
        }

        match decode::probe_stream(media, hint) {
            Ok(handle) => Ok((TrackSource::Stream(handle), LoadTier::Streaming)),
            Err(stream_err) => {
                let transcode = transcode_err
                    .map(|e| format!("; {}", e))
                    .unwrap_or_default();
                Err(LoadError::DecodeFailed(format!(
                    "{}: all tiers failed (decode: {}{}; stream: {})",
                    source_ref, decode_err, transcode, stream_err
                )))
            }
        }
    }

    /// Loads every request concurrently. One failure never affects the others; results come back
    /// in request order.
    pub async fn load_many(
        self: &Arc<Self>,
        requests: Vec<LoadRequest>,
    ) -> Vec<(TrackId, Result<Loaded, LoadError>)> {
        let mut join_set = JoinSet::new();
        for (index, request) in requests.iter().cloned().enumerate() {
            let manager = self.clone();
            join_set.spawn_blocking(move || (index, manager.load(&request)));
        }

        let mut results: Vec<Option<Result<Loaded, LoadError>>> =
            requests.iter().map(|_| None).collect();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => warn!(err = %e, "Load task failed."),
            }
        }

        requests
            .into_iter()
            .zip(results)
            .map(|(request, result)| {
                let result = result.unwrap_or_else(|| {
                    Err(LoadError::Task(format!("{}: load task did not finish", request.id)))
                });
                (request.id, result)
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::path::Path;
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::testutil::audio::write_wav;

    /// Serves fixed bytes per path and records every fetch.
    struct MemoryFetcher {
        media: Vec<(String, Vec<u8>)>,
        fetched: Mutex<Vec<String>>,
    }

    impl Fetcher for MemoryFetcher {
        fn fetch(&self, source: &SourceRef) -> Result<Vec<u8>, LoadError> {
            let key = source.to_string();
            self.fetched.lock().push(key.clone());
            self.media
                .iter()
                .find(|(name, _)| *name == key)
                .map(|(_, bytes)| bytes.clone())
                .ok_or(LoadError::SourceUnavailable(key))
        }
    }

    /// Pretends to transcode by returning a known-good WAV.
    struct FixedTranscoder(Vec<u8>);

    impl Transcoder for FixedTranscoder {
        fn transcode(&self, _: &SourceRef, _: &[u8]) -> Result<Vec<u8>, LoadError> {
            Ok(self.0.clone())
        }
    }

    fn wav(dir: &Path, name: &str, frames: usize) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
        let path = dir.join(name);
        write_wav(path.clone(), vec![vec![0i32; frames]], 1000)?;
        Ok(fs::read(path)?)
    }

    #[test]
    fn test_load_decodes_directly() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        write_wav(dir.path().join("master.wav"), vec![vec![0i32; 3000]], 1000)?;

        let manager = AudioSourceManager::new(Arc::new(FileFetcher::rooted_at(dir.path())), None);
        let loaded = manager.load(&LoadRequest::new(
            "master",
            SourceRef::parse("master.wav"),
            TrackRole::Reference,
        ))?;

        assert_eq!(loaded.tier, LoadTier::Decoded);
        assert_eq!(loaded.track.role(), TrackRole::Reference);
        assert_eq!(loaded.track.duration(), Duration::from_secs(3));
        assert!(matches!(loaded.track.source(), TrackSource::Buffer(_)));
        Ok(())
    }

    #[test]
    fn test_missing_source_is_fatal() {
        let manager = AudioSourceManager::default();
        let result = manager.load(&LoadRequest::new(
            "dub",
            SourceRef::parse("/no/such/dub.wav"),
            TrackRole::Component,
        ));
        assert!(matches!(result, Err(LoadError::SourceUnavailable(_))));
    }

    #[test]
    fn test_raw_media_goes_through_transcoder() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let good = wav(dir.path(), "good.wav", 2000)?;

        let fetcher = MemoryFetcher {
            media: vec![("reel.mxf".to_string(), vec![0x42; 512])],
            fetched: Mutex::new(Vec::new()),
        };
        let manager = AudioSourceManager::new(
            Arc::new(fetcher),
            Some(Arc::new(FixedTranscoder(good))),
        );

        let loaded = manager.load(&LoadRequest::new(
            "dub",
            SourceRef::parse("reel.mxf"),
            TrackRole::Component,
        ))?;
        assert_eq!(loaded.tier, LoadTier::Transcoded);
        assert_eq!(loaded.track.duration(), Duration::from_secs(2));
        Ok(())
    }

    #[test]
    fn test_non_raw_media_skips_transcoder() {
        let fetcher = MemoryFetcher {
            media: vec![("broken.wav".to_string(), vec![0x42; 512])],
            fetched: Mutex::new(Vec::new()),
        };
        let manager = AudioSourceManager::new(
            Arc::new(fetcher),
            Some(Arc::new(FixedTranscoder(Vec::new()))),
        );

        // Garbage that isn't raw media: every tier fails and the decode failure surfaces.
        let result = manager.load(&LoadRequest::new(
            "dub",
            SourceRef::parse("broken.wav"),
            TrackRole::Component,
        ));
        assert!(matches!(result, Err(LoadError::DecodeFailed(_))));
    }

    #[test]
    fn test_bad_transcode_is_reported() {
        let fetcher = MemoryFetcher {
            media: vec![("reel.mov".to_string(), vec![0x42; 512])],
            fetched: Mutex::new(Vec::new()),
        };
        let manager = AudioSourceManager::new(
            Arc::new(fetcher),
            Some(Arc::new(FixedTranscoder(vec![0x13; 256]))),
        );

        let result = manager.load(&LoadRequest::new(
            "dub",
            SourceRef::parse("reel.mov"),
            TrackRole::Component,
        ));
        match result {
            Err(LoadError::DecodeFailed(message)) => {
                assert!(message.contains("Transcode failed"), "{message}");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_load_many_isolates_failures() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let mut media = Vec::new();
        for i in 1..=5 {
            if i != 3 {
                let name = format!("track{}.wav", i);
                media.push((name.clone(), wav(dir.path(), &name, 1000 * i)?));
            }
        }
        let manager = Arc::new(AudioSourceManager::new(
            Arc::new(MemoryFetcher {
                media,
                fetched: Mutex::new(Vec::new()),
            }),
            None,
        ));

        let requests = (1..=5)
            .map(|i| {
                LoadRequest::new(
                    format!("t{}", i),
                    SourceRef::parse(&format!("track{}.wav", i)),
                    TrackRole::Component,
                )
            })
            .collect();
        let results = manager.load_many(requests).await;

        assert_eq!(results.len(), 5);
        assert_eq!(results.iter().filter(|(_, r)| r.is_ok()).count(), 4);
        assert_eq!(results[2].0, TrackId::from("t3"));
        assert!(matches!(results[2].1, Err(LoadError::SourceUnavailable(_))));
        assert_eq!(
            results[4].1.as_ref().map(|loaded| loaded.track.duration()).ok(),
            Some(Duration::from_secs(5))
        );
        Ok(())
    }
}
