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
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use config::{Config, File, FileFormat};
use serde::Deserialize;

use super::engine::Engine;
use super::error::ConfigError;
use crate::sources::{LoadRequest, SourceRef};
use crate::track::{TrackId, TrackRole};

/// One track in a session file.
#[derive(Deserialize, Clone, Debug)]
pub struct Track {
    id: String,
    /// A path (relative to the session file) or URL.
    file: String,
    role: Option<TrackRole>,
    /// Signed offset in seconds.
    offset: Option<f64>,
    volume: Option<f32>,
    pan: Option<f32>,
    muted: Option<bool>,
    solo: Option<bool>,
    /// Picks a per-channel offset out of the analysis results.
    channel_role: Option<String>,
}

impl Track {
    pub fn id(&self) -> TrackId {
        TrackId::new(self.id.clone())
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn role(&self) -> TrackRole {
        self.role.unwrap_or_default()
    }

    pub fn offset(&self) -> f64 {
        self.offset.unwrap_or(0.0)
    }

    /// The offset only if the file sets one. Analysis results fill in the rest.
    pub fn explicit_offset(&self) -> Option<f64> {
        self.offset
    }

    pub fn volume(&self) -> f32 {
        self.volume.unwrap_or(1.0)
    }

    pub fn pan(&self) -> f32 {
        self.pan.unwrap_or(0.0)
    }

    pub fn muted(&self) -> bool {
        self.muted.unwrap_or(false)
    }

    pub fn solo(&self) -> bool {
        self.solo.unwrap_or(false)
    }

    pub fn channel_role(&self) -> Option<&str> {
        self.channel_role.as_deref()
    }
}

/// A YAML description of a comparison session.
#[derive(Deserialize, Clone, Debug)]
pub struct Session {
    tracks: Vec<Track>,
    /// Path to an analysis result JSON file.
    analysis: Option<String>,
    engine: Option<Engine>,

    /// Directory relative paths resolve against.
    #[serde(skip)]
    base_dir: Option<PathBuf>,
}

impl Session {
    /// Parses a session from a YAML file.
    pub fn deserialize(path: &Path) -> Result<Session, ConfigError> {
        let mut session = Config::builder()
            .add_source(File::from(path))
            .build()?
            .try_deserialize::<Session>()?;
        session.base_dir = path.parent().map(Path::to_path_buf);
        session.validate()?;
        Ok(session)
    }

    /// Parses a session from a YAML string. Relative paths resolve against `base_dir`.
    pub fn deserialize_yaml(yaml: &str, base_dir: Option<&Path>) -> Result<Session, ConfigError> {
        let mut session = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?
            .try_deserialize::<Session>()?;
        session.base_dir = base_dir.map(Path::to_path_buf);
        session.validate()?;
        Ok(session)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for track in &self.tracks {
            if !seen.insert(track.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate track id {}", track.id)));
            }
        }
        let references = self
            .tracks
            .iter()
            .filter(|track| track.role() == TrackRole::Reference)
            .count();
        if references > 1 {
            return Err(ConfigError::Invalid(format!(
                "{} tracks are marked as reference, at most one is allowed",
                references
            )));
        }
        Ok(())
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// The engine block, or defaults if the session has none.
    pub fn engine(&self) -> Engine {
        self.engine.clone().unwrap_or_default()
    }

    /// The analysis file, resolved like track files.
    pub fn analysis(&self) -> Option<PathBuf> {
        self.analysis.as_deref().map(|analysis| self.resolve_path(analysis))
    }

    fn resolve_path(&self, file: &str) -> PathBuf {
        let path = PathBuf::from(file);
        match &self.base_dir {
            Some(base_dir) if path.is_relative() => base_dir.join(path),
            _ => path,
        }
    }

    /// Where a track's media comes from.
    pub fn source(&self, track: &Track) -> SourceRef {
        match SourceRef::parse(track.file()) {
            SourceRef::Path(_) => SourceRef::Path(self.resolve_path(track.file())),
            url => url,
        }
    }

    /// One load request per track, in file order.
    pub fn load_requests(&self) -> Vec<LoadRequest> {
        self.tracks
            .iter()
            .map(|track| LoadRequest::new(track.id(), self.source(track), track.role()))
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const SESSION: &str = r#"
        tracks:
          - id: master
            file: master.wav
            role: reference
          - id: dub
            file: https://media.example/dub.mxf
            offset: 2.5
            volume: 0.8
            pan: -0.5
            solo: true
            channel_role: dialog
        analysis: analysis.json
        engine:
          sync_threshold: 30ms
    "#;

    #[test]
    fn test_parse_session() -> Result<(), ConfigError> {
        let session = Session::deserialize_yaml(SESSION, Some(Path::new("/sessions/reel1")))?;
        let tracks = session.tracks();
        assert_eq!(tracks.len(), 2);

        assert_eq!(tracks[0].role(), TrackRole::Reference);
        assert_eq!(tracks[0].offset(), 0.0);
        assert_eq!(tracks[0].explicit_offset(), None);
        assert_eq!(tracks[0].volume(), 1.0);
        assert_eq!(
            session.source(&tracks[0]),
            SourceRef::Path(PathBuf::from("/sessions/reel1/master.wav"))
        );

        assert_eq!(tracks[1].role(), TrackRole::Component);
        assert_eq!(tracks[1].offset(), 2.5);
        assert_eq!(tracks[1].explicit_offset(), Some(2.5));
        assert_eq!(tracks[1].volume(), 0.8);
        assert_eq!(tracks[1].pan(), -0.5);
        assert!(tracks[1].solo());
        assert!(!tracks[1].muted());
        assert_eq!(tracks[1].channel_role(), Some("dialog"));
        assert!(matches!(session.source(&tracks[1]), SourceRef::Url(_)));

        assert_eq!(
            session.analysis(),
            Some(PathBuf::from("/sessions/reel1/analysis.json"))
        );
        assert_eq!(
            session.engine().sync_threshold()?,
            std::time::Duration::from_millis(30)
        );

        let requests = session.load_requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].id, TrackId::from("dub"));
        Ok(())
    }

    #[test]
    fn test_rejects_duplicate_ids_and_references() {
        let duplicate = r#"
            tracks:
              - { id: a, file: a.wav }
              - { id: a, file: b.wav }
        "#;
        assert!(matches!(
            Session::deserialize_yaml(duplicate, None),
            Err(ConfigError::Invalid(_))
        ));

        let two_references = r#"
            tracks:
              - { id: a, file: a.wav, role: reference }
              - { id: b, file: b.wav, role: reference }
        "#;
        assert!(matches!(
            Session::deserialize_yaml(two_references, None),
            Err(ConfigError::Invalid(_))
        ));
    }
}
