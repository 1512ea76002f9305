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
use std::time::Duration;

use serde::Deserialize;

/// Identifies a track within a session.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(transparent)]
pub struct TrackId(String);

impl TrackId {
    pub fn new(id: impl Into<String>) -> TrackId {
        TrackId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TrackId {
    fn from(id: &str) -> Self {
        TrackId(id.to_string())
    }
}

impl From<String> for TrackId {
    fn from(id: String) -> Self {
        TrackId(id)
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether a track is the timing master or something compared against it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackRole {
    Reference,
    #[default]
    Component,
}

impl fmt::Display for TrackRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackRole::Reference => f.write_str("reference"),
            TrackRole::Component => f.write_str("component"),
        }
    }
}

/// Fully decoded audio held in memory in planar format.
pub struct DecodedBuffer {
    sample_rate: u32,
    /// One Vec per channel, all the same length.
    planar: Vec<Vec<f32>>,
}

impl DecodedBuffer {
    /// Creates a decoded buffer. Channels are truncated to the shortest one so every channel
    /// has the same number of frames.
    pub fn new(mut planar: Vec<Vec<f32>>, sample_rate: u32) -> DecodedBuffer {
        let frames = planar.iter().map(Vec::len).min().unwrap_or(0);
        planar.iter_mut().for_each(|channel| channel.truncate(frames));
        DecodedBuffer {
            sample_rate,
            planar,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> u16 {
        self.planar.len() as u16
    }

    /// Number of frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.planar.first().map(Vec::len).unwrap_or(0)
    }

    pub fn channel(&self, index: usize) -> Option<&[f32]> {
        self.planar.get(index).map(Vec::as_slice)
    }

    pub fn channels(&self) -> &[Vec<f32>] {
        &self.planar
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frames() as f64 / self.sample_rate as f64)
    }
}

impl fmt::Debug for DecodedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedBuffer")
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channel_count())
            .field("frames", &self.frames())
            .finish()
    }
}

/// A handle for media that could not be decoded up front. Only the duration is known;
/// playback backends stream it and there is no per-sample access for visualisation.
#[derive(Clone)]
pub struct StreamHandle {
    /// The fetched media bytes.
    media: Arc<[u8]>,
    /// Container/extension hint for the demuxer.
    hint: Option<String>,
    duration: Duration,
    sample_rate: Option<u32>,
}

impl StreamHandle {
    pub fn new(
        media: Arc<[u8]>,
        hint: Option<String>,
        duration: Duration,
        sample_rate: Option<u32>,
    ) -> StreamHandle {
        StreamHandle {
            media,
            hint,
            duration,
            sample_rate,
        }
    }

    pub fn media(&self) -> Arc<[u8]> {
        self.media.clone()
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn sample_rate(&self) -> Option<u32> {
        self.sample_rate
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("bytes", &self.media.len())
            .field("hint", &self.hint)
            .field("duration", &self.duration)
            .finish()
    }
}

/// The playable resource backing a track. Exactly one variant is ever populated.
#[derive(Clone, Debug)]
pub enum TrackSource {
    Buffer(Arc<DecodedBuffer>),
    Stream(StreamHandle),
}

impl TrackSource {
    pub fn duration(&self) -> Duration {
        match self {
            TrackSource::Buffer(buffer) => buffer.duration(),
            TrackSource::Stream(handle) => handle.duration(),
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, TrackSource::Stream(_))
    }
}

/// One playable unit of a comparison session.
#[derive(Clone, Debug)]
pub struct Track {
    id: TrackId,
    role: TrackRole,
    source: TrackSource,
    /// Signed correction. Positive means this track's content occurs later than the
    /// reference at the same content point.
    pub offset_seconds: f64,
    /// Base volume. 1.0 is unity; values above 1.0 are a deliberate boost.
    pub volume: f32,
    /// Stereo position in [-1, 1].
    pub pan: f32,
    pub muted: bool,
    pub solo: bool,
    /// Channel role used to select a per-channel offset from analysis results.
    pub channel_role: Option<String>,
    pub(crate) buffered: bool,
    pub(crate) last_error: Option<String>,
    /// Cleared when the backend could not take the track.
    pub(crate) playable: bool,
    /// Set once a hard reposition failed; the drift monitor leaves the track alone afterwards.
    pub(crate) monitor_excluded: bool,
}

impl Track {
    /// Creates a loaded track at unity gain with no offset.
    pub fn new(id: TrackId, role: TrackRole, source: TrackSource) -> Track {
        Track {
            id,
            role,
            source,
            offset_seconds: 0.0,
            volume: 1.0,
            pan: 0.0,
            muted: false,
            solo: false,
            channel_role: None,
            buffered: false,
            last_error: None,
            playable: true,
            monitor_excluded: false,
        }
    }

    pub fn id(&self) -> &TrackId {
        &self.id
    }

    pub fn role(&self) -> TrackRole {
        self.role
    }

    pub(crate) fn set_role(&mut self, role: TrackRole) {
        self.role = role;
    }

    pub fn source(&self) -> &TrackSource {
        &self.source
    }

    pub fn duration(&self) -> Duration {
        self.source.duration()
    }

    pub fn buffered(&self) -> bool {
        self.buffered
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Whether the track can take part in playback.
    pub fn is_playable(&self) -> bool {
        self.playable
    }

    pub fn monitor_excluded(&self) -> bool {
        self.monitor_excluded
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_decoded_buffer_duration() {
        let buffer = DecodedBuffer::new(vec![vec![0.0; 44100], vec![0.0; 44100]], 44100);
        assert_eq!(buffer.channel_count(), 2);
        assert_eq!(buffer.frames(), 44100);
        assert_eq!(buffer.duration(), Duration::from_secs(1));
    }

    #[test]
    fn test_decoded_buffer_truncates_ragged_channels() {
        let buffer = DecodedBuffer::new(vec![vec![0.5; 10], vec![0.5; 7]], 10);
        assert_eq!(buffer.frames(), 7);
        assert_eq!(buffer.channel(0).map(<[f32]>::len), Some(7));
        assert_eq!(buffer.duration(), Duration::from_millis(700));
    }

    #[test]
    fn test_track_defaults() {
        let handle = StreamHandle::new(Arc::from(vec![0u8; 4]), None, Duration::from_secs(3), None);
        let track = Track::new("dub".into(), TrackRole::Component, TrackSource::Stream(handle));

        assert_eq!(track.duration(), Duration::from_secs(3));
        assert!(track.source().is_streaming());
        assert!(!track.buffered());
        assert!(track.is_playable());
        assert_eq!(track.volume, 1.0);
        assert_eq!(track.offset_seconds, 0.0);
    }
}
