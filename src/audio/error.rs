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
use crate::track::TrackId;

/// Errors raised by an audio backend for a single track.
#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    /// The host refused to start output (autoplay policy, device busy).
    #[error("Playback blocked: {0}")]
    Blocked(String),

    /// A position change was rejected.
    #[error("Reposition failed: {0}")]
    RepositionFailed(String),

    #[error("Unknown track: {0}")]
    UnknownTrack(TrackId),

    /// The backend can't handle the track's source.
    #[error("Unsupported source: {0}")]
    Unsupported(String),

    /// The output device failed.
    #[error("Device error: {0}")]
    Device(String),
}
