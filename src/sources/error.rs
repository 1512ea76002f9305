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
/// Error types for loading a track's media.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// The media could not be fetched at all. Fatal for the track.
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    /// The media was fetched but could not be decoded. Recovered locally by the fallback tiers.
    #[error("Decode failed: {0}")]
    DecodeFailed(String),

    /// The transcode collaborator rejected or failed the request.
    #[error("Transcode failed: {0}")]
    Transcode(String),

    /// The blocking load task died before it produced a result.
    #[error("Load task failed: {0}")]
    Task(String),
}

impl From<symphonia::core::errors::Error> for LoadError {
    fn from(err: symphonia::core::errors::Error) -> Self {
        LoadError::DecodeFailed(err.to_string())
    }
}
