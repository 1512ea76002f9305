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
//! Synchronized A/B playback of a master track against dub tracks, with the detected timing
//! correction either applied ("after") or not ("before").
pub mod analysis;
pub mod audio;
pub mod config;
pub mod events;
pub mod playsync;
pub mod session;
pub mod sources;
pub mod syncmonitor;
pub mod track;
pub mod transport;
pub mod viewport;
pub mod waveform;

#[cfg(test)]
mod testutil;

pub use session::{MonitorMode, PlaybackSession, PlayReport, SessionError};
