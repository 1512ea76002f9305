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
use std::any::Any;
use std::{error::Error, fmt, sync::Arc, time::Duration};

use crate::config;
use crate::track::{TrackId, TrackSource};

pub mod cpal;
pub mod error;
pub mod mixer;
pub mod mock;
pub mod resample;

pub use error::PlaybackError;
pub use mixer::{ChannelGains, TrackGraph};

/// The playback capability a session drives. Every track is attached once and then addressed by
/// id. Positions are in the track's own timeline.
pub trait AudioBackend: Any + fmt::Display + Send + Sync {
    /// Takes a track's source so it can be played. Re-attaching an id replaces the old voice.
    fn attach(&self, id: &TrackId, source: &TrackSource) -> Result<(), PlaybackError>;

    /// Releases everything held for the track. Unknown ids are ignored.
    fn detach(&self, id: &TrackId);

    /// Starts (or restarts) the track from the given position.
    fn play(&self, id: &TrackId, position: Duration) -> Result<(), PlaybackError>;

    /// Halts the track in place. Safe to call on a paused or unknown track.
    fn pause(&self, id: &TrackId);

    /// The actual output position of the track, as reported by the device.
    fn position(&self, id: &TrackId) -> Option<Duration>;

    /// Hard-repositions the track without changing whether it is playing.
    fn set_position(&self, id: &TrackId, position: Duration) -> Result<(), PlaybackError>;

    /// Whether enough of the track is ready for glitch-free output.
    fn is_buffered(&self, id: &TrackId) -> bool;

    fn set_gains(&self, id: &TrackId, gains: ChannelGains);

    /// The backend's monotonic clock. Scheduled starts are measured against it.
    fn now(&self) -> Duration;

    #[cfg(test)]
    fn to_mock(&self) -> Result<Arc<mock::Backend>, Box<dyn Error>>;
}

/// Describes an output device that can be named in the configuration.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub name: String,
    pub host: String,
    pub max_channels: u16,
    pub default_sample_rate: u32,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (Channels={}, Rate={}) ({})",
            self.name, self.max_channels, self.default_sample_rate, self.host
        )
    }
}

/// Lists output devices known to cpal.
pub fn list_devices() -> Result<Vec<DeviceInfo>, Box<dyn Error>> {
    cpal::Backend::list()
}

/// Gets the backend named by the engine configuration.
pub fn get_backend(config: &config::Engine) -> Result<Arc<dyn AudioBackend>, Box<dyn Error>> {
    let device = config.device();
    if device.starts_with("mock") {
        return Ok(Arc::new(mock::Backend::realtime(device)));
    }

    Ok(Arc::new(cpal::Backend::get(device)?))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_get_mock_backend() -> Result<(), Box<dyn Error>> {
        let config = config::Engine::deserialize_yaml("device: mock-studio")?;
        let backend = get_backend(&config)?;
        assert_eq!(backend.to_string(), "mock-studio (Mock)");
        assert!(backend.to_mock().is_ok());
        Ok(())
    }
}
