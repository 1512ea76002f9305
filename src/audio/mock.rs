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
use std::{
    collections::HashMap,
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tracing::{debug, info};

use super::{ChannelGains, PlaybackError};
use crate::track::{TrackId, TrackSource};

/// Where the mock's notion of time comes from.
#[derive(Clone)]
enum Clock {
    /// Only moves when `advance` is called.
    Manual(Arc<Mutex<Duration>>),
    /// Follows the wall clock from creation.
    Realtime(Instant),
}

impl Clock {
    fn now(&self) -> Duration {
        match self {
            Clock::Manual(now) => *now.lock(),
            Clock::Realtime(start) => start.elapsed(),
        }
    }
}

/// A call the mock received, in order.
#[derive(Clone, Debug, PartialEq)]
pub enum Call {
    Play { id: TrackId, position: Duration, at: Duration },
    Pause { id: TrackId },
    SetPosition { id: TrackId, position: Duration },
}

struct Voice {
    duration: Duration,
    playing: bool,
    /// Position when the voice last started or was repositioned.
    base: Duration,
    /// Clock time at which `base` was taken.
    started_at: Duration,
    buffered: bool,
    fail_reposition: bool,
    gains: ChannelGains,
}

impl Voice {
    fn position(&self, now: Duration) -> Duration {
        if self.playing {
            (self.base + now.saturating_sub(self.started_at)).min(self.duration)
        } else {
            self.base
        }
    }
}

#[derive(Default)]
struct State {
    voices: HashMap<TrackId, Voice>,
    playback_blocked: bool,
    attached: HashMap<TrackId, usize>,
    detached: HashMap<TrackId, usize>,
    calls: Vec<Call>,
}

/// A simulated device. Doesn't output anything, but tracks every voice's position against its
/// own clock so transport and drift logic can be exercised headless.
#[derive(Clone)]
pub struct Backend {
    name: String,
    clock: Clock,
    state: Arc<Mutex<State>>,
}

impl Backend {
    /// A mock whose clock only moves through `advance`.
    pub fn manual(name: &str) -> Backend {
        Backend {
            name: name.to_string(),
            clock: Clock::Manual(Arc::new(Mutex::new(Duration::ZERO))),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// A mock that follows the wall clock.
    pub fn realtime(name: &str) -> Backend {
        Backend {
            name: name.to_string(),
            clock: Clock::Realtime(Instant::now()),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Moves a manual clock forward. Has no effect on a realtime mock.
    pub fn advance(&self, by: Duration) {
        if let Clock::Manual(now) = &self.clock {
            *now.lock() += by;
        }
    }

    /// Makes every subsequent `play` fail as the host refusing output would.
    pub fn block_playback(&self, blocked: bool) {
        self.state.lock().playback_blocked = blocked;
    }

    /// Makes repositioning the given track fail.
    pub fn fail_reposition(&self, id: &TrackId, fail: bool) {
        if let Some(voice) = self.state.lock().voices.get_mut(id) {
            voice.fail_reposition = fail;
        }
    }

    pub fn set_buffered(&self, id: &TrackId, buffered: bool) {
        if let Some(voice) = self.state.lock().voices.get_mut(id) {
            voice.buffered = buffered;
        }
    }

    /// Moves a voice's actual position without logging a call, simulating device drift.
    pub fn drift_to(&self, id: &TrackId, position: Duration) {
        let now = self.clock.now();
        if let Some(voice) = self.state.lock().voices.get_mut(id) {
            voice.base = position.min(voice.duration);
            voice.started_at = now;
        }
    }

    pub fn is_playing(&self, id: &TrackId) -> bool {
        self.state
            .lock()
            .voices
            .get(id)
            .is_some_and(|voice| voice.playing)
    }

    pub fn gains(&self, id: &TrackId) -> Option<ChannelGains> {
        self.state.lock().voices.get(id).map(|voice| voice.gains)
    }

    pub fn is_attached(&self, id: &TrackId) -> bool {
        self.state.lock().voices.contains_key(id)
    }

    /// How many times the track has been attached.
    pub fn attach_count(&self, id: &TrackId) -> usize {
        self.state.lock().attached.get(id).copied().unwrap_or(0)
    }

    /// How many times an attached track has been released.
    pub fn detach_count(&self, id: &TrackId) -> usize {
        self.state.lock().detached.get(id).copied().unwrap_or(0)
    }

    /// Every call received so far.
    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// The positions most recently handed to `play`, per track.
    pub fn last_play_position(&self, id: &TrackId) -> Option<Duration> {
        self.state.lock().calls.iter().rev().find_map(|call| match call {
            Call::Play {
                id: played,
                position,
                ..
            } if played == id => Some(*position),
            _ => None,
        })
    }

    /// Number of hard repositions issued for a track.
    pub fn reposition_count(&self, id: &TrackId) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| matches!(call, Call::SetPosition { id: moved, .. } if moved == id))
            .count()
    }
}

impl super::AudioBackend for Backend {
    fn attach(&self, id: &TrackId, source: &TrackSource) -> Result<(), PlaybackError> {
        let mut state = self.state.lock();
        if state.voices.remove(id).is_some() {
            *state.detached.entry(id.clone()).or_default() += 1;
        }
        state.voices.insert(
            id.clone(),
            Voice {
                duration: source.duration(),
                playing: false,
                base: Duration::ZERO,
                started_at: Duration::ZERO,
                buffered: true,
                fail_reposition: false,
                gains: ChannelGains::UNITY,
            },
        );
        *state.attached.entry(id.clone()).or_default() += 1;
        debug!(device = self.name, track = %id, "Attached track.");
        Ok(())
    }

    fn detach(&self, id: &TrackId) {
        let mut state = self.state.lock();
        if state.voices.remove(id).is_some() {
            *state.detached.entry(id.clone()).or_default() += 1;
            debug!(device = self.name, track = %id, "Detached track.");
        }
    }

    fn play(&self, id: &TrackId, position: Duration) -> Result<(), PlaybackError> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        if state.playback_blocked {
            return Err(PlaybackError::Blocked(format!(
                "{}: output requires a user gesture",
                self.name
            )));
        }
        let voice = state
            .voices
            .get_mut(id)
            .ok_or_else(|| PlaybackError::UnknownTrack(id.clone()))?;
        voice.base = position.min(voice.duration);
        voice.started_at = now;
        voice.playing = true;
        state.calls.push(Call::Play {
            id: id.clone(),
            position,
            at: now,
        });
        info!(device = self.name, track = %id, position = ?position, "Playing track (mock).");
        Ok(())
    }

    fn pause(&self, id: &TrackId) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        if let Some(voice) = state.voices.get_mut(id) {
            voice.base = voice.position(now);
            voice.playing = false;
            state.calls.push(Call::Pause { id: id.clone() });
        }
    }

    fn position(&self, id: &TrackId) -> Option<Duration> {
        let now = self.clock.now();
        self.state
            .lock()
            .voices
            .get(id)
            .map(|voice| voice.position(now))
    }

    fn set_position(&self, id: &TrackId, position: Duration) -> Result<(), PlaybackError> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let voice = state
            .voices
            .get_mut(id)
            .ok_or_else(|| PlaybackError::UnknownTrack(id.clone()))?;
        if voice.fail_reposition {
            return Err(PlaybackError::RepositionFailed(format!(
                "{}: device rejected seek",
                id
            )));
        }
        voice.base = position.min(voice.duration);
        voice.started_at = now;
        state.calls.push(Call::SetPosition {
            id: id.clone(),
            position,
        });
        Ok(())
    }

    fn is_buffered(&self, id: &TrackId) -> bool {
        self.state
            .lock()
            .voices
            .get(id)
            .is_some_and(|voice| voice.buffered)
    }

    fn set_gains(&self, id: &TrackId, gains: ChannelGains) {
        if let Some(voice) = self.state.lock().voices.get_mut(id) {
            voice.gains = gains;
        }
    }

    fn now(&self) -> Duration {
        self.clock.now()
    }

    #[cfg(test)]
    fn to_mock(&self) -> Result<Arc<Backend>, Box<dyn std::error::Error>> {
        Ok(Arc::new(self.clone()))
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (Mock)", self.name)
    }
}

#[cfg(test)]
mod test {
    use std::error::Error;

    use super::*;
    use crate::audio::AudioBackend;
    use crate::track::StreamHandle;

    fn source(seconds: u64) -> TrackSource {
        TrackSource::Stream(StreamHandle::new(
            Arc::from(vec![0u8; 1]),
            None,
            Duration::from_secs(seconds),
            None,
        ))
    }

    #[test]
    fn test_position_follows_manual_clock() -> Result<(), Box<dyn Error>> {
        let backend = Backend::manual("mock");
        let id = TrackId::from("a");
        backend.attach(&id, &source(10))?;

        backend.play(&id, Duration::from_secs(2))?;
        backend.advance(Duration::from_millis(1500));
        assert_eq!(backend.position(&id), Some(Duration::from_millis(3500)));

        backend.pause(&id);
        backend.advance(Duration::from_secs(5));
        assert_eq!(backend.position(&id), Some(Duration::from_millis(3500)));
        assert!(!backend.is_playing(&id));

        backend.play(&id, Duration::from_secs(9))?;
        backend.advance(Duration::from_secs(5));
        assert_eq!(backend.position(&id), Some(Duration::from_secs(10)));
        Ok(())
    }

    #[test]
    fn test_fault_injection() -> Result<(), Box<dyn Error>> {
        let backend = Backend::manual("mock");
        let id = TrackId::from("a");
        backend.attach(&id, &source(10))?;

        backend.block_playback(true);
        assert!(matches!(
            backend.play(&id, Duration::ZERO),
            Err(PlaybackError::Blocked(_))
        ));
        backend.block_playback(false);

        backend.fail_reposition(&id, true);
        assert!(matches!(
            backend.set_position(&id, Duration::from_secs(1)),
            Err(PlaybackError::RepositionFailed(_))
        ));

        backend.play(&id, Duration::from_secs(1))?;
        backend.drift_to(&id, Duration::from_millis(1250));
        assert_eq!(backend.position(&id), Some(Duration::from_millis(1250)));
        assert_eq!(backend.reposition_count(&id), 0);
        Ok(())
    }

    #[test]
    fn test_attach_detach_counts() -> Result<(), Box<dyn Error>> {
        let backend = Backend::manual("mock");
        let id = TrackId::from("a");
        backend.attach(&id, &source(10))?;
        backend.attach(&id, &source(10))?;
        assert_eq!(backend.attach_count(&id), 2);
        assert_eq!(backend.detach_count(&id), 1);

        backend.detach(&id);
        backend.detach(&id);
        assert_eq!(backend.detach_count(&id), 2);
        assert!(!backend.is_attached(&id));
        Ok(())
    }
}
