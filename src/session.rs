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
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use tracing::{debug, info, span, warn, Level, Span};

use crate::analysis::AnalysisResult;
use crate::audio::{AudioBackend, PlaybackError, TrackGraph};
use crate::config::EngineSettings;
use crate::events::{EventBus, SessionEvent, StatusLevel};
use crate::sources::{AudioSourceManager, LoadError, LoadRequest};
use crate::syncmonitor::{self, MonitorHandle, TickOutcome};
use crate::track::{Track, TrackId, TrackRole};
use crate::transport::{self, StartPlan, TransportState};


/// How often `play` checks whether tracks have buffered.
const BUFFER_POLL: Duration = Duration::from_millis(10);

/// Session level failures. Per-track problems never show up here; they're reported as status
/// events and recorded on the track.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("No playable tracks")]
    NoPlayableTracks,

    #[error("Unknown track: {0}")]
    UnknownTrack(TrackId),

    /// Output was refused for every track. The caller may retry once the host allows it.
    #[error("Playback blocked: {0}")]
    PlaybackBlocked(String),
}

/// Whether the drift monitor runs on its own thread or is ticked by the host.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MonitorMode {
    #[default]
    Thread,
    Manual,
}

/// What a play or seek did to each track.
#[derive(Debug, Default)]
pub struct PlayReport {
    /// The computed plan for every playable track, in session order.
    pub plans: Vec<(TrackId, StartPlan)>,
    /// Tracks that started right away and where.
    pub started: Vec<(TrackId, Duration)>,
    /// Tracks scheduled to start from zero after a delay.
    pub delayed: Vec<(TrackId, Duration)>,
    pub failed: Vec<(TrackId, PlaybackError)>,
}

impl PlayReport {
    /// The position each track was planned to be at, in session order.
    pub fn positions(&self) -> Vec<(TrackId, Duration)> {
        self.plans
            .iter()
            .map(|(id, plan)| (id.clone(), plan.position()))
            .collect()
    }
}

/// A track that starts from zero once the backend clock reaches `due`.
#[derive(Clone, Debug)]
pub(crate) struct PendingStart {
    pub(crate) id: TrackId,
    pub(crate) due: Duration,
}

/// Everything the transport and the drift monitor share.
pub(crate) struct SessionState {
    pub(crate) tracks: Vec<Track>,
    pub(crate) graph: TrackGraph,
    pub(crate) events: EventBus,
    pub(crate) transport: TransportState,
    pub(crate) corrected: bool,
    pub(crate) reference_time: Duration,
    /// Backend clock and reference time at the last measurement while playing.
    pub(crate) anchor: Option<(Duration, Duration)>,
    pub(crate) pending: Vec<PendingStart>,
    /// Tracks the backend is playing right now.
    pub(crate) active: Vec<TrackId>,
    pub(crate) failed_loads: Vec<(TrackId, String)>,
}

impl SessionState {
    fn new() -> SessionState {
        SessionState {
            tracks: Vec::new(),
            graph: TrackGraph::new(),
            events: EventBus::new(),
            transport: TransportState::Idle,
            corrected: false,
            reference_time: Duration::ZERO,
            anchor: None,
            pending: Vec::new(),
            active: Vec::new(),
            failed_loads: Vec::new(),
        }
    }

    pub(crate) fn is_active(&self, id: &TrackId) -> bool {
        self.active.contains(id)
    }

    pub(crate) fn activate(&mut self, id: &TrackId) {
        if !self.is_active(id) {
            self.active.push(id.clone());
        }
    }

    /// Forgets any running or scheduled playback of a track.
    pub(crate) fn release(&mut self, id: &TrackId) {
        self.active.retain(|active| active != id);
        self.pending.retain(|pending| pending.id != *id);
    }

    /// The longest track duration.
    pub(crate) fn duration(&self) -> Duration {
        self.tracks
            .iter()
            .filter(|track| track.is_playable())
            .map(Track::duration)
            .max()
            .unwrap_or_default()
    }

    fn track_mut(&mut self, id: &TrackId) -> Result<&mut Track, SessionError> {
        self.tracks
            .iter_mut()
            .find(|track| track.id() == id)
            .ok_or_else(|| SessionError::UnknownTrack(id.clone()))
    }

    fn set_transport(&mut self, transport: TransportState) {
        if self.transport != transport {
            self.transport = transport;
            self.events.emit(SessionEvent::StateChanged(transport));
        }
    }

    fn apply_gains(&self, backend: &dyn AudioBackend) {
        let solo_active = TrackGraph::solo_active(&self.tracks);
        for track in &self.tracks {
            backend.set_gains(track.id(), self.graph.gains_for(track, solo_active));
        }
    }
}

/// One comparison session: a registry of tracks and a transport that plays them in raw or
/// corrected alignment.
pub struct PlaybackSession {
    backend: Arc<dyn AudioBackend>,
    sources: Arc<AudioSourceManager>,
    settings: EngineSettings,
    state: Arc<Mutex<SessionState>>,
    monitor: Mutex<Option<MonitorHandle>>,
    monitor_mode: MonitorMode,
    /// The logging span.
    span: Span,
}

impl PlaybackSession {
    pub fn new(
        backend: Arc<dyn AudioBackend>,
        sources: Arc<AudioSourceManager>,
        settings: EngineSettings,
        monitor_mode: MonitorMode,
    ) -> PlaybackSession {
        PlaybackSession {
            backend,
            sources,
            settings,
            state: Arc::new(Mutex::new(SessionState::new())),
            monitor: Mutex::new(None),
            monitor_mode,
            span: span!(Level::INFO, "session"),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn backend(&self) -> Arc<dyn AudioBackend> {
        self.backend.clone()
    }

    /// Subscribes to session events.
    pub fn subscribe(&self) -> Receiver<SessionEvent> {
        self.state.lock().events.subscribe()
    }

    pub fn state(&self) -> TransportState {
        self.state.lock().transport
    }

    pub fn is_playing(&self) -> bool {
        self.state() == TransportState::Playing
    }

    pub fn corrected(&self) -> bool {
        self.state.lock().corrected
    }

    /// The transport position in the reference timeline.
    pub fn reference_time(&self) -> Duration {
        let state = self.state.lock();
        syncmonitor::current_reference(&state, self.backend.as_ref(), &self.settings)
    }

    /// The longest playable track.
    pub fn duration(&self) -> Duration {
        self.state.lock().duration()
    }

    pub fn tracks(&self) -> Vec<Track> {
        self.state.lock().tracks.clone()
    }

    pub fn track(&self, id: &TrackId) -> Option<Track> {
        self.state
            .lock()
            .tracks
            .iter()
            .find(|track| track.id() == id)
            .cloned()
    }

    /// Tracks that never made it into the session, with the reason.
    pub fn failed_loads(&self) -> Vec<(TrackId, String)> {
        self.state.lock().failed_loads.clone()
    }

    /// Adds a track, replacing any track with the same id. A second reference demotes the
    /// existing one. Tracks the backend can't take stay in the session but aren't playable.
    pub fn add_track(&self, mut track: Track) {
        let _enter = self.span.enter();
        let mut state = self.state.lock();

        if let Some(index) = state.tracks.iter().position(|t| t.id() == track.id()) {
            info!(track = %track.id(), "Replacing existing track.");
            self.backend.detach(track.id());
            state.tracks.remove(index);
            state.release(track.id());
        }

        if track.role() == TrackRole::Reference {
            let mut demoted = Vec::new();
            for existing in state.tracks.iter_mut() {
                if existing.role() == TrackRole::Reference {
                    existing.set_role(TrackRole::Component);
                    demoted.push(existing.id().clone());
                }
            }
            for id in demoted {
                state.events.status(
                    StatusLevel::Warning,
                    format!("track {} is no longer the reference, {} replaces it", id, track.id()),
                );
            }
        }

        match self.backend.attach(track.id(), track.source()) {
            Ok(()) => track.buffered = self.backend.is_buffered(track.id()),
            Err(e) => {
                track.last_error = Some(e.to_string());
                track.playable = false;
                state.events.status(
                    StatusLevel::Error,
                    format!("track {} can't be played: {}", track.id(), e),
                );
            }
        }

        let id = track.id().clone();
        let duration = track.duration();
        let streaming = track.source().is_streaming();
        state.tracks.push(track);
        state.apply_gains(self.backend.as_ref());
        state.events.emit(SessionEvent::TrackLoaded {
            id: id.clone(),
            duration,
            streaming,
        });

        // Join a running transport at the current reference time.
        if state.transport == TransportState::Playing {
            let reference =
                syncmonitor::current_reference(&state, self.backend.as_ref(), &self.settings);
            state.reference_time = reference;
            let mut report = PlayReport::default();
            if let Some(index) = state.tracks.iter().position(|t| *t.id() == id) {
                self.start_track(&mut state, index, &mut report);
            }
        }
    }

    /// Removes a track and releases its resources.
    pub fn remove_track(&self, id: &TrackId) -> Result<Track, SessionError> {
        let _enter = self.span.enter();
        let mut state = self.state.lock();
        let index = state
            .tracks
            .iter()
            .position(|track| track.id() == id)
            .ok_or_else(|| SessionError::UnknownTrack(id.clone()))?;

        self.backend.detach(id);
        state.release(id);
        let track = state.tracks.remove(index);
        state.apply_gains(self.backend.as_ref());
        info!(track = %id, "Removed track.");
        Ok(track)
    }

    /// Stops playback and removes every track.
    pub fn clear(&self) {
        self.stop();
        let mut state = self.state.lock();
        for track in state.tracks.drain(..) {
            self.backend.detach(track.id());
        }
        state.failed_loads.clear();
        state.reference_time = Duration::ZERO;
    }

    /// Loads one track and adds it to the session. Failures are recorded and reported.
    pub fn load(&self, request: &LoadRequest) -> Result<TrackId, LoadError> {
        match self.sources.load(request) {
            Ok(loaded) => {
                let id = loaded.track.id().clone();
                self.add_track(loaded.track);
                Ok(id)
            }
            Err(e) => {
                self.record_failed_load(&request.id, &e);
                Err(e)
            }
        }
    }

    /// Loads every request concurrently and returns how many tracks became playable.
    pub async fn load_many(&self, requests: Vec<LoadRequest>) -> usize {
        let mut playable = 0;
        for (id, result) in self.sources.load_many(requests).await {
            match result {
                Ok(loaded) => {
                    self.add_track(loaded.track);
                    if self.track(&id).is_some_and(|track| track.is_playable()) {
                        playable += 1;
                    }
                }
                Err(e) => self.record_failed_load(&id, &e),
            }
        }
        playable
    }

    fn record_failed_load(&self, id: &TrackId, e: &LoadError) {
        let mut state = self.state.lock();
        state.failed_loads.retain(|(failed, _)| failed != id);
        state.failed_loads.push((id.clone(), e.to_string()));
        state
            .events
            .status(StatusLevel::Error, format!("track {} failed to load: {}", id, e));
    }

    /// Starts every playable track from `start_seconds` in the reference timeline.
    pub fn play(&self, start_seconds: f64, corrected: bool) -> Result<PlayReport, SessionError> {
        self.play_from(transport::seconds_to_duration(start_seconds), corrected)
    }

    /// Starts again from the current reference time in the current mode.
    pub fn resume(&self) -> Result<PlayReport, SessionError> {
        let (reference, corrected) = {
            let state = self.state.lock();
            (state.reference_time, state.corrected)
        };
        self.play_from(reference, corrected)
    }

    fn play_from(&self, reference: Duration, corrected: bool) -> Result<PlayReport, SessionError> {
        let _enter = self.span.enter();
        self.stop_monitor();

        let waiting = {
            let mut state = self.state.lock();
            self.halt(&mut state);
            state.corrected = corrected;
            state.reference_time = reference;

            let waiting: Vec<TrackId> = state
                .tracks
                .iter()
                .filter(|track| track.is_playable())
                .map(|track| track.id().clone())
                .collect();
            if waiting.is_empty() {
                state.set_transport(TransportState::Idle);
                state
                    .events
                    .status(StatusLevel::Error, "nothing to play: no playable tracks");
                return Err(SessionError::NoPlayableTracks);
            }
            waiting
        };

        self.wait_for_buffers(waiting);

        let mut state = self.state.lock();
        let report = self.start_tracks(&mut state);
        // Scheduled starts alone don't count when every immediate start was refused.
        if report.started.is_empty() && !report.failed.is_empty() {
            state.pending.clear();
            if matches!(
                state.transport,
                TransportState::Playing | TransportState::Seeking
            ) {
                state.set_transport(TransportState::Paused);
            }
            let blocked = report
                .failed
                .iter()
                .find(|(_, e)| matches!(e, PlaybackError::Blocked(_)));
            return Err(match blocked {
                Some((_, e)) => SessionError::PlaybackBlocked(e.to_string()),
                None => SessionError::NoPlayableTracks,
            });
        }

        state.anchor = Some((self.backend.now(), reference));
        state.set_transport(TransportState::Playing);
        let scheduled = report.started.len() + report.delayed.len();
        state.events.status(
            StatusLevel::Success,
            format!("playing {} of {} tracks", scheduled, report.plans.len()),
        );
        info!(
            reference = ?reference,
            corrected,
            started = report.started.len(),
            delayed = report.delayed.len(),
            failed = report.failed.len(),
            "Playing."
        );
        drop(state);

        self.start_monitor();
        Ok(report)
    }

    /// Waits, bounded by the buffer wait, until the backend has buffered the given tracks.
    fn wait_for_buffers(&self, mut waiting: Vec<TrackId>) {
        let deadline = Instant::now() + self.settings.buffer_wait;
        loop {
            waiting.retain(|id| !self.backend.is_buffered(id));
            if waiting.is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                warn!(tracks = ?waiting, "Starting before every track buffered.");
                break;
            }
            thread::sleep(BUFFER_POLL);
        }

        let mut state = self.state.lock();
        for track in state.tracks.iter_mut() {
            track.buffered = self.backend.is_buffered(track.id());
        }
    }

    /// Plans and starts every playable track at the stored reference time.
    fn start_tracks(&self, state: &mut SessionState) -> PlayReport {
        let mut report = PlayReport::default();
        for index in 0..state.tracks.len() {
            if state.tracks[index].is_playable() {
                self.start_track(state, index, &mut report);
            }
        }
        report
    }

    fn start_track(&self, state: &mut SessionState, index: usize, report: &mut PlayReport) {
        let track = &state.tracks[index];
        let id = track.id().clone();
        let plan = transport::plan_start(
            state.reference_time,
            track.offset_seconds,
            state.corrected,
            track.duration(),
            self.settings.end_epsilon,
        );
        report.plans.push((id.clone(), plan));

        let result = match plan {
            StartPlan::Immediate(position) => self.backend.play(&id, position).map(|()| {
                state.activate(&id);
                let track = &mut state.tracks[index];
                if !track.monitor_excluded {
                    track.last_error = None;
                }
                report.started.push((id.clone(), position));
            }),
            StartPlan::Delayed { delay } => {
                self.backend.set_position(&id, Duration::ZERO).map(|()| {
                    state.pending.push(PendingStart {
                        id: id.clone(),
                        due: self.backend.now() + delay,
                    });
                    report.delayed.push((id.clone(), delay));
                })
            }
        };

        if let Err(e) = result {
            state.tracks[index].last_error = Some(e.to_string());
            state
                .events
                .status(StatusLevel::Error, format!("track {} didn't start: {}", id, e));
            report.failed.push((id, e));
        }
    }

    /// Moves to a new reference time. While playing, tracks restart through the same plan as
    /// `play`; otherwise they're repositioned in place.
    pub fn seek(&self, seconds: f64) -> Result<PlayReport, SessionError> {
        let _enter = self.span.enter();
        let reference = transport::seconds_to_duration(seconds);

        let was = self.state();
        if was == TransportState::Playing {
            self.state.lock().set_transport(TransportState::Seeking);
            let corrected = self.corrected();
            let result = self.play_from(reference, corrected);
            self.emit_time_update();
            return result;
        }

        let mut state = self.state.lock();
        state.set_transport(TransportState::Seeking);
        self.halt(&mut state);
        state.reference_time = reference;
        let report = self.reposition_all(&mut state);
        state.set_transport(was);
        let update = syncmonitor::time_update(&state, self.backend.as_ref(), &self.settings);
        state.events.emit(SessionEvent::TimeUpdate(update));
        debug!(reference = ?reference, "Seeked while stopped.");
        Ok(report)
    }

    /// Puts every playable track on its planned position without starting it.
    fn reposition_all(&self, state: &mut SessionState) -> PlayReport {
        let mut report = PlayReport::default();
        let mut failures = Vec::new();
        for track in state.tracks.iter().filter(|track| track.is_playable()) {
            let plan = transport::plan_start(
                state.reference_time,
                track.offset_seconds,
                state.corrected,
                track.duration(),
                self.settings.end_epsilon,
            );
            report.plans.push((track.id().clone(), plan));
            if let Err(e) = self.backend.set_position(track.id(), plan.position()) {
                failures.push(format!("track {} didn't move: {}", track.id(), e));
                report.failed.push((track.id().clone(), e));
            }
        }
        for message in failures {
            state.events.status(StatusLevel::Warning, message);
        }
        report
    }

    /// Switches between raw and corrected alignment, keeping the reference time.
    pub fn set_corrected(&self, corrected: bool) -> Result<(), SessionError> {
        let reference = {
            let mut state = self.state.lock();
            if state.corrected == corrected {
                return Ok(());
            }
            let reference =
                syncmonitor::current_reference(&state, self.backend.as_ref(), &self.settings);
            if state.transport != TransportState::Playing {
                state.corrected = corrected;
                state.reference_time = reference;
                self.reposition_all(&mut state);
                return Ok(());
            }
            reference
        };

        self.play_from(reference, corrected)?;
        Ok(())
    }

    /// Halts every track in place. A no-op when nothing is playing.
    pub fn pause(&self) {
        let _enter = self.span.enter();
        self.stop_monitor();
        let mut state = self.state.lock();
        if state.transport != TransportState::Playing {
            return;
        }
        self.halt(&mut state);
        state.set_transport(TransportState::Paused);
        info!(reference = ?state.reference_time, "Paused.");
    }

    /// Halts and rewinds every track to zero. Cancels any scheduled starts before returning.
    pub fn stop(&self) {
        let _enter = self.span.enter();
        self.stop_monitor();
        let mut state = self.state.lock();
        self.halt(&mut state);
        state.reference_time = Duration::ZERO;
        for track in state.tracks.iter().filter(|track| track.is_playable()) {
            if let Err(e) = self.backend.set_position(track.id(), Duration::ZERO) {
                warn!(track = %track.id(), err = %e, "Couldn't rewind track.");
            }
        }
        if state.transport != TransportState::Idle {
            info!("Stopped.");
        }
        state.set_transport(TransportState::Idle);
    }

    /// Pauses every track, drops scheduled starts and captures the reference time.
    fn halt(&self, state: &mut SessionState) {
        if state.anchor.is_some() {
            state.reference_time =
                syncmonitor::current_reference(state, self.backend.as_ref(), &self.settings);
        }
        for track in &state.tracks {
            self.backend.pause(track.id());
        }
        state.pending.clear();
        state.active.clear();
        state.anchor = None;
    }

    /// Runs one drift monitor pass. Hosts using `MonitorMode::Manual` call this on their own
    /// schedule.
    pub fn tick(&self) -> TickOutcome {
        let mut state = self.state.lock();
        syncmonitor::tick(&mut state, self.backend.as_ref(), &self.settings)
    }

    fn emit_time_update(&self) {
        let mut state = self.state.lock();
        let update = syncmonitor::time_update(&state, self.backend.as_ref(), &self.settings);
        state.events.emit(SessionEvent::TimeUpdate(update));
    }

    fn start_monitor(&self) {
        if self.monitor_mode == MonitorMode::Manual {
            return;
        }
        let handle = MonitorHandle::spawn(
            self.state.clone(),
            self.backend.clone(),
            self.settings.clone(),
        );
        let previous = self.monitor.lock().replace(handle);
        if let Some(previous) = previous {
            previous.stop();
        }
    }

    fn stop_monitor(&self) {
        let handle = self.monitor.lock().take();
        if let Some(handle) = handle {
            handle.stop();
        }
    }

    /// Sets a track's offset. A playing track is pulled onto the new position by the monitor.
    pub fn set_offset(&self, id: &TrackId, offset_seconds: f64) -> Result<(), SessionError> {
        self.state.lock().track_mut(id)?.offset_seconds = offset_seconds;
        Ok(())
    }

    /// Applies an analysis result to a track, preferring the entry for its channel role.
    /// Returns the offset that was set.
    pub fn apply_analysis(
        &self,
        id: &TrackId,
        analysis: &AnalysisResult,
    ) -> Result<f64, SessionError> {
        let mut state = self.state.lock();
        let track = state.track_mut(id)?;
        let offset = analysis.offset_for(track.channel_role.as_deref());
        track.offset_seconds = offset;
        info!(track = %id, offset, confidence = analysis.confidence, "Applied analysis.");
        Ok(offset)
    }

    pub fn set_channel_role(&self, id: &TrackId, role: Option<String>) -> Result<(), SessionError> {
        self.state.lock().track_mut(id)?.channel_role = role;
        Ok(())
    }

    pub fn set_volume(&self, id: &TrackId, volume: f32) -> Result<(), SessionError> {
        self.update_mix(id, |track| track.volume = volume.max(0.0))
    }

    pub fn set_pan(&self, id: &TrackId, pan: f32) -> Result<(), SessionError> {
        self.update_mix(id, |track| track.pan = pan.clamp(-1.0, 1.0))
    }

    pub fn set_muted(&self, id: &TrackId, muted: bool) -> Result<(), SessionError> {
        self.update_mix(id, |track| track.muted = muted)
    }

    pub fn set_solo(&self, id: &TrackId, solo: bool) -> Result<(), SessionError> {
        self.update_mix(id, |track| track.solo = solo)
    }

    fn update_mix(&self, id: &TrackId, update: impl FnOnce(&mut Track)) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        update(state.track_mut(id)?);
        state.apply_gains(self.backend.as_ref());
        Ok(())
    }

    /// Balance in [-1, 1]: towards +1 fades out the reference, towards -1 the components.
    pub fn set_balance(&self, balance: f32) {
        let mut state = self.state.lock();
        state.graph.set_balance(balance);
        state.apply_gains(self.backend.as_ref());
    }

    pub fn balance(&self) -> f32 {
        self.state.lock().graph.balance()
    }

    pub fn set_master_volume(&self, volume: f32) {
        let mut state = self.state.lock();
        state.graph.set_master_volume(volume);
        state.apply_gains(self.backend.as_ref());
    }
}

impl Drop for PlaybackSession {
    fn drop(&mut self) {
        self.stop_monitor();
        let mut state = self.state.lock();
        for track in state.tracks.drain(..) {
            self.backend.detach(track.id());
        }
    }
}
