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
//! Keeps playing tracks on their expected positions.
//!
//! Every tick derives the reference time from the reference track's actual output position (or
//! from the backend clock when there is no usable reference track), starts delayed tracks that
//! have come due, hard-repositions any track that drifted past the threshold and reports a time
//! update. Only tracks the backend actually started are measured, and the transport pauses once
//! nothing is left playing or scheduled.
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, span, warn, Level};

use crate::audio::AudioBackend;
use crate::config::EngineSettings;
use crate::events::{SessionEvent, StatusLevel, TimeUpdate, TrackTime};
use crate::playsync::CancelHandle;
use crate::session::{PendingStart, SessionState};
use crate::track::TrackRole;
use crate::transport::{self, StartPlan, TransportState};

/// What a tick did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    /// The transport wasn't playing, so nothing was checked.
    Idle,
    Continue,
    /// The reference time reached the end of the longest track and the transport went idle.
    Ended,
    /// No track was left playing or scheduled, so the transport paused.
    Stalled,
}

/// The absolute difference between two positions.
pub fn drift(expected: Duration, actual: Duration) -> Duration {
    if expected > actual {
        expected - actual
    } else {
        actual - expected
    }
}

/// Exactly-threshold drift is left alone.
pub fn needs_reposition(drift: Duration, threshold: Duration) -> bool {
    drift > threshold
}

/// The reference time right now. While playing this follows the reference track's output
/// position; otherwise it is the stored reference time.
pub(crate) fn current_reference(
    state: &SessionState,
    backend: &dyn AudioBackend,
    settings: &EngineSettings,
) -> Duration {
    let Some((anchor_now, anchor_reference)) = state.anchor else {
        return state.reference_time;
    };

    let reference_track = state.tracks.iter().find(|track| {
        track.role() == TrackRole::Reference
            && track.is_playable()
            && !track.monitor_excluded
            && state.is_active(track.id())
    });
    if let Some(track) = reference_track {
        if let Some(actual) = backend.position(track.id()) {
            // Once the reference has run out it no longer says anything about time.
            if actual < track.duration().saturating_sub(settings.end_epsilon) {
                return transport::reference_from_track(
                    actual,
                    track.offset_seconds,
                    state.corrected,
                );
            }
        }
    }

    anchor_reference + backend.now().saturating_sub(anchor_now)
}

/// Builds a time update for the current state.
pub(crate) fn time_update(
    state: &SessionState,
    backend: &dyn AudioBackend,
    settings: &EngineSettings,
) -> TimeUpdate {
    let per_track = state
        .tracks
        .iter()
        .map(|track| TrackTime {
            id: track.id().clone(),
            position: backend.position(track.id()),
            expected: transport::expected_position(
                state.reference_time,
                track.offset_seconds,
                state.corrected,
                track.duration(),
                settings.end_epsilon,
            ),
            error: track.last_error.clone(),
        })
        .collect();

    TimeUpdate {
        reference_time: state.reference_time,
        duration: state.duration(),
        is_playing: state.transport == TransportState::Playing,
        corrected: state.corrected,
        per_track,
    }
}

/// Runs one monitoring pass.
pub(crate) fn tick(
    state: &mut SessionState,
    backend: &dyn AudioBackend,
    settings: &EngineSettings,
) -> TickOutcome {
    if state.transport != TransportState::Playing {
        return TickOutcome::Idle;
    }

    let now = backend.now();
    let reference = current_reference(state, backend, settings);
    state.reference_time = reference;
    state.anchor = Some((now, reference));

    start_due(state, backend, settings, now);
    correct_drift(state, backend, settings, now);

    let update = time_update(state, backend, settings);
    state.events.emit(SessionEvent::TimeUpdate(update));

    let end = state.duration().saturating_sub(settings.end_epsilon);
    if reference >= end {
        info!(reference = ?reference, "Playback reached the end.");
        for track in &state.tracks {
            backend.pause(track.id());
        }
        state.pending.clear();
        state.anchor = None;
        state.transport = TransportState::Idle;
        state
            .events
            .emit(SessionEvent::StateChanged(TransportState::Idle));
        state.events.emit(SessionEvent::PlaybackEnded);
        return TickOutcome::Ended;
    }

    if state.active.is_empty() && state.pending.is_empty() {
        warn!(reference = ?reference, "Nothing is playing anymore.");
        for track in &state.tracks {
            backend.pause(track.id());
        }
        state.anchor = None;
        state.transport = TransportState::Paused;
        state
            .events
            .emit(SessionEvent::StateChanged(TransportState::Paused));
        state
            .events
            .status(StatusLevel::Error, "playback paused: no track is playing");
        return TickOutcome::Stalled;
    }

    TickOutcome::Continue
}

/// Starts delayed tracks whose time has come.
fn start_due(
    state: &mut SessionState,
    backend: &dyn AudioBackend,
    settings: &EngineSettings,
    now: Duration,
) {
    let (due, waiting): (Vec<_>, Vec<_>) = state
        .pending
        .drain(..)
        .partition(|pending| pending.due <= now);
    state.pending = waiting;

    for pending in due {
        let Some(index) = state.tracks.iter().position(|track| *track.id() == pending.id) else {
            continue;
        };
        let track = &state.tracks[index];
        let position = match transport::plan_start(
            state.reference_time,
            track.offset_seconds,
            state.corrected,
            track.duration(),
            settings.end_epsilon,
        ) {
            StartPlan::Immediate(position) => position,
            StartPlan::Delayed { .. } => Duration::ZERO,
        };
        match backend.play(&pending.id, position) {
            Ok(()) => {
                debug!(track = %pending.id, position = ?position, "Started delayed track.");
                state.activate(&pending.id);
            }
            Err(e) => {
                let track = &mut state.tracks[index];
                track.last_error = Some(e.to_string());
                track.monitor_excluded = true;
                let message = format!("track {}: delayed start failed: {}", pending.id, e);
                state.events.status(StatusLevel::Error, message);
            }
        }
    }
}

/// Repositions every drifting track other than the one time is derived from. A track whose
/// start now lies in the future is paused and scheduled again instead.
fn correct_drift(
    state: &mut SessionState,
    backend: &dyn AudioBackend,
    settings: &EngineSettings,
    now: Duration,
) {
    let reference = state.reference_time;
    let corrected = state.corrected;
    let mut failures = Vec::new();
    let mut rescheduled = Vec::new();

    for track in state.tracks.iter_mut() {
        if track.role() == TrackRole::Reference
            || !track.is_playable()
            || track.monitor_excluded
            || !state.active.contains(track.id())
        {
            continue;
        }
        let Some(actual) = backend.position(track.id()) else {
            continue;
        };
        let expected = match transport::plan_start(
            reference,
            track.offset_seconds,
            corrected,
            track.duration(),
            settings.end_epsilon,
        ) {
            StartPlan::Immediate(expected) => expected,
            StartPlan::Delayed { delay } => {
                debug!(track = %track.id(), delay = ?delay, "Track starts later now, rescheduling.");
                backend.pause(track.id());
                if let Err(e) = backend.set_position(track.id(), Duration::ZERO) {
                    warn!(track = %track.id(), err = %e, "Couldn't rewind rescheduled track.");
                }
                rescheduled.push(PendingStart {
                    id: track.id().clone(),
                    due: now + delay,
                });
                continue;
            }
        };
        let drift = drift(expected, actual);
        if !needs_reposition(drift, settings.sync_threshold) {
            continue;
        }

        debug!(track = %track.id(), drift = ?drift, expected = ?expected, "Repositioning track.");
        if let Err(e) = backend.set_position(track.id(), expected) {
            warn!(track = %track.id(), err = %e, "Excluding track from monitoring.");
            track.last_error = Some(e.to_string());
            track.monitor_excluded = true;
            failures.push(format!("track {}: {}", track.id(), e));
        }
    }

    for pending in rescheduled {
        state.active.retain(|active| *active != pending.id);
        state.pending.push(pending);
    }
    for message in failures {
        state.events.status(StatusLevel::Error, message);
    }
}

/// A background thread ticking the monitor while the session plays.
pub(crate) struct MonitorHandle {
    cancel_handle: CancelHandle,
    join: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    pub(crate) fn spawn(
        state: Arc<Mutex<SessionState>>,
        backend: Arc<dyn AudioBackend>,
        settings: EngineSettings,
    ) -> MonitorHandle {
        let cancel_handle = CancelHandle::new();
        let join = {
            let cancel_handle = cancel_handle.clone();
            thread::spawn(move || {
                let span = span!(Level::INFO, "sync monitor");
                let _enter = span.enter();
                debug!(interval = ?settings.sync_check_interval, "Sync monitor started.");

                loop {
                    let wait = next_wait(&state.lock(), backend.as_ref(), &settings);
                    if cancel_handle.sleep(wait) {
                        break;
                    }

                    let mut state = state.lock();
                    // Cancelled while waiting for the lock.
                    if cancel_handle.is_cancelled() {
                        break;
                    }
                    if tick(&mut state, backend.as_ref(), &settings) != TickOutcome::Continue {
                        break;
                    }
                }

                debug!("Sync monitor stopped.");
            })
        };

        MonitorHandle {
            cancel_handle,
            join: Some(join),
        }
    }

    /// Cancels the thread and waits for it. Must not be called while holding the session state.
    pub(crate) fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.cancel_handle.cancel();
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                error!("Sync monitor thread panicked.");
            }
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The tick interval, shortened so a delayed start isn't late by more than scheduling jitter.
fn next_wait(state: &SessionState, backend: &dyn AudioBackend, settings: &EngineSettings) -> Duration {
    let now = backend.now();
    state
        .pending
        .iter()
        .map(|pending| pending.due.saturating_sub(now))
        .fold(settings.sync_check_interval, Duration::min)
}
