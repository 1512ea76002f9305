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
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use tracing::{error, info, warn};

use crate::track::TrackId;
use crate::transport::TransportState;

/// Severity of a status message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusLevel {
    Info,
    Success,
    Warning,
    Error,
}

impl fmt::Display for StatusLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusLevel::Info => f.write_str("info"),
            StatusLevel::Success => f.write_str("success"),
            StatusLevel::Warning => f.write_str("warning"),
            StatusLevel::Error => f.write_str("error"),
        }
    }
}

/// One track's position in a time update.
#[derive(Clone, Debug, PartialEq)]
pub struct TrackTime {
    pub id: TrackId,
    /// The position the device reports.
    pub position: Option<Duration>,
    /// The position the offset formula wants.
    pub expected: Duration,
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TimeUpdate {
    pub reference_time: Duration,
    /// The longest track duration.
    pub duration: Duration,
    pub is_playing: bool,
    pub corrected: bool,
    pub per_track: Vec<TrackTime>,
}

/// Notifications for the host application.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    TrackLoaded {
        id: TrackId,
        duration: Duration,
        streaming: bool,
    },
    Status {
        message: String,
        level: StatusLevel,
    },
    TimeUpdate(TimeUpdate),
    StateChanged(TransportState),
    PlaybackEnded,
}

/// Fans events out to every subscriber. Subscribers that went away are dropped on the next emit.
#[derive(Default)]
pub struct EventBus {
    subscribers: Vec<Sender<SessionEvent>>,
}

impl EventBus {
    pub fn new() -> EventBus {
        EventBus::default()
    }

    pub fn subscribe(&mut self) -> Receiver<SessionEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subscribers.push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn emit(&mut self, event: SessionEvent) {
        self.subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    /// Emits a human readable status message and logs it at the matching level.
    pub fn status(&mut self, level: StatusLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            StatusLevel::Info | StatusLevel::Success => info!(status = %level, "{}", message),
            StatusLevel::Warning => warn!("{}", message),
            StatusLevel::Error => error!("{}", message),
        }
        self.emit(SessionEvent::Status { message, level });
    }
}
