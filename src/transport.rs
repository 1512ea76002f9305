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
//! The offset formula shared by play, seek and the drift monitor.
//!
//! A positive offset means the track's content arrives later than the reference's, so corrected
//! playback skips into the track by the offset. When that lands before the start of the track,
//! the track is not clamped to zero (which would lose its leading content); it is started from
//! zero after a wall-clock delay of the shortfall instead.
use std::fmt;
use std::time::Duration;

/// Where the transport is.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransportState {
    #[default]
    Idle,
    Playing,
    Paused,
    /// Transient while positions are being recomputed; never observed after `seek` returns.
    Seeking,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportState::Idle => f.write_str("idle"),
            TransportState::Playing => f.write_str("playing"),
            TransportState::Paused => f.write_str("paused"),
            TransportState::Seeking => f.write_str("seeking"),
        }
    }
}

/// How a track gets to its computed start.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartPlan {
    /// Start now from this position in the track's own timeline.
    Immediate(Duration),
    /// Start from zero once this much time has passed.
    Delayed { delay: Duration },
}

impl StartPlan {
    /// The position the track should be at right now.
    pub fn position(&self) -> Duration {
        match self {
            StartPlan::Immediate(position) => *position,
            StartPlan::Delayed { .. } => Duration::ZERO,
        }
    }
}

/// Converts user supplied seconds. Negative and non-finite values become zero.
pub fn seconds_to_duration(seconds: f64) -> Duration {
    if seconds.is_finite() && seconds > 0.0 {
        Duration::from_secs_f64(seconds)
    } else {
        Duration::ZERO
    }
}

fn offset_nanos(offset_seconds: f64) -> i128 {
    if offset_seconds.is_finite() {
        (offset_seconds * 1e9).round() as i128
    } else {
        0
    }
}

/// Computes where a track starts for a given reference time.
pub fn plan_start(
    reference: Duration,
    offset_seconds: f64,
    corrected: bool,
    duration: Duration,
    end_epsilon: Duration,
) -> StartPlan {
    let reference_ns = reference.as_nanos() as i128;
    let start_ns = if !corrected || offset_seconds == 0.0 {
        reference_ns
    } else {
        reference_ns + offset_nanos(offset_seconds)
    };

    if start_ns < 0 {
        return StartPlan::Delayed {
            delay: Duration::from_nanos((-start_ns) as u64),
        };
    }

    let latest = duration.saturating_sub(end_epsilon);
    let start = Duration::from_nanos(start_ns.min(u64::MAX as i128) as u64);
    StartPlan::Immediate(start.min(latest))
}

/// The position a playing track should report at the given reference time.
pub fn expected_position(
    reference: Duration,
    offset_seconds: f64,
    corrected: bool,
    duration: Duration,
    end_epsilon: Duration,
) -> Duration {
    plan_start(reference, offset_seconds, corrected, duration, end_epsilon).position()
}

/// Recovers the reference time from a track's actual output position.
pub fn reference_from_track(actual: Duration, offset_seconds: f64, corrected: bool) -> Duration {
    if !corrected || offset_seconds == 0.0 {
        return actual;
    }
    let reference_ns = actual.as_nanos() as i128 - offset_nanos(offset_seconds);
    Duration::from_nanos(reference_ns.clamp(0, u64::MAX as i128) as u64)
}

#[cfg(test)]
mod test {
    use super::*;

    const EPS: Duration = Duration::from_millis(10);

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    #[test]
    fn test_positive_offset_skips_into_track() {
        let duration = secs(30.0);
        assert_eq!(
            plan_start(Duration::ZERO, 2.5, true, duration, EPS),
            StartPlan::Immediate(secs(2.5))
        );
        assert_eq!(
            plan_start(Duration::ZERO, 2.5, false, duration, EPS),
            StartPlan::Immediate(Duration::ZERO)
        );
        assert_eq!(
            plan_start(secs(10.0), 2.5, true, duration, EPS),
            StartPlan::Immediate(secs(12.5))
        );
    }

    #[test]
    fn test_negative_start_is_delayed() {
        let duration = secs(30.0);
        assert_eq!(
            plan_start(Duration::ZERO, -1.5, true, duration, EPS),
            StartPlan::Delayed { delay: secs(1.5) }
        );
        assert_eq!(
            plan_start(secs(3.0), -1.5, true, duration, EPS),
            StartPlan::Immediate(secs(1.5))
        );
        assert_eq!(
            expected_position(Duration::ZERO, -1.5, true, duration, EPS),
            Duration::ZERO
        );
    }

    #[test]
    fn test_start_clamped_before_end() {
        assert_eq!(
            plan_start(secs(9.0), 2.5, true, secs(10.0), EPS),
            StartPlan::Immediate(secs(10.0) - EPS)
        );
        assert_eq!(
            plan_start(secs(100.0), 0.0, false, secs(10.0), EPS),
            StartPlan::Immediate(secs(10.0) - EPS)
        );
    }

    #[test]
    fn test_toggle_round_trip() {
        let duration = secs(60.0);
        for offset in [-3.25, -0.04, 0.0, 0.5, 7.0] {
            for reference in [0.0, 1.0, 20.0] {
                let raw = plan_start(secs(reference), offset, false, duration, EPS);
                let corrected = plan_start(secs(reference), offset, true, duration, EPS);
                assert_eq!(plan_start(secs(reference), offset, false, duration, EPS), raw);
                assert_eq!(
                    plan_start(secs(reference), offset, true, duration, EPS),
                    corrected
                );
            }
        }
    }

    #[test]
    fn test_reference_from_track() {
        assert_eq!(reference_from_track(secs(5.0), 2.0, true), secs(3.0));
        assert_eq!(reference_from_track(secs(5.0), 2.0, false), secs(5.0));
        assert_eq!(reference_from_track(secs(1.0), 2.0, true), Duration::ZERO);
        assert_eq!(reference_from_track(secs(1.0), -2.0, true), secs(3.0));
    }

    #[test]
    fn test_seconds_to_duration() {
        assert_eq!(seconds_to_duration(-4.0), Duration::ZERO);
        assert_eq!(seconds_to_duration(f64::NAN), Duration::ZERO);
        assert_eq!(seconds_to_duration(1.5), secs(1.5));
    }
}
