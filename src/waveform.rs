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
//! Peak summaries for drawing tracks on the timeline.
use crate::track::{DecodedBuffer, Track, TrackSource};

/// Min/max pairs, one per bucket, across all channels.
#[derive(Clone, Debug, PartialEq)]
pub struct Waveform {
    pub peaks: Vec<(f32, f32)>,
    /// True when the track has no sample access and the peaks are a flat line.
    pub placeholder: bool,
}

/// Summarises a track into `buckets` min/max pairs. Stream-only tracks get a flat placeholder.
pub fn peaks(track: &Track, buckets: usize) -> Waveform {
    match track.source() {
        TrackSource::Buffer(buffer) => Waveform {
            peaks: buffer_peaks(buffer, buckets),
            placeholder: false,
        },
        TrackSource::Stream(_) => Waveform {
            peaks: vec![(0.0, 0.0); buckets],
            placeholder: true,
        },
    }
}

fn buffer_peaks(buffer: &DecodedBuffer, buckets: usize) -> Vec<(f32, f32)> {
    let frames = buffer.frames();
    if buckets == 0 {
        return Vec::new();
    }
    if frames == 0 {
        return vec![(0.0, 0.0); buckets];
    }

    (0..buckets)
        .map(|bucket| {
            let start = bucket * frames / buckets;
            // Always at least one frame, so short buffers repeat rather than leave gaps.
            let end = ((bucket + 1) * frames / buckets).max(start + 1).min(frames);
            buffer
                .channels()
                .iter()
                .flat_map(|channel| &channel[start..end])
                .fold(None, |peak: Option<(f32, f32)>, &sample| match peak {
                    Some((min, max)) => Some((min.min(sample), max.max(sample))),
                    None => Some((sample, sample)),
                })
                .unwrap_or((0.0, 0.0))
        })
        .collect()
}
