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
//! Gain composition for the comparison mix. Independent of transport state and of any backend.
use crate::track::{Track, TrackRole};

/// Final per-output-channel gains for one track.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChannelGains {
    pub left: f32,
    pub right: f32,
}

impl ChannelGains {
    pub const SILENT: ChannelGains = ChannelGains {
        left: 0.0,
        right: 0.0,
    };

    pub const UNITY: ChannelGains = ChannelGains {
        left: 1.0,
        right: 1.0,
    };

    pub fn is_silent(&self) -> bool {
        self.left == 0.0 && self.right == 0.0
    }
}

impl Default for ChannelGains {
    fn default() -> Self {
        ChannelGains::UNITY
    }
}

/// Scales a role class by the balance control. Positive balance fades references out, negative
/// balance fades components out.
pub fn balance_factor(role: TrackRole, balance: f32) -> f32 {
    let balance = balance.clamp(-1.0, 1.0);
    match role {
        TrackRole::Reference => 1.0 - balance.max(0.0),
        TrackRole::Component => 1.0 - (-balance).max(0.0),
    }
}

/// Linear pan law: the far side is attenuated, the near side stays at unity.
pub fn pan_gains(pan: f32) -> ChannelGains {
    let pan = pan.clamp(-1.0, 1.0);
    ChannelGains {
        left: 1.0 - pan.max(0.0),
        right: 1.0 + pan.min(0.0),
    }
}

/// Mixing state shared by every track in a session.
#[derive(Clone, Debug)]
pub struct TrackGraph {
    balance: f32,
    master_volume: f32,
}

impl Default for TrackGraph {
    fn default() -> Self {
        TrackGraph {
            balance: 0.0,
            master_volume: 1.0,
        }
    }
}

impl TrackGraph {
    pub fn new() -> TrackGraph {
        TrackGraph::default()
    }

    pub fn balance(&self) -> f32 {
        self.balance
    }

    pub fn set_balance(&mut self, balance: f32) {
        self.balance = balance.clamp(-1.0, 1.0);
    }

    pub fn master_volume(&self) -> f32 {
        self.master_volume
    }

    pub fn set_master_volume(&mut self, volume: f32) {
        self.master_volume = volume.max(0.0);
    }

    /// True when any track is soloed.
    pub fn solo_active<'a>(tracks: impl IntoIterator<Item = &'a Track>) -> bool {
        tracks.into_iter().any(|track| track.solo)
    }

    /// Track volume after solo, mute and balance, before pan and master.
    pub fn effective_volume(&self, track: &Track, solo_active: bool) -> f32 {
        let solo = if solo_active && !track.solo { 0.0 } else { 1.0 };
        let mute = if track.muted { 0.0 } else { 1.0 };
        track.volume.max(0.0) * solo * mute * balance_factor(track.role(), self.balance)
    }

    /// The gains handed to the backend for a track.
    pub fn gains_for(&self, track: &Track, solo_active: bool) -> ChannelGains {
        let volume = self.effective_volume(track, solo_active) * self.master_volume;
        let pan = pan_gains(track.pan);
        ChannelGains {
            left: volume * pan.left,
            right: volume * pan.right,
        }
    }
}

/// Adds frames from a planar source, starting at `offset`, into an interleaved output buffer.
/// Mono sources feed both sides; extra source channels beyond two are folded onto the stereo
/// pair. Returns the number of source frames consumed, which silent gains still consume.
pub fn mix_planar_into(
    output: &mut [f32],
    output_channels: usize,
    source: &[Vec<f32>],
    offset: usize,
    gains: ChannelGains,
) -> usize {
    if output_channels == 0 || source.is_empty() {
        return 0;
    }
    let available = source[0].len().saturating_sub(offset);
    let frames = (output.len() / output_channels).min(available);
    if gains.is_silent() {
        return frames;
    }

    for (frame, out) in output.chunks_exact_mut(output_channels).take(frames).enumerate() {
        let index = offset + frame;
        let (left, right) = match source.len() {
            1 => (source[0][index], source[0][index]),
            _ => {
                let mut left = 0.0;
                let mut right = 0.0;
                for (channel, samples) in source.iter().enumerate() {
                    if channel % 2 == 0 {
                        left += samples[index];
                    } else {
                        right += samples[index];
                    }
                }
                (left, right)
            }
        };

        if output_channels == 1 {
            out[0] += 0.5 * (left * gains.left + right * gains.right);
        } else {
            out[0] += left * gains.left;
            out[1] += right * gains.right;
        }
    }
    frames
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::track::{DecodedBuffer, TrackSource};

    fn track(role: TrackRole) -> Track {
        let buffer = DecodedBuffer::new(vec![vec![0.0; 10]], 10);
        Track::new("t".into(), role, TrackSource::Buffer(Arc::new(buffer)))
    }

    #[test]
    fn test_balance_factor() {
        assert_eq!(balance_factor(TrackRole::Reference, 0.0), 1.0);
        assert_eq!(balance_factor(TrackRole::Component, 0.0), 1.0);

        assert_eq!(balance_factor(TrackRole::Reference, 1.0), 0.0);
        assert_eq!(balance_factor(TrackRole::Component, 1.0), 1.0);

        assert_eq!(balance_factor(TrackRole::Reference, -1.0), 1.0);
        assert_eq!(balance_factor(TrackRole::Component, -1.0), 0.0);

        assert_eq!(balance_factor(TrackRole::Reference, 0.25), 0.75);
        assert_eq!(balance_factor(TrackRole::Component, -0.5), 0.5);
    }

    #[test]
    fn test_effective_volume_solo_and_mute() {
        let graph = TrackGraph::new();
        let mut soloed = track(TrackRole::Component);
        soloed.solo = true;
        soloed.volume = 0.8;
        let other = track(TrackRole::Reference);

        let solo_active = TrackGraph::solo_active([&soloed, &other]);
        assert!(solo_active);
        assert_eq!(graph.effective_volume(&soloed, solo_active), 0.8);
        assert_eq!(graph.effective_volume(&other, solo_active), 0.0);

        soloed.muted = true;
        assert_eq!(graph.effective_volume(&soloed, solo_active), 0.0);
    }

    #[test]
    fn test_boost_is_preserved() {
        let graph = TrackGraph::new();
        let mut boosted = track(TrackRole::Component);
        boosted.volume = 1.5;
        assert_eq!(graph.effective_volume(&boosted, false), 1.5);
    }

    #[test]
    fn test_pan_is_independent_of_balance() {
        let mut graph = TrackGraph::new();
        graph.set_balance(-0.5);
        graph.set_master_volume(0.5);

        let mut component = track(TrackRole::Component);
        component.pan = 1.0;
        let gains = graph.gains_for(&component, false);
        assert_eq!(gains.left, 0.0);
        assert_eq!(gains.right, 0.25);

        component.pan = -0.5;
        let gains = graph.gains_for(&component, false);
        assert_eq!(gains.left, 0.25);
        assert_eq!(gains.right, 0.125);
    }

    #[test]
    fn test_mix_planar_into() {
        let mut output = vec![0.0f32; 8];
        let mono = vec![vec![1.0, 0.5, 0.25]];
        let frames = mix_planar_into(
            &mut output,
            2,
            &mono,
            1,
            ChannelGains {
                left: 1.0,
                right: 0.5,
            },
        );
        assert_eq!(frames, 2);
        assert_eq!(output, vec![0.5, 0.25, 0.25, 0.125, 0.0, 0.0, 0.0, 0.0]);

        let stereo = vec![vec![1.0; 4], vec![-1.0; 4]];
        let frames = mix_planar_into(&mut output, 2, &stereo, 0, ChannelGains::UNITY);
        assert_eq!(frames, 4);
        assert_eq!(output[0], 1.5);
        assert_eq!(output[1], -0.75);
        assert_eq!(output[6], 1.0);

        let before = output.clone();
        let frames = mix_planar_into(&mut output, 2, &stereo, 2, ChannelGains::SILENT);
        assert_eq!(frames, 2);
        assert_eq!(output, before);
    }
}
