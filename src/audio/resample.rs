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
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

use super::PlaybackError;
use crate::track::DecodedBuffer;

/// Input block size handed to the sinc resampler.
const INPUT_BLOCK_SIZE: usize = 1024;

/// Converts planar audio from one sample rate to another in arbitrarily sized pieces. When the
/// rates match, input is passed straight through.
pub struct StreamResampler {
    resampler: Option<SincFixedIn<f32>>,
    channels: usize,
    /// Input waiting for a full block.
    pending: Vec<Vec<f32>>,
    /// Leading output frames still to drop to compensate for the filter delay.
    delay_remaining: usize,
}

impl StreamResampler {
    pub fn new(
        source_rate: u32,
        target_rate: u32,
        channels: usize,
    ) -> Result<StreamResampler, PlaybackError> {
        let channels = channels.max(1);
        let resampler = if source_rate == target_rate || source_rate == 0 {
            None
        } else {
            let sinc_params = SincInterpolationParameters {
                sinc_len: 256,
                f_cutoff: 0.95,
                oversampling_factor: 128,
                interpolation: SincInterpolationType::Linear,
                window: WindowFunction::BlackmanHarris2,
            };
            let ratio = target_rate as f64 / source_rate as f64;
            let r = SincFixedIn::<f32>::new(ratio, 1.0, sinc_params, INPUT_BLOCK_SIZE, channels)
                .map_err(|e| {
                    PlaybackError::Unsupported(format!(
                        "cannot resample {} -> {}: {}",
                        source_rate, target_rate, e
                    ))
                })?;
            Some(r)
        };
        let delay_remaining = resampler.as_ref().map(|r| r.output_delay()).unwrap_or(0);

        Ok(StreamResampler {
            resampler,
            channels,
            pending: vec![Vec::new(); channels],
            delay_remaining,
        })
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }

    /// Feeds input and appends whatever full blocks are ready to `output`.
    pub fn push(
        &mut self,
        input: &[Vec<f32>],
        output: &mut Vec<Vec<f32>>,
    ) -> Result<(), PlaybackError> {
        self.ensure_channels(output);
        let resampler = match self.resampler.as_mut() {
            Some(resampler) => resampler,
            None => {
                for (channel, out) in output.iter_mut().enumerate() {
                    if let Some(samples) = input.get(channel) {
                        out.extend_from_slice(samples);
                    }
                }
                return Ok(());
            }
        };

        for (channel, pending) in self.pending.iter_mut().enumerate() {
            if let Some(samples) = input.get(channel) {
                pending.extend_from_slice(samples);
            }
        }

        loop {
            let needed = resampler.input_frames_next();
            let available = self.pending.iter().map(Vec::len).min().unwrap_or(0);
            if available < needed {
                return Ok(());
            }
            let block: Vec<Vec<f32>> = self
                .pending
                .iter_mut()
                .map(|pending| pending.drain(..needed).collect())
                .collect();
            let resampled = resampler
                .process(&block, None)
                .map_err(|e| PlaybackError::Device(format!("resampling failed: {}", e)))?;
            Self::append(&mut self.delay_remaining, resampled, output);
        }
    }

    /// Drains everything still held inside the resampler.
    pub fn flush(&mut self, output: &mut Vec<Vec<f32>>) -> Result<(), PlaybackError> {
        self.ensure_channels(output);
        let resampler = match self.resampler.as_mut() {
            Some(resampler) => resampler,
            None => return Ok(()),
        };

        let block: Vec<Vec<f32>> = self.pending.iter_mut().map(std::mem::take).collect();
        let resampled = resampler
            .process_partial(Some(block.as_slice()), None)
            .map_err(|e| PlaybackError::Device(format!("resampling failed: {}", e)))?;
        Self::append(&mut self.delay_remaining, resampled, output);

        // One empty pass pushes the filter tail out.
        let tail = resampler
            .process_partial::<Vec<f32>>(None, None)
            .map_err(|e| PlaybackError::Device(format!("resampling failed: {}", e)))?;
        Self::append(&mut self.delay_remaining, tail, output);
        Ok(())
    }

    fn ensure_channels(&self, output: &mut Vec<Vec<f32>>) {
        if output.len() < self.channels {
            output.resize(self.channels, Vec::new());
        }
    }

    fn append(delay_remaining: &mut usize, resampled: Vec<Vec<f32>>, output: &mut [Vec<f32>]) {
        let frames = resampled.first().map(Vec::len).unwrap_or(0);
        let skip = (*delay_remaining).min(frames);
        *delay_remaining -= skip;
        for (out, samples) in output.iter_mut().zip(resampled) {
            out.extend_from_slice(&samples[skip..]);
        }
    }
}

/// Resamples a whole decoded buffer, keeping its duration.
pub fn resample_buffer(
    buffer: &DecodedBuffer,
    target_rate: u32,
) -> Result<DecodedBuffer, PlaybackError> {
    let source_rate = buffer.sample_rate();
    if source_rate == target_rate {
        return Ok(DecodedBuffer::new(buffer.channels().to_vec(), target_rate));
    }

    let mut resampler =
        StreamResampler::new(source_rate, target_rate, buffer.channel_count() as usize)?;
    let mut output = Vec::new();
    resampler.push(buffer.channels(), &mut output)?;
    resampler.flush(&mut output)?;

    let expected =
        (buffer.frames() as f64 * target_rate as f64 / source_rate as f64).round() as usize;
    output.iter_mut().for_each(|channel| channel.resize(expected, 0.0));
    Ok(DecodedBuffer::new(output, target_rate))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::audio::{audio_test_utils::calculate_rms, sine};

    #[test]
    fn test_passthrough_when_rates_match() -> Result<(), PlaybackError> {
        let mut resampler = StreamResampler::new(48000, 48000, 2)?;
        assert!(resampler.is_passthrough());

        let mut output = Vec::new();
        resampler.push(&[vec![0.1, 0.2], vec![0.3, 0.4]], &mut output)?;
        resampler.flush(&mut output)?;
        assert_eq!(output, vec![vec![0.1, 0.2], vec![0.3, 0.4]]);
        Ok(())
    }

    #[test]
    fn test_resample_buffer_keeps_duration() -> Result<(), PlaybackError> {
        let input = sine(440.0, 0.5, 44100, 44100);
        let buffer = DecodedBuffer::new(vec![input.clone()], 44100);

        let resampled = resample_buffer(&buffer, 48000)?;
        assert_eq!(resampled.sample_rate(), 48000);
        assert_eq!(resampled.frames(), 48000);

        let channel = resampled.channel(0).unwrap_or_default();
        let ratio = calculate_rms(&channel[4800..43200]) / calculate_rms(&input[4410..39690]);
        assert!((ratio - 1.0).abs() < 0.05, "RMS ratio was {}", ratio);
        Ok(())
    }

    #[test]
    fn test_stream_resampler_chunked_matches_length() -> Result<(), PlaybackError> {
        let mut resampler = StreamResampler::new(48000, 24000, 1)?;
        let input = sine(100.0, 0.5, 48000, 9600);

        let mut output = Vec::new();
        for chunk in input.chunks(700) {
            resampler.push(&[chunk.to_vec()], &mut output)?;
        }
        resampler.flush(&mut output)?;

        // Flushing pads the final block, so the tail may run past the exact ratio.
        let frames = output[0].len();
        assert!((4800..=4800 + 1024).contains(&frames), "got {} frames", frames);
        Ok(())
    }
}
