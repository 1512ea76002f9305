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
use std::time::Duration;

use symphonia::core::codecs::Decoder;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{SeekMode, SeekTo};
use symphonia::core::units::Time;
use tracing::debug;

use super::decode::{append_planar, make_decoder, open_media, read_next_packet, OpenedMedia};
use super::error::LoadError;
use crate::track::StreamHandle;

/// Incrementally decodes a stream handle in planar chunks. Unlike a full decode, packets that
/// fail to decode are skipped rather than failing the stream.
pub struct StreamingDecoder {
    opened: OpenedMedia,
    decoder: Box<dyn Decoder>,
    sample_rate: u32,
    /// Decoded samples that didn't fit in the last chunk.
    leftover: Vec<Vec<f32>>,
    /// Frames to discard after an accurate seek landed before the requested time.
    skip_frames: usize,
    finished: bool,
}

impl StreamingDecoder {
    /// Opens the stream and seeks to `start`.
    pub fn open(handle: &StreamHandle, start: Duration) -> Result<StreamingDecoder, LoadError> {
        let mut opened = open_media(handle.media(), handle.hint())?;
        let decoder = make_decoder(&opened)?;
        let sample_rate = opened
            .sample_rate
            .or(handle.sample_rate())
            .ok_or_else(|| LoadError::DecodeFailed("Sample rate not specified".to_string()))?;

        let mut skip_frames = 0;
        if !start.is_zero() {
            let seek_to = SeekTo::Time {
                time: Time::from(start),
                track_id: Some(opened.track_id),
            };
            let seeked = opened.format_reader.seek(SeekMode::Accurate, seek_to)?;
            skip_frames = seeked.required_ts.saturating_sub(seeked.actual_ts) as usize;
        }

        Ok(StreamingDecoder {
            opened,
            decoder,
            sample_rate,
            leftover: Vec::new(),
            skip_frames,
            finished: false,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Fills `output` with up to `max_frames` planar frames. Returns the number of frames
    /// written; 0 means the stream is exhausted.
    pub fn next_chunk(&mut self, output: &mut Vec<Vec<f32>>, max_frames: usize) -> usize {
        output.iter_mut().for_each(Vec::clear);

        while self.leftover_frames() < max_frames && !self.finished {
            self.decode_next_packet();
        }

        let frames = self.leftover_frames().min(max_frames);
        if output.len() < self.leftover.len() {
            output.resize(self.leftover.len(), Vec::new());
        }
        for (channel, samples) in self.leftover.iter_mut().enumerate() {
            output[channel].extend(samples.drain(..frames));
        }
        frames
    }

    fn leftover_frames(&self) -> usize {
        self.leftover.first().map(Vec::len).unwrap_or(0)
    }

    fn decode_next_packet(&mut self) {
        let packet = match read_next_packet(self.opened.format_reader.as_mut()) {
            Ok(Some(packet)) => packet,
            Ok(None) => {
                self.finished = true;
                return;
            }
            Err(SymphoniaError::ResetRequired) => {
                self.decoder.reset();
                return;
            }
            Err(e) => {
                debug!(err = %e, "Stream ended on read error");
                self.finished = true;
                return;
            }
        };
        if packet.track_id() != self.opened.track_id {
            return;
        }

        match self.decoder.decode(&packet) {
            Ok(decoded) => {
                append_planar(decoded, &mut self.leftover);
                if self.skip_frames > 0 {
                    let skip = self.skip_frames.min(self.leftover_frames());
                    self.leftover.iter_mut().for_each(|samples| {
                        samples.drain(..skip);
                    });
                    self.skip_frames -= skip;
                }
            }
            Err(SymphoniaError::DecodeError(e)) => {
                debug!(err = e, ts = packet.ts(), "Skipping undecodable packet");
            }
            Err(SymphoniaError::ResetRequired) => self.decoder.reset(),
            Err(e) => {
                debug!(err = %e, "Stream ended on decode error");
                self.finished = true;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::sync::Arc;

    use super::*;
    use crate::sources::decode::probe_stream;
    use crate::testutil::audio::write_wav;

    fn handle_for(samples: Vec<i32>, sample_rate: u32) -> Result<StreamHandle, Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("stream.wav");
        write_wav(path.clone(), vec![samples], sample_rate)?;
        let media: Arc<[u8]> = Arc::from(fs::read(path)?);
        Ok(probe_stream(media, Some("wav"))?)
    }

    #[test]
    fn test_streams_all_frames_in_chunks() -> Result<(), Box<dyn std::error::Error>> {
        let handle = handle_for((0..1000).map(|i| i << 16).collect(), 1000)?;
        let mut decoder = StreamingDecoder::open(&handle, Duration::ZERO)?;
        assert_eq!(decoder.sample_rate(), 1000);

        let mut output = Vec::new();
        let mut total = 0;
        loop {
            let frames = decoder.next_chunk(&mut output, 256);
            if frames == 0 {
                break;
            }
            assert!(frames <= 256);
            total += frames;
        }
        assert_eq!(total, 1000);
        Ok(())
    }

    #[test]
    fn test_open_with_seek_skips_ahead() -> Result<(), Box<dyn std::error::Error>> {
        let handle = handle_for(vec![0; 2000], 1000)?;
        let mut decoder = StreamingDecoder::open(&handle, Duration::from_millis(1500))?;

        let mut output = Vec::new();
        let mut total = 0;
        loop {
            let frames = decoder.next_chunk(&mut output, 4096);
            if frames == 0 {
                break;
            }
            total += frames;
        }
        assert_eq!(total, 500);
        Ok(())
    }
}
