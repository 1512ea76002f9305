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
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, Packet};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::default::{get_codecs, get_probe};

use super::error::LoadError;
use crate::track::{DecodedBuffer, StreamHandle};

/// An opened demuxer positioned on the first audio track of some media.
pub(crate) struct OpenedMedia {
    pub format_reader: Box<dyn FormatReader>,
    pub track_id: u32,
    pub sample_rate: Option<u32>,
    pub n_frames: Option<u64>,
}

/// Probes the media and selects the first decodable audio track.
pub(crate) fn open_media(media: Arc<[u8]>, hint: Option<&str>) -> Result<OpenedMedia, LoadError> {
    let mss = MediaSourceStream::new(Box::new(Cursor::new(media)), Default::default());

    let mut probe_hint = Hint::new();
    if let Some(extension) = hint {
        probe_hint.with_extension(extension);
    }

    let meta_opts: MetadataOptions = Default::default();
    let fmt_opts: FormatOptions = Default::default();
    let probed = get_probe().format(&probe_hint, mss, &fmt_opts, &meta_opts)?;
    let format_reader = probed.format;

    let track = format_reader
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| LoadError::DecodeFailed("No audio track found".to_string()))?;

    let track_id = track.id;
    let sample_rate = track.codec_params.sample_rate;
    let n_frames = track.codec_params.n_frames;

    Ok(OpenedMedia {
        format_reader,
        track_id,
        sample_rate,
        n_frames,
    })
}

/// Creates a decoder for the selected track.
pub(crate) fn make_decoder(opened: &OpenedMedia) -> Result<Box<dyn Decoder>, LoadError> {
    let track = opened
        .format_reader
        .tracks()
        .iter()
        .find(|t| t.id == opened.track_id)
        .ok_or_else(|| LoadError::DecodeFailed("Audio track disappeared".to_string()))?;
    let decoder_opts: DecoderOptions = Default::default();
    Ok(get_codecs().make(&track.codec_params, &decoder_opts)?)
}

/// Reads the next packet with common end-of-stream handling.
/// - `Ok(Some(packet))` if a packet was read
/// - `Ok(None)` at end of stream
/// - `Err(ResetRequired)` is passed through so callers can reset their decoder
pub(crate) fn read_next_packet(
    format_reader: &mut dyn FormatReader,
) -> Result<Option<Packet>, SymphoniaError> {
    match format_reader.next_packet() {
        Ok(packet) => Ok(Some(packet)),
        Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Appends a decoded packet to per-channel output vectors.
pub(crate) fn append_planar(
    decoded: symphonia::core::audio::AudioBufferRef,
    output: &mut Vec<Vec<f32>>,
) -> usize {
    let spec = *decoded.spec();
    let frames = decoded.frames();
    if frames == 0 {
        return 0;
    }
    let channels = spec.channels.count();

    let mut sample_buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
    sample_buffer.copy_planar_ref(decoded);
    let samples = sample_buffer.samples();

    if output.len() < channels {
        output.resize(channels, Vec::new());
    }
    for (channel, plane) in samples.chunks_exact(frames).take(channels).enumerate() {
        output[channel].extend_from_slice(plane);
    }
    frames
}

/// Decodes all of the given media into memory. Any decode error fails the whole decode so the
/// caller can move on to its next tier.
pub fn decode_to_buffer(media: Arc<[u8]>, hint: Option<&str>) -> Result<DecodedBuffer, LoadError> {
    let mut opened = open_media(media, hint)?;
    let mut decoder = make_decoder(&opened)?;
    let sample_rate = opened
        .sample_rate
        .ok_or_else(|| LoadError::DecodeFailed("Sample rate not specified".to_string()))?;

    let mut planar: Vec<Vec<f32>> = Vec::new();
    loop {
        let packet = match read_next_packet(opened.format_reader.as_mut()) {
            Ok(Some(packet)) => packet,
            Ok(None) => break,
            Err(SymphoniaError::ResetRequired) => {
                decoder.reset();
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        if packet.track_id() != opened.track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                append_planar(decoded, &mut planar);
            }
            Err(SymphoniaError::ResetRequired) => {
                decoder.reset();
                let decoded = decoder.decode(&packet)?;
                append_planar(decoded, &mut planar);
            }
            Err(e) => return Err(e.into()),
        }
    }

    if planar.is_empty() {
        return Err(LoadError::DecodeFailed("No audio decoded".to_string()));
    }

    Ok(DecodedBuffer::new(planar, sample_rate))
}

/// Builds a metadata-only stream handle. Only the container is read; packets are walked to find
/// the duration when the container doesn't declare it, but nothing is decoded.
pub fn probe_stream(media: Arc<[u8]>, hint: Option<&str>) -> Result<StreamHandle, LoadError> {
    let mut opened = open_media(media.clone(), hint)?;

    let duration = match (opened.n_frames, opened.sample_rate) {
        (Some(n_frames), Some(sample_rate)) if sample_rate > 0 => {
            Duration::from_secs_f64(n_frames as f64 / sample_rate as f64)
        }
        _ => scan_duration(&mut opened)?,
    };

    Ok(StreamHandle::new(
        media,
        hint.map(str::to_string),
        duration,
        opened.sample_rate,
    ))
}

/// Walks packet timestamps to find where the track ends.
fn scan_duration(opened: &mut OpenedMedia) -> Result<Duration, LoadError> {
    let time_base = opened
        .format_reader
        .tracks()
        .iter()
        .find(|t| t.id == opened.track_id)
        .and_then(|t| t.codec_params.time_base);

    let mut end_ts = 0u64;
    loop {
        match read_next_packet(opened.format_reader.as_mut()) {
            Ok(Some(packet)) => {
                if packet.track_id() == opened.track_id {
                    end_ts = end_ts.max(packet.ts() + packet.dur());
                }
            }
            Ok(None) => break,
            Err(SymphoniaError::ResetRequired) => continue,
            Err(e) => return Err(e.into()),
        }
    }

    match (time_base, opened.sample_rate) {
        (Some(time_base), _) => {
            let time = time_base.calc_time(end_ts);
            Ok(Duration::from_secs(time.seconds) + Duration::from_secs_f64(time.frac))
        }
        (None, Some(sample_rate)) if sample_rate > 0 => {
            Ok(Duration::from_secs_f64(end_ts as f64 / sample_rate as f64))
        }
        _ => Err(LoadError::DecodeFailed(
            "Unable to determine stream duration".to_string(),
        )),
    }
}
