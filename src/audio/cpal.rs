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
    error::Error,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, error, info, span, warn, Level};

use super::{
    mixer::mix_planar_into, resample::resample_buffer, resample::StreamResampler, ChannelGains,
    DeviceInfo, PlaybackError,
};
use crate::playsync::CancelHandle;
use crate::sources::StreamingDecoder;
use crate::track::{DecodedBuffer, StreamHandle, TrackId, TrackSource};

/// Decoded chunk size used by stream feeders, in source frames.
const FEED_CHUNK_FRAMES: usize = 4096;

/// How many chunks a stream feeder may run ahead of the device.
const FEED_QUEUE_DEPTH: usize = 8;

/// Queued chunks needed before a stream voice counts as buffered.
const FEED_BUFFERED_CHUNKS: usize = 2;

/// Feeds one stream voice from a background decoder.
struct Feeder {
    chunks: Receiver<Vec<Vec<f32>>>,
    cancel_handle: CancelHandle,
    buffered: Arc<AtomicBool>,
}

impl Feeder {
    fn start(handle: StreamHandle, start: Duration, target_rate: u32) -> Feeder {
        let (tx, rx) = crossbeam_channel::bounded(FEED_QUEUE_DEPTH);
        let cancel_handle = CancelHandle::new();
        let buffered = Arc::new(AtomicBool::new(false));

        {
            let cancel_handle = cancel_handle.clone();
            let buffered = buffered.clone();
            thread::spawn(move || {
                let span = span!(Level::DEBUG, "stream feeder");
                let _enter = span.enter();
                if let Err(e) = Feeder::run(handle, start, target_rate, tx, &cancel_handle, &buffered)
                {
                    warn!(err = %e, "Stream feeder stopped.");
                }
                // A dead feeder never becomes ready again; let playback proceed on what was sent.
                buffered.store(true, Ordering::Relaxed);
            });
        }

        Feeder {
            chunks: rx,
            cancel_handle,
            buffered,
        }
    }

    fn run(
        handle: StreamHandle,
        start: Duration,
        target_rate: u32,
        tx: Sender<Vec<Vec<f32>>>,
        cancel_handle: &CancelHandle,
        buffered: &AtomicBool,
    ) -> Result<(), Box<dyn Error>> {
        let mut decoder = StreamingDecoder::open(&handle, start)?;
        let mut resampler: Option<StreamResampler> = None;
        let mut decoded = Vec::new();
        let mut sent = 0;

        loop {
            if cancel_handle.is_cancelled() {
                return Ok(());
            }
            let frames = decoder.next_chunk(&mut decoded, FEED_CHUNK_FRAMES);
            if resampler.is_none() {
                if frames == 0 {
                    return Ok(());
                }
                resampler = Some(StreamResampler::new(
                    decoder.sample_rate(),
                    target_rate,
                    decoded.len(),
                )?);
            }
            let Some(resampler) = resampler.as_mut() else {
                return Ok(());
            };

            let mut chunk = Vec::new();
            if frames == 0 {
                resampler.flush(&mut chunk)?;
            } else {
                resampler.push(&decoded, &mut chunk)?;
            }

            if chunk.first().is_some_and(|samples| !samples.is_empty()) {
                if !Feeder::send(&tx, chunk, cancel_handle) {
                    return Ok(());
                }
                sent += 1;
                if sent >= FEED_BUFFERED_CHUNKS {
                    buffered.store(true, Ordering::Relaxed);
                }
            }
            if frames == 0 {
                return Ok(());
            }
        }
    }

    /// Blocks until the chunk is queued. Returns false if the voice went away or was cancelled.
    fn send(tx: &Sender<Vec<Vec<f32>>>, mut chunk: Vec<Vec<f32>>, cancel: &CancelHandle) -> bool {
        loop {
            match tx.try_send(chunk) {
                Ok(()) => return true,
                Err(TrySendError::Disconnected(_)) => return false,
                Err(TrySendError::Full(returned)) => {
                    chunk = returned;
                    if cancel.sleep(Duration::from_millis(10)) {
                        return false;
                    }
                }
            }
        }
    }
}

impl Drop for Feeder {
    fn drop(&mut self) {
        self.cancel_handle.cancel();
    }
}

enum Source {
    /// Already at the device rate.
    Buffer(Arc<DecodedBuffer>),
    Stream {
        handle: StreamHandle,
        feeder: Feeder,
        /// The chunk being played and how far into it we are.
        current: Vec<Vec<f32>>,
        current_offset: usize,
    },
}

struct Voice {
    source: Source,
    playing: bool,
    /// Device-rate frame the voice is at.
    cursor: usize,
    total_frames: usize,
    gains: ChannelGains,
}

impl Voice {
    /// Moves the voice, restarting its feeder when it streams.
    fn seek(&mut self, frame: usize, sample_rate: u32) {
        self.cursor = frame.min(self.total_frames);
        if let Source::Stream {
            handle,
            feeder,
            current,
            current_offset,
        } = &mut self.source
        {
            let start = Duration::from_secs_f64(self.cursor as f64 / sample_rate as f64);
            *feeder = Feeder::start(handle.clone(), start, sample_rate);
            current.clear();
            *current_offset = 0;
        }
    }

    fn is_buffered(&self) -> bool {
        match &self.source {
            Source::Buffer(_) => true,
            Source::Stream { feeder, .. } => feeder.buffered.load(Ordering::Relaxed),
        }
    }

    /// Mixes the voice into the interleaved output and advances it.
    fn render(&mut self, output: &mut [f32], channels: usize) {
        let frames = output.len() / channels;
        match &mut self.source {
            Source::Buffer(buffer) => {
                let consumed =
                    mix_planar_into(output, channels, buffer.channels(), self.cursor, self.gains);
                self.cursor += consumed;
            }
            Source::Stream {
                feeder,
                current,
                current_offset,
                ..
            } => {
                let mut written = 0;
                while written < frames {
                    let remaining = current.first().map(Vec::len).unwrap_or(0);
                    if *current_offset >= remaining {
                        match feeder.chunks.try_recv() {
                            Ok(chunk) => {
                                *current = chunk;
                                *current_offset = 0;
                                continue;
                            }
                            // Underrun: the position holds until the feeder catches up.
                            Err(TryRecvError::Empty) => break,
                            Err(TryRecvError::Disconnected) => {
                                self.cursor = self.total_frames;
                                break;
                            }
                        }
                    }
                    let consumed = mix_planar_into(
                        &mut output[written * channels..],
                        channels,
                        current,
                        *current_offset,
                        self.gains,
                    );
                    *current_offset += consumed;
                    written += consumed;
                    self.cursor += consumed;
                }
            }
        }

        if self.cursor >= self.total_frames {
            self.playing = false;
        }
    }
}

/// State shared between the backend and the device callback.
struct Shared {
    voices: Mutex<HashMap<TrackId, Voice>>,
    /// Frames the device has consumed since the stream started.
    frames_played: AtomicU64,
}

/// Plays tracks through a cpal output device.
pub struct Backend {
    name: String,
    host: String,
    sample_rate: u32,
    channels: u16,
    shared: Arc<Shared>,
    cancel_handle: CancelHandle,
    output_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (Channels={}, Rate={}) ({})",
            self.name, self.channels, self.sample_rate, self.host
        )
    }
}

impl Backend {
    /// Lists cpal output devices.
    pub fn list() -> Result<Vec<DeviceInfo>, Box<dyn Error>> {
        Ok(Backend::list_cpal_devices()?
            .into_iter()
            .map(|(info, _)| info)
            .collect())
    }

    fn list_cpal_devices() -> Result<Vec<(DeviceInfo, cpal::Device)>, Box<dyn Error>> {
        // Suppress noisy output here.
        let _shh_stdout = shh::stdout()?;
        let _shh_stderr = shh::stderr()?;

        let mut devices = Vec::new();
        for host_id in cpal::available_hosts() {
            let host_devices = match cpal::host_from_id(host_id)?.output_devices() {
                Ok(host_devices) => host_devices,
                Err(e) => {
                    error!(
                        err = e.to_string(),
                        host = host_id.name(),
                        "Unable to list devices for host"
                    );
                    continue;
                }
            };

            for device in host_devices {
                let Ok(configs) = device.supported_output_configs() else {
                    continue;
                };
                let max_channels = configs.map(|c| c.channels()).max().unwrap_or(0);
                if max_channels == 0 {
                    continue;
                }
                let default_sample_rate = device
                    .default_output_config()
                    .map(|c| c.sample_rate().0)
                    .unwrap_or(0);

                devices.push((
                    DeviceInfo {
                        name: device.name()?,
                        host: host_id.name().to_string(),
                        max_channels,
                        default_sample_rate,
                    },
                    device,
                ));
            }
        }

        devices.sort_by(|(a, _), (b, _)| a.name.cmp(&b.name));
        Ok(devices)
    }

    /// Opens the named output device. `default` selects the host's default output.
    pub fn get(name: &str) -> Result<Backend, Box<dyn Error>> {
        let (host, device) = if name == "default" {
            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or("no default output device")?;
            (host.id().name().to_string(), device)
        } else {
            match Backend::list_cpal_devices()?
                .into_iter()
                .find(|(info, _)| info.name.trim() == name)
            {
                Some((info, device)) => (info.host, device),
                None => return Err(format!("no device found with name {}", name).into()),
            }
        };

        let supported = device.default_output_config()?;
        let sample_format = supported.sample_format();
        let config: cpal::StreamConfig = supported.config();
        let sample_rate = config.sample_rate.0;
        let channels = config.channels;

        let shared = Arc::new(Shared {
            voices: Mutex::new(HashMap::new()),
            frames_played: AtomicU64::new(0),
        });
        let cancel_handle = CancelHandle::new();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<(), String>>(1);

        let output_thread = {
            let shared = shared.clone();
            let cancel_handle = cancel_handle.clone();
            thread::spawn(move || {
                let stream = match sample_format {
                    cpal::SampleFormat::F32 => build_stream::<f32>(&device, &config, shared),
                    cpal::SampleFormat::I16 => build_stream::<i16>(&device, &config, shared),
                    cpal::SampleFormat::I32 => build_stream::<i32>(&device, &config, shared),
                    cpal::SampleFormat::U16 => build_stream::<u16>(&device, &config, shared),
                    other => Err(format!("unsupported sample format {}", other)),
                };
                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(e.to_string()));
                    return;
                }
                info!("cpal output stream started");
                let _ = ready_tx.send(Ok(()));

                // The stream lives exactly as long as this thread.
                while !cancel_handle.sleep(Duration::from_secs(1)) {}
                drop(stream);
            })
        };

        match ready_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(PlaybackError::Device(e).into()),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                cancel_handle.cancel();
                return Err(PlaybackError::Device("output stream did not start".into()).into());
            }
        }

        info!(device = name, sample_rate, channels, "Opened output device.");
        Ok(Backend {
            name: name.to_string(),
            host,
            sample_rate,
            channels,
            shared,
            cancel_handle,
            output_thread: Mutex::new(Some(output_thread)),
        })
    }

    fn duration_to_frame(&self, position: Duration) -> usize {
        (position.as_secs_f64() * self.sample_rate as f64).round() as usize
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    shared: Arc<Shared>,
) -> Result<cpal::Stream, String>
where
    T: cpal::Sample + cpal::FromSample<f32> + cpal::SizedSample,
{
    let channels = (config.channels as usize).max(1);
    let mut mix = Vec::new();
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                mix.clear();
                mix.resize(data.len(), 0.0f32);
                {
                    let mut voices = shared.voices.lock();
                    for voice in voices.values_mut().filter(|voice| voice.playing) {
                        voice.render(&mut mix, channels);
                    }
                }
                shared
                    .frames_played
                    .fetch_add((data.len() / channels) as u64, Ordering::Relaxed);
                for (out, sample) in data.iter_mut().zip(mix.iter()) {
                    *out = T::from_sample(sample.clamp(-1.0, 1.0));
                }
            },
            |err| error!("cpal output stream error: {}", err),
            None,
        )
        .map_err(|e| e.to_string())
}

impl super::AudioBackend for Backend {
    fn attach(&self, id: &TrackId, source: &TrackSource) -> Result<(), PlaybackError> {
        let voice = match source {
            TrackSource::Buffer(buffer) => {
                let buffer = if buffer.sample_rate() == self.sample_rate {
                    buffer.clone()
                } else {
                    debug!(
                        track = %id,
                        from = buffer.sample_rate(),
                        to = self.sample_rate,
                        "Resampling track for device."
                    );
                    Arc::new(resample_buffer(buffer, self.sample_rate)?)
                };
                Voice {
                    total_frames: buffer.frames(),
                    source: Source::Buffer(buffer),
                    playing: false,
                    cursor: 0,
                    gains: ChannelGains::UNITY,
                }
            }
            TrackSource::Stream(handle) => Voice {
                total_frames: self.duration_to_frame(handle.duration()),
                source: Source::Stream {
                    handle: handle.clone(),
                    feeder: Feeder::start(handle.clone(), Duration::ZERO, self.sample_rate),
                    current: Vec::new(),
                    current_offset: 0,
                },
                playing: false,
                cursor: 0,
                gains: ChannelGains::UNITY,
            },
        };

        self.shared.voices.lock().insert(id.clone(), voice);
        Ok(())
    }

    fn detach(&self, id: &TrackId) {
        if self.shared.voices.lock().remove(id).is_some() {
            debug!(track = %id, "Detached track.");
        }
    }

    fn play(&self, id: &TrackId, position: Duration) -> Result<(), PlaybackError> {
        let frame = self.duration_to_frame(position);
        let mut voices = self.shared.voices.lock();
        let voice = voices
            .get_mut(id)
            .ok_or_else(|| PlaybackError::UnknownTrack(id.clone()))?;
        if voice.cursor != frame {
            voice.seek(frame, self.sample_rate);
        }
        voice.playing = true;
        Ok(())
    }

    fn pause(&self, id: &TrackId) {
        if let Some(voice) = self.shared.voices.lock().get_mut(id) {
            voice.playing = false;
        }
    }

    fn position(&self, id: &TrackId) -> Option<Duration> {
        self.shared.voices.lock().get(id).map(|voice| {
            Duration::from_secs_f64(voice.cursor as f64 / self.sample_rate as f64)
        })
    }

    fn set_position(&self, id: &TrackId, position: Duration) -> Result<(), PlaybackError> {
        let frame = self.duration_to_frame(position);
        let mut voices = self.shared.voices.lock();
        let voice = voices
            .get_mut(id)
            .ok_or_else(|| PlaybackError::UnknownTrack(id.clone()))?;
        voice.seek(frame, self.sample_rate);
        Ok(())
    }

    fn is_buffered(&self, id: &TrackId) -> bool {
        self.shared
            .voices
            .lock()
            .get(id)
            .is_some_and(Voice::is_buffered)
    }

    fn set_gains(&self, id: &TrackId, gains: ChannelGains) {
        if let Some(voice) = self.shared.voices.lock().get_mut(id) {
            voice.gains = gains;
        }
    }

    fn now(&self) -> Duration {
        let frames = self.shared.frames_played.load(Ordering::Relaxed);
        Duration::from_secs_f64(frames as f64 / self.sample_rate.max(1) as f64)
    }

    #[cfg(test)]
    fn to_mock(&self) -> Result<Arc<super::mock::Backend>, Box<dyn Error>> {
        Err("not a mock".into())
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        self.cancel_handle.cancel();
        self.shared.voices.lock().clear();
        if let Some(thread) = self.output_thread.lock().take() {
            if thread.join().is_err() {
                error!("Output thread panicked.");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn voice(samples: Vec<f32>) -> Voice {
        let buffer = Arc::new(DecodedBuffer::new(vec![samples], 100));
        Voice {
            total_frames: buffer.frames(),
            source: Source::Buffer(buffer),
            playing: true,
            cursor: 0,
            gains: ChannelGains::UNITY,
        }
    }

    #[test]
    fn test_buffer_voice_renders_and_finishes() {
        let mut voice = voice(vec![0.5; 6]);
        let mut output = vec![0.0f32; 8];

        voice.render(&mut output, 2);
        assert_eq!(voice.cursor, 4);
        assert!(voice.playing);
        assert_eq!(output, vec![0.5; 8]);

        output.fill(0.0);
        voice.render(&mut output, 2);
        assert_eq!(voice.cursor, 6);
        assert!(!voice.playing);
        assert_eq!(&output[..4], &[0.5; 4]);
        assert_eq!(&output[4..], &[0.0; 4]);
    }

    #[test]
    fn test_muted_voice_keeps_time() {
        let mut voice = voice(vec![0.5; 6]);
        voice.gains = ChannelGains::SILENT;
        let mut output = vec![0.0f32; 8];

        voice.render(&mut output, 2);
        assert_eq!(voice.cursor, 4);
        assert_eq!(output, vec![0.0; 8]);
    }

    #[test]
    fn test_seek_clamps_to_end() {
        let mut voice = voice(vec![0.5; 6]);
        voice.seek(100, 100);
        assert_eq!(voice.cursor, 6);
    }
}
