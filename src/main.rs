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
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use clap::{crate_version, Parser, Subcommand};
use tokio::sync::oneshot;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use dubsync::analysis::{self, AnalysisResult};
use dubsync::audio;
use dubsync::config::Session;
use dubsync::events::SessionEvent;
use dubsync::sources::AudioSourceManager;
use dubsync::track::TrackRole;
use dubsync::transport::TransportState;
use dubsync::{MonitorMode, PlaybackSession};

#[derive(Parser)]
#[clap(
    author = "Michael Wilson",
    version = crate_version!(),
    about = "A/B playback of a master track against its dubs."
)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Lists the available audio output devices.
    Devices {},
    /// Prints the drift timeline of an analysis result with severity bands.
    Timeline {
        /// The path to the analysis result JSON.
        analysis_path: String,
    },
    /// Plays a session through the configured device.
    Preview {
        /// The path to the session YAML.
        session_path: String,
        /// Play with the correction applied.
        #[arg(short, long)]
        after: bool,
        /// Where to start, in seconds of the reference timeline.
        #[arg(short, long, default_value_t = 0.0)]
        start: f64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Devices {} => {
            let devices = audio::list_devices()?;

            if devices.is_empty() {
                println!("No devices found.");
                return Ok(());
            }

            println!("Devices:");
            for device in devices {
                println!("- {}", device);
            }
        }
        Commands::Timeline { analysis_path } => {
            let result = AnalysisResult::from_file(&PathBuf::from(&analysis_path))?;
            println!(
                "Offset: {:+.3}s (confidence {:.2})",
                result.offset_seconds, result.confidence
            );
            for (role, channel) in &result.per_channel_offsets {
                println!("- {}: {:+.3}s", role, channel.offset_seconds);
            }

            let points = result.drift_points();
            if points.is_empty() {
                println!("No drift timeline.");
                return Ok(());
            }

            println!("Timeline (points: {}):", points.len());
            for point in &points {
                println!(
                    "- {:>9.3}s {:+.3}s {}{}",
                    point.time,
                    point.offset_seconds,
                    point.severity(),
                    if point.reliable { "" } else { " (unreliable)" }
                );
            }
            for (severity, count) in analysis::severity_counts(&points) {
                println!("{}: {}", severity, count);
            }
        }
        Commands::Preview {
            session_path,
            after,
            start,
        } => preview(PathBuf::from(session_path), after, start).await?,
    }

    Ok(())
}

/// Loads a session, plays it and logs time updates until playback ends or Ctrl-C.
async fn preview(session_path: PathBuf, after: bool, start: f64) -> Result<(), Box<dyn Error>> {
    let session = Session::deserialize(&session_path)?;
    let engine = session.engine();
    let backend = audio::get_backend(&engine)?;
    info!(device = %backend, "Using device.");

    let playback = PlaybackSession::new(
        backend,
        Arc::new(AudioSourceManager::default()),
        engine.settings()?,
        MonitorMode::Thread,
    );

    let requested = session.tracks().len();
    let loaded = playback.load_many(session.load_requests()).await;
    info!(loaded, requested, "Loaded tracks.");

    let analysis = match session.analysis() {
        Some(path) => Some(AnalysisResult::from_file(&path)?),
        None => None,
    };
    for track in session.tracks() {
        let id = track.id();
        if playback.track(&id).is_none() {
            continue;
        }
        playback.set_channel_role(&id, track.channel_role().map(str::to_string))?;
        playback.set_volume(&id, track.volume())?;
        playback.set_pan(&id, track.pan())?;
        playback.set_muted(&id, track.muted())?;
        playback.set_solo(&id, track.solo())?;
        match (track.explicit_offset(), &analysis) {
            (Some(offset), _) => playback.set_offset(&id, offset)?,
            (None, Some(analysis)) if track.role() == TrackRole::Component => {
                playback.apply_analysis(&id, analysis)?;
            }
            _ => {}
        }
    }

    let events = playback.subscribe();
    let (done_tx, done_rx) = oneshot::channel::<()>();
    thread::spawn(move || {
        let mut last_second = None;
        for event in events.iter() {
            match event {
                SessionEvent::TimeUpdate(update) => {
                    let second = update.reference_time.as_secs();
                    if last_second != Some(second) {
                        last_second = Some(second);
                        info!(
                            reference = ?update.reference_time,
                            duration = ?update.duration,
                            corrected = update.corrected,
                            "Time."
                        );
                    }
                }
                SessionEvent::PlaybackEnded => break,
                // Nothing pauses a preview except the monitor giving up.
                SessionEvent::StateChanged(TransportState::Paused) => {
                    warn!("No track is playing anymore.");
                    break;
                }
                _ => {}
            }
        }
        let _ = done_tx.send(());
    });

    let report = playback.play(start, after)?;
    for (id, err) in &report.failed {
        warn!(track = %id, err = %err, "Track didn't start.");
    }

    tokio::select! {
        _ = done_rx => info!("Playback finished."),
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Interrupted.");
        }
    }
    playback.stop();

    Ok(())
}
