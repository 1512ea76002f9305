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
use std::path::Path;
use std::time::Duration;

use config::{Config, File, FileFormat};
use duration_string::DurationString;
use serde::Deserialize;

use super::error::ConfigError;

const DEFAULT_SYNC_THRESHOLD: Duration = Duration::from_millis(50);
const DEFAULT_SYNC_CHECK_INTERVAL: Duration = Duration::from_millis(200);
const DEFAULT_BUFFER_WAIT: Duration = Duration::from_secs(2);
const DEFAULT_VIEW_WINDOW: Duration = Duration::from_secs(60);
const DEFAULT_END_EPSILON: Duration = Duration::from_millis(10);
const DEFAULT_MIN_ZOOM: f64 = 0.1;
const DEFAULT_MAX_ZOOM: f64 = 20.0;
const DEFAULT_ZOOM_STEP: f64 = 0.1;
const DEFAULT_DEVICE: &str = "mock";

/// A YAML representation of the engine configuration. Every key is optional.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct Engine {
    /// Drift beyond which a track is hard-repositioned.
    sync_threshold: Option<String>,

    /// How often the drift monitor runs.
    sync_check_interval: Option<String>,

    min_zoom: Option<f64>,
    max_zoom: Option<f64>,

    /// Zoom in/out multiplies/divides the zoom level by 1 + zoom_step.
    zoom_step: Option<f64>,

    /// How long play() waits for tracks that aren't buffered yet.
    buffer_wait: Option<String>,

    /// Seconds shown at zoom 1 when no media durations are known.
    default_view_window: Option<String>,

    /// Slack kept before the end of a track when clamping and detecting the end of playback.
    end_epsilon: Option<String>,

    /// The output backend. `mock` (or `mock-*`) selects the simulated device.
    device: Option<String>,
}

/// Validated engine settings with every default applied.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineSettings {
    pub sync_threshold: Duration,
    pub sync_check_interval: Duration,
    pub min_zoom: f64,
    pub max_zoom: f64,
    pub zoom_step: f64,
    pub buffer_wait: Duration,
    pub default_view_window: Duration,
    pub end_epsilon: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            sync_threshold: DEFAULT_SYNC_THRESHOLD,
            sync_check_interval: DEFAULT_SYNC_CHECK_INTERVAL,
            min_zoom: DEFAULT_MIN_ZOOM,
            max_zoom: DEFAULT_MAX_ZOOM,
            zoom_step: DEFAULT_ZOOM_STEP,
            buffer_wait: DEFAULT_BUFFER_WAIT,
            default_view_window: DEFAULT_VIEW_WINDOW,
            end_epsilon: DEFAULT_END_EPSILON,
        }
    }
}

fn parse_duration(value: &Option<String>, default: Duration) -> Result<Duration, ConfigError> {
    match value {
        Some(value) => Ok(DurationString::from_string(value.clone())
            .map_err(|e| ConfigError::Duration(format!("{}: {}", value, e)))?
            .into()),
        None => Ok(default),
    }
}

impl Engine {
    /// Creates an engine configuration that uses the given device and defaults for everything else.
    pub fn new(device: &str) -> Engine {
        Engine {
            device: Some(device.to_string()),
            ..Default::default()
        }
    }

    /// Parses an engine configuration from a YAML file.
    pub fn deserialize(path: &Path) -> Result<Engine, ConfigError> {
        Ok(Config::builder()
            .add_source(File::from(path))
            .build()?
            .try_deserialize::<Engine>()?)
    }

    /// Parses an engine configuration from a YAML string.
    pub fn deserialize_yaml(yaml: &str) -> Result<Engine, ConfigError> {
        Ok(Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?
            .try_deserialize::<Engine>()?)
    }

    pub fn device(&self) -> &str {
        self.device.as_deref().unwrap_or(DEFAULT_DEVICE)
    }

    pub fn sync_threshold(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.sync_threshold, DEFAULT_SYNC_THRESHOLD)
    }

    pub fn sync_check_interval(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.sync_check_interval, DEFAULT_SYNC_CHECK_INTERVAL)
    }

    pub fn buffer_wait(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.buffer_wait, DEFAULT_BUFFER_WAIT)
    }

    pub fn default_view_window(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.default_view_window, DEFAULT_VIEW_WINDOW)
    }

    pub fn end_epsilon(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.end_epsilon, DEFAULT_END_EPSILON)
    }

    pub fn min_zoom(&self) -> f64 {
        self.min_zoom.unwrap_or(DEFAULT_MIN_ZOOM)
    }

    pub fn max_zoom(&self) -> f64 {
        self.max_zoom.unwrap_or(DEFAULT_MAX_ZOOM)
    }

    pub fn zoom_step(&self) -> f64 {
        self.zoom_step.unwrap_or(DEFAULT_ZOOM_STEP)
    }

    /// Resolves every setting and checks that they make sense together.
    pub fn settings(&self) -> Result<EngineSettings, ConfigError> {
        let settings = EngineSettings {
            sync_threshold: self.sync_threshold()?,
            sync_check_interval: self.sync_check_interval()?,
            min_zoom: self.min_zoom(),
            max_zoom: self.max_zoom(),
            zoom_step: self.zoom_step(),
            buffer_wait: self.buffer_wait()?,
            default_view_window: self.default_view_window()?,
            end_epsilon: self.end_epsilon()?,
        };

        if settings.sync_check_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "sync_check_interval must be greater than zero".to_string(),
            ));
        }
        if !(settings.min_zoom > 0.0 && settings.min_zoom <= settings.max_zoom) {
            return Err(ConfigError::Invalid(format!(
                "zoom range {}..{} is empty or not positive",
                settings.min_zoom, settings.max_zoom
            )));
        }
        if !(settings.min_zoom..=settings.max_zoom).contains(&1.0) {
            return Err(ConfigError::Invalid(
                "zoom range must include 1.0".to_string(),
            ));
        }
        if !(settings.zoom_step > 0.0 && settings.zoom_step.is_finite()) {
            return Err(ConfigError::Invalid(format!(
                "zoom_step {} must be positive",
                settings.zoom_step
            )));
        }
        if settings.default_view_window.is_zero() {
            return Err(ConfigError::Invalid(
                "default_view_window must be greater than zero".to_string(),
            ));
        }
        Ok(settings)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults() -> Result<(), ConfigError> {
        let engine = Engine::deserialize_yaml("{}")?;
        assert_eq!(engine.device(), "mock");
        assert_eq!(engine.settings()?, EngineSettings::default());

        let settings = engine.settings()?;
        assert_eq!(settings.sync_threshold, Duration::from_millis(50));
        assert_eq!(settings.sync_check_interval, Duration::from_millis(200));
        assert_eq!(settings.min_zoom, 0.1);
        assert_eq!(settings.max_zoom, 20.0);
        assert_eq!(settings.zoom_step, 0.1);
        Ok(())
    }

    #[test]
    fn test_overrides() -> Result<(), ConfigError> {
        let engine = Engine::deserialize_yaml(
            r#"
            sync_threshold: 25ms
            sync_check_interval: 100ms
            buffer_wait: 500ms
            max_zoom: 8.0
            device: default
            "#,
        )?;
        let settings = engine.settings()?;
        assert_eq!(engine.device(), "default");
        assert_eq!(settings.sync_threshold, Duration::from_millis(25));
        assert_eq!(settings.sync_check_interval, Duration::from_millis(100));
        assert_eq!(settings.buffer_wait, Duration::from_millis(500));
        assert_eq!(settings.max_zoom, 8.0);
        Ok(())
    }

    #[test]
    fn test_invalid_values() -> Result<(), ConfigError> {
        let engine = Engine::deserialize_yaml("sync_threshold: soon")?;
        assert!(matches!(engine.settings(), Err(ConfigError::Duration(_))));

        let engine = Engine::deserialize_yaml("min_zoom: 4.0\nmax_zoom: 2.0")?;
        assert!(matches!(engine.settings(), Err(ConfigError::Invalid(_))));

        let engine = Engine::deserialize_yaml("zoom_step: 0")?;
        assert!(matches!(engine.settings(), Err(ConfigError::Invalid(_))));
        Ok(())
    }
}
