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
//! Zoom and pan state for the timeline, and the time <-> pixel mapping derived from it.
//!
//! The pan offset is stored in pixels at zoom 1 and is never positive: panning right (towards
//! later time) makes it more negative.
use std::time::Duration;

use crate::analysis::{DriftPoint, Severity};
use crate::config::EngineSettings;

/// A drift point positioned on the canvas.
#[derive(Clone, Debug, PartialEq)]
pub struct Marker {
    pub x: f64,
    pub time: f64,
    pub severity: Severity,
    pub reliable: bool,
}

#[derive(Clone, Debug)]
pub struct ViewportModel {
    zoom_level: f64,
    pan_offset: f64,
    view_window: f64,
    default_view_window: f64,
    canvas_width: f64,
    min_zoom: f64,
    max_zoom: f64,
    zoom_step: f64,
}

impl ViewportModel {
    pub fn new(settings: &EngineSettings, canvas_width: f64) -> ViewportModel {
        let default_view_window = settings.default_view_window.as_secs_f64();
        ViewportModel {
            zoom_level: 1.0,
            pan_offset: 0.0,
            view_window: default_view_window,
            default_view_window,
            canvas_width: canvas_width.max(0.0),
            min_zoom: settings.min_zoom,
            max_zoom: settings.max_zoom,
            zoom_step: settings.zoom_step,
        }
    }

    pub fn zoom_level(&self) -> f64 {
        self.zoom_level
    }

    pub fn pan_offset(&self) -> f64 {
        self.pan_offset
    }

    pub fn view_window(&self) -> f64 {
        self.view_window
    }

    pub fn canvas_width(&self) -> f64 {
        self.canvas_width
    }

    pub fn set_canvas_width(&mut self, canvas_width: f64) {
        self.canvas_width = canvas_width.max(0.0);
        self.clamp_pan();
    }

    /// Re-derives the window from media durations. With no (non-zero) durations the configured
    /// default is used.
    pub fn set_durations(&mut self, durations: impl IntoIterator<Item = Duration>) {
        let longest = durations
            .into_iter()
            .map(|duration| duration.as_secs_f64())
            .fold(0.0, f64::max);
        self.view_window = if longest > 0.0 {
            longest
        } else {
            self.default_view_window
        };
        self.clamp_pan();
    }

    /// Canvas pixels per second at zoom 1.
    fn base_pixels_per_second(&self) -> f64 {
        if self.view_window > 0.0 {
            self.canvas_width / self.view_window
        } else {
            0.0
        }
    }

    pub fn visible_duration(&self) -> f64 {
        self.view_window / self.zoom_level
    }

    pub fn visible_start(&self) -> f64 {
        let pps = self.base_pixels_per_second();
        let start = if pps > 0.0 { -self.pan_offset / pps } else { 0.0 };
        let latest = (self.view_window - self.visible_duration()).max(0.0);
        start.clamp(0.0, latest)
    }

    pub fn visible_end(&self) -> f64 {
        self.visible_start() + self.visible_duration()
    }

    /// Maps a time to a canvas x position. The result may fall outside the canvas.
    pub fn time_to_pixel(&self, time: f64) -> f64 {
        let visible_duration = self.visible_duration();
        if visible_duration <= 0.0 {
            return 0.0;
        }
        (time - self.visible_start()) * (self.canvas_width / visible_duration)
    }

    pub fn pixel_to_time(&self, x: f64) -> f64 {
        if self.canvas_width <= 0.0 {
            return self.visible_start();
        }
        self.visible_start() + x * (self.visible_duration() / self.canvas_width)
    }

    /// Whether a time lands on the canvas.
    pub fn is_visible(&self, time: f64) -> bool {
        let x = self.time_to_pixel(time);
        (0.0..=self.canvas_width).contains(&x)
    }

    pub fn zoom_in(&mut self) {
        let target = self.zoom_level * (1.0 + self.zoom_step);
        self.zoom_to_point(self.visible_center(), target);
    }

    pub fn zoom_out(&mut self) {
        let target = self.zoom_level / (1.0 + self.zoom_step);
        self.zoom_to_point(self.visible_center(), target);
    }

    fn visible_center(&self) -> f64 {
        self.visible_start() + self.visible_duration() / 2.0
    }

    /// Zooms while keeping `time` in the middle of the canvas, as far as the window allows.
    pub fn zoom_to_point(&mut self, time: f64, target_zoom: f64) {
        self.zoom_level = if target_zoom.is_finite() {
            target_zoom.clamp(self.min_zoom, self.max_zoom)
        } else {
            1.0
        };
        let start = time - self.visible_duration() / 2.0;
        self.pan_offset = -start * self.base_pixels_per_second();
        self.clamp_pan();
    }

    /// Resets zoom and pan against the current window.
    pub fn zoom_to_fit(&mut self) {
        self.zoom_level = 1.0;
        self.pan_offset = 0.0;
    }

    /// Shows earlier time by one zoom step's worth of the visible window.
    pub fn pan_left(&mut self) {
        self.pan_offset += self.pan_step();
        self.clamp_pan();
    }

    /// Shows later time by one zoom step's worth of the visible window.
    pub fn pan_right(&mut self) {
        self.pan_offset -= self.pan_step();
        self.clamp_pan();
    }

    fn pan_step(&self) -> f64 {
        self.canvas_width * self.zoom_step / self.zoom_level
    }

    fn clamp_pan(&mut self) {
        let latest = (self.view_window - self.visible_duration()).max(0.0);
        let min_pan = -latest * self.base_pixels_per_second();
        self.pan_offset = self.pan_offset.clamp(min_pan, 0.0);
    }

    /// Positions the visible drift points. Severity is classified on every call.
    pub fn markers(&self, points: &[DriftPoint]) -> Vec<Marker> {
        points
            .iter()
            .filter_map(|point| {
                let x = self.time_to_pixel(point.time);
                (0.0..=self.canvas_width).contains(&x).then(|| Marker {
                    x,
                    time: point.time,
                    severity: point.severity(),
                    reliable: point.reliable,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn viewport() -> ViewportModel {
        // 600 pixels over 60 seconds: 10 pixels per second at zoom 1.
        ViewportModel::new(&EngineSettings::default(), 600.0)
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_zoom_to_fit_resets_history() {
        let mut viewport = viewport();
        viewport.zoom_in();
        viewport.zoom_in();
        viewport.zoom_in();
        viewport.pan_left();
        viewport.pan_left();
        assert!(viewport.zoom_level() > 1.3);

        viewport.zoom_to_fit();
        assert_eq!(viewport.zoom_level(), 1.0);
        assert_eq!(viewport.pan_offset(), 0.0);
        assert_eq!(viewport.visible_start(), 0.0);
        assert!(close(viewport.visible_duration(), 60.0));
    }

    #[test]
    fn test_zoom_to_point_keeps_time_centered() {
        let mut viewport = viewport();
        viewport.zoom_to_point(20.0, 4.0);
        assert_eq!(viewport.zoom_level(), 4.0);
        assert!(close(viewport.visible_duration(), 15.0));
        assert!(close(viewport.visible_start(), 12.5));
        assert!(close(viewport.time_to_pixel(20.0), 300.0));
        assert!(viewport.pan_offset() < 0.0);
    }

    #[test]
    fn test_zoom_to_point_near_edges_is_clamped() {
        let mut viewport = viewport();
        viewport.zoom_to_point(1.0, 4.0);
        assert_eq!(viewport.visible_start(), 0.0);

        viewport.zoom_to_point(59.0, 4.0);
        assert!(close(viewport.visible_start(), 45.0));
        assert!(close(viewport.visible_end(), 60.0));
    }

    #[test]
    fn test_zoom_limits() {
        let mut viewport = viewport();
        viewport.zoom_to_point(30.0, 1000.0);
        assert_eq!(viewport.zoom_level(), 20.0);
        viewport.zoom_to_point(30.0, 0.0);
        assert_eq!(viewport.zoom_level(), 0.1);
        // Zoomed out past the window: nothing to pan.
        assert_eq!(viewport.visible_start(), 0.0);
    }

    #[test]
    fn test_pan_moves_by_visible_fraction() {
        let mut viewport = viewport();
        viewport.zoom_to_point(30.0, 2.0);
        assert!(close(viewport.visible_start(), 15.0));

        viewport.pan_right();
        // 10% of the 30 second visible window.
        assert!(close(viewport.visible_start(), 18.0));
        viewport.pan_left();
        viewport.pan_left();
        assert!(close(viewport.visible_start(), 12.0));

        for _ in 0..20 {
            viewport.pan_left();
        }
        assert_eq!(viewport.visible_start(), 0.0);
        assert_eq!(viewport.pan_offset(), 0.0);
    }

    #[test]
    fn test_time_pixel_mapping() {
        let mut viewport = viewport();
        assert!(close(viewport.time_to_pixel(30.0), 300.0));
        assert!(close(viewport.pixel_to_time(450.0), 45.0));

        viewport.zoom_to_point(30.0, 2.0);
        assert!(close(viewport.time_to_pixel(15.0), 0.0));
        assert!(close(viewport.time_to_pixel(45.0), 600.0));
        assert!(!viewport.is_visible(10.0));
        assert!(viewport.is_visible(40.0));
    }

    #[test]
    fn test_window_from_durations() {
        let mut viewport = viewport();
        viewport.set_durations([Duration::from_secs(90), Duration::from_secs(120)]);
        assert_eq!(viewport.view_window(), 120.0);
        viewport.set_durations(Vec::new());
        assert_eq!(viewport.view_window(), 60.0);
    }

    #[test]
    fn test_markers_follow_viewport() {
        let points = vec![
            DriftPoint {
                time: 5.0,
                offset_seconds: 0.01,
                confidence: None,
                reliable: true,
            },
            DriftPoint {
                time: 40.0,
                offset_seconds: 0.2,
                confidence: Some(0.5),
                reliable: false,
            },
        ];
        let mut viewport = viewport();
        let markers = viewport.markers(&points);
        assert_eq!(markers.len(), 2);
        assert_eq!(markers[0].severity, Severity::InSync);
        assert!(close(markers[1].x, 400.0));
        assert_eq!(markers[1].severity, Severity::Issue);

        viewport.zoom_to_point(40.0, 4.0);
        let markers = viewport.markers(&points);
        assert_eq!(markers.len(), 1);
        assert!(close(markers[0].x, 300.0));
    }
}
