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
//! Offset analysis results as produced by the external analysis service. Read-only here.
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::fs;
use std::path::Path;

use serde::Deserialize;

/// Below this the tracks are considered in sync.
const IN_SYNC_BELOW_MICROS: u64 = 40_000;
const MINOR_UP_TO_MICROS: u64 = 100_000;
const ISSUE_UP_TO_MICROS: u64 = 1_000_000;

/// An offset measured for one channel role.
#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct ChannelOffset {
    pub offset_seconds: f64,
    pub confidence: Option<f64>,
    pub method: Option<String>,
}

/// One segment of the drift timeline.
#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct TimelineSegment {
    pub start_time: f64,
    pub end_time: f64,
    pub offset_seconds: f64,
    pub confidence: Option<f64>,
    pub reliable: Option<bool>,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct AnalysisResult {
    pub offset_seconds: f64,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub per_channel_offsets: BTreeMap<String, ChannelOffset>,
    #[serde(default)]
    pub timeline: Vec<TimelineSegment>,
}

impl AnalysisResult {
    pub fn from_json(json: &str) -> Result<AnalysisResult, Box<dyn Error>> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: &Path) -> Result<AnalysisResult, Box<dyn Error>> {
        match serde_json::from_str(&fs::read_to_string(path)?) {
            Ok(result) => Ok(result),
            Err(e) => Err(format!("error parsing file {}: {}", path.display(), e).into()),
        }
    }

    /// The offset to apply to a track. A per-channel entry wins over the overall offset.
    pub fn offset_for(&self, channel_role: Option<&str>) -> f64 {
        channel_role
            .and_then(|role| self.per_channel_offsets.get(role))
            .map(|channel| channel.offset_seconds)
            .unwrap_or(self.offset_seconds)
    }

    /// The drift timeline as points at the start of each segment.
    pub fn drift_points(&self) -> Vec<DriftPoint> {
        self.timeline
            .iter()
            .map(|segment| DriftPoint {
                time: segment.start_time,
                offset_seconds: segment.offset_seconds,
                confidence: segment.confidence,
                reliable: segment.reliable.unwrap_or(true),
            })
            .collect()
    }
}

/// A measured offset at a point in the reference timeline.
#[derive(Clone, Debug, PartialEq)]
pub struct DriftPoint {
    pub time: f64,
    pub offset_seconds: f64,
    pub confidence: Option<f64>,
    pub reliable: bool,
}

impl DriftPoint {
    /// Always derived from the offset, never stored.
    pub fn severity(&self) -> Severity {
        Severity::classify(self.offset_seconds)
    }
}

/// How bad an offset is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    InSync,
    Minor,
    Issue,
    Major,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::InSync,
        Severity::Minor,
        Severity::Issue,
        Severity::Major,
    ];

    /// Classifies by magnitude. Compared on whole microseconds so that decimal inputs like 0.1
    /// land on the band edge they were written as.
    pub fn classify(offset_seconds: f64) -> Severity {
        if !offset_seconds.is_finite() {
            return Severity::Major;
        }
        let micros = (offset_seconds.abs() * 1e6).round() as u64;
        if micros < IN_SYNC_BELOW_MICROS {
            Severity::InSync
        } else if micros <= MINOR_UP_TO_MICROS {
            Severity::Minor
        } else if micros <= ISSUE_UP_TO_MICROS {
            Severity::Issue
        } else {
            Severity::Major
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::InSync => f.write_str("in_sync"),
            Severity::Minor => f.write_str("minor"),
            Severity::Issue => f.write_str("issue"),
            Severity::Major => f.write_str("major"),
        }
    }
}

/// Number of points per severity band, in band order.
pub fn severity_counts(points: &[DriftPoint]) -> [(Severity, usize); 4] {
    Severity::ALL.map(|severity| {
        let count = points
            .iter()
            .filter(|point| point.severity() == severity)
            .count();
        (severity, count)
    })
}

#[cfg(test)]
mod test {
    use super::*;

    const RESULT: &str = r#"{
        "offset_seconds": 2.5,
        "confidence": 0.93,
        "per_channel_offsets": {
            "dialog": { "offset_seconds": 2.48, "confidence": 0.97, "method": "xcorr" },
            "music": { "offset_seconds": 2.52 }
        },
        "timeline": [
            { "start_time": 0.0, "end_time": 30.0, "offset_seconds": 0.02, "confidence": 0.9 },
            { "start_time": 30.0, "end_time": 60.0, "offset_seconds": -0.07, "reliable": false },
            { "start_time": 60.0, "end_time": 90.0, "offset_seconds": 0.5 },
            { "start_time": 90.0, "end_time": 120.0, "offset_seconds": 1.2 }
        ]
    }"#;

    #[test]
    fn test_severity_boundaries() {
        assert_eq!(Severity::classify(0.0), Severity::InSync);
        assert_eq!(Severity::classify(0.039), Severity::InSync);
        assert_eq!(Severity::classify(0.040), Severity::Minor);
        assert_eq!(Severity::classify(0.041), Severity::Minor);
        assert_eq!(Severity::classify(0.100), Severity::Minor);
        assert_eq!(Severity::classify(0.101), Severity::Issue);
        assert_eq!(Severity::classify(1.000), Severity::Issue);
        assert_eq!(Severity::classify(1.001), Severity::Major);
        assert_eq!(Severity::classify(-0.101), Severity::Issue);
        assert_eq!(Severity::classify(f64::NAN), Severity::Major);
    }

    #[test]
    fn test_parse_result() -> Result<(), Box<dyn Error>> {
        let result = AnalysisResult::from_json(RESULT)?;
        assert_eq!(result.offset_seconds, 2.5);
        assert_eq!(result.offset_for(Some("dialog")), 2.48);
        assert_eq!(result.offset_for(Some("effects")), 2.5);
        assert_eq!(result.offset_for(None), 2.5);
        assert_eq!(
            result.per_channel_offsets["dialog"].method.as_deref(),
            Some("xcorr")
        );
        Ok(())
    }

    #[test]
    fn test_minimal_result() -> Result<(), Box<dyn Error>> {
        let result = AnalysisResult::from_json(r#"{ "offset_seconds": -0.25 }"#)?;
        assert_eq!(result.confidence, 0.0);
        assert!(result.drift_points().is_empty());
        Ok(())
    }

    #[test]
    fn test_drift_points_recomputed() -> Result<(), Box<dyn Error>> {
        let mut result = AnalysisResult::from_json(RESULT)?;
        let points = result.drift_points();
        assert_eq!(points.len(), 4);
        assert_eq!(points[1].time, 30.0);
        assert!(points[0].reliable);
        assert!(!points[1].reliable);
        assert_eq!(
            points.iter().map(DriftPoint::severity).collect::<Vec<_>>(),
            vec![
                Severity::InSync,
                Severity::Minor,
                Severity::Issue,
                Severity::Major
            ]
        );

        result.timeline[0].offset_seconds = 2.0;
        assert_eq!(result.drift_points()[0].severity(), Severity::Major);

        let counts = severity_counts(&result.drift_points());
        assert_eq!(counts[0], (Severity::InSync, 0));
        assert_eq!(counts[3], (Severity::Major, 2));
        Ok(())
    }
}
