//! Export of the local map as serializable landmark records.

use std::io;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::map::feature::MapFeature;
use crate::map::feature_map::MapEntry;
use crate::map::map_plane::MapPlane;
use crate::map::map_point::MapPoint;
use crate::map::map_point2d::MapPoint2D;
use crate::map::types::{Color, FeatureId, FeatureKind};

/// Geometry of an exported landmark, in world millimeters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LandmarkGeometry {
    Point {
        position: [f64; 3],
        standard_deviation: [f64; 3],
    },
    InverseDepth {
        first_observation: [f64; 3],
        theta: f64,
        phi: f64,
        inverse_depth: f64,
        /// Over `(x, y, z, theta, phi, inverse_depth)`.
        standard_deviation: [f64; 6],
    },
    Plane {
        normal: [f64; 3],
        offset: f64,
        centroid: [f64; 3],
    },
}

/// Persisted form of one local map landmark.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LandmarkRecord {
    pub id: FeatureId,
    pub kind: FeatureKind,
    pub geometry: LandmarkGeometry,
    pub color: Color,
    pub age: i32,
}

/// Borrowed view over any local landmark.
#[derive(Debug, Clone, Copy)]
pub enum Landmark<'a> {
    Point(&'a MapEntry<MapPoint>),
    Point2D(&'a MapEntry<MapPoint2D>),
    Plane(&'a MapEntry<MapPlane>),
}

impl Landmark<'_> {
    pub fn kind(&self) -> FeatureKind {
        match self {
            Landmark::Point(_) => FeatureKind::Point,
            Landmark::Point2D(_) => FeatureKind::Point2D,
            Landmark::Plane(_) => FeatureKind::Plane,
        }
    }

    pub fn id(&self) -> FeatureId {
        match self {
            Landmark::Point(entry) => entry.feature.id(),
            Landmark::Point2D(entry) => entry.feature.id(),
            Landmark::Plane(entry) => entry.feature.id(),
        }
    }

    pub fn to_record(&self) -> LandmarkRecord {
        match self {
            Landmark::Point(entry) => entry.feature.to_record(&entry.counters, entry.color),
            Landmark::Point2D(entry) => entry.feature.to_record(&entry.counters, entry.color),
            Landmark::Plane(entry) => entry.feature.to_record(&entry.counters, entry.color),
        }
    }
}

/// Sink for exported landmarks.
pub trait MapWriter {
    fn write_landmark(&mut self, record: &LandmarkRecord) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Collects records and writes them as a single YAML sequence on flush.
pub struct YamlMapWriter<W: io::Write> {
    output: W,
    records: Vec<LandmarkRecord>,
}

impl<W: io::Write> YamlMapWriter<W> {
    pub fn new(output: W) -> Self {
        Self {
            output,
            records: Vec::new(),
        }
    }

    pub fn into_inner(self) -> W {
        self.output
    }
}

impl<W: io::Write> MapWriter for YamlMapWriter<W> {
    fn write_landmark(&mut self, record: &LandmarkRecord) -> Result<()> {
        self.records.push(record.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let yaml = serde_yaml::to_string(&self.records).context("Failed to serialize landmarks")?;
        self.output
            .write_all(yaml.as_bytes())
            .context("Failed to write landmarks")?;
        self.output.flush().context("Failed to flush landmark output")?;
        self.records.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_writer_outputs_sequence() {
        let mut writer = YamlMapWriter::new(Vec::new());
        writer
            .write_landmark(&LandmarkRecord {
                id: FeatureId::new(4),
                kind: FeatureKind::Plane,
                geometry: LandmarkGeometry::Plane {
                    normal: [0.0, 0.0, -1.0],
                    offset: 2000.0,
                    centroid: [0.0, 0.0, 2000.0],
                },
                color: Color([200, 40, 40]),
                age: 3,
            })
            .unwrap();
        writer
            .write_landmark(&LandmarkRecord {
                id: FeatureId::new(5),
                kind: FeatureKind::Point,
                geometry: LandmarkGeometry::Point {
                    position: [1.0, 2.0, 3.0],
                    standard_deviation: [0.5, 0.5, 2.0],
                },
                color: Color::default(),
                age: 0,
            })
            .unwrap();
        writer.flush().unwrap();

        let text = String::from_utf8(writer.into_inner()).unwrap();
        assert!(text.contains("type: plane"));
        let records: Vec<LandmarkRecord> = serde_yaml::from_str(&text).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, FeatureId::new(4));
        assert_eq!(records[1].kind, FeatureKind::Point);
    }

    #[test]
    fn test_flush_without_records_writes_empty_sequence() {
        let mut writer = YamlMapWriter::new(Vec::new());
        writer.flush().unwrap();
        let records: Vec<LandmarkRecord> = serde_yaml::from_slice(&writer.into_inner()).unwrap();
        assert!(records.is_empty());
    }
}
