//! Immutable metric data handed from a collection cycle to a reader
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::attributes::AttributeSet;
use crate::instrument::{InstrumentationScope, NumberValue};
use crate::resource::Resource;

/// Whether reported values are running totals or per-interval increments
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Temporality {
    #[default]
    Cumulative,
    Delta,
}

/// A sum or gauge value for one attribute set
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NumberDataPoint {
    pub attributes: AttributeSet,
    pub start_time: DateTime<Utc>,
    pub time: DateTime<Utc>,
    pub value: NumberValue,
}

/// An explicit-bucket histogram for one attribute set
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HistogramDataPoint {
    pub attributes: AttributeSet,
    pub start_time: DateTime<Utc>,
    pub time: DateTime<Utc>,
    pub count: u64,
    pub sum: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub bounds: Vec<f64>,
    pub bucket_counts: Vec<u64>,
}

/// The points of one instrument
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetricPoints {
    Sum {
        points: Vec<NumberDataPoint>,
        temporality: Temporality,
        is_monotonic: bool,
    },
    Gauge {
        points: Vec<NumberDataPoint>,
    },
    Histogram {
        points: Vec<HistogramDataPoint>,
        temporality: Temporality,
    },
}

impl MetricPoints {
    pub fn len(&self) -> usize {
        match self {
            MetricPoints::Sum { points, .. } | MetricPoints::Gauge { points } => points.len(),
            MetricPoints::Histogram { points, .. } => points.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number points of a sum or gauge
    pub fn number_points(&self) -> &[NumberDataPoint] {
        match self {
            MetricPoints::Sum { points, .. } | MetricPoints::Gauge { points } => points,
            MetricPoints::Histogram { .. } => &[],
        }
    }

    pub fn histogram_points(&self) -> &[HistogramDataPoint] {
        match self {
            MetricPoints::Histogram { points, .. } => points,
            _ => &[],
        }
    }

    pub fn temporality(&self) -> Option<Temporality> {
        match self {
            MetricPoints::Sum { temporality, .. } | MetricPoints::Histogram { temporality, .. } => {
                Some(*temporality)
            }
            MetricPoints::Gauge { .. } => None,
        }
    }
}

/// Everything one reader collected for one instrument in one cycle
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MetricData {
    pub resource: Arc<Resource>,
    pub scope: InstrumentationScope,
    pub name: String,
    pub description: String,
    pub unit: String,
    pub data: MetricPoints,
}

impl MetricData {
    /// Find the number point recorded for an attribute set
    pub fn number_point(&self, attributes: &AttributeSet) -> Option<&NumberDataPoint> {
        self.data
            .number_points()
            .iter()
            .find(|p| &p.attributes == attributes)
    }

    pub fn histogram_point(&self, attributes: &AttributeSet) -> Option<&HistogramDataPoint> {
        self.data
            .histogram_points()
            .iter()
            .find(|p| &p.attributes == attributes)
    }
}
