//! Per-instrument aggregation storage shared by every reader
pub(crate) mod observable;
pub(crate) mod sync;

pub use observable::Observer;
pub(crate) use observable::{erase_callback, Callback, ObservableStorage};
pub(crate) use sync::SyncStorage;

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::aggregation::{Aggregate, Aggregation, HistogramState};
use crate::attributes::AttributeSet;
use crate::collection::{CollectionHandle, HandleSet};
use crate::data::{HistogramDataPoint, MetricPoints, NumberDataPoint, Temporality};
use crate::instrument::InstrumentDescriptor;

/// Default maximum number of attribute sets kept per instrument
pub const DEFAULT_CARDINALITY_LIMIT: usize = 2000;

/// Insertion order assigned to the overflow point, which always sorts last
pub(crate) const OVERFLOW_SEQ: u64 = u64::MAX;

/// The policy one reader collects under, resolved for one instrument
#[derive(Clone, Copy, Debug)]
pub(crate) struct ReaderContext {
    pub handle: CollectionHandle,
    pub temporality: Temporality,
    pub cardinality_limit: usize,
}

/// Storage for one instrument
pub(crate) trait MetricStorage: Send + Sync {
    fn descriptor(&self) -> &InstrumentDescriptor;

    /// Build the view for one reader. `live` holds every reader that has not
    /// been retired. Returns `None` when there is nothing to report.
    fn collect(
        &self,
        reader: &ReaderContext,
        live: &HandleSet,
        now: DateTime<Utc>,
    ) -> Option<MetricPoints>;
}

/// Aggregates keyed by attribute set, remembering insertion order
pub(crate) type Entries = HashMap<AttributeSet, (u64, Aggregate)>;

pub(crate) fn merge_entries(into: &mut Entries, from: &Entries) {
    for (attributes, (seq, aggregate)) in from {
        match into.get_mut(attributes) {
            Some((_, existing)) => existing.merge(aggregate),
            None => {
                into.insert(attributes.clone(), (*seq, aggregate.clone()));
            }
        }
    }
}

/// Order entries by insertion and fold everything past `limit` real
/// attribute sets into the overflow point.
pub(crate) fn fold_cardinality(entries: Entries, limit: usize) -> Vec<(AttributeSet, Aggregate)> {
    let mut sorted: Vec<(u64, AttributeSet, Aggregate)> = entries
        .into_iter()
        .map(|(attributes, (seq, aggregate))| (seq, attributes, aggregate))
        .collect();
    sorted.sort_by_key(|(seq, _, _)| *seq);

    let (mut kept, mut overflow): (Vec<(AttributeSet, Aggregate)>, Option<Aggregate>) =
        (Vec::with_capacity(sorted.len()), None);
    let mut real = 0;

    for (_, attributes, aggregate) in sorted {
        if attributes.is_overflow() || real >= limit {
            match overflow.as_mut() {
                Some(existing) => existing.merge(&aggregate),
                None => overflow = Some(aggregate),
            }
        } else {
            real += 1;
            kept.push((attributes, aggregate));
        }
    }

    if let Some(aggregate) = overflow {
        kept.push((AttributeSet::overflow(), aggregate));
    }
    kept
}

/// Turn folded aggregates into reportable points
pub(crate) fn build_points(
    aggregation: &Aggregation,
    entries: Vec<(AttributeSet, Aggregate)>,
    temporality: Temporality,
    start_time: DateTime<Utc>,
    time: DateTime<Utc>,
) -> Option<MetricPoints> {
    if entries.is_empty() {
        return None;
    }

    let number_points = |entries: Vec<(AttributeSet, Aggregate)>| -> Vec<NumberDataPoint> {
        entries
            .into_iter()
            .filter_map(|(attributes, aggregate)| {
                aggregate.number().map(|value| NumberDataPoint {
                    attributes,
                    start_time,
                    time,
                    value,
                })
            })
            .collect()
    };

    let points = match aggregation {
        Aggregation::Sum { monotonic } => MetricPoints::Sum {
            points: number_points(entries),
            temporality,
            is_monotonic: *monotonic,
        },
        Aggregation::LastValue => MetricPoints::Gauge {
            points: number_points(entries),
        },
        Aggregation::Histogram { bounds } => MetricPoints::Histogram {
            points: entries
                .into_iter()
                .filter_map(|(attributes, aggregate)| match aggregate {
                    Aggregate::Histogram(state) => {
                        Some(histogram_point(attributes, state, bounds, start_time, time))
                    }
                    _ => None,
                })
                .collect(),
            temporality,
        },
    };

    Some(points)
}

fn histogram_point(
    attributes: AttributeSet,
    state: HistogramState,
    bounds: &[f64],
    start_time: DateTime<Utc>,
    time: DateTime<Utc>,
) -> HistogramDataPoint {
    HistogramDataPoint {
        attributes,
        start_time,
        time,
        count: state.count,
        sum: state.sum,
        min: state.min(),
        max: state.max(),
        bounds: bounds.to_vec(),
        bucket_counts: state.bucket_counts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::KeyValue;
    use crate::instrument::NumberValue;

    fn set(v: &str) -> AttributeSet {
        AttributeSet::new(&[KeyValue::new("k", v)])
    }

    #[test]
    fn test_fold_keeps_earliest_attribute_sets() {
        let mut entries = Entries::new();
        for (seq, key) in ["a", "b", "c", "d"].iter().enumerate() {
            entries.insert(set(key), (seq as u64, Aggregate::Sum(NumberValue::I64(seq as i64 + 1))));
        }

        let folded = fold_cardinality(entries, 2);

        assert_eq!(folded.len(), 3);
        assert_eq!(folded[0], (set("a"), Aggregate::Sum(NumberValue::I64(1))));
        assert_eq!(folded[1], (set("b"), Aggregate::Sum(NumberValue::I64(2))));
        assert_eq!(folded[2], (AttributeSet::overflow(), Aggregate::Sum(NumberValue::I64(7))));
    }

    #[test]
    fn test_fold_merges_existing_overflow() {
        let mut entries = Entries::new();
        entries.insert(set("a"), (0, Aggregate::Sum(NumberValue::I64(1))));
        entries.insert(set("b"), (1, Aggregate::Sum(NumberValue::I64(2))));
        entries.insert(AttributeSet::overflow(), (OVERFLOW_SEQ, Aggregate::Sum(NumberValue::I64(10))));

        let folded = fold_cardinality(entries, 1);

        assert_eq!(folded.len(), 2);
        assert_eq!(folded[1], (AttributeSet::overflow(), Aggregate::Sum(NumberValue::I64(12))));
    }

    #[test]
    fn test_build_points_empty_is_none() {
        let now = Utc::now();
        let points = build_points(
            &Aggregation::Sum { monotonic: true },
            Vec::new(),
            Temporality::Delta,
            now,
            now,
        );
        assert!(points.is_none());
    }
}
