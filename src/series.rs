//! Entity-partitioned time series held in memory.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesPoint {
    pub entity_id: String,
    pub order_key: i64,
    pub values: BTreeMap<String, Option<f64>>,
}

impl TimeSeriesPoint {
    pub fn new(entity_id: impl Into<String>, order_key: i64) -> Self {
        Self {
            entity_id: entity_id.into(),
            order_key,
            values: BTreeMap::new(),
        }
    }

    pub fn with_value(mut self, metric: impl Into<String>, value: Option<f64>) -> Self {
        self.values.insert(metric.into(), value);
        self
    }

    /// `None` when the metric is absent, `Some(None)` when it is present but null.
    pub fn value(&self, metric: &str) -> Option<Option<f64>> {
        self.values.get(metric).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    pub entity_id: String,
    pub points: Vec<TimeSeriesPoint>,
}

/// Points grouped by entity, each partition sorted by `order_key`.
///
/// Partitions keep the order in which their entity first arrived. Within a
/// partition equal order keys keep arrival order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderedPartitionedSeries {
    partition_key: String,
    order_key: String,
    partitions: Vec<Partition>,
}

impl OrderedPartitionedSeries {
    pub fn from_points(
        partition_key: impl Into<String>,
        order_key: impl Into<String>,
        points: impl IntoIterator<Item = TimeSeriesPoint>,
    ) -> Self {
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut partitions: Vec<Partition> = Vec::new();

        for point in points {
            match index.get(&point.entity_id) {
                Some(&slot) => partitions[slot].points.push(point),
                None => {
                    index.insert(point.entity_id.clone(), partitions.len());
                    partitions.push(Partition {
                        entity_id: point.entity_id.clone(),
                        points: vec![point],
                    });
                }
            }
        }

        for partition in &mut partitions {
            // sort_by_key is stable, ties keep arrival order
            partition.points.sort_by_key(|point| point.order_key);
        }

        Self {
            partition_key: partition_key.into(),
            order_key: order_key.into(),
            partitions,
        }
    }

    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    pub fn order_key(&self) -> &str {
        &self.order_key
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn partition(&self, entity_id: &str) -> Option<&Partition> {
        self.partitions
            .iter()
            .find(|partition| partition.entity_id == entity_id)
    }

    pub fn len(&self) -> usize {
        self.partitions
            .iter()
            .map(|partition| partition.points.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn points(&self) -> impl Iterator<Item = &TimeSeriesPoint> {
        self.partitions
            .iter()
            .flat_map(|partition| partition.points.iter())
    }

    /// Values of one metric for an entity in chronological order.
    pub fn metric_values(&self, entity_id: &str, metric: &str) -> Vec<Option<f64>> {
        self.partition(entity_id)
            .map(|partition| {
                partition
                    .points
                    .iter()
                    .map(|point| point.value(metric).flatten())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn from_sorted_partitions(
        partition_key: String,
        order_key: String,
        partitions: Vec<Partition>,
    ) -> Self {
        Self {
            partition_key,
            order_key,
            partitions,
        }
    }
}
