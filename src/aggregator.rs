//! Merging of same-series datums into statistic sets
use chrono::Utc;
use log::trace;
use std::collections::HashMap;

use crate::datum::{Datum, MetricValue, StatisticAccumulator};

/// Identity of a series: name, unit and order-independent dimensions
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeriesKey {
    pub metric_name: String,
    pub unit: String,
    pub dimensions: String,
}

impl SeriesKey {
    pub fn of(datum: &Datum) -> Self {
        Self {
            metric_name: datum.metric_name.clone(),
            unit: datum.unit.clone(),
            dimensions: datum.dimensions_key(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MetricAggregator;

impl MetricAggregator {
    pub fn new() -> Self {
        Self
    }

    /// Merge datums sharing a series key.
    ///
    /// Groups are emitted in order of first appearance. A group of one is
    /// returned untouched; larger groups become a single statistic set.
    pub fn aggregate(&self, datums: Vec<Datum>) -> Vec<Datum> {
        let mut index: HashMap<SeriesKey, usize> = HashMap::new();
        let mut groups: Vec<Vec<Datum>> = Vec::new();

        for datum in datums {
            let key = SeriesKey::of(&datum);
            match index.get(&key) {
                Some(&i) => groups[i].push(datum),
                None => {
                    index.insert(key, groups.len());
                    groups.push(vec![datum]);
                }
            }
        }

        groups.into_iter().filter_map(merge_group).collect()
    }
}

fn merge_group(mut items: Vec<Datum>) -> Option<Datum> {
    if items.len() <= 1 {
        return items.pop();
    }

    let mut acc = StatisticAccumulator::default();
    for item in &items {
        acc.add(&item.value);
    }

    trace!("Merged {} datums for '{}'", items.len(), items[0].metric_name);

    let mut merged = items.swap_remove(0);
    merged.value = MetricValue::Statistics(acc.finish());
    merged.timestamp = Utc::now();
    Some(merged)
}
