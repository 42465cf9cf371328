//! Per-user clustering vector (56-d).
//!
//! Wider than the 64-d model user vector in behaviour terms: it describes
//! *how* a user shops (frequency, time of day, merchant loyalty, funnel
//! shape) rather than what they might click next.

use crate::models::{InteractionEvent, InteractionKind, Item};
use crate::utils::{log_scale, price_bucket, sanitize_unit, PRICE_BUCKETS};
use chrono::Timelike;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::ops::Range;
use uuid::Uuid;

pub const CATEGORY: Range<usize> = 0..16;
pub const PRICE: Range<usize> = 16..21;
pub const FREQUENCY: Range<usize> = 21..26;
pub const TIME: Range<usize> = 26..34;
pub const MERCHANT: Range<usize> = 34..38;
pub const BEHAVIOR: Range<usize> = 38..44;
pub const ORDER_VALUE: Range<usize> = 44..50;
pub const EXPLORATION: Range<usize> = 50..56;

pub const CLUSTER_DIM: usize = 56;
pub const CATEGORY_SLOTS: usize = 16;

/// Value used for every dimension of an unusable vector
pub const NEUTRAL: f64 = 0.5;

/// Upper bounds of the event-count bands (1-2, 3-5, 6-15, 16-40, 41+)
const FREQUENCY_BANDS: [usize; 4] = [2, 5, 15, 40];

/// Category name -> slot for one clustering run.
///
/// The most-interacted categories of the run get the 16 slots; the table is
/// stored with the run so later incremental assignments use the same slots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryTable {
    categories: Vec<String>,
}

impl CategoryTable {
    pub fn from_events(events: &[InteractionEvent], items: &HashMap<Uuid, Item>) -> Self {
        let mut weights: HashMap<&str, f64> = HashMap::new();
        for event in events {
            if let Some(item) = items.get(&event.item_id) {
                *weights.entry(item.category.as_str()).or_insert(0.0) += event.kind.weight();
            }
        }
        let mut ranked: Vec<(&str, f64)> = weights.into_iter().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        Self {
            categories: ranked
                .into_iter()
                .take(CATEGORY_SLOTS)
                .map(|(c, _)| c.to_string())
                .collect(),
        }
    }

    pub fn from_names(categories: Vec<String>) -> Self {
        Self {
            categories: categories.into_iter().take(CATEGORY_SLOTS).collect(),
        }
    }

    pub fn slot(&self, category: &str) -> Option<usize> {
        self.categories.iter().position(|c| c == category)
    }

    pub fn name(&self, slot: usize) -> Option<&str> {
        self.categories.get(slot).map(String::as_str)
    }

    pub fn names(&self) -> &[String] {
        &self.categories
    }
}

pub fn neutral_vector() -> Vec<f64> {
    vec![NEUTRAL; CLUSTER_DIM]
}

/// Replace a vector that has the wrong length or non-finite values
pub fn sanitize(vector: Vec<f64>) -> Vec<f64> {
    if vector.len() != CLUSTER_DIM || vector.iter().any(|v| !v.is_finite()) {
        return neutral_vector();
    }
    vector
}

fn normalize_shares(values: &mut [f64]) {
    let total: f64 = values.iter().sum();
    if total > 0.0 {
        for v in values.iter_mut() {
            *v /= total;
        }
    }
}

fn frequency_band(count: usize) -> usize {
    FREQUENCY_BANDS
        .iter()
        .position(|bound| count <= *bound)
        .unwrap_or(FREQUENCY_BANDS.len())
}

/// Build the clustering vector of one user. `None` for a user without
/// behaviour; such users go to the new-user cluster instead.
///
/// Items missing from `items` only drop out of the item-derived groups.
pub fn build(
    events: &[InteractionEvent],
    items: &HashMap<Uuid, Item>,
    table: &CategoryTable,
) -> Option<Vec<f64>> {
    if events.is_empty() {
        return None;
    }
    let mut v = vec![0.0; CLUSTER_DIM];
    let n = events.len() as f64;

    // category and price shares (weighted)
    let mut category_weights: HashMap<&str, f64> = HashMap::new();
    for event in events {
        let Some(item) = items.get(&event.item_id) else {
            continue;
        };
        let w = event.kind.weight();
        *category_weights.entry(item.category.as_str()).or_insert(0.0) += w;
        if let Some(slot) = table.slot(&item.category) {
            v[CATEGORY.start + slot] += w;
        }
        v[PRICE.start + price_bucket(item.price)] += w;
    }
    normalize_shares(&mut v[CATEGORY]);
    normalize_shares(&mut v[PRICE]);

    v[FREQUENCY.start + frequency_band(events.len())] = 1.0;

    for event in events {
        let slot = (event.occurred_at.hour() / 3) as usize;
        v[TIME.start + slot.min(7)] += 1.0;
    }
    normalize_shares(&mut v[TIME]);

    // merchant loyalty
    let mut merchant_counts: HashMap<&str, usize> = HashMap::new();
    for event in events {
        if let Some(item) = items.get(&event.item_id) {
            *merchant_counts.entry(item.merchant_id.as_str()).or_insert(0) += 1;
        }
    }
    let known = merchant_counts.values().sum::<usize>() as f64;
    if known > 0.0 {
        let distinct = merchant_counts.len() as f64;
        let top = merchant_counts.values().copied().max().unwrap_or(0) as f64;
        let repeat: usize = merchant_counts.values().filter(|c| **c > 1).sum();
        v[MERCHANT.start] = distinct / known;
        v[MERCHANT.start + 1] = top / known;
        v[MERCHANT.start + 2] = log_scale(distinct, 50.0);
        v[MERCHANT.start + 3] = repeat as f64 / known;
    }

    // funnel shape
    let mut kind_counts = [0usize; 5];
    for event in events {
        if let Some(i) = InteractionKind::ALL.iter().position(|k| *k == event.kind) {
            kind_counts[i] += 1;
        }
    }
    for (i, count) in kind_counts.iter().enumerate() {
        v[BEHAVIOR.start + i] = *count as f64 / n;
    }
    let purchases = events
        .iter()
        .filter(|e| e.kind == InteractionKind::Purchase)
        .count() as f64;
    let browses = events
        .iter()
        .filter(|e| matches!(e.kind, InteractionKind::View | InteractionKind::Click))
        .count() as f64;
    v[BEHAVIOR.start + 5] = (purchases / browses.max(1.0)).min(1.0);

    // average purchase price bucket; slot 0 means no priced purchase
    let purchase_prices: Vec<f64> = events
        .iter()
        .filter(|e| e.kind == InteractionKind::Purchase)
        .filter_map(|e| items.get(&e.item_id).map(|i| i.price))
        .collect();
    if purchase_prices.is_empty() {
        v[ORDER_VALUE.start] = 1.0;
    } else {
        let avg = purchase_prices.iter().sum::<f64>() / purchase_prices.len() as f64;
        v[ORDER_VALUE.start + 1 + price_bucket(avg).min(PRICE_BUCKETS - 1)] = 1.0;
    }

    // exploration
    let distinct_items: HashSet<Uuid> = events.iter().map(|e| e.item_id).collect();
    let distinct_categories = category_weights.len() as f64;
    let total_weight: f64 = category_weights.values().sum();
    let entropy = if total_weight > 0.0 && distinct_categories > 1.0 {
        let h: f64 = category_weights
            .values()
            .map(|w| w / total_weight)
            .filter(|p| *p > 0.0)
            .map(|p| -p * p.ln())
            .sum();
        h / distinct_categories.ln()
    } else {
        0.0
    };
    let top_weight = category_weights.values().copied().fold(0.0, f64::max);
    v[EXPLORATION.start] = distinct_categories / CATEGORY_SLOTS as f64;
    v[EXPLORATION.start + 1] = entropy;
    v[EXPLORATION.start + 2] = if total_weight > 0.0 {
        1.0 - top_weight / total_weight
    } else {
        0.0
    };
    v[EXPLORATION.start + 3] = distinct_items.len() as f64 / n;
    v[EXPLORATION.start + 4] = log_scale(distinct_items.len() as f64, 100.0);
    v[EXPLORATION.start + 5] = log_scale(distinct_categories, CATEGORY_SLOTS as f64);

    for value in v.iter_mut() {
        *value = sanitize_unit(*value);
    }
    Some(v)
}
