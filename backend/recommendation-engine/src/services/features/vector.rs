use super::layout::{self, cross, item as item_layout, user as user_layout, VectorKind};
use crate::models::{InteractionEvent, InteractionKind, InterestTag, Item, UserPreferences};
use crate::utils::{
    average_pool, cosine_similarity, cyclical, exponential_decay, hash_bucket, log_scale,
    price_bucket, sanitize_unit, PRICE_BUCKETS,
};
use chrono::{DateTime, Datelike, Timelike, Utc};
use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::ops::Range;

/// Log-scale ceilings
const MAX_PRICE: f64 = 10_000.0;
const MAX_SALES: f64 = 10_000.0;
const MAX_REVIEWS: f64 = 10_000.0;
const MAX_STOCK: f64 = 1_000.0;
const MAX_ACTIVITY: f64 = 100.0;

const FRESHNESS_HALF_LIFE_DAYS: f64 = 30.0;
const RECENCY_HALF_LIFE_DAYS: f64 = 7.0;
const DISCOUNTED_THRESHOLD: f64 = 0.1;
const SENSITIVITY_MEDIAN: f64 = 0.5;
const HIGH_RATING: f64 = 4.0;

/// Fixed-length vector of values in [0, 1]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    values: Vec<f64>,
}

impl FeatureVector {
    pub fn zeros(len: usize) -> Self {
        Self {
            values: vec![0.0; len],
        }
    }

    /// Sanitised copy of `values`, padded with zeros or truncated to `len`
    pub fn from_values(mut values: Vec<f64>, len: usize) -> Self {
        values.resize(len, 0.0);
        crate::utils::normalize_unit(&mut values);
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }

    pub fn view(&self) -> ArrayView1<'_, f64> {
        ArrayView1::from(self.values.as_slice())
    }

    pub fn get(&self, index: usize) -> f64 {
        self.values.get(index).copied().unwrap_or(0.0)
    }

    pub fn slice(&self, range: Range<usize>) -> &[f64] {
        let end = range.end.min(self.values.len());
        let start = range.start.min(end);
        &self.values[start..end]
    }

    pub fn set(&mut self, index: usize, value: f64) {
        if let Some(slot) = self.values.get_mut(index) {
            *slot = sanitize_unit(value);
        }
    }

    pub fn write(&mut self, range: Range<usize>, values: &[f64]) {
        for (index, value) in range.zip(values.iter()) {
            self.set(index, *value);
        }
    }

    /// Whether the vector has the declared length and every value is in [0, 1]
    pub fn is_valid(&self, kind: VectorKind) -> bool {
        self.values.len() == kind.dim()
            && self.values.iter().all(|v| v.is_finite() && (0.0..=1.0).contains(v))
    }
}

/// Concatenate user, item and cross vectors in that order
pub fn concatenate(user: &FeatureVector, item: &FeatureVector, cross: &FeatureVector) -> FeatureVector {
    let mut values = Vec::with_capacity(layout::TOTAL_DIM);
    for (vector, kind) in [
        (user, VectorKind::User),
        (item, VectorKind::Item),
        (cross, VectorKind::Cross),
    ] {
        let mut part = vector.as_slice().to_vec();
        part.resize(kind.dim(), 0.0);
        values.extend(part);
    }
    FeatureVector::from_values(values, layout::TOTAL_DIM)
}

/// Embedding values are in [-1, 1]; map into [0, 1] after pooling
fn pooled_embedding(embedding: &[f64]) -> Vec<f64> {
    average_pool(embedding, layout::EMBEDDING_POOLED)
        .into_iter()
        .map(|v| (v + 1.0) / 2.0)
        .collect()
}

pub fn pooled_embedding_or_zero(embedding: &[f64]) -> Vec<f64> {
    if embedding.is_empty() {
        vec![0.0; layout::EMBEDDING_POOLED]
    } else {
        pooled_embedding(embedding)
    }
}

/// Derive the preference record from a user's recent behaviour
pub fn derive_preferences(
    events: &[InteractionEvent],
    items: &HashMap<uuid::Uuid, Item>,
    tags: &[InterestTag],
    now: DateTime<Utc>,
) -> UserPreferences {
    let mut prefs = UserPreferences {
        behavior_count: events.len(),
        ..Default::default()
    };

    let mut tag_max = 0.0f64;
    for tag in tags {
        let weight = tag.decayed_weight(now);
        let bucket = hash_bucket(&tag.value, layout::TAG_BUCKETS);
        prefs.tag_buckets[bucket] += weight;
        tag_max = tag_max.max(prefs.tag_buckets[bucket]);
        prefs.tag_values.insert(tag.value.to_lowercase());
    }
    if tag_max > 0.0 {
        for bucket in prefs.tag_buckets.iter_mut() {
            *bucket /= tag_max;
        }
    }

    if events.is_empty() {
        return prefs;
    }

    let mut category_weight: HashMap<String, f64> = HashMap::new();
    let mut price_weight = [0.0f64; PRICE_BUCKETS];
    let mut total_weight = 0.0;
    let mut discounted_weight = 0.0;
    let mut categories: HashSet<&str> = HashSet::new();
    let mut purchase_prices = Vec::new();
    let mut all_prices = Vec::new();
    let mut purchases = 0usize;

    for event in events {
        if event.kind == InteractionKind::Purchase {
            purchases += 1;
        }
        let Some(item) = items.get(&event.item_id) else {
            continue;
        };
        let weight = event.kind.weight();
        total_weight += weight;
        *category_weight.entry(item.category.clone()).or_insert(0.0) += weight;
        price_weight[price_bucket(item.price)] += weight;
        if item.discount_ratio() > DISCOUNTED_THRESHOLD {
            discounted_weight += weight;
        }
        categories.insert(item.category.as_str());
        prefs.known_merchants.insert(item.merchant_id.clone());
        all_prices.push(item.price);
        if event.kind == InteractionKind::Purchase {
            purchase_prices.push(item.price);
        }
    }

    let max_category = category_weight.values().cloned().fold(0.0, f64::max);
    let mut affinity: Vec<(String, f64)> = category_weight
        .into_iter()
        .map(|(c, w)| (c, if max_category > 0.0 { w / max_category } else { 0.0 }))
        .collect();
    affinity.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    prefs.category_affinity = affinity;

    if total_weight > 0.0 {
        for (slot, w) in prefs.price_affinity.iter_mut().zip(price_weight.iter()) {
            *slot = w / total_weight;
        }
        prefs.discount_sensitivity = discounted_weight / total_weight;
    }

    let matched = all_prices.len().max(1) as f64;
    prefs.merchant_diversity = sanitize_unit(prefs.known_merchants.len() as f64 / matched);
    prefs.exploration_tendency = sanitize_unit(categories.len() as f64 / matched);
    prefs.activity_level = log_scale(events.len() as f64, MAX_ACTIVITY);
    prefs.purchase_ratio = purchases as f64 / events.len() as f64;

    // Purchasing power from purchases when there are any, browsing otherwise
    let reference = if purchase_prices.is_empty() { &all_prices } else { &purchase_prices };
    if !reference.is_empty() {
        let mean = reference.iter().sum::<f64>() / reference.len() as f64;
        prefs.purchasing_power = log_scale(mean, MAX_PRICE);
    }
    if !purchase_prices.is_empty() {
        prefs.average_order_value = purchase_prices.iter().sum::<f64>() / purchase_prices.len() as f64;
    }

    if let Some(latest) = events.iter().map(|e| e.occurred_at).max() {
        let days = (now - latest).num_seconds().max(0) as f64 / 86_400.0;
        prefs.recency = exponential_decay(days, RECENCY_HALF_LIFE_DAYS);
    }

    prefs
}

/// User vector: basic attributes, behaviour embedding, tag buckets, price
/// affinity and time-of-request context.
pub fn build_user_vector(
    prefs: &UserPreferences,
    recent_items: &[Item],
    now: DateTime<Utc>,
) -> FeatureVector {
    let mut v = FeatureVector::zeros(layout::USER_DIM);

    v.write(
        user_layout::BASIC,
        &[
            prefs.activity_level,
            prefs.purchase_ratio,
            log_scale(prefs.average_order_value, MAX_PRICE),
            prefs.purchasing_power,
            prefs.discount_sensitivity,
            prefs.merchant_diversity,
            prefs.recency,
        ],
    );

    v.write(user_layout::EMBEDDING, &behavior_embedding(recent_items));
    v.write(user_layout::TAGS, &prefs.tag_buckets);
    v.write(user_layout::PRICE_AFFINITY, &prefs.price_affinity);
    v.write(user_layout::TIME, &time_context(now));
    v
}

/// Average of recent item embeddings, pooled to 32 dimensions
pub fn behavior_embedding(recent_items: &[Item]) -> Vec<f64> {
    let with_embedding: Vec<&Item> = recent_items
        .iter()
        .filter(|item| !item.embedding.is_empty())
        .collect();
    if with_embedding.is_empty() {
        return vec![0.0; layout::EMBEDDING_POOLED];
    }

    let dim = with_embedding
        .iter()
        .map(|item| item.embedding.len())
        .max()
        .unwrap_or(0);
    let mut mean = vec![0.0; dim];
    for item in &with_embedding {
        for (slot, value) in mean.iter_mut().zip(item.embedding.iter()) {
            *slot += value;
        }
    }
    let n = with_embedding.len() as f64;
    for slot in mean.iter_mut() {
        *slot /= n;
    }
    pooled_embedding(&mean)
}

pub fn time_context(now: DateTime<Utc>) -> [f64; 4] {
    let hour = now.hour() as f64 + now.minute() as f64 / 60.0;
    let weekday = now.weekday().num_days_from_monday() as f64;
    let (hour_sin, hour_cos) = cyclical(hour, 24.0);
    let (day_sin, day_cos) = cyclical(weekday, 7.0);
    [hour_sin, hour_cos, day_sin, day_cos]
}

pub fn build_item_vector(item: &Item, now: DateTime<Utc>, new_item_days: i64) -> FeatureVector {
    let mut v = FeatureVector::zeros(layout::ITEM_DIM);

    let bucket = price_bucket(item.price);
    let sales = log_scale(item.sales_count as f64, MAX_SALES);
    let rating = item.rating / 5.0;

    v.write(
        item_layout::BASIC,
        &[
            log_scale(item.price, MAX_PRICE),
            item.discount_ratio(),
            rating,
            sales,
            log_scale(item.review_count as f64, MAX_REVIEWS),
            log_scale(item.stock as f64, MAX_STOCK),
            exponential_decay(item.age_days(now), FRESHNESS_HALF_LIFE_DAYS),
            if item.is_promoted { 1.0 } else { 0.0 },
            if item.is_new(now, new_item_days) { 1.0 } else { 0.0 },
            bucket as f64 / (PRICE_BUCKETS - 1) as f64,
            0.6 * sales + 0.4 * sanitize_unit(rating),
        ],
    );

    v.set(
        item_layout::CATEGORY.start + hash_bucket(&item.category, layout::CATEGORY_BUCKETS),
        1.0,
    );
    v.write(item_layout::EMBEDDING, &pooled_embedding_or_zero(&item.embedding));
    v.set(item_layout::PRICE_BUCKET.start + bucket, 1.0);
    v
}

/// Cross features between a user and one item
pub fn build_cross_vector(
    user_vec: &FeatureVector,
    item_vec: &FeatureVector,
    prefs: &UserPreferences,
    item: &Item,
) -> FeatureVector {
    let mut v = FeatureVector::zeros(layout::CROSS_DIM);

    v.set(cross::CATEGORY_AFFINITY, prefs.affinity_for(&item.category));

    let item_buckets = item_vec.slice(item_layout::PRICE_BUCKET);
    for (i, index) in cross::PRICE_BUCKET.enumerate() {
        let affinity = prefs.price_affinity.get(i).copied().unwrap_or(0.0);
        v.set(index, affinity * item_buckets.get(i).copied().unwrap_or(0.0));
    }

    let discounted = item.discount_ratio() > DISCOUNTED_THRESHOLD;
    let flag = |b: bool| if b { 1.0 } else { 0.0 };
    v.set(
        cross::DISCOUNT_X_SENSITIVE,
        flag(discounted && prefs.discount_sensitivity > SENSITIVITY_MEDIAN),
    );
    v.set(
        cross::RATED_X_POWER,
        flag(item.rating >= HIGH_RATING && prefs.purchasing_power > SENSITIVITY_MEDIAN),
    );
    v.set(
        cross::NEW_X_EXPLORER,
        flag(item_vec.get(item_layout::NEW_FLAG) > 0.5 && prefs.exploration_tendency > SENSITIVITY_MEDIAN),
    );
    v.set(
        cross::MERCHANT_FAMILIAR,
        flag(prefs.known_merchants.contains(&item.merchant_id)),
    );

    if !item.tags.is_empty() {
        let overlap = item
            .tags
            .iter()
            .filter(|t| prefs.tag_values.contains(&t.to_lowercase()))
            .count();
        v.set(cross::TAG_OVERLAP, overlap as f64 / item.tags.len() as f64);
    }

    let cosine = cosine_similarity(
        ArrayView1::from(user_vec.slice(user_layout::EMBEDDING)),
        ArrayView1::from(item_vec.slice(item_layout::EMBEDDING)),
    );
    v.set(cross::EMBEDDING_COSINE, cosine);

    let user_tags = user_vec.slice(user_layout::TAGS);
    let item_categories = item_vec.slice(item_layout::CATEGORY);
    for (i, index) in cross::TAG_X_CATEGORY.enumerate() {
        let tag = user_tags.get(i).copied().unwrap_or(0.0);
        let category = item_categories.get(i).copied().unwrap_or(0.0);
        v.set(index, tag * category);
    }

    let user_power = user_vec.get(user_layout::BASIC.start + 3);
    let item_price = item_vec.get(item_layout::PRICE);
    v.set(cross::PRICE_FIT, 1.0 - (user_power - item_price).abs());
    v.set(
        cross::TOP_CATEGORY,
        flag(prefs.top_category() == Some(item.category.as_str())),
    );
    v.set(
        cross::UNDER_AVG_ORDER,
        flag(prefs.average_order_value > 0.0 && item.price <= prefs.average_order_value),
    );
    v.set(cross::BIAS, 1.0);
    v
}
