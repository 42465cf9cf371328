//! Ranking metrics over (ranked list, relevance set).
//!
//! Relevance is binary. Every metric returns a value in [0, 1] and 0 for
//! empty inputs or `k == 0`. A ranked list is read with repeats removed,
//! first occurrence keeping its rank.

use crate::models::Item;
use crate::utils::price_bucket;
use std::collections::HashSet;
use std::hash::Hash;

const CATEGORY_WEIGHT: f64 = 0.3;
const MERCHANT_WEIGHT: f64 = 0.2;
const PRICE_WEIGHT: f64 = 0.15;
const BRAND_WEIGHT: f64 = 0.15;
const ORIGIN_WEIGHT: f64 = 0.1;
const PROMOTION_WEIGHT: f64 = 0.1;

/// Widest possible price-bucket gap
const MAX_BUCKET_GAP: f64 = 4.0;

fn discount(rank: usize) -> f64 {
    1.0 / (rank as f64 + 2.0).log2()
}

/// Items in rank order without repeats
fn distinct<T: Eq + Hash>(ranked: &[T]) -> impl Iterator<Item = &T> {
    let mut seen = HashSet::new();
    ranked.iter().filter(move |item| seen.insert(*item))
}

pub fn dcg_at_k<T: Eq + Hash>(ranked: &[T], relevant: &HashSet<T>, k: usize) -> f64 {
    distinct(ranked)
        .take(k)
        .enumerate()
        .filter(|(_, item)| relevant.contains(*item))
        .map(|(rank, _)| discount(rank))
        .sum()
}

/// DCG normalised by the DCG of a list with every relevant item on top
pub fn ndcg_at_k<T: Eq + Hash>(ranked: &[T], relevant: &HashSet<T>, k: usize) -> f64 {
    let ideal: f64 = (0..relevant.len().min(k)).map(discount).sum();
    if ideal <= 0.0 {
        return 0.0;
    }
    (dcg_at_k(ranked, relevant, k) / ideal).min(1.0)
}

pub fn hit_rate_at_k<T: Eq + Hash>(ranked: &[T], relevant: &HashSet<T>, k: usize) -> f64 {
    if distinct(ranked).take(k).any(|item| relevant.contains(item)) {
        1.0
    } else {
        0.0
    }
}

fn hits_at_k<T: Eq + Hash>(ranked: &[T], relevant: &HashSet<T>, k: usize) -> usize {
    distinct(ranked).take(k).filter(|item| relevant.contains(*item)).count()
}

/// Hits in the top `k` divided by `k`
pub fn precision_at_k<T: Eq + Hash>(ranked: &[T], relevant: &HashSet<T>, k: usize) -> f64 {
    if k == 0 {
        return 0.0;
    }
    hits_at_k(ranked, relevant, k) as f64 / k as f64
}

pub fn recall_at_k<T: Eq + Hash>(ranked: &[T], relevant: &HashSet<T>, k: usize) -> f64 {
    if relevant.is_empty() {
        return 0.0;
    }
    hits_at_k(ranked, relevant, k) as f64 / relevant.len() as f64
}

/// Mean of precision at each hit, over `|relevant|`
pub fn average_precision<T: Eq + Hash>(ranked: &[T], relevant: &HashSet<T>) -> f64 {
    if relevant.is_empty() {
        return 0.0;
    }
    let mut hits = 0usize;
    let mut sum = 0.0;
    for (rank, item) in distinct(ranked).enumerate() {
        if relevant.contains(item) {
            hits += 1;
            sum += hits as f64 / (rank + 1) as f64;
        }
    }
    sum / relevant.len() as f64
}

pub fn reciprocal_rank<T: Eq + Hash>(ranked: &[T], relevant: &HashSet<T>) -> f64 {
    distinct(ranked)
        .position(|item| relevant.contains(item))
        .map_or(0.0, |rank| 1.0 / (rank + 1) as f64)
}

/// Distinct recommended items over catalogue size, capped at 1
pub fn coverage<T: Eq + Hash>(recommended: impl IntoIterator<Item = T>, catalog_size: usize) -> f64 {
    if catalog_size == 0 {
        return 0.0;
    }
    let distinct: HashSet<T> = recommended.into_iter().collect();
    (distinct.len() as f64 / catalog_size as f64).min(1.0)
}

/// Weighted dissimilarity of two items in [0, 1]
pub fn dissimilarity(a: &Item, b: &Item) -> f64 {
    let differs = |x: bool| if x { 1.0 } else { 0.0 };
    let gap = (price_bucket(a.price) as f64 - price_bucket(b.price) as f64).abs();

    CATEGORY_WEIGHT * differs(!a.category.eq_ignore_ascii_case(&b.category))
        + MERCHANT_WEIGHT * differs(a.merchant_id != b.merchant_id)
        + PRICE_WEIGHT * (gap / MAX_BUCKET_GAP).min(1.0)
        + BRAND_WEIGHT * differs(a.brand_key() != b.brand_key())
        + ORIGIN_WEIGHT * differs(a.origin.as_deref().unwrap_or("") != b.origin.as_deref().unwrap_or(""))
        + PROMOTION_WEIGHT * differs(a.is_promoted != b.is_promoted)
}

/// Mean pairwise dissimilarity; 0 for fewer than two items
pub fn intra_list_diversity(items: &[Item]) -> f64 {
    if items.len() < 2 {
        return 0.0;
    }
    let mut total = 0.0;
    let mut pairs = 0usize;
    for (i, a) in items.iter().enumerate() {
        for b in &items[i + 1..] {
            total += dissimilarity(a, b);
            pairs += 1;
        }
    }
    total / pairs as f64
}
