// Utility functions for recommendation-engine

use ndarray::ArrayView1;
use std::f64::consts::PI;

/// Upper bounds of the five price buckets; the last bucket is open-ended
pub const PRICE_BUCKET_BOUNDS: [f64; 4] = [50.0, 100.0, 200.0, 500.0];
pub const PRICE_BUCKETS: usize = 5;

/// Clamp a value into [0, 1]; NaN and infinities become 0
pub fn sanitize_unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Normalize every element of a vector into [0, 1] in place
pub fn normalize_unit(values: &mut [f64]) {
    for v in values.iter_mut() {
        *v = sanitize_unit(*v);
    }
}

/// Compute exponential decay for time-based scoring
pub fn exponential_decay(age: f64, half_life: f64) -> f64 {
    if half_life <= 0.0 {
        return 0.0;
    }
    (-age / half_life * std::f64::consts::LN_2).exp()
}

/// Logistic function, saturating to exactly 0 or 1 beyond +-500
pub fn sigmoid(z: f64) -> f64 {
    if z > 500.0 {
        1.0
    } else if z < -500.0 {
        0.0
    } else {
        1.0 / (1.0 + (-z).exp())
    }
}

/// `ln(1 + x) / ln(1 + max)` clamped to [0, 1]
pub fn log_scale(value: f64, max: f64) -> f64 {
    if value <= 0.0 || max <= 0.0 {
        return 0.0;
    }
    sanitize_unit(value.ln_1p() / max.ln_1p())
}

/// Sine/cosine encoding of a periodic value, mapped from [-1, 1] to [0, 1]
pub fn cyclical(value: f64, period: f64) -> (f64, f64) {
    let angle = 2.0 * PI * value / period;
    ((angle.sin() + 1.0) / 2.0, (angle.cos() + 1.0) / 2.0)
}

pub fn price_bucket(price: f64) -> usize {
    PRICE_BUCKET_BOUNDS
        .iter()
        .position(|bound| price < *bound)
        .unwrap_or(PRICE_BUCKETS - 1)
}

/// FNV-1a, stable across builds and processes
pub fn stable_hash(value: &str) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    value.bytes().fold(OFFSET, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(PRIME)
    })
}

pub fn hash_bucket(value: &str, buckets: usize) -> usize {
    if buckets == 0 {
        return 0;
    }
    (stable_hash(&value.to_lowercase()) % buckets as u64) as usize
}

/// Average-pool `values` down to `target` slots of consecutive chunks
pub fn average_pool(values: &[f64], target: usize) -> Vec<f64> {
    if values.is_empty() || target == 0 {
        return vec![0.0; target];
    }
    let chunk = values.len().div_ceil(target);
    let mut pooled: Vec<f64> = values
        .chunks(chunk)
        .map(|c| c.iter().sum::<f64>() / c.len() as f64)
        .collect();
    pooled.resize(target, 0.0);
    pooled
}

/// Calculate cosine similarity between two vectors
pub fn cosine_similarity(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product = a.dot(&b);
    let norm_a = a.dot(&a).sqrt();
    let norm_b = b.dot(&b).sqrt();

    if norm_a == 0.0 || norm_b == 0.0 || !dot_product.is_finite() {
        return 0.0;
    }

    (dot_product / (norm_a * norm_b)).clamp(-1.0, 1.0)
}

pub fn euclidean_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}
