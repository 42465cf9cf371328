//! Cold-start mix and warmth interpolation

use crate::config::ColdStartMix;
use crate::utils::sigmoid;

/// Warmth in [0, 1]: `sigmoid((behaviour_count - midpoint) * steepness)`
pub fn warmth(behavior_count: usize, midpoint: f64, steepness: f64) -> f64 {
    let w = sigmoid((behavior_count as f64 - midpoint) * steepness);
    if w.is_finite() {
        w.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// How many of `limit` slots go to personalised results
pub fn personalized_slots(limit: usize, warmth: f64) -> usize {
    ((limit as f64 * warmth).ceil() as usize).min(limit)
}

/// Split `total` across popular / high-rated / new / random by the mix
/// ratios, largest remainder first so the parts always add up to `total`
pub fn split_mix(total: usize, mix: &ColdStartMix) -> [usize; 4] {
    let ratios = [mix.popular, mix.high_rated, mix.new_items, mix.random];
    let sum: f64 = ratios.iter().filter(|r| r.is_finite() && **r > 0.0).sum();
    if total == 0 || sum <= 0.0 {
        return [total, 0, 0, 0];
    }

    let mut counts = [0usize; 4];
    let mut remainders = [(0usize, 0.0f64); 4];
    for (i, ratio) in ratios.iter().enumerate() {
        let ratio = if ratio.is_finite() { ratio.max(0.0) } else { 0.0 };
        let exact = total as f64 * ratio / sum;
        counts[i] = exact.floor() as usize;
        remainders[i] = (i, exact - exact.floor());
    }

    let assigned: usize = counts.iter().sum();
    remainders.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    for (i, _) in remainders.iter().take(total.saturating_sub(assigned)) {
        counts[*i] += 1;
    }
    counts
}
