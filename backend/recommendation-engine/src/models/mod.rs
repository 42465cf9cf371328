use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use uuid::Uuid;

/// Catalogue item as seen by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: Uuid,
    pub category: String,
    pub merchant_id: String,
    pub brand: Option<String>,
    pub origin: Option<String>,
    pub price: f64,
    /// Price before discount; equal to `price` when not discounted
    pub original_price: f64,
    /// Average rating on a 0-5 scale
    pub rating: f64,
    pub sales_count: u64,
    pub review_count: u64,
    pub stock: u64,
    pub is_promoted: bool,
    pub tags: Vec<String>,
    /// Product embedding (128-d when present, empty otherwise)
    pub embedding: Vec<f64>,
    pub created_at: DateTime<Utc>,
}

impl Item {
    /// Fraction knocked off the original price, 0 when not discounted
    pub fn discount_ratio(&self) -> f64 {
        if self.original_price <= 0.0 || self.price >= self.original_price {
            return 0.0;
        }
        ((self.original_price - self.price) / self.original_price).clamp(0.0, 1.0)
    }

    pub fn age_days(&self, now: DateTime<Utc>) -> f64 {
        let secs = (now - self.created_at).num_seconds().max(0) as f64;
        secs / 86_400.0
    }

    pub fn is_new(&self, now: DateTime<Utc>, new_item_days: i64) -> bool {
        now - self.created_at <= Duration::days(new_item_days)
    }

    /// Brand, falling back to the merchant when the catalogue has none
    pub fn brand_key(&self) -> &str {
        self.brand.as_deref().unwrap_or(&self.merchant_id)
    }
}

/// Implicit feedback signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    Purchase,
    CartAdd,
    Favorite,
    View,
    Click,
}

impl InteractionKind {
    pub const ALL: [InteractionKind; 5] = [
        InteractionKind::Purchase,
        InteractionKind::CartAdd,
        InteractionKind::Favorite,
        InteractionKind::View,
        InteractionKind::Click,
    ];

    /// Signal strength; integers so folded matrices stay exact
    pub fn weight(&self) -> f64 {
        match self {
            InteractionKind::Purchase => 5.0,
            InteractionKind::CartAdd => 3.0,
            InteractionKind::Favorite => 2.0,
            InteractionKind::View => 1.0,
            InteractionKind::Click => 1.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionKind::Purchase => "purchase",
            InteractionKind::CartAdd => "cart_add",
            InteractionKind::Favorite => "favorite",
            InteractionKind::View => "view",
            InteractionKind::Click => "click",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "purchase" | "order" => Some(InteractionKind::Purchase),
            "cart_add" | "cart" | "add_to_cart" => Some(InteractionKind::CartAdd),
            "favorite" | "favourite" | "collect" => Some(InteractionKind::Favorite),
            "view" => Some(InteractionKind::View),
            "click" => Some(InteractionKind::Click),
            _ => None,
        }
    }

    /// Whether the event counts as an observed positive outcome for evaluation
    pub fn is_engagement(&self) -> bool {
        !matches!(self, InteractionKind::View)
    }
}

impl fmt::Display for InteractionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionEvent {
    pub user_id: Uuid,
    pub item_id: Uuid,
    pub kind: InteractionKind,
    pub occurred_at: DateTime<Utc>,
}

impl InteractionEvent {
    pub fn new(user_id: Uuid, item_id: Uuid, kind: InteractionKind, occurred_at: DateTime<Utc>) -> Self {
        Self {
            user_id,
            item_id,
            kind,
            occurred_at,
        }
    }
}

/// Weighted (type, value) interest tag with time decay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterestTag {
    pub tag_type: String,
    pub value: String,
    pub weight: f64,
    pub updated_at: DateTime<Utc>,
}

/// Tag weight half-life
const TAG_HALF_LIFE_DAYS: f64 = 30.0;

impl InterestTag {
    pub fn decayed_weight(&self, now: DateTime<Utc>) -> f64 {
        let age_days = (now - self.updated_at).num_seconds().max(0) as f64 / 86_400.0;
        self.weight.max(0.0) * crate::utils::exponential_decay(age_days, TAG_HALF_LIFE_DAYS)
    }

    pub fn is_category(&self) -> bool {
        self.tag_type.eq_ignore_ascii_case("category")
    }
}

/// Derived shopping preferences of a user, input to user and cross features.
///
/// All ratios are in [0,1]; `average_order_value` is in currency units.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserPreferences {
    /// Interactions in the behaviour window
    pub behavior_count: usize,
    /// Per-category affinity, normalised so the strongest category is 1.0
    pub category_affinity: Vec<(String, f64)>,
    /// Share of weighted interactions per price bucket
    pub price_affinity: [f64; 5],
    pub purchasing_power: f64,
    pub discount_sensitivity: f64,
    pub merchant_diversity: f64,
    pub exploration_tendency: f64,
    pub activity_level: f64,
    pub purchase_ratio: f64,
    pub recency: f64,
    pub average_order_value: f64,
    pub known_merchants: HashSet<String>,
    /// Decayed interest tag weight hashed into 16 buckets, max-normalised
    pub tag_buckets: [f64; 16],
    pub tag_values: HashSet<String>,
}

impl UserPreferences {
    pub fn affinity_for(&self, category: &str) -> f64 {
        self.category_affinity
            .iter()
            .find(|(c, _)| c == category)
            .map(|(_, a)| *a)
            .unwrap_or(0.0)
    }

    pub fn top_category(&self) -> Option<&str> {
        self.category_affinity.first().map(|(c, _)| c.as_str())
    }

    pub fn top_categories(&self, n: usize) -> Vec<String> {
        self.category_affinity
            .iter()
            .take(n)
            .map(|(c, _)| c.clone())
            .collect()
    }
}

/// Which stream produced a recommendation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationSource {
    ContentBased,
    Collaborative,
    Popularity,
    Exploration,
    ColdStartPopular,
    ColdStartHighRated,
    ColdStartNew,
    ColdStartRandom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendedItem {
    pub item_id: Uuid,
    pub score: f64,
    pub source: RecommendationSource,
    /// Predicted click-through rate when the list was reranked
    pub ctr: Option<f64>,
}

impl RecommendedItem {
    pub fn new(item_id: Uuid, score: f64, source: RecommendationSource) -> Self {
        Self {
            item_id,
            score,
            source,
            ctr: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn item(price: f64, original_price: f64) -> Item {
        Item {
            id: Uuid::new_v4(),
            category: "shoes".into(),
            merchant_id: "m1".into(),
            brand: None,
            origin: None,
            price,
            original_price,
            rating: 4.0,
            sales_count: 10,
            review_count: 2,
            stock: 5,
            is_promoted: false,
            tags: vec![],
            embedding: vec![],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_discount_ratio() {
        assert!((item(80.0, 100.0).discount_ratio() - 0.2).abs() < 1e-9);
        assert_eq!(item(100.0, 100.0).discount_ratio(), 0.0);
        assert_eq!(item(120.0, 0.0).discount_ratio(), 0.0);
    }

    #[test]
    fn test_interaction_weights_are_ordered() {
        assert!(InteractionKind::Purchase.weight() > InteractionKind::CartAdd.weight());
        assert!(InteractionKind::CartAdd.weight() > InteractionKind::Favorite.weight());
        assert!(InteractionKind::Favorite.weight() > InteractionKind::View.weight());
        assert_eq!(InteractionKind::parse("add_to_cart"), Some(InteractionKind::CartAdd));
        assert_eq!(InteractionKind::parse("share"), None);
    }

    #[test]
    fn test_brand_key_falls_back_to_merchant() {
        let mut it = item(10.0, 10.0);
        assert_eq!(it.brand_key(), "m1");
        it.brand = Some("acme".into());
        assert_eq!(it.brand_key(), "acme");
    }
}
