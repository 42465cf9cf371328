//! Feature vector layout
//!
//! Offsets are fixed; the click model's weight vector is indexed by them, so
//! changing a range invalidates persisted weights (they are reinitialised on
//! load when the dimension no longer matches).

use std::ops::Range;

pub const USER_DIM: usize = 64;
pub const ITEM_DIM: usize = 64;
pub const CROSS_DIM: usize = 32;
pub const TOTAL_DIM: usize = USER_DIM + ITEM_DIM + CROSS_DIM;

pub const EMBEDDING_POOLED: usize = 32;
pub const TAG_BUCKETS: usize = 16;
pub const CATEGORY_BUCKETS: usize = 16;

pub mod user {
    use std::ops::Range;

    pub const BASIC: Range<usize> = 0..7;
    pub const EMBEDDING: Range<usize> = 7..39;
    pub const TAGS: Range<usize> = 39..55;
    pub const PRICE_AFFINITY: Range<usize> = 55..60;
    pub const TIME: Range<usize> = 60..64;

    pub const BASIC_NAMES: [&str; 7] = [
        "activity",
        "purchase_ratio",
        "avg_order_value",
        "purchasing_power",
        "discount_sensitivity",
        "merchant_diversity",
        "recency",
    ];
    pub const TIME_NAMES: [&str; 4] = ["hour_sin", "hour_cos", "weekday_sin", "weekday_cos"];
}

pub mod item {
    use std::ops::Range;

    pub const BASIC: Range<usize> = 0..11;
    pub const CATEGORY: Range<usize> = 11..27;
    pub const EMBEDDING: Range<usize> = 27..59;
    pub const PRICE_BUCKET: Range<usize> = 59..64;

    pub const PRICE: usize = 0;
    pub const DISCOUNT: usize = 1;
    pub const RATING: usize = 2;
    pub const NEW_FLAG: usize = 8;

    pub const BASIC_NAMES: [&str; 11] = [
        "price",
        "discount_ratio",
        "rating",
        "sales",
        "reviews",
        "stock",
        "freshness",
        "promoted",
        "is_new",
        "price_position",
        "popularity",
    ];
}

pub mod cross {
    use std::ops::Range;

    pub const CATEGORY_AFFINITY: usize = 0;
    pub const PRICE_BUCKET: Range<usize> = 1..6;
    pub const DISCOUNT_X_SENSITIVE: usize = 6;
    pub const RATED_X_POWER: usize = 7;
    pub const NEW_X_EXPLORER: usize = 8;
    pub const MERCHANT_FAMILIAR: usize = 9;
    pub const TAG_OVERLAP: usize = 10;
    pub const EMBEDDING_COSINE: usize = 11;
    pub const TAG_X_CATEGORY: Range<usize> = 12..28;
    pub const PRICE_FIT: usize = 28;
    pub const TOP_CATEGORY: usize = 29;
    pub const UNDER_AVG_ORDER: usize = 30;
    pub const BIAS: usize = 31;
}

/// Offset of each sub-vector inside the concatenated vector
pub const fn concat_range(kind: VectorKind) -> Range<usize> {
    match kind {
        VectorKind::User => 0..USER_DIM,
        VectorKind::Item => USER_DIM..USER_DIM + ITEM_DIM,
        VectorKind::Cross => USER_DIM + ITEM_DIM..TOTAL_DIM,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorKind {
    User,
    Item,
    Cross,
}

impl VectorKind {
    pub const fn dim(self) -> usize {
        match self {
            VectorKind::User => USER_DIM,
            VectorKind::Item => ITEM_DIM,
            VectorKind::Cross => CROSS_DIM,
        }
    }
}

/// Index -> dotted feature name for the concatenated vector.
///
/// Built once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct FeatureNameTable {
    names: Vec<String>,
}

impl FeatureNameTable {
    pub fn standard() -> Self {
        let mut names = Vec::with_capacity(TOTAL_DIM);

        names.extend(user::BASIC_NAMES.iter().map(|n| format!("user.basic.{}", n)));
        names.extend((0..EMBEDDING_POOLED).map(|i| format!("user.embedding.{:02}", i)));
        names.extend((0..TAG_BUCKETS).map(|i| format!("user.tag_bucket.{:02}", i)));
        names.extend((0..5).map(|i| format!("user.price_affinity.{}", i)));
        names.extend(user::TIME_NAMES.iter().map(|n| format!("user.time.{}", n)));

        names.extend(item::BASIC_NAMES.iter().map(|n| format!("item.basic.{}", n)));
        names.extend((0..CATEGORY_BUCKETS).map(|i| format!("item.category.{:02}", i)));
        names.extend((0..EMBEDDING_POOLED).map(|i| format!("item.embedding.{:02}", i)));
        names.extend((0..5).map(|i| format!("item.price_bucket.{}", i)));

        names.push("cross.category_affinity".to_string());
        names.extend((0..5).map(|i| format!("cross.price_bucket.{}", i)));
        for n in [
            "discount_x_sensitive",
            "rated_x_power",
            "new_x_explorer",
            "merchant_familiar",
            "tag_overlap",
            "embedding_cosine",
        ] {
            names.push(format!("cross.{}", n));
        }
        names.extend((0..TAG_BUCKETS).map(|i| format!("cross.tag_x_category.{:02}", i)));
        for n in ["price_fit", "top_category", "under_avg_order", "bias"] {
            names.push(format!("cross.{}", n));
        }

        Self { names }
    }

    pub fn name(&self, index: usize) -> &str {
        self.names.get(index).map(String::as_str).unwrap_or("unknown")
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranges_tile_each_vector() {
        assert_eq!(user::BASIC.start, 0);
        assert_eq!(user::BASIC.end, user::EMBEDDING.start);
        assert_eq!(user::EMBEDDING.end, user::TAGS.start);
        assert_eq!(user::TAGS.end, user::PRICE_AFFINITY.start);
        assert_eq!(user::PRICE_AFFINITY.end, user::TIME.start);
        assert_eq!(user::TIME.end, USER_DIM);

        assert_eq!(item::BASIC.end, item::CATEGORY.start);
        assert_eq!(item::CATEGORY.end, item::EMBEDDING.start);
        assert_eq!(item::EMBEDDING.end, item::PRICE_BUCKET.start);
        assert_eq!(item::PRICE_BUCKET.end, ITEM_DIM);

        assert_eq!(cross::TAG_X_CATEGORY.end, cross::PRICE_FIT);
        assert_eq!(cross::BIAS + 1, CROSS_DIM);
        assert_eq!(TOTAL_DIM, 160);
    }

    #[test]
    fn test_name_table_covers_every_index() {
        let table = FeatureNameTable::standard();
        assert_eq!(table.len(), TOTAL_DIM);
        assert_eq!(table.name(0), "user.basic.activity");
        assert_eq!(table.name(7 + 7), "user.embedding.07");
        assert_eq!(
            table.name(concat_range(VectorKind::Cross).start + 3),
            "cross.price_bucket.2"
        );
        assert_eq!(table.name(TOTAL_DIM - 1), "cross.bias");
        assert_eq!(table.name(TOTAL_DIM), "unknown");
    }
}
