//! External collaborators consumed by the engine.
//!
//! The engine never talks to a catalogue service, an event table or an
//! exploration bandit directly; it goes through these traits so tests can
//! plug in the in-memory versions and the binary the ClickHouse ones.

pub mod clickhouse_db;
pub mod memory;

pub use clickhouse_db::ClickHouseSource;
pub use memory::{CatalogExploration, MemoryCatalog, MemoryInteractionLog, MemoryInterestTags, NoExploration};

use crate::error::Result;
use crate::models::{InteractionEvent, InterestTag, Item};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Ordering for catalogue listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ItemOrder {
    /// Sales count, highest first
    #[default]
    Popularity,
    /// Rating, then review count
    Rating,
    /// Creation time, newest first
    Newest,
    /// Source order
    Unordered,
}

#[derive(Debug, Clone, Default)]
pub struct ItemQuery {
    pub category: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub order: ItemOrder,
    pub limit: usize,
}

impl ItemQuery {
    pub fn popular(limit: usize) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }

    pub fn in_category(category: impl Into<String>, limit: usize) -> Self {
        Self {
            category: Some(category.into()),
            limit,
            ..Default::default()
        }
    }

    pub fn ordered(mut self, order: ItemOrder) -> Self {
        self.order = order;
        self
    }

    pub fn created_after(mut self, after: DateTime<Utc>) -> Self {
        self.created_after = Some(after);
        self
    }
}

/// Item / catalogue lookup
#[async_trait]
pub trait ItemCatalog: Send + Sync {
    async fn get_item(&self, item_id: Uuid) -> Result<Option<Item>>;

    /// Items that exist, in no particular order
    async fn get_items(&self, item_ids: &[Uuid]) -> Result<Vec<Item>>;

    async fn list_items(&self, query: &ItemQuery) -> Result<Vec<Item>>;

    /// Catalogue size used as the coverage denominator
    async fn item_count(&self) -> Result<usize>;
}

/// Interaction-log reader (purchase/cart/view/click/favorite events)
#[async_trait]
pub trait InteractionLog: Send + Sync {
    /// Events of one user at or after `since`, newest first
    async fn user_interactions(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<InteractionEvent>>;

    /// Events on one item at or after `since`
    async fn item_interactions(
        &self,
        item_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<InteractionEvent>>;

    /// Every event at or after `since` (matrix construction)
    async fn interactions_since(&self, since: DateTime<Utc>) -> Result<Vec<InteractionEvent>>;

    /// Users with at least one event at or after `since`, most active first
    async fn active_users(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<Uuid>>;
}

#[async_trait]
pub trait InterestTagSource: Send + Sync {
    async fn interest_tags(&self, user_id: Uuid) -> Result<Vec<InterestTag>>;
}

/// Exploration plug-in (bandit strategies live outside the engine)
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExplorationStrategy: Send + Sync {
    /// Decide whether this request should include exploration items
    fn should_explore(&self, ratio: f64) -> bool;

    async fn exploration_recommendations(
        &self,
        user_id: Uuid,
        known_categories: &[String],
        limit: usize,
    ) -> Result<Vec<Uuid>>;
}
