// ============================================
// In-memory data sources
// ============================================
//
// Used by tests and local runs. Concurrent maps so the same source can be
// written by a test while the engine reads it.

use super::{ExplorationStrategy, InteractionLog, InterestTagSource, ItemCatalog, ItemOrder, ItemQuery};
use crate::error::Result;
use crate::models::{InteractionEvent, InterestTag, Item};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Default)]
pub struct MemoryCatalog {
    items: DashMap<Uuid, Item>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, item: Item) {
        self.items.insert(item.id, item);
    }

    pub fn extend(&self, items: impl IntoIterator<Item = Item>) {
        for item in items {
            self.insert(item);
        }
    }
}

fn sort_items(items: &mut [Item], order: ItemOrder) {
    match order {
        ItemOrder::Popularity => items.sort_by(|a, b| {
            b.sales_count
                .cmp(&a.sales_count)
                .then_with(|| a.id.cmp(&b.id))
        }),
        ItemOrder::Rating => items.sort_by(|a, b| {
            b.rating
                .partial_cmp(&a.rating)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.review_count.cmp(&a.review_count))
                .then_with(|| a.id.cmp(&b.id))
        }),
        ItemOrder::Newest => items.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        }),
        ItemOrder::Unordered => items.sort_by_key(|item| item.id),
    }
}

#[async_trait]
impl ItemCatalog for MemoryCatalog {
    async fn get_item(&self, item_id: Uuid) -> Result<Option<Item>> {
        Ok(self.items.get(&item_id).map(|item| item.clone()))
    }

    async fn get_items(&self, item_ids: &[Uuid]) -> Result<Vec<Item>> {
        Ok(item_ids
            .iter()
            .filter_map(|id| self.items.get(id).map(|item| item.clone()))
            .collect())
    }

    async fn list_items(&self, query: &ItemQuery) -> Result<Vec<Item>> {
        let mut items: Vec<Item> = self
            .items
            .iter()
            .filter(|entry| {
                let item = entry.value();
                query
                    .category
                    .as_ref()
                    .map_or(true, |c| item.category.eq_ignore_ascii_case(c))
                    && query.created_after.map_or(true, |after| item.created_at >= after)
            })
            .map(|entry| entry.value().clone())
            .collect();

        sort_items(&mut items, query.order);
        items.truncate(query.limit);
        Ok(items)
    }

    async fn item_count(&self) -> Result<usize> {
        Ok(self.items.len())
    }
}

/// Events keyed by user
#[derive(Default)]
pub struct MemoryInteractionLog {
    events: DashMap<Uuid, Vec<InteractionEvent>>,
}

impl MemoryInteractionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: InteractionEvent) {
        self.events.entry(event.user_id).or_default().push(event);
    }

    pub fn extend(&self, events: impl IntoIterator<Item = InteractionEvent>) {
        for event in events {
            self.record(event);
        }
    }

    fn collect<F>(&self, keep: F) -> Vec<InteractionEvent>
    where
        F: Fn(&InteractionEvent) -> bool,
    {
        let mut out: Vec<InteractionEvent> = self
            .events
            .iter()
            .flat_map(|entry| {
                entry
                    .value()
                    .iter()
                    .filter(|e| keep(*e))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        out.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));
        out
    }
}

#[async_trait]
impl InteractionLog for MemoryInteractionLog {
    async fn user_interactions(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<InteractionEvent>> {
        let mut events: Vec<InteractionEvent> = self
            .events
            .get(&user_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.occurred_at >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        events.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));
        Ok(events)
    }

    async fn item_interactions(
        &self,
        item_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<InteractionEvent>> {
        Ok(self.collect(|e| e.item_id == item_id && e.occurred_at >= since))
    }

    async fn interactions_since(&self, since: DateTime<Utc>) -> Result<Vec<InteractionEvent>> {
        Ok(self.collect(|e| e.occurred_at >= since))
    }

    async fn active_users(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<Uuid>> {
        let mut counts: Vec<(Uuid, usize)> = self
            .events
            .iter()
            .map(|entry| {
                let n = entry.value().iter().filter(|e| e.occurred_at >= since).count();
                (*entry.key(), n)
            })
            .filter(|(_, n)| *n > 0)
            .collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        Ok(counts.into_iter().take(limit).map(|(id, _)| id).collect())
    }
}

#[derive(Default)]
pub struct MemoryInterestTags {
    tags: DashMap<Uuid, Vec<InterestTag>>,
}

impl MemoryInterestTags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, user_id: Uuid, tags: Vec<InterestTag>) {
        self.tags.insert(user_id, tags);
    }
}

#[async_trait]
impl InterestTagSource for MemoryInterestTags {
    async fn interest_tags(&self, user_id: Uuid) -> Result<Vec<InterestTag>> {
        Ok(self
            .tags
            .get(&user_id)
            .map(|tags| tags.clone())
            .unwrap_or_default())
    }
}

/// Strategy that never explores
#[derive(Debug, Default, Clone, Copy)]
pub struct NoExploration;

#[async_trait]
impl ExplorationStrategy for NoExploration {
    fn should_explore(&self, _ratio: f64) -> bool {
        false
    }

    async fn exploration_recommendations(
        &self,
        _user_id: Uuid,
        _known_categories: &[String],
        _limit: usize,
    ) -> Result<Vec<Uuid>> {
        Ok(Vec::new())
    }
}

/// Candidate pool scanned for unfamiliar categories
const EXPLORATION_POOL: usize = 500;

/// Random items from categories the user has not shown interest in
pub struct CatalogExploration {
    catalog: Arc<dyn ItemCatalog>,
    rng: Mutex<StdRng>,
}

impl CatalogExploration {
    pub fn new(catalog: Arc<dyn ItemCatalog>, seed: u64) -> Self {
        Self {
            catalog,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

#[async_trait]
impl ExplorationStrategy for CatalogExploration {
    fn should_explore(&self, ratio: f64) -> bool {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        rng.gen::<f64>() < ratio
    }

    async fn exploration_recommendations(
        &self,
        _user_id: Uuid,
        known_categories: &[String],
        limit: usize,
    ) -> Result<Vec<Uuid>> {
        let known: HashSet<String> = known_categories.iter().map(|c| c.to_lowercase()).collect();
        let pool = self
            .catalog
            .list_items(&ItemQuery::popular(EXPLORATION_POOL).ordered(ItemOrder::Unordered))
            .await?;

        // One item per unfamiliar category first, so the slate spans categories
        let mut by_category: HashMap<String, Vec<Uuid>> = HashMap::new();
        for item in pool {
            let category = item.category.to_lowercase();
            if !known.contains(&category) {
                by_category.entry(category).or_default().push(item.id);
            }
        }

        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut categories: Vec<Vec<Uuid>> = by_category.into_values().collect();
        categories.sort_by_key(|ids| ids.first().copied());
        categories.shuffle(&mut *rng);
        for ids in categories.iter_mut() {
            ids.shuffle(&mut *rng);
        }

        let mut picked = Vec::with_capacity(limit);
        let mut round = 0;
        while picked.len() < limit {
            let mut progressed = false;
            for ids in &categories {
                if let Some(id) = ids.get(round) {
                    picked.push(*id);
                    progressed = true;
                    if picked.len() == limit {
                        break;
                    }
                }
            }
            if !progressed {
                break;
            }
            round += 1;
        }
        Ok(picked)
    }
}
