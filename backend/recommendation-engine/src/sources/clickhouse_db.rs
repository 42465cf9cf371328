// ============================================
// ClickHouse data sources
// ============================================
//
// Catalogue, interaction log and interest tags backed by the analytics
// tables. Ids are stored as strings and parsed on read; rows that fail to
// parse are skipped.

use super::{InteractionLog, InterestTagSource, ItemCatalog, ItemOrder, ItemQuery};
use crate::config::ClickHouseConfig;
use crate::error::{EngineError, Result};
use crate::models::{InteractionEvent, InteractionKind, InterestTag, Item};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use clickhouse::{Client, Row};
use serde::Deserialize;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Hard cap for a full-window scan
const MAX_SCAN_ROWS: usize = 5_000_000;

pub struct ClickHouseSource {
    client: Client,
    database: String,
}

impl ClickHouseSource {
    pub fn new(url: &str, database: &str, username: &str, password: &str) -> Self {
        let client = Client::default()
            .with_url(url)
            .with_database(database)
            .with_user(username)
            .with_password(password);

        info!(url = url, database = database, "ClickHouseSource initialized");

        Self {
            client,
            database: database.to_string(),
        }
    }

    pub fn from_config(config: &ClickHouseConfig) -> Self {
        Self::new(
            &config.url,
            &config.database,
            &config.username,
            &config.password,
        )
    }

    async fn fetch_items(&self, query: clickhouse::query::Query) -> Result<Vec<Item>> {
        let rows: Vec<ItemRow> = query.fetch_all().await.map_err(|e| {
            error!(error = %e, "Failed to fetch items");
            EngineError::from(e)
        })?;
        Ok(rows.into_iter().filter_map(ItemRow::into_item).collect())
    }

    async fn fetch_events(&self, query: clickhouse::query::Query) -> Result<Vec<InteractionEvent>> {
        let rows: Vec<InteractionRow> = query.fetch_all().await.map_err(|e| {
            error!(error = %e, "Failed to fetch interactions");
            EngineError::from(e)
        })?;
        Ok(rows
            .into_iter()
            .filter_map(InteractionRow::into_event)
            .collect())
    }
}

// ============================================
// ClickHouse Row Types
// ============================================

const ITEM_COLUMNS: &str = "item_id, category, merchant_id, brand, origin, price, original_price, \
     rating, sales_count, review_count, stock, is_promoted, tags, embedding, created_at";

#[derive(Debug, Row, Deserialize)]
struct ItemRow {
    item_id: String,
    category: String,
    merchant_id: String,
    brand: Option<String>,
    origin: Option<String>,
    price: f64,
    original_price: f64,
    rating: f64,
    sales_count: u64,
    review_count: u64,
    stock: u64,
    is_promoted: u8,
    tags: Vec<String>,
    embedding: Vec<f64>,
    #[serde(with = "clickhouse::serde::time::datetime")]
    created_at: time::OffsetDateTime,
}

impl ItemRow {
    fn into_item(self) -> Option<Item> {
        let id = Uuid::parse_str(&self.item_id).ok()?;
        Some(Item {
            id,
            category: self.category,
            merchant_id: self.merchant_id,
            brand: self.brand.filter(|b| !b.is_empty()),
            origin: self.origin.filter(|o| !o.is_empty()),
            price: self.price,
            original_price: self.original_price,
            rating: self.rating,
            sales_count: self.sales_count,
            review_count: self.review_count,
            stock: self.stock,
            is_promoted: self.is_promoted != 0,
            tags: self.tags,
            embedding: self.embedding,
            created_at: offset_datetime_to_chrono(self.created_at),
        })
    }
}

#[derive(Debug, Row, Deserialize)]
struct InteractionRow {
    user_id: String,
    item_id: String,
    interaction_type: String,
    #[serde(with = "clickhouse::serde::time::datetime")]
    event_time: time::OffsetDateTime,
}

impl InteractionRow {
    fn into_event(self) -> Option<InteractionEvent> {
        Some(InteractionEvent {
            user_id: Uuid::parse_str(&self.user_id).ok()?,
            item_id: Uuid::parse_str(&self.item_id).ok()?,
            kind: InteractionKind::parse(&self.interaction_type)?,
            occurred_at: offset_datetime_to_chrono(self.event_time),
        })
    }
}

#[derive(Debug, Row, Deserialize)]
struct InterestTagRow {
    tag_type: String,
    tag_value: String,
    weight: f64,
    #[serde(with = "clickhouse::serde::time::datetime")]
    updated_at: time::OffsetDateTime,
}

#[derive(Debug, Row, Deserialize)]
struct ActiveUserRow {
    user_id: String,
    #[allow(dead_code)]
    event_count: u64,
}

#[derive(Debug, Row, Deserialize)]
struct CountRow {
    total: u64,
}

fn order_clause(order: ItemOrder) -> &'static str {
    match order {
        ItemOrder::Popularity => "ORDER BY sales_count DESC, item_id",
        ItemOrder::Rating => "ORDER BY rating DESC, review_count DESC, item_id",
        ItemOrder::Newest => "ORDER BY created_at DESC, item_id",
        ItemOrder::Unordered => "ORDER BY item_id",
    }
}

#[async_trait]
impl ItemCatalog for ClickHouseSource {
    async fn get_item(&self, item_id: Uuid) -> Result<Option<Item>> {
        let items = self.get_items(&[item_id]).await?;
        Ok(items.into_iter().next())
    }

    async fn get_items(&self, item_ids: &[Uuid]) -> Result<Vec<Item>> {
        if item_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = item_ids.iter().map(|id| id.to_string()).collect();
        let sql = format!(
            "SELECT {} FROM {}.items WHERE has(?, item_id)",
            ITEM_COLUMNS, self.database
        );
        debug!(count = ids.len(), "Fetching items from ClickHouse");
        self.fetch_items(self.client.query(&sql).bind(ids)).await
    }

    async fn list_items(&self, query: &ItemQuery) -> Result<Vec<Item>> {
        if query.limit == 0 {
            return Ok(Vec::new());
        }
        let mut sql = format!("SELECT {} FROM {}.items WHERE 1 = 1", ITEM_COLUMNS, self.database);
        if query.category.is_some() {
            sql.push_str(" AND lower(category) = lower(?)");
        }
        if query.created_after.is_some() {
            sql.push_str(" AND created_at >= toDateTime(?)");
        }
        sql.push(' ');
        sql.push_str(order_clause(query.order));
        sql.push_str(" LIMIT ?");

        let mut q = self.client.query(&sql);
        if let Some(category) = &query.category {
            q = q.bind(category.as_str());
        }
        if let Some(after) = query.created_after {
            q = q.bind(after.timestamp());
        }
        q = q.bind(query.limit as u64);
        self.fetch_items(q).await
    }

    async fn item_count(&self) -> Result<usize> {
        let sql = format!("SELECT count() AS total FROM {}.items", self.database);
        let row: CountRow = self.client.query(&sql).fetch_one().await?;
        Ok(row.total as usize)
    }
}

const INTERACTION_COLUMNS: &str = "user_id, item_id, interaction_type, event_time";

#[async_trait]
impl InteractionLog for ClickHouseSource {
    async fn user_interactions(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<InteractionEvent>> {
        let sql = format!(
            "SELECT {} FROM {}.user_interactions \
             WHERE user_id = ? AND event_time >= toDateTime(?) \
             ORDER BY event_time DESC LIMIT 10000",
            INTERACTION_COLUMNS, self.database
        );
        debug!(user_id = %user_id, "Fetching user interactions from ClickHouse");
        self.fetch_events(
            self.client
                .query(&sql)
                .bind(user_id.to_string())
                .bind(since.timestamp()),
        )
        .await
    }

    async fn item_interactions(
        &self,
        item_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<InteractionEvent>> {
        let sql = format!(
            "SELECT {} FROM {}.user_interactions \
             WHERE item_id = ? AND event_time >= toDateTime(?) \
             ORDER BY event_time DESC LIMIT 100000",
            INTERACTION_COLUMNS, self.database
        );
        self.fetch_events(
            self.client
                .query(&sql)
                .bind(item_id.to_string())
                .bind(since.timestamp()),
        )
        .await
    }

    async fn interactions_since(&self, since: DateTime<Utc>) -> Result<Vec<InteractionEvent>> {
        let sql = format!(
            "SELECT {} FROM {}.user_interactions \
             WHERE event_time >= toDateTime(?) \
             LIMIT ?",
            INTERACTION_COLUMNS, self.database
        );
        info!(since = %since, "Scanning interaction window from ClickHouse");
        self.fetch_events(
            self.client
                .query(&sql)
                .bind(since.timestamp())
                .bind(MAX_SCAN_ROWS as u64),
        )
        .await
    }

    async fn active_users(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<Uuid>> {
        let sql = format!(
            "SELECT user_id, count() AS event_count FROM {}.user_interactions \
             WHERE event_time >= toDateTime(?) \
             GROUP BY user_id ORDER BY event_count DESC, user_id LIMIT ?",
            self.database
        );
        let rows: Vec<ActiveUserRow> = self
            .client
            .query(&sql)
            .bind(since.timestamp())
            .bind(limit as u64)
            .fetch_all()
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| Uuid::parse_str(&row.user_id).ok())
            .collect())
    }
}

#[async_trait]
impl InterestTagSource for ClickHouseSource {
    async fn interest_tags(&self, user_id: Uuid) -> Result<Vec<InterestTag>> {
        let sql = format!(
            "SELECT tag_type, tag_value, weight, updated_at FROM {}.user_interest_tags \
             WHERE user_id = ? ORDER BY weight DESC LIMIT 200",
            self.database
        );
        let rows: Vec<InterestTagRow> = self
            .client
            .query(&sql)
            .bind(user_id.to_string())
            .fetch_all()
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| InterestTag {
                tag_type: row.tag_type,
                value: row.tag_value,
                weight: row.weight,
                updated_at: offset_datetime_to_chrono(row.updated_at),
            })
            .collect())
    }
}

fn offset_datetime_to_chrono(dt: time::OffsetDateTime) -> DateTime<Utc> {
    Utc.timestamp_opt(dt.unix_timestamp(), dt.nanosecond())
        .single()
        .unwrap_or_else(Utc::now)
}
