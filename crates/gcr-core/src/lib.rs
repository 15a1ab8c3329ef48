//! Core domain model for the game catalog reconciler.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "gcr-core";

/// Source tag written on every audit row produced by the reconciliation pipeline.
pub const SYNC_SOURCE: &str = "rawg+cheapshark";

/// Descriptive record from the metadata provider, keyed by the provider-assigned id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub external_id: i64,
    pub slug: String,
    pub name: String,
    pub released: Option<NaiveDate>,
    pub genre: Option<String>,
    pub rating: Option<f64>,
    pub ratings_count: Option<i64>,
    pub metacritic: Option<i64>,
    pub background_image: Option<String>,
    pub platforms: Vec<String>,
}

/// Price picked from the pricing provider for one metadata record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRecord {
    pub cheapshark_game_id: String,
    pub price_cheap: f64,
    pub price_external: Option<f64>,
}

/// Metadata + price, the unit handed to the upsert engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedItem {
    pub external_id: i64,
    pub slug: String,
    pub name: String,
    pub released: Option<NaiveDate>,
    pub genre: Option<String>,
    pub rating: Option<f64>,
    pub ratings_count: Option<i64>,
    pub metacritic: Option<i64>,
    pub background_image: Option<String>,
    pub platforms: Vec<String>,
    pub cheapshark_game_id: String,
    pub price_cheap: f64,
    pub price_external: Option<f64>,
}

impl MergedItem {
    /// Field union of both records. The two field sets are disjoint, so nothing is overridden.
    pub fn merge(meta: MetadataRecord, price: PriceRecord) -> Self {
        Self {
            external_id: meta.external_id,
            slug: meta.slug,
            name: meta.name,
            released: meta.released,
            genre: meta.genre,
            rating: meta.rating,
            ratings_count: meta.ratings_count,
            metacritic: meta.metacritic,
            background_image: meta.background_image,
            platforms: meta.platforms,
            cheapshark_game_id: price.cheapshark_game_id,
            price_cheap: price.price_cheap,
            price_external: price.price_external,
        }
    }
}

/// Persisted catalog row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredItem {
    #[serde(flatten)]
    pub item: MergedItem,
    pub fetched_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Success,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Success => "success",
            SyncStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(SyncStatus::Success),
            "error" => Some(SyncStatus::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCounts {
    pub fetched: u64,
    pub inserted: u64,
    pub updated: u64,
    pub skipped: u64,
}

impl SyncCounts {
    /// `fetched == inserted + updated + skipped`, which every successful run must satisfy.
    pub fn is_balanced(&self) -> bool {
        self.fetched == self.inserted + self.updated + self.skipped
    }
}

/// One append-only row per pipeline invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncAuditRecord {
    pub id: i64,
    pub source: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub records_fetched: u64,
    pub records_inserted: u64,
    pub records_updated: u64,
    pub records_skipped: u64,
    pub status: SyncStatus,
    pub message: Option<String>,
}

impl SyncAuditRecord {
    pub fn counts(&self) -> SyncCounts {
        SyncCounts {
            fetched: self.records_fetched,
            inserted: self.records_inserted,
            updated: self.records_updated,
            skipped: self.records_skipped,
        }
    }
}
