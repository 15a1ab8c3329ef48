//! Source adapter contracts + the RAWG metadata and CheapShark price adapters.

use async_trait::async_trait;
use chrono::NaiveDate;
use gcr_core::{MetadataRecord, PriceRecord};
use gcr_storage::{classify_status, HttpClientConfig, LinearBackoff, RetryDisposition};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "gcr-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("http status {status} for {url}")]
    Upstream { status: u16, url: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("undecodable payload from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetadataPage {
    pub records: Vec<MetadataRecord>,
    pub has_next_page: bool,
}

/// Why a price lookup produced nothing. Never fatal to a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoMatchReason {
    EmptyResults,
    NoCandidate,
    MissingPrice,
    RateLimited { attempts: u32 },
    HttpStatus(u16),
    Transport(String),
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PriceLookup {
    Matched(PriceRecord),
    NoMatch(NoMatchReason),
}

#[async_trait]
pub trait MetadataSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_page(&self, page_size: u32, page: u32) -> Result<MetadataPage, AdapterError>;
}

#[async_trait]
pub trait PriceSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Paced, throttle-aware lookup. Every failure mode folds into `NoMatch`.
    async fn fetch_price(&self, name: &str) -> PriceLookup;
}

#[derive(Debug, Clone)]
pub struct RawgConfig {
    pub base_url: String,
    pub api_key: String,
}

impl Default for RawgConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.rawg.io/api".to_string(),
            api_key: String::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawgListResponse {
    next: Option<String>,
    #[serde(default)]
    results: Vec<RawgGameRow>,
}

#[derive(Debug, Deserialize)]
struct RawgGameRow {
    id: i64,
    slug: String,
    name: String,
    released: Option<String>,
    genres: Option<Vec<RawgNamed>>,
    rating: Option<f64>,
    ratings_count: Option<i64>,
    metacritic: Option<i64>,
    background_image: Option<String>,
    platforms: Option<Vec<RawgPlatformEntry>>,
}

#[derive(Debug, Deserialize)]
struct RawgNamed {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RawgPlatformEntry {
    platform: Option<RawgNamed>,
}

impl From<RawgGameRow> for MetadataRecord {
    fn from(row: RawgGameRow) -> Self {
        let released = row
            .released
            .as_deref()
            .and_then(|text| NaiveDate::parse_from_str(text, "%Y-%m-%d").ok());
        let genre = row
            .genres
            .and_then(|genres| genres.into_iter().next())
            .map(|g| g.name);
        let platforms = row
            .platforms
            .unwrap_or_default()
            .into_iter()
            .filter_map(|entry| entry.platform.map(|p| p.name))
            .collect();

        MetadataRecord {
            external_id: row.id,
            slug: row.slug,
            name: row.name,
            released,
            genre,
            rating: row.rating,
            ratings_count: row.ratings_count,
            metacritic: row.metacritic,
            background_image: row.background_image,
            platforms,
        }
    }
}

pub struct RawgAdapter {
    client: reqwest::Client,
    config: RawgConfig,
}

impl RawgAdapter {
    pub fn new(config: RawgConfig, http: &HttpClientConfig) -> Result<Self, AdapterError> {
        Ok(Self {
            client: http.build_client()?,
            config,
        })
    }
}

#[async_trait]
impl MetadataSource for RawgAdapter {
    fn source_id(&self) -> &'static str {
        "rawg"
    }

    async fn fetch_page(&self, page_size: u32, page: u32) -> Result<MetadataPage, AdapterError> {
        let url = format!("{}/games", self.config.base_url.trim_end_matches('/'));
        let page_size = page_size.to_string();
        let page = page.to_string();

        let resp = self
            .client
            .get(&url)
            .query(&[
                ("key", self.config.api_key.as_str()),
                ("page_size", page_size.as_str()),
                ("ordering", "-added"),
                ("page", page.as_str()),
            ])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(AdapterError::Upstream {
                status: status.as_u16(),
                url,
            });
        }

        let body = resp.bytes().await?;
        let parsed: RawgListResponse =
            serde_json::from_slice(&body).map_err(|source| AdapterError::Decode {
                url: url.clone(),
                source,
            })?;

        debug!(page = %page, results = parsed.results.len(), "rawg page fetched");
        Ok(MetadataPage {
            has_next_page: parsed.next.is_some(),
            records: parsed.results.into_iter().map(MetadataRecord::from).collect(),
        })
    }
}

/// Lowercase, blank out `:,-'"!?.`, collapse whitespace. Apply to both sides of a comparison.
pub fn normalize_name(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if ":,-'\"!?.".contains(c) { ' ' } else { c })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// One entry of the CheapShark `/games` lookup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheapSharkGame {
    #[serde(default)]
    pub external: Option<String>,
    #[serde(default)]
    pub cheapest: Option<JsonValue>,
    #[serde(default, rename = "gameID")]
    pub game_id: Option<JsonValue>,
}

impl CheapSharkGame {
    fn normalized_name(&self) -> String {
        normalize_name(self.external.as_deref().unwrap_or_default())
    }

    fn cheapest_price(&self) -> Option<f64> {
        let price = match self.cheapest.as_ref()? {
            JsonValue::String(text) => text.trim().parse::<f64>().ok()?,
            JsonValue::Number(number) => number.as_f64()?,
            _ => return None,
        };
        (price.is_finite() && price >= 0.0).then_some(price)
    }

    fn game_id_text(&self) -> String {
        match &self.game_id {
            Some(JsonValue::String(text)) => text.clone(),
            Some(JsonValue::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchTier {
    Exact,
    Superset,
    Majority,
}

/// Tiered match: the first tier with any hit wins, and within a tier the
/// first candidate in provider order wins.
pub fn best_match<'a>(
    results: &'a [CheapSharkGame],
    query: &str,
) -> Option<(&'a CheapSharkGame, MatchTier)> {
    let query_norm = normalize_name(query);
    let query_words = query_norm
        .split(' ')
        .filter(|w| w.chars().count() > 1)
        .collect::<Vec<_>>();
    let names = results
        .iter()
        .map(CheapSharkGame::normalized_name)
        .collect::<Vec<_>>();

    if let Some(idx) = names.iter().position(|name| *name == query_norm) {
        return Some((&results[idx], MatchTier::Exact));
    }

    if query_words.is_empty() {
        return None;
    }

    // substring containment, so "war" also hits "warframe"
    let hits = |name: &str| query_words.iter().filter(|w| name.contains(*w)).count();

    if let Some(idx) = names.iter().position(|name| hits(name.as_str()) == query_words.len()) {
        return Some((&results[idx], MatchTier::Superset));
    }

    names
        .iter()
        .position(|name| hits(name.as_str()) * 2 > query_words.len())
        .map(|idx| (&results[idx], MatchTier::Majority))
}

/// Pick a price for `query` out of one lookup response.
pub fn match_price(query: &str, results: &[CheapSharkGame]) -> PriceLookup {
    if results.is_empty() {
        return PriceLookup::NoMatch(NoMatchReason::EmptyResults);
    }
    let Some((best, tier)) = best_match(results, query) else {
        debug!(query = %normalize_name(query), "no candidate in any tier");
        return PriceLookup::NoMatch(NoMatchReason::NoCandidate);
    };
    let Some(price_cheap) = best.cheapest_price() else {
        return PriceLookup::NoMatch(NoMatchReason::MissingPrice);
    };

    debug!(query, matched = ?best.external, ?tier, "price matched");
    PriceLookup::Matched(PriceRecord {
        cheapshark_game_id: best.game_id_text(),
        price_cheap,
        price_external: None,
    })
}

#[derive(Debug, Clone)]
pub struct CheapSharkConfig {
    pub base_url: String,
    /// Slept before every lookup, whatever its outcome.
    pub request_delay: std::time::Duration,
    pub backoff: LinearBackoff,
}

impl Default for CheapSharkConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.cheapshark.com/api/1.0".to_string(),
            request_delay: std::time::Duration::from_secs(1),
            backoff: LinearBackoff::default(),
        }
    }
}

pub struct CheapSharkAdapter {
    client: reqwest::Client,
    config: CheapSharkConfig,
}

impl CheapSharkAdapter {
    pub fn new(config: CheapSharkConfig, http: &HttpClientConfig) -> Result<Self, AdapterError> {
        Ok(Self {
            client: http.build_client()?,
            config,
        })
    }
}

#[async_trait]
impl PriceSource for CheapSharkAdapter {
    fn source_id(&self) -> &'static str {
        "cheapshark"
    }

    async fn fetch_price(&self, name: &str) -> PriceLookup {
        tokio::time::sleep(self.config.request_delay).await;

        let title = name.trim();
        let url = format!("{}/games", self.config.base_url.trim_end_matches('/'));
        let max_attempts = self.config.backoff.max_retries.max(1);

        for attempt in 1..=max_attempts {
            let resp = match self
                .client
                .get(&url)
                .query(&[("title", title), ("limit", "20")])
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(err) => {
                    warn!(name, error = %err, "price lookup request failed");
                    return PriceLookup::NoMatch(NoMatchReason::Transport(err.to_string()));
                }
            };

            let status = resp.status();
            if classify_status(status) == RetryDisposition::Retryable {
                let wait = self.config.backoff.delay_for_attempt(attempt);
                warn!(
                    name,
                    attempt,
                    max_attempts,
                    wait_ms = wait.as_millis() as u64,
                    "price source rate limited, backing off"
                );
                tokio::time::sleep(wait).await;
                continue;
            }
            if !status.is_success() {
                warn!(name, status = status.as_u16(), "price lookup failed");
                return PriceLookup::NoMatch(NoMatchReason::HttpStatus(status.as_u16()));
            }

            let body = match resp.bytes().await {
                Ok(body) => body,
                Err(err) => {
                    warn!(name, error = %err, "reading price lookup body failed");
                    return PriceLookup::NoMatch(NoMatchReason::Transport(err.to_string()));
                }
            };
            return match serde_json::from_slice::<Vec<CheapSharkGame>>(&body) {
                Ok(results) => match_price(title, &results),
                Err(err) => {
                    warn!(name, error = %err, "malformed price lookup payload");
                    PriceLookup::NoMatch(NoMatchReason::Malformed(err.to_string()))
                }
            };
        }

        warn!(name, max_attempts, "max retries reached, skipping");
        PriceLookup::NoMatch(NoMatchReason::RateLimited {
            attempts: max_attempts,
        })
    }
}
