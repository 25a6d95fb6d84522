//! Firmware metadata catalog.
//!
//! Answers search/filter/rank queries over the known firmware records for a
//! codename, with every query result cached under the full parameter tuple.

pub mod cache;
pub mod store;
pub mod version;

use crate::error::Result;
use cache::QueryCache;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use store::FirmwareStore;
use version::{cmp_versions, version_matches};

/// One firmware image's metadata. Immutable once fetched; unique by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirmwareRecord {
    pub id: String,
    pub version: String,
    pub codename: String,
    pub region: String,
    pub build_date: NaiveDate,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    pub download_url: String,
    pub is_official: bool,
    /// Codenames this image is safe to install on.
    #[serde(default)]
    pub compatibility: BTreeSet<String>,
    #[serde(default)]
    pub changelog: String,
}

/// Conjunctive search filters; `codename` is the only required one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQuery {
    pub codename: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub version_filter: Option<String>,
    #[serde(default)]
    pub official_only: bool,
}

impl SearchQuery {
    pub fn for_codename(codename: impl Into<String>) -> Self {
        Self { codename: codename.into(), region: None, version_filter: None, official_only: false }
    }

    fn cache_key(&self) -> String {
        format!(
            "search:{}:{}:{}:{}",
            self.codename,
            self.region.as_deref().unwrap_or("*"),
            self.version_filter.as_deref().unwrap_or("*"),
            self.official_only
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub records: Vec<FirmwareRecord>,
    pub total_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateCheck {
    pub has_update: bool,
    pub latest: Option<FirmwareRecord>,
}

pub struct FirmwareCatalog {
    store: Arc<dyn FirmwareStore>,
    cache: QueryCache,
    /// Serializes check-then-populate so concurrent misses do not race the
    /// same fetch.
    fetch_lock: tokio::sync::Mutex<()>,
    http: reqwest::Client,
}

impl FirmwareCatalog {
    pub fn new(store: Arc<dyn FirmwareStore>, cache_ttl: Duration) -> Self {
        Self {
            store,
            cache: QueryCache::new(cache_ttl),
            fetch_lock: tokio::sync::Mutex::new(()),
            http: reqwest::Client::new(),
        }
    }

    pub fn initialize_cache(&self) {
        self.cache.initialize();
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Conjunctive filter over the codename's records, newest version first.
    /// No match is an empty result, not an error.
    pub async fn search(&self, query: &SearchQuery) -> Result<SearchResult> {
        let key = query.cache_key();
        if let Some(hit) = self.cache.get::<SearchResult>(&key) {
            return Ok(hit);
        }

        let _guard = self.fetch_lock.lock().await;
        if let Some(hit) = self.cache.get::<SearchResult>(&key) {
            return Ok(hit);
        }

        let mut records: Vec<FirmwareRecord> = self
            .store
            .records_for(&query.codename)
            .await?
            .into_iter()
            .filter(|r| query.region.as_deref().is_none_or(|region| r.region == region))
            .filter(|r| {
                query
                    .version_filter
                    .as_deref()
                    .is_none_or(|f| version_matches(&r.version, f))
            })
            .filter(|r| !query.official_only || r.is_official)
            .collect();
        records.sort_by(|a, b| cmp_versions(&b.version, &a.version));

        let result = SearchResult { total_count: records.len(), records };
        self.cache.put(&key, &result);
        Ok(result)
    }

    /// Maximum of the filtered set under the structured version order.
    pub async fn latest(&self, codename: &str, official_only: bool) -> Result<Option<FirmwareRecord>> {
        let mut query = SearchQuery::for_codename(codename);
        query.official_only = official_only;
        // Search sorts newest first.
        Ok(self.search(&query).await?.records.into_iter().next())
    }

    /// Deterministic "popular" ranking: build date descending, ties broken
    /// by version descending. A non-positive limit yields no results.
    pub async fn popular(&self, codename: &str, limit: i64) -> Result<Vec<FirmwareRecord>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }
        let key = format!("popular:{codename}:{limit}");
        if let Some(hit) = self.cache.get::<Vec<FirmwareRecord>>(&key) {
            return Ok(hit);
        }

        let mut records = self.search(&SearchQuery::for_codename(codename)).await?.records;
        records.sort_by(|a, b| {
            b.build_date
                .cmp(&a.build_date)
                .then_with(|| cmp_versions(&b.version, &a.version))
        });
        records.truncate(limit as usize);
        self.cache.put(&key, &records);
        Ok(records)
    }

    /// True iff a latest record exists and orders strictly greater than
    /// `current_version`.
    pub async fn check_for_updates(
        &self,
        current_version: &str,
        codename: &str,
    ) -> Result<UpdateCheck> {
        let latest = self.latest(codename, false).await?;
        let has_update = latest
            .as_ref()
            .is_some_and(|r| cmp_versions(&r.version, current_version) == Ordering::Greater);
        Ok(UpdateCheck { has_update, latest })
    }

    /// Non-destructive reachability probe: metadata-only request, no body
    /// download. Network failures resolve to `false`, never an error.
    pub async fn validate_firmware_url(&self, url: &str) -> bool {
        match self.http.head(url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                log::debug!("firmware url probe failed for {url}: {e}");
                false
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::store::MemoryStore;
    use super::test_fixtures::record;
    use super::*;

    fn catalog(records: Vec<FirmwareRecord>) -> FirmwareCatalog {
        FirmwareCatalog::new(Arc::new(MemoryStore::new(records)), Duration::from_secs(60))
    }

    fn guacamole_set() -> Vec<FirmwareRecord> {
        let mut eu_official_1 = record("fw-1", "guacamole", "11.0");
        eu_official_1.region = "EU".to_string();
        let mut eu_official_2 = record("fw-2", "guacamole", "11.1");
        eu_official_2.region = "EU".to_string();
        let mut eu_official_3 = record("fw-3", "guacamole", "12.0");
        eu_official_3.region = "EU".to_string();
        let mut eu_unofficial_1 = record("fw-4", "guacamole", "12.1");
        eu_unofficial_1.region = "EU".to_string();
        eu_unofficial_1.is_official = false;
        let mut eu_unofficial_2 = record("fw-5", "guacamole", "12.2");
        eu_unofficial_2.region = "EU".to_string();
        eu_unofficial_2.is_official = false;
        let mut us_official = record("fw-6", "guacamole", "12.0");
        us_official.region = "US".to_string();
        vec![
            eu_official_1,
            eu_official_2,
            eu_official_3,
            eu_unofficial_1,
            eu_unofficial_2,
            us_official,
        ]
    }

    #[tokio::test]
    async fn test_search_conjunctive_filters() {
        let catalog = catalog(guacamole_set());
        let result = catalog
            .search(&SearchQuery {
                codename: "guacamole".to_string(),
                region: Some("EU".to_string()),
                version_filter: None,
                official_only: true,
            })
            .await
            .unwrap();
        assert_eq!(result.total_count, 3);
        let ids: Vec<&str> = result.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["fw-3", "fw-2", "fw-1"]);
    }

    #[tokio::test]
    async fn test_search_no_match_is_empty() {
        let catalog = catalog(guacamole_set());
        let result = catalog
            .search(&SearchQuery::for_codename("unknown"))
            .await
            .unwrap();
        assert_eq!(result.total_count, 0);
        assert!(result.records.is_empty());
    }

    #[tokio::test]
    async fn test_search_version_filter_is_substring() {
        let catalog = catalog(guacamole_set());
        let mut query = SearchQuery::for_codename("guacamole");
        query.version_filter = Some("12.".to_string());
        let result = catalog.search(&query).await.unwrap();
        assert_eq!(result.total_count, 4); // 12.0 EU, 12.1, 12.2 and 12.0 US share the prefix
        assert!(result.records.iter().all(|r| r.version.starts_with("12.")));
    }

    #[tokio::test]
    async fn test_latest_uses_structured_order() {
        let mut records = guacamole_set();
        records.push(record("fw-13-2", "guacamole", "13.2"));
        records.push(record("fw-13-10", "guacamole", "13.10"));
        let catalog = catalog(records);
        let latest = catalog.latest("guacamole", false).await.unwrap().unwrap();
        assert_eq!(latest.id, "fw-13-10");
    }

    #[tokio::test]
    async fn test_popular_ranks_by_build_date_then_version() {
        let mut a = record("fw-a", "guacamole", "11.0");
        a.build_date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let mut b = record("fw-b", "guacamole", "11.1");
        b.build_date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let mut c = record("fw-c", "guacamole", "12.0");
        c.build_date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let catalog = catalog(vec![a, b, c]);

        let top = catalog.popular("guacamole", 2).await.unwrap();
        let ids: Vec<&str> = top.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["fw-b", "fw-a"]);

        assert!(catalog.popular("guacamole", 0).await.unwrap().is_empty());
        assert!(catalog.popular("guacamole", -3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_check_for_updates_strictly_greater() {
        let catalog = catalog(guacamole_set());
        let check = catalog.check_for_updates("13.1", "guacamole").await.unwrap();
        assert!(!check.has_update);

        let check = catalog.check_for_updates("11.0", "guacamole").await.unwrap();
        assert!(check.has_update);
        assert_eq!(check.latest.unwrap().version, "12.2");

        // Equal to latest: no update.
        let check = catalog.check_for_updates("12.2", "guacamole").await.unwrap();
        assert!(!check.has_update);
    }

    #[tokio::test]
    async fn test_search_results_are_cached() {
        let catalog = catalog(guacamole_set());
        let query = SearchQuery::for_codename("guacamole");
        let first = catalog.search(&query).await.unwrap();
        let second = catalog.search(&query).await.unwrap();
        assert_eq!(first.total_count, second.total_count);
        catalog.clear_cache();
        let third = catalog.search(&query).await.unwrap();
        assert_eq!(first.total_count, third.total_count);
    }

    #[tokio::test]
    async fn test_validate_firmware_url_failure_is_false() {
        let catalog = catalog(Vec::new());
        assert!(!catalog.validate_firmware_url("http://127.0.0.1:1/nothing").await);
        assert!(!catalog.validate_firmware_url("not a url").await);
    }
}
