//! Compatibility evaluation.
//!
//! Decides which catalog entries are safe to flash onto a device. When the
//! current firmware version is known, same-or-older versions are refused
//! outright; downgrades are a known source of baseband instability.

use crate::catalog::version::cmp_versions;
use crate::catalog::{FirmwareCatalog, FirmwareRecord, SearchQuery};
use crate::error::Result;
use std::cmp::Ordering;
use std::sync::Arc;

pub struct CompatibilityEvaluator {
    catalog: Arc<FirmwareCatalog>,
}

impl CompatibilityEvaluator {
    pub fn new(catalog: Arc<FirmwareCatalog>) -> Self {
        Self { catalog }
    }

    /// Records from the catalog whose compatibility set names `codename`,
    /// strictly newer than `current_version` when one is supplied, newest
    /// first.
    pub async fn eligible(
        &self,
        codename: &str,
        current_version: Option<&str>,
    ) -> Result<Vec<FirmwareRecord>> {
        let all = self
            .catalog
            .search(&SearchQuery::for_codename(codename))
            .await?
            .records;

        // Search already orders newest first.
        Ok(all
            .into_iter()
            .filter(|r| r.compatibility.contains(codename))
            .filter(|r| {
                current_version
                    .map_or(true, |current| cmp_versions(&r.version, current) == Ordering::Greater)
            })
            .collect())
    }

    /// Whether one specific record may be flashed onto `codename`.
    pub fn record_allows(record: &FirmwareRecord, codename: &str) -> bool {
        record.compatibility.contains(codename)
    }
}
