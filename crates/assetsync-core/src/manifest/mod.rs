//! Entity manifests.
//!
//! This module provides:
//! - The manifest schema ([`EntityManifest`]) with derived statistics
//! - [`ManifestBuilder`] for deterministic manifest construction
//! - [`ManifestStore`] for atomic persistence and tolerant reads

pub(crate) mod atomic;
mod builder;
mod store;

pub use atomic::{atomic_read_json, atomic_write_json};
pub use builder::ManifestBuilder;
pub use store::ManifestStore;

use crate::scanner::{AssetKind, AssetRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Schema version written by this build.
pub const MANIFEST_SCHEMA_VERSION: u32 = 2;

/// A shared asset referenced through its group key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupedAsset {
    pub group_key: String,
    pub asset: AssetRecord,
}

/// Totals derived from a manifest's asset lists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestStatistics {
    pub total_files: u64,
    pub total_size_bytes: u64,
    #[serde(default)]
    pub per_group_counts: BTreeMap<String, u64>,
    #[serde(default)]
    pub per_kind_counts: BTreeMap<AssetKind, u64>,
}

impl ManifestStatistics {
    /// Compute statistics from asset lists. The only way statistics are made.
    pub fn compute(base_assets: &[AssetRecord], grouped_assets: &[GroupedAsset]) -> Self {
        let mut stats = ManifestStatistics::default();
        let all = base_assets
            .iter()
            .chain(grouped_assets.iter().map(|g| &g.asset));
        for asset in all {
            stats.total_files += 1;
            stats.total_size_bytes += asset.size_bytes;
            *stats.per_kind_counts.entry(asset.kind).or_insert(0) += 1;
        }
        for grouped in grouped_assets {
            *stats
                .per_group_counts
                .entry(grouped.group_key.clone())
                .or_insert(0) += 1;
        }
        stats
    }
}

fn legacy_schema_version() -> u32 {
    1
}

/// Persisted record of one entity's assets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityManifest {
    #[serde(default = "legacy_schema_version")]
    pub schema_version: u32,
    pub entity_id: String,
    #[serde(default)]
    pub entity_name: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub base_assets: Vec<AssetRecord>,
    #[serde(default)]
    pub grouped_assets: Vec<GroupedAsset>,
    #[serde(default)]
    pub statistics: ManifestStatistics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<DateTime<Utc>>,
}

impl EntityManifest {
    /// Whether the stored statistics match the asset lists.
    pub fn statistics_consistent(&self) -> bool {
        self.statistics == ManifestStatistics::compute(&self.base_assets, &self.grouped_assets)
    }

    /// Fill defaults that older schema versions did not carry.
    pub(crate) fn normalize(mut self) -> Self {
        if self.entity_name.is_empty() {
            self.entity_name = self.entity_id.clone();
        }
        self.statistics = ManifestStatistics::compute(&self.base_assets, &self.grouped_assets);
        self
    }
}
