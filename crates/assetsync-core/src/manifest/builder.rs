//! Deterministic manifest construction.

use super::{EntityManifest, GroupedAsset, ManifestStatistics, MANIFEST_SCHEMA_VERSION};
use crate::scanner::AssetRecord;
use std::collections::BTreeMap;

/// Builds manifests from scanned assets.
///
/// Output depends only on the inputs: assets are sorted by relative path
/// (grouped assets by group key first), metadata is key-ordered, and
/// statistics are computed fresh. Asset timestamps are kept verbatim.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManifestBuilder;

impl ManifestBuilder {
    pub fn new() -> Self {
        Self
    }

    pub fn build(
        &self,
        entity_id: &str,
        entity_name: &str,
        mut base_assets: Vec<AssetRecord>,
        mut grouped_assets: Vec<GroupedAsset>,
        metadata: impl IntoIterator<Item = (String, String)>,
    ) -> EntityManifest {
        base_assets.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        grouped_assets.sort_by(|a, b| {
            a.group_key
                .cmp(&b.group_key)
                .then_with(|| a.asset.relative_path.cmp(&b.asset.relative_path))
        });

        let statistics = ManifestStatistics::compute(&base_assets, &grouped_assets);
        let name = if entity_name.is_empty() {
            entity_id
        } else {
            entity_name
        };

        EntityManifest {
            schema_version: MANIFEST_SCHEMA_VERSION,
            entity_id: entity_id.to_string(),
            entity_name: name.to_string(),
            metadata: metadata.into_iter().collect::<BTreeMap<_, _>>(),
            base_assets,
            grouped_assets,
            statistics,
            generated_at: None,
        }
    }
}
