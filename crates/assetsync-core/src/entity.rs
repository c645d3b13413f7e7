//! Entity catalog.
//!
//! The source root holds one directory per entity and a `_groups/`
//! directory of shared assets:
//!
//! ```text
//! <source_root>/
//!   <entity_id>/            base assets
//!     entity.json           optional descriptor
//!   _groups/<group_key>/    shared group assets
//! ```
//!
//! Directories whose names start with `_` or `.` are never entities.

use crate::config::PathsConfig;
use crate::error::{Result, SyncError};
use crate::manifest::atomic_read_json;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Optional per-entity descriptor (`entity.json`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityDescriptor {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    /// Group keys whose shared assets this entity references.
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// One entity directory under the source root.
#[derive(Debug, Clone)]
pub struct Entity {
    pub id: String,
    pub dir: PathBuf,
    pub descriptor: EntityDescriptor,
}

impl Entity {
    /// Display name, falling back to the id.
    pub fn name(&self) -> &str {
        self.descriptor
            .name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(&self.id)
    }

    /// Manifest metadata: the descriptor map plus `category` when set.
    pub fn metadata(&self) -> BTreeMap<String, String> {
        let mut metadata = self.descriptor.metadata.clone();
        if let Some(category) = &self.descriptor.category {
            metadata
                .entry("category".to_string())
                .or_insert_with(|| category.clone());
        }
        metadata
    }

    /// Referenced group keys, deduplicated and sorted.
    pub fn group_keys(&self) -> Vec<String> {
        self.descriptor
            .groups
            .iter()
            .map(|g| g.trim().to_string())
            .filter(|g| !g.is_empty())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Selection of entities for a run.
#[derive(Debug, Clone, Default)]
pub struct EntityFilter {
    /// Restrict to these ids; empty selects every entity.
    pub ids: BTreeSet<String>,
    /// Cap on the number of selected entities, applied after `ids`.
    pub limit: Option<usize>,
}

impl EntityFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn only<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, entity_id: &str) -> bool {
        self.ids.is_empty() || self.ids.contains(entity_id)
    }

    /// Apply the filter to ids already in sorted order.
    pub fn select<'a>(&self, sorted_ids: &'a [String]) -> Vec<&'a String> {
        let matching = sorted_ids.iter().filter(|id| self.matches(id));
        match self.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        }
    }
}

fn is_reserved_name(name: &str) -> bool {
    name.starts_with('_') || name.starts_with('.')
}

/// A group key must name a single directory below `_groups/`.
pub fn is_valid_group_key(key: &str) -> bool {
    !key.is_empty() && !key.starts_with('.') && !key.contains(['/', '\\'])
}

/// Read-only view of the source root.
#[derive(Debug, Clone)]
pub struct EntityCatalog {
    root: PathBuf,
}

impl EntityCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entity_dir(&self, entity_id: &str) -> PathBuf {
        self.root.join(entity_id)
    }

    pub fn group_dir(&self, group_key: &str) -> PathBuf {
        self.root.join(PathsConfig::GROUPS_DIR_NAME).join(group_key)
    }

    /// Entity ids under the root, sorted.
    ///
    /// Fails with [`SyncError::Access`] when the root cannot be read.
    pub fn list_ids(&self) -> Result<Vec<String>> {
        let entries = std::fs::read_dir(&self.root).map_err(|e| SyncError::Access {
            path: self.root.clone(),
            message: e.to_string(),
            source: Some(e),
        })?;

        let mut ids = Vec::new();
        for entry in entries.flatten() {
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if is_reserved_name(&name) {
                continue;
            }
            ids.push(name);
        }
        ids.sort();
        debug!("Found {} entities under {}", ids.len(), self.root.display());
        Ok(ids)
    }

    /// Open one entity and read its descriptor.
    pub fn load(&self, entity_id: &str) -> Result<Entity> {
        if entity_id.is_empty() || is_reserved_name(entity_id) || entity_id.contains(['/', '\\']) {
            return Err(SyncError::NotFound {
                key: entity_id.to_string(),
            });
        }
        let dir = self.entity_dir(entity_id);
        if !dir.is_dir() {
            return Err(SyncError::NotFound {
                key: entity_id.to_string(),
            });
        }

        let descriptor_path = dir.join(PathsConfig::ENTITY_DESCRIPTOR);
        let descriptor: EntityDescriptor = atomic_read_json(&descriptor_path)?.unwrap_or_default();
        if let Some(bad) = descriptor
            .groups
            .iter()
            .map(|g| g.trim())
            .find(|g| !g.is_empty() && !is_valid_group_key(g))
        {
            return Err(SyncError::per_file(
                descriptor_path,
                format!("invalid group key '{}'", bad),
            ));
        }

        Ok(Entity {
            id: entity_id.to_string(),
            dir,
            descriptor,
        })
    }
}
