//! Sync state classification.
//!
//! [`resolve`] joins local and remote records by logical identity and
//! classifies each identity exactly once. Equality is decided by content
//! fingerprint only; a remote object with the same name but unknown or
//! composite integrity is `Unverified`, never `Synced`.

use crate::fingerprint::FingerprintKind;
use crate::remote::RemoteObjectRecord;
use crate::scanner::AssetRecord;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::warn;

/// Relationship between the local and remote copy of one asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncState {
    /// Local only.
    Missing,
    /// Remote only.
    Absent,
    /// Both present, fingerprints equal.
    Synced,
    /// Both present, fingerprints differ.
    Drifted,
    /// Both present, fingerprints not comparable yet.
    Unverified,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Missing => "missing",
            SyncState::Absent => "absent",
            SyncState::Synced => "synced",
            SyncState::Drifted => "drifted",
            SyncState::Unverified => "unverified",
        }
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One classified identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedAsset {
    pub identity: String,
    pub state: SyncState,
    #[serde(default)]
    pub local: Option<AssetRecord>,
    #[serde(default)]
    pub remote: Option<RemoteObjectRecord>,
}

/// Derives the logical identity of local and remote records.
pub trait IdentityFn {
    fn local_identity(&self, record: &AssetRecord) -> String;
    fn remote_identity(&self, record: &RemoteObjectRecord) -> String;
}

/// Identity by relative path; remote keys are taken relative to `prefix`.
#[derive(Debug, Clone, Default)]
pub struct PrefixIdentity {
    prefix: String,
}

impl PrefixIdentity {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: normalize_identity(&prefix.into()),
        }
    }
}

impl IdentityFn for PrefixIdentity {
    fn local_identity(&self, record: &AssetRecord) -> String {
        normalize_identity(&record.relative_path)
    }

    fn remote_identity(&self, record: &RemoteObjectRecord) -> String {
        let key = normalize_identity(&record.key);
        if self.prefix.is_empty() {
            return key;
        }
        match key.strip_prefix(&self.prefix) {
            Some(rest) if rest.starts_with('/') => rest[1..].to_string(),
            _ => key,
        }
    }
}

/// Normalize a relative path or key: `\` becomes `/`, empty and `.`
/// segments are dropped. Case is preserved.
pub fn normalize_identity(raw: &str) -> String {
    raw.replace('\\', "/")
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}

fn classify(local: &AssetRecord, remote: &RemoteObjectRecord) -> SyncState {
    if remote.fingerprint_kind == FingerprintKind::Composite {
        return SyncState::Unverified;
    }
    match &local.fingerprint {
        None => SyncState::Unverified,
        Some(fingerprint) if *fingerprint == remote.fingerprint => SyncState::Synced,
        Some(_) => SyncState::Drifted,
    }
}

/// Classify every identity present in either input exactly once.
///
/// Local entries come first in input order, followed by remote-only entries
/// sorted by identity. When one side lists the same identity twice, the
/// first record wins.
pub fn resolve(
    local: impl IntoIterator<Item = AssetRecord>,
    remote: impl IntoIterator<Item = RemoteObjectRecord>,
    identity: &impl IdentityFn,
) -> Vec<ResolvedAsset> {
    let mut remote_by_id: HashMap<String, RemoteObjectRecord> = HashMap::new();
    for record in remote {
        let id = identity.remote_identity(&record);
        if remote_by_id.contains_key(&id) {
            warn!("Duplicate remote identity {} (key {}), ignoring", id, record.key);
            continue;
        }
        remote_by_id.insert(id, record);
    }

    let mut seen = HashSet::new();
    let mut resolved = Vec::new();
    for record in local {
        let id = identity.local_identity(&record);
        if !seen.insert(id.clone()) {
            warn!("Duplicate local identity {}, ignoring", id);
            continue;
        }
        let remote = remote_by_id.remove(&id);
        let state = match &remote {
            None => SyncState::Missing,
            Some(remote) => classify(&record, remote),
        };
        resolved.push(ResolvedAsset {
            identity: id,
            state,
            local: Some(record),
            remote,
        });
    }

    let mut absent: Vec<_> = remote_by_id.into_iter().collect();
    absent.sort_by(|a, b| a.0.cmp(&b.0));
    resolved.extend(absent.into_iter().map(|(id, record)| ResolvedAsset {
        identity: id,
        state: SyncState::Absent,
        local: None,
        remote: Some(record),
    }));

    resolved
}

/// Resolution result for one entity or prefix, as exposed to callers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub entries: Vec<ResolvedAsset>,
    pub counts: BTreeMap<SyncState, usize>,
}

impl SyncReport {
    pub fn new(entries: Vec<ResolvedAsset>) -> Self {
        let mut counts = BTreeMap::new();
        for entry in &entries {
            *counts.entry(entry.state).or_insert(0) += 1;
        }
        Self { entries, counts }
    }

    pub fn count(&self, state: SyncState) -> usize {
        self.counts.get(&state).copied().unwrap_or(0)
    }

    /// Identities whose remote copy is missing or differs in content.
    pub fn needs_upload(&self) -> impl Iterator<Item = &ResolvedAsset> {
        self.entries
            .iter()
            .filter(|e| matches!(e.state, SyncState::Missing | SyncState::Drifted))
    }

    /// `(identity, state)` pairs.
    pub fn states(&self) -> impl Iterator<Item = (&str, SyncState)> {
        self.entries.iter().map(|e| (e.identity.as_str(), e.state))
    }

    /// True when every local asset is known to be content-identical remotely.
    pub fn is_clean(&self) -> bool {
        self.entries
            .iter()
            .all(|e| matches!(e.state, SyncState::Synced | SyncState::Absent))
    }
}
