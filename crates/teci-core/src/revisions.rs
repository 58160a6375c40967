//! Revision store: component -> variable -> value.
//!
//! Accumulates the URLs, revisions and branches discovered during a run and
//! travels between jobs as the `all.rev` build artifact:
//!
//! ```json
//! {
//!   "te": { "TE_GIT_URL": "https://...", "TE_REV": "abc123" },
//!   "ts": { "TS_REV": "def456", "TS_BRANCH": "main" }
//! }
//! ```
//!
//! Writes are last-write-wins. Components and keys enumerate in insertion
//! order, so repeated serializations of the same store are identical.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::component::{Component, VarSuffix};
use crate::context::Vars;
use crate::error::Result;
use crate::services::{ArtifactStore, BranchRef, BuildSelector, CheckoutOutcome};

/// Conventional file name of a serialized revision store.
pub const REVISIONS_FILE: &str = "all.rev";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevisionStore {
    components: IndexMap<String, IndexMap<String, String>>,
}

impl RevisionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Number of (component, key) entries.
    pub fn len(&self) -> usize {
        self.components.values().map(IndexMap::len).sum()
    }

    /// Upsert a value, creating the component's map if needed.
    pub fn put(&mut self, component: &str, key: impl Into<String>, value: impl Into<String>) {
        self.components
            .entry(component.to_string())
            .or_default()
            .insert(key.into(), value.into());
    }

    pub fn get(&self, component: &str, key: &str) -> Option<&str> {
        self.components
            .get(component)
            .and_then(|keys| keys.get(key))
            .map(String::as_str)
    }

    /// Remove a value. A component left without keys is removed too.
    pub fn delete(&mut self, component: &str, key: &str) {
        if let Some(keys) = self.components.get_mut(component) {
            keys.shift_remove(key);
            if keys.is_empty() {
                self.components.shift_remove(component);
            }
        }
    }

    /// All `(component, key, value)` entries in insertion order. Each call
    /// starts a fresh pass.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &str)> + '_ {
        self.components.iter().flat_map(|(component, keys)| {
            keys.iter()
                .map(move |(k, v)| (component.as_str(), k.as_str(), v.as_str()))
        })
    }

    /// Record the result of checking out `component` from `url`.
    ///
    /// Writes `<C>_GIT_URL` and `<C>_REV`, and `<C>_BRANCH` when the checkout
    /// landed on a named branch.
    pub fn record_checkout(&mut self, component: &Component, url: &str, outcome: &CheckoutOutcome) {
        let id = component.as_str();
        self.put(id, component.var(VarSuffix::GitUrl), url);
        self.put(id, component.var(VarSuffix::Rev), outcome.commit.as_str());
        if let BranchRef::Named(branch) = &outcome.branch {
            self.put(id, component.var(VarSuffix::Branch), branch.as_str());
        }
    }

    /// Copy entries into `sink`.
    ///
    /// Without `force`, a destination key that already holds a non-empty
    /// value is left alone. Returns the number of keys written.
    pub fn export_to(
        &self,
        sink: &mut Vars,
        force: bool,
        component_filter: Option<&str>,
        key_filter: Option<&dyn Fn(&str) -> bool>,
    ) -> usize {
        let mut written = 0;
        for (component, key, value) in self.iter() {
            if component_filter.is_some_and(|c| c != component) {
                continue;
            }
            if key_filter.is_some_and(|f| !f(key)) {
                continue;
            }
            let occupied = sink.get(key).is_some_and(|v| !v.is_empty());
            if occupied && !force {
                continue;
            }
            sink.insert(key.to_string(), value.to_string());
            written += 1;
        }
        written
    }

    /// Pretty-printed JSON object keyed by component.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Parse a serialized store. Unreadable input yields an empty store.
    pub fn deserialize(bytes: &[u8]) -> Self {
        match serde_json::from_slice(bytes) {
            Ok(store) => store,
            Err(e) => {
                warn!(error = %e, "unreadable revision snapshot, starting empty");
                Self::default()
            }
        }
    }

    /// Load `path`. A missing or unreadable file yields an empty store.
    pub fn load(path: &Path) -> Self {
        match std::fs::read(path) {
            Ok(bytes) => Self::deserialize(&bytes),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "no revision snapshot");
                Self::default()
            }
        }
    }

    /// Write the store to `path` atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;

        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&self.serialize()?)?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Load the `all.rev` artifact of the last successful build of `job`.
    ///
    /// Best effort: any failure yields an empty store.
    pub async fn load_from_external_run(artifacts: &dyn ArtifactStore, job: &str) -> Self {
        match artifacts
            .fetch(job, REVISIONS_FILE, BuildSelector::LastSuccessful)
            .await
        {
            Ok(bytes) => Self::deserialize(&bytes),
            Err(e) => {
                warn!(job = %job, error = %e, "cannot load revisions from external run");
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::MemoryArtifactStore;

    fn sample() -> RevisionStore {
        let mut store = RevisionStore::new();
        store.put("te", "TE_REV", "abc123");
        store.put("ts", "TS_REV", "def456");
        store
    }

    #[test]
    fn test_put_get_last_write_wins() {
        let mut store = sample();
        store.put("te", "TE_REV", "zzz");
        assert_eq!(store.get("te", "TE_REV"), Some("zzz"));
        assert_eq!(store.get("te", "TE_BRANCH"), None);
        assert_eq!(store.get("nope", "TE_REV"), None);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_delete_drops_empty_component() {
        let mut store = sample();
        store.delete("te", "TE_REV");
        assert_eq!(store.get("te", "TE_REV"), None);
        assert_eq!(store.iter().count(), 1);
        store.delete("ts", "missing");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_iter_insertion_order_and_restartable() {
        let mut store = RevisionStore::new();
        store.put("ts", "TS_REV", "2");
        store.put("te", "TE_REV", "1");
        store.put("ts", "TS_BRANCH", "main");

        let first: Vec<_> = store.iter().collect();
        assert_eq!(
            first,
            vec![
                ("ts", "TS_REV", "2"),
                ("ts", "TS_BRANCH", "main"),
                ("te", "TE_REV", "1"),
            ]
        );
        let second: Vec<_> = store.iter().collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_serialize_deserialize_roundtrip() {
        let store = sample();
        let bytes = store.serialize().unwrap();
        let loaded = RevisionStore::deserialize(&bytes);
        let entries: Vec<_> = loaded.iter().collect();
        assert_eq!(
            entries,
            vec![("te", "TE_REV", "abc123"), ("ts", "TS_REV", "def456")]
        );
        assert_eq!(store.serialize().unwrap(), loaded.serialize().unwrap());
    }

    #[test]
    fn test_serialize_is_pretty_json_object() {
        let text = String::from_utf8(sample().serialize().unwrap()).unwrap();
        assert!(text.contains('\n'));
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["te"]["TE_REV"], "abc123");
    }

    #[test]
    fn test_deserialize_garbage_is_empty() {
        assert!(RevisionStore::deserialize(b"not json").is_empty());
        assert!(RevisionStore::deserialize(b"{\"te\": 5}").is_empty());
        assert!(RevisionStore::deserialize(b"").is_empty());
    }

    #[test]
    fn test_export_without_force_keeps_existing() {
        let store = sample();
        let mut sink = Vars::new();
        sink.insert("TE_REV".to_string(), "operator".to_string());
        sink.insert("TS_REV".to_string(), String::new());

        let written = store.export_to(&mut sink, false, None, None);
        assert_eq!(written, 1);
        assert_eq!(sink["TE_REV"], "operator");
        assert_eq!(sink["TS_REV"], "def456");
    }

    #[test]
    fn test_export_with_force_overwrites() {
        let store = sample();
        let mut sink = Vars::new();
        sink.insert("TE_REV".to_string(), "operator".to_string());

        let written = store.export_to(&mut sink, true, None, None);
        assert_eq!(written, 2);
        assert_eq!(sink["TE_REV"], "abc123");
    }

    #[test]
    fn test_export_filters() {
        let mut store = sample();
        store.put("te", "TE_GIT_URL", "git://te");
        let mut sink = Vars::new();

        store.export_to(&mut sink, false, Some("te"), None);
        assert_eq!(sink.len(), 2);
        assert!(!sink.contains_key("TS_REV"));

        let mut sink = Vars::new();
        let only_revs = |k: &str| k.ends_with("_REV");
        store.export_to(&mut sink, false, None, Some(&only_revs));
        assert_eq!(sink.len(), 2);
        assert!(!sink.contains_key("TE_GIT_URL"));
    }

    #[test]
    fn test_record_checkout() {
        let te = Component::new("te").unwrap();
        let mut store = RevisionStore::new();
        store.record_checkout(
            &te,
            "git://te",
            &CheckoutOutcome {
                commit: "abc".to_string(),
                branch: BranchRef::Named("main".to_string()),
            },
        );
        assert_eq!(store.get("te", "TE_GIT_URL"), Some("git://te"));
        assert_eq!(store.get("te", "TE_REV"), Some("abc"));
        assert_eq!(store.get("te", "TE_BRANCH"), Some("main"));

        let mut detached = RevisionStore::new();
        detached.record_checkout(
            &te,
            "git://te",
            &CheckoutOutcome {
                commit: "abc".to_string(),
                branch: BranchRef::Detached,
            },
        );
        assert_eq!(detached.get("te", "TE_BRANCH"), None);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(REVISIONS_FILE);
        sample().save(&path).unwrap();
        assert_eq!(RevisionStore::load(&path), sample());
        assert!(RevisionStore::load(&dir.path().join("missing.rev")).is_empty());
    }

    #[tokio::test]
    async fn test_load_from_missing_run_then_put() {
        let artifacts = MemoryArtifactStore::new();
        let mut store = RevisionStore::load_from_external_run(&artifacts, "upstream").await;
        assert!(store.is_empty());

        store.put("te", "TE_REV", "new");
        let value: serde_json::Value =
            serde_json::from_slice(&store.serialize().unwrap()).unwrap();
        assert_eq!(value, serde_json::json!({ "te": { "TE_REV": "new" } }));
    }

    #[tokio::test]
    async fn test_load_from_external_run() {
        let artifacts = MemoryArtifactStore::new();
        artifacts.insert("upstream", 4, REVISIONS_FILE, sample().serialize().unwrap());
        artifacts.mark_successful("upstream", 4).await.unwrap();

        let store = RevisionStore::load_from_external_run(&artifacts, "upstream").await;
        assert_eq!(store, sample());
    }
}
