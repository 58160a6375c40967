//! Run metadata document consumed by the reporting importer.
//!
//! `meta_data.json`:
//!
//! ```json
//! { "version": 1,
//!   "metas": [ { "name": "START_TIMESTAMP", "value": "...", "type": "timestamp" },
//!              { "name": "CFG", "value": "cfg-a" } ] }
//! ```

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::component::VarSuffix;
use crate::context::{lookup, Vars};
use crate::error::Result;
use crate::revisions::RevisionStore;

/// Conventional file name of the metadata document.
pub const METADATA_FILE: &str = "meta_data.json";

/// Document format version understood by the importer.
pub const METADATA_VERSION: u32 = 1;

/// Flat metadata mapping. `None` values are filled from fallbacks.
pub type Metas = IndexMap<String, Option<String>>;

/// Value kind tag attached to a meta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetaType {
    Timestamp,
    Revision,
    Branch,
}

/// Key suffix -> type, checked in order. Matching is case-sensitive.
const TYPE_SUFFIXES: &[(&str, MetaType)] = &[
    ("_TIMESTAMP", MetaType::Timestamp),
    ("_COMMIT", MetaType::Revision),
    ("_REV", MetaType::Revision),
    ("_BRANCH", MetaType::Branch),
];

impl MetaType {
    /// Infer the type of a meta from its key.
    pub fn infer(key: &str) -> Option<MetaType> {
        TYPE_SUFFIXES
            .iter()
            .find(|(suffix, _)| key.ends_with(*suffix))
            .map(|(_, kind)| *kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    pub name: String,
    pub value: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<MetaType>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataDocument {
    pub version: u32,
    pub metas: Vec<Meta>,
}

impl MetadataDocument {
    /// Build the document from `mapping`, in mapping order.
    ///
    /// A `None` value is looked up in each of `fallbacks` in turn (context
    /// first, then environment); if still absent the entry is skipped.
    pub fn emit(mapping: &Metas, fallbacks: &[&Vars]) -> Self {
        let metas = mapping
            .iter()
            .filter_map(|(name, value)| {
                let value = match value {
                    Some(v) => v.clone(),
                    None => fallbacks
                        .iter()
                        .find_map(|vars| lookup(vars, name))?
                        .to_string(),
                };
                Some(Meta {
                    name: name.clone(),
                    value,
                    kind: MetaType::infer(name),
                })
            })
            .collect();

        Self {
            version: METADATA_VERSION,
            metas,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Meta> {
        self.metas.iter().find(|m| m.name == name)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write the document as pretty JSON.
    pub fn write(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

/// Revision and branch entries of `store` as metas, in store order.
pub fn revision_metas(store: &RevisionStore) -> Metas {
    store
        .iter()
        .filter(|(_, key, _)| {
            matches!(VarSuffix::of(key), Some(VarSuffix::Rev | VarSuffix::Branch))
        })
        .map(|(_, key, value)| (key.to_string(), Some(value.to_string())))
        .collect()
}

/// Flat mapping for a finished run: `run` entries (timestamps, `CFG`,
/// `RESULT`, ...), then revision metas from `store`, then `extra`. An
/// `extra` entry with no value never replaces a value already present.
pub fn collect_run_metas(
    store: &RevisionStore,
    run: Metas,
    extra: impl IntoIterator<Item = (String, Option<String>)>,
) -> Metas {
    let mut metas = run;
    metas.extend(revision_metas(store));
    for (name, value) in extra {
        match value {
            Some(value) => {
                metas.insert(name, Some(value));
            }
            None => {
                metas.entry(name).or_insert(None);
            }
        }
    }
    metas
}
