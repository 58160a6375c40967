//! Component identifiers and the variable naming convention built on them.
//!
//! A component (`te`, `ts`, `tsconf`, ...) names an external repository.
//! Run parameters use the lower-case form (`te_repo`, `te_rev`), context and
//! environment variables the upper-case form (`TE_GIT_URL`, `TE_REV`). All
//! names are produced here from [`ParamSuffix`] and [`VarSuffix`].

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, TeciError};

/// Suffixes of run parameter names (`<component>_<suffix>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamSuffix {
    Repo,
    Rev,
    Branch,
}

/// Suffixes of context / environment variable names (`<COMPONENT>_<SUFFIX>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VarSuffix {
    GitUrl,
    Rev,
    Branch,
    DefBranch,
}

const PARAM_SUFFIXES: &[(ParamSuffix, &str)] = &[
    (ParamSuffix::Repo, "repo"),
    (ParamSuffix::Rev, "rev"),
    (ParamSuffix::Branch, "branch"),
];

const VAR_SUFFIXES: &[(VarSuffix, &str)] = &[
    (VarSuffix::GitUrl, "GIT_URL"),
    (VarSuffix::Rev, "REV"),
    (VarSuffix::Branch, "BRANCH"),
    (VarSuffix::DefBranch, "DEF_BRANCH"),
];

impl ParamSuffix {
    pub fn as_str(&self) -> &'static str {
        PARAM_SUFFIXES
            .iter()
            .find(|(s, _)| s == self)
            .map(|(_, name)| *name)
            .unwrap_or_default()
    }
}

impl VarSuffix {
    pub fn as_str(&self) -> &'static str {
        VAR_SUFFIXES
            .iter()
            .find(|(s, _)| s == self)
            .map(|(_, name)| *name)
            .unwrap_or_default()
    }

    /// Find the suffix a variable name ends with, if any.
    ///
    /// `DEF_BRANCH` is checked before `BRANCH` so the longer suffix wins.
    pub fn of(name: &str) -> Option<VarSuffix> {
        [
            VarSuffix::GitUrl,
            VarSuffix::DefBranch,
            VarSuffix::Branch,
            VarSuffix::Rev,
        ]
        .into_iter()
        .find(|s| {
            name.strip_suffix(s.as_str())
                .is_some_and(|rest| rest.ends_with('_'))
        })
    }
}

/// Identifier of an external component, used as a namespace for variable
/// names and as the key of the revision store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Component(String);

impl Component {
    /// Create a component, validating the identifier.
    ///
    /// Identifiers are non-empty and made of ASCII alphanumerics, `-` and `_`.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(TeciError::InvalidComponent(id));
        }
        Ok(Component(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Run parameter name, e.g. `te_repo`.
    pub fn param(&self, suffix: ParamSuffix) -> String {
        format!("{}_{}", self.0, suffix.as_str())
    }

    /// Context / environment variable name, e.g. `TE_GIT_URL`.
    pub fn var(&self, suffix: VarSuffix) -> String {
        format!("{}_{}", self.var_prefix(), suffix.as_str())
    }

    /// Upper-case prefix of the component's variables, e.g. `TS_RIGS`.
    pub fn var_prefix(&self) -> String {
        self.0.to_ascii_uppercase().replace('-', "_")
    }

    /// Whether `other` is a different component whose variables would
    /// overwrite this one's (`ts-rigs` and `ts_rigs`, `te` and `TE`).
    pub fn shares_vars_with(&self, other: &Component) -> bool {
        self != other && self.var_prefix() == other.var_prefix()
    }
}

impl TryFrom<String> for Component {
    type Error = TeciError;

    fn try_from(s: String) -> Result<Self> {
        Component::new(s)
    }
}

impl From<Component> for String {
    fn from(c: Component) -> Self {
        c.0
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
