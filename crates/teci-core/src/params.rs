//! Run parameter declarations, including sticky parameters whose default is
//! the value used by the previous run.

use serde::{Deserialize, Serialize};

use crate::context::Vars;

/// Conventional file name of a run's effective parameters.
pub const PARAMS_FILE: &str = "params.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(default)]
    pub default: Option<String>,
    /// Reuse the previous run's value when none is supplied.
    #[serde(default)]
    pub sticky: bool,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
            sticky: false,
        }
    }
}

/// Effective run parameters.
///
/// Supplied values win. A declared parameter that was not supplied takes the
/// previous run's value if it is sticky, else its default. Supplied values
/// without a declaration are passed through.
pub fn resolve_params(specs: &[ParamSpec], supplied: &Vars, previous: &Vars) -> Vars {
    let mut out = supplied.clone();
    for spec in specs {
        if out.contains_key(&spec.name) {
            continue;
        }
        let value = spec
            .sticky
            .then(|| previous.get(&spec.name).cloned())
            .flatten()
            .or_else(|| spec.default.clone());
        if let Some(value) = value {
            out.insert(spec.name.clone(), value);
        }
    }
    out
}
