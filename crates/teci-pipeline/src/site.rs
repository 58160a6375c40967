//! Site-specific configuration: a dotenv file merged into the run context.

use anyhow::Context;
use std::path::Path;
use teci_core::Vars;
use tracing::debug;

/// Merge `KEY=VALUE` lines from `path` into `context`.
///
/// Keys that already hold a non-empty value keep it. Returns the number of
/// keys written.
pub fn merge_site_config(path: &Path, context: &mut Vars) -> anyhow::Result<usize> {
    let iter = dotenvy::from_path_iter(path)
        .with_context(|| format!("Failed to open site config {:?}", path))?;

    let mut written = 0;
    for item in iter {
        let (key, value) = item.with_context(|| format!("Invalid line in site config {:?}", path))?;
        if context.get(&key).is_some_and(|v| !v.is_empty()) {
            debug!(key = %key, "site config value shadowed by run context");
            continue;
        }
        context.insert(key, value);
        written += 1;
    }
    Ok(written)
}
