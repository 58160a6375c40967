//! Fan-out of one operation over every node carrying a label.

use futures::future::join_all;
use std::future::Future;
use teci_core::{NodeDirectory, TeciError};
use tracing::{info, warn};

/// Run `f` on every node with `label` concurrently and wait for all of them.
///
/// Fails with `NoNodes` if the label resolves to nothing. When some nodes
/// fail, the first failure in node order is returned after every branch has
/// finished.
pub async fn on_nodes<F, Fut, T>(
    directory: &dyn NodeDirectory,
    label: &str,
    f: F,
) -> anyhow::Result<Vec<T>>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let nodes = directory.nodes(label);
    if nodes.is_empty() {
        return Err(TeciError::NoNodes {
            label: label.to_string(),
        }
        .into());
    }
    info!(label = %label, nodes = nodes.len(), "running on nodes");

    let results = join_all(nodes.iter().cloned().map(&f)).await;

    let mut values = Vec::with_capacity(results.len());
    let mut first_error = None;
    for (node, result) in nodes.iter().zip(results) {
        match result {
            Ok(value) => values.push(value),
            Err(e) => {
                warn!(node = %node, error = %e, "node branch failed");
                if first_error.is_none() {
                    first_error = Some(e.context(format!("on node {node}")));
                }
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(values),
    }
}
