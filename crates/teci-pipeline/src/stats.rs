//! Execution statistics collected after the action.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use teci_core::Metas;

use crate::runner::StageResult;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatistics {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub action_duration_ms: Option<u64>,
    pub exit_code: Option<i32>,
    /// `KEY=VALUE` pairs printed by the statistics command.
    #[serde(default)]
    pub values: IndexMap<String, String>,
}

impl RunStatistics {
    pub fn new(started_at: DateTime<Utc>, action: Option<&StageResult>) -> Self {
        Self {
            started_at,
            finished_at: Utc::now(),
            action_duration_ms: action.map(|a| a.duration_ms),
            exit_code: action.map(|a| a.exit_code),
            values: IndexMap::new(),
        }
    }

    /// Parse `KEY=VALUE` lines; other lines are ignored.
    pub fn absorb_output(&mut self, stdout: &str) -> usize {
        let mut added = 0;
        for line in stdout.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            if key.is_empty() || key.contains(char::is_whitespace) {
                continue;
            }
            self.values.insert(key.to_string(), value.trim().to_string());
            added += 1;
        }
        added
    }

    pub fn duration_ms(&self) -> u64 {
        (self.finished_at - self.started_at).num_milliseconds().max(0) as u64
    }

    /// Metas describing the run timing and collected values.
    pub fn metas(&self) -> Metas {
        let mut metas = Metas::new();
        metas.insert(
            "START_TIMESTAMP".to_string(),
            Some(self.started_at.to_rfc3339()),
        );
        metas.insert(
            "FINISH_TIMESTAMP".to_string(),
            Some(self.finished_at.to_rfc3339()),
        );
        metas.insert("DURATION_MS".to_string(), Some(self.duration_ms().to_string()));
        for (key, value) in &self.values {
            metas.insert(key.clone(), Some(value.clone()));
        }
        metas
    }
}
