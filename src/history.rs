use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::models::TitleRecord;

pub const HISTORY_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub poster: Option<String>,
    pub searched_at: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn from_record(record: &TitleRecord, at: DateTime<Utc>) -> Self {
        Self {
            id: record.id.clone(),
            name: record.name.clone(),
            poster: record.poster.clone(),
            searched_at: at,
        }
    }
}

/// Recently opened search results, newest first, one entry per title.
#[derive(Debug)]
pub struct SearchHistory {
    path: PathBuf,
    entries: Vec<HistoryEntry>,
}

impl SearchHistory {
    /// Reads the history file. A missing or unreadable file starts empty.
    pub async fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<Vec<HistoryEntry>>(&bytes).unwrap_or_else(|e| {
                warn!("Discarding corrupt search history {}: {}", path.display(), e);
                Vec::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                warn!("Failed to read search history {}: {}", path.display(), e);
                Vec::new()
            }
        };
        let mut history = Self { path, entries };
        history.entries.truncate(HISTORY_LIMIT);
        history
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        self.entries.retain(|e| e.id != entry.id);
        self.entries.insert(0, entry);
        self.entries.truncate(HISTORY_LIMIT);
    }

    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        self.entries.len() != before
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub async fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let body = serde_json::to_vec_pretty(&self.entries)?;
        tokio::fs::write(&self.path, body)
            .await
            .with_context(|| format!("Failed to write search history {}", self.path.display()))
    }
}
