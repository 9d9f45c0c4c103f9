use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio::fs;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::collaborators::{ConversationMemory, ConversationRecord};

pub const DEFAULT_MAX_HISTORY: usize = 1000;

/// Conversation log kept in one JSON file, oldest records dropped past
/// `max_history`.
#[derive(Clone)]
pub struct JsonConversationStore {
    path: PathBuf,
    max_history: usize,
    records: Arc<RwLock<VecDeque<ConversationRecord>>>,
}

impl JsonConversationStore {
    pub async fn open(path: impl AsRef<Path>, max_history: usize) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let records = if path.exists() {
            let raw = fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read {:?}", path))?;
            match serde_json::from_str::<VecDeque<ConversationRecord>>(&raw) {
                Ok(records) => records,
                Err(err) => {
                    tracing::warn!("conversation log {:?} is unreadable, starting empty: {}", path, err);
                    VecDeque::new()
                }
            }
        } else {
            VecDeque::new()
        };
        Ok(Self {
            path,
            max_history: max_history.max(1),
            records: Arc::new(RwLock::new(records)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    pub async fn conversation(&self, id: &str) -> Option<ConversationRecord> {
        self.records
            .read()
            .await
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }
}

#[async_trait]
impl ConversationMemory for JsonConversationStore {
    async fn store_conversation(&self, mut record: ConversationRecord) -> anyhow::Result<String> {
        if record.id.is_empty() {
            record.id = Uuid::new_v4().to_string();
        }
        let id = record.id.clone();
        let mut records = self.records.write().await;
        let mut next = records.clone();
        next.push_back(record);
        while next.len() > self.max_history {
            next.pop_front();
        }
        let payload = serde_json::to_string_pretty(&next)?;
        fs::write(&self.path, payload)
            .await
            .with_context(|| format!("Failed to write {:?}", self.path))?;
        *records = next;
        Ok(id)
    }

    async fn recent_conversations(&self, limit: usize) -> anyhow::Result<Vec<ConversationRecord>> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }
}
