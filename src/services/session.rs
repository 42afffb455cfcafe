//! Per-session agent state: context variables, chat history, artifacts.
//!
//! Sessions are the mutable surface that `state` steps write and
//! `export_state` serialises. All mutation goes through methods that
//! return the previous values, so the executor can register compensations.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

/// One message of the session transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRecord {
    pub from: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Serialized session state for `export_state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionExport {
    pub context_variables: HashMap<String, Value>,
    pub history: Vec<ChatRecord>,
    pub artifacts: HashMap<String, Value>,
}

/// Mutable state owned by one agent session.
pub struct SessionState {
    session_id: String,
    variables: RwLock<HashMap<String, Value>>,
    artifacts: RwLock<HashMap<String, Value>>,
    history: RwLock<Vec<ChatRecord>>,
}

impl SessionState {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            variables: RwLock::new(HashMap::new()),
            artifacts: RwLock::new(HashMap::new()),
            history: RwLock::new(Vec::new()),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Merge updates into the context variables, returning each key's
    /// previous value (`None` for keys that did not exist).
    pub async fn apply_updates(
        &self,
        updates: &HashMap<String, Value>,
    ) -> Vec<(String, Option<Value>)> {
        let mut variables = self.variables.write().await;
        updates
            .iter()
            .map(|(key, value)| {
                let previous = variables.insert(key.clone(), value.clone());
                (key.clone(), previous)
            })
            .collect()
    }

    /// Restore previous values captured by [`Self::apply_updates`].
    pub async fn restore(&self, previous: &[(String, Option<Value>)]) {
        let mut variables = self.variables.write().await;
        for (key, value) in previous.iter().rev() {
            match value {
                Some(value) => {
                    variables.insert(key.clone(), value.clone());
                }
                None => {
                    variables.remove(key);
                }
            }
        }
    }

    pub async fn get_variable(&self, key: &str) -> Option<Value> {
        self.variables.read().await.get(key).cloned()
    }

    pub async fn variables(&self) -> HashMap<String, Value> {
        self.variables.read().await.clone()
    }

    /// Append a transcript record.
    pub async fn record_message(&self, from: impl Into<String>, content: impl Into<String>) {
        self.history.write().await.push(ChatRecord {
            from: from.into(),
            content: content.into(),
            timestamp: Utc::now(),
        });
    }

    pub async fn history(&self) -> Vec<ChatRecord> {
        self.history.read().await.clone()
    }

    /// Merge workflow artifacts into the session's artifact store.
    pub async fn merge_artifacts(&self, artifacts: &HashMap<String, Value>) {
        let mut store = self.artifacts.write().await;
        for (key, value) in artifacts {
            store.insert(key.clone(), value.clone());
        }
    }

    pub async fn artifacts(&self) -> HashMap<String, Value> {
        self.artifacts.read().await.clone()
    }

    /// Serialize for the `export_state` message.
    pub async fn export(&self) -> SessionExport {
        SessionExport {
            context_variables: self.variables().await,
            history: self.history().await,
            artifacts: self.artifacts().await,
        }
    }
}
