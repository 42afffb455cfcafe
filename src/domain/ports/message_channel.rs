//! Outbound message channel port.
//!
//! Chat steps emit user-facing responses through this contract; the
//! transport (HTTP, CLI, queue) lives outside the engine.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::domain::error::EngineResult;

/// Delivers user-facing messages for a session.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    async fn send(&self, session_id: &str, content: &str) -> EngineResult<()>;
}

/// Channel that buffers messages in memory; the default when no transport
/// is attached, and the assertion point in tests.
#[derive(Debug, Default)]
pub struct BufferedChannel {
    messages: Mutex<Vec<(String, String)>>,
}

impl BufferedChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages sent so far, as `(session_id, content)` pairs.
    pub fn messages(&self) -> Vec<(String, String)> {
        self.messages.lock().expect("channel lock").clone()
    }
}

#[async_trait]
impl MessageChannel for BufferedChannel {
    async fn send(&self, session_id: &str, content: &str) -> EngineResult<()> {
        self.messages
            .lock()
            .expect("channel lock")
            .push((session_id.to_string(), content.to_string()));
        Ok(())
    }
}
