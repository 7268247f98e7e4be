// Conversation management
//
// A Conversation is the live handle over one agent's Session: it accepts
// new messages, keeps the running token total consistent, trims through
// the context window manager, materializes the API view, and serializes
// state for the snapshot store. The caller owning the snapshot store
// persists what `new_session` archives.

use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

use crate::context_window::{ContextWindowConfig, ContextWindowManager, TrimReport};
use crate::error::{CoreError, Result};
use crate::message::{Message, MessageCategory, MessageContent, MessageRole};
use crate::provider::ApiMessage;
use crate::session::Session;

/// Live, exclusively-owned conversation state for one agent
#[derive(Debug)]
pub struct Conversation {
    session: Session,
    window: ContextWindowManager,
    token_total: usize,
}

impl Conversation {
    /// Create a fresh conversation for an agent
    pub fn new(agent_id: impl Into<String>, config: ContextWindowConfig) -> Self {
        Self {
            session: Session::new(agent_id),
            window: ContextWindowManager::new(config),
            token_total: 0,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Running token total; equals the sum over all messages
    pub fn token_total(&self) -> usize {
        self.token_total
    }

    pub fn window(&self) -> &ContextWindowManager {
        &self.window
    }

    /// Append a message built from parts. Trims synchronously when the
    /// total crosses the available budget.
    pub fn add(
        &mut self,
        role: MessageRole,
        content: MessageContent,
        category: MessageCategory,
        metadata: Option<BTreeMap<String, Value>>,
    ) -> Message {
        let mut message = Message::new(role, content, category);
        if let Some(metadata) = metadata {
            message.metadata = metadata;
        }
        self.add_message(message)
    }

    /// Append a pre-built message (bus delivery, tool results)
    pub fn add_message(&mut self, message: Message) -> Message {
        self.token_total += message.token_count;
        let stored = self.session.push(message).clone();
        if self.window.over_budget(&self.session) {
            self.trim();
        }
        stored
    }

    /// Replace the system prompt. The new message carries the
    /// `permanent` metadata flag and the system_prompt category.
    pub fn set_system_prompt(&mut self, text: impl Into<String>) {
        let prompt = Message::system_prompt(text);
        if let Some(pos) = self
            .session
            .messages
            .iter()
            .position(|m| m.category == MessageCategory::SystemPrompt)
        {
            let old = std::mem::replace(&mut self.session.messages[pos], prompt);
            let added = self.session.messages[pos].token_count;
            // Keep the original slot ordering; only the content changes
            self.session.messages[pos].seq = old.seq;
            self.session.messages[pos].created_at = old.created_at;
            self.token_total = self.token_total - old.token_count + added;
        } else {
            self.token_total += prompt.token_count;
            self.session.push(prompt);
        }
    }

    /// Current system prompt text, if any
    pub fn system_prompt(&self) -> Option<&str> {
        self.session
            .messages
            .iter()
            .find(|m| m.category == MessageCategory::SystemPrompt)
            .and_then(|m| m.text())
    }

    /// The exact ordered message sequence for the next provider call:
    /// system prompt first, then declarative notes, then working memory,
    /// then conversation and tool memory merged in creation order.
    pub fn api_view(&self) -> Vec<ApiMessage> {
        let mut view: Vec<&Message> = Vec::with_capacity(self.session.messages.len());

        for category in [
            MessageCategory::SystemPrompt,
            MessageCategory::DeclarativeNotes,
            MessageCategory::WorkingMemory,
        ] {
            view.extend(
                self.session
                    .messages
                    .iter()
                    .filter(|m| m.category == category),
            );
        }

        let mut tail: Vec<&Message> = self
            .session
            .messages
            .iter()
            .filter(|m| {
                matches!(
                    m.category,
                    MessageCategory::Conversation | MessageCategory::ToolMemory
                )
            })
            .collect();
        tail.sort_by_key(|m| (m.created_at, m.seq));
        view.extend(tail);

        view.into_iter().map(ApiMessage::from).collect()
    }

    /// Trim toward the category targets, updating the token total
    pub fn trim(&mut self) -> TrimReport {
        let report = self.window.trim(&mut self.session);
        self.token_total = self.session.total_tokens();
        report
    }

    /// Second-chance trim with halved non-system targets
    pub fn aggressive_trim(&mut self) -> TrimReport {
        let report = self.window.aggressive_trim(&mut self.session);
        self.token_total = self.session.total_tokens();
        report
    }

    /// Whether the session still exceeds the available budget
    pub fn over_budget(&self) -> bool {
        self.window.over_budget(&self.session)
    }

    /// Reversibly serialize the full session state
    pub fn snapshot_state(&self) -> Result<String> {
        serde_json::to_string(&self.session)
            .map_err(|e| CoreError::snapshot(format!("serialize failed: {}", e)))
    }

    /// Replace the current session with a deserialized one. Token totals
    /// are recomputed from the restored messages.
    pub fn restore_state(&mut self, blob: &str) -> Result<()> {
        let session: Session = serde_json::from_str(blob)
            .map_err(|e| CoreError::snapshot(format!("deserialize failed: {}", e)))?;
        self.token_total = session.total_tokens();
        self.session = session;
        Ok(())
    }

    /// Start a fresh session, carrying the system prompt over. Returns
    /// the archived session for the caller to snapshot.
    pub fn new_session(&mut self) -> Session {
        let agent_id = self.session.agent_id.clone();
        let prompt = self.system_prompt().map(|s| s.to_string());
        let archived = std::mem::replace(&mut self.session, Session::new(agent_id));
        self.token_total = 0;
        if let Some(prompt) = prompt {
            self.set_system_prompt(prompt);
        }
        debug!(archived_session = %archived.id, "started new session");
        archived
    }
}
