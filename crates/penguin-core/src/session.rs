// Session: an ordered, persistable sequence of messages with identity

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::message::Message;

/// An ordered sequence of messages owned by one agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique session ID (time-ordered)
    pub id: Uuid,

    /// Owning agent
    pub agent_id: String,

    /// Creation time
    pub created_at: DateTime<Utc>,

    /// Last append or restore
    pub last_active: DateTime<Utc>,

    /// Messages in insertion order
    pub messages: Vec<Message>,

    /// Session metadata (persona, model binding, labels)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl Session {
    /// Create an empty session for an agent
    pub fn new(agent_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            agent_id: agent_id.into(),
            created_at: now,
            last_active: now,
            messages: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Append a message, stamping its sequence number
    pub fn push(&mut self, mut message: Message) -> &Message {
        message.seq = self.next_seq();
        self.last_active = Utc::now();
        self.messages.push(message);
        self.messages.last().expect("push succeeded")
    }

    /// Next sequence number for this session
    pub fn next_seq(&self) -> u64 {
        self.messages.last().map(|m| m.seq + 1).unwrap_or(0)
    }

    /// Sum of token counts over all messages
    pub fn total_tokens(&self) -> usize {
        self.messages.iter().map(|m| m.token_count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_assigns_monotonic_seq() {
        let mut session = Session::new("default");
        session.push(Message::user("one"));
        session.push(Message::user("two"));
        let seqs: Vec<u64> = session.messages.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![0, 1]);
    }

    #[test]
    fn test_total_tokens() {
        let mut session = Session::new("default");
        session.push(Message::user("abcd"));
        session.push(Message::user("efgh"));
        assert_eq!(session.total_tokens(), 2);
    }
}
