// Context window management
//
// Allocates the model's token budget across message categories and trims
// the session toward per-category targets when the total runs over.
// System prompt messages are never trimmed.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::message::MessageCategory;
use crate::session::Session;

/// Token budget configuration for one model binding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextWindowConfig {
    /// The model's context window
    pub max_tokens: usize,

    /// Held back for the response
    #[serde(default)]
    pub reserved_tokens: Option<usize>,

    /// Per-category fractions of the available window; must sum to 1.0.
    /// Missing categories fall back to their defaults.
    #[serde(default)]
    pub fractions: HashMap<MessageCategory, f64>,
}

impl ContextWindowConfig {
    /// Config for a given window with the default 10% reserve
    pub fn new(max_tokens: usize) -> Self {
        Self {
            max_tokens,
            reserved_tokens: None,
            fractions: HashMap::new(),
        }
    }

    /// Tokens held back for the response (default 10% of the window)
    pub fn reserved(&self) -> usize {
        self.reserved_tokens.unwrap_or(self.max_tokens / 10)
    }

    /// Tokens available for the prompt
    pub fn available(&self) -> usize {
        self.max_tokens.saturating_sub(self.reserved())
    }

    /// Fraction for a category (configured or default)
    pub fn fraction(&self, category: MessageCategory) -> f64 {
        self.fractions
            .get(&category)
            .copied()
            .unwrap_or_else(|| category.default_fraction())
    }
}

impl Default for ContextWindowConfig {
    fn default() -> Self {
        Self::new(128_000)
    }
}

/// What a trim pass removed
#[derive(Debug, Clone, Default)]
pub struct TrimReport {
    /// Removed message ids grouped by category
    pub removed: HashMap<MessageCategory, Vec<Uuid>>,
    /// Total tokens reclaimed
    pub tokens_reclaimed: usize,
}

impl TrimReport {
    /// Whether anything was removed
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty()
    }
}

/// Category-priority trimmer over a session's message log
#[derive(Debug, Clone, Default)]
pub struct ContextWindowManager {
    config: ContextWindowConfig,
}

impl ContextWindowManager {
    pub fn new(config: ContextWindowConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ContextWindowConfig {
        &self.config
    }

    /// Whether the session currently exceeds the available budget
    pub fn over_budget(&self, session: &Session) -> bool {
        session.total_tokens() > self.config.available()
    }

    /// Trim toward the per-category targets. Deterministic: oldest message
    /// in each over-target category goes first, categories in the fixed
    /// trim order. Returns what was removed.
    pub fn trim(&self, session: &mut Session) -> TrimReport {
        self.trim_with_scale(session, 1.0)
    }

    /// Second-chance trim with non-system targets halved
    pub fn aggressive_trim(&self, session: &mut Session) -> TrimReport {
        self.trim_with_scale(session, 0.5)
    }

    fn trim_with_scale(&self, session: &mut Session, scale: f64) -> TrimReport {
        let mut report = TrimReport::default();

        if session.total_tokens() <= self.config.available() {
            return report;
        }

        let system_tokens: usize = session
            .messages
            .iter()
            .filter(|m| m.category == MessageCategory::SystemPrompt)
            .map(|m| m.token_count)
            .sum();

        let available = self.config.available();
        if system_tokens > available {
            warn!(
                system_tokens,
                available, "system prompt alone exceeds the available window; proceeding untrimmed"
            );
        }

        // Budget that the non-system categories share
        let distributable = available.saturating_sub(system_tokens);

        for category in MessageCategory::TRIM_ORDER {
            let target =
                (self.config.fraction(category) * scale * distributable as f64).floor() as usize;

            loop {
                let category_tokens: usize = session
                    .messages
                    .iter()
                    .filter(|m| m.category == category)
                    .map(|m| m.token_count)
                    .sum();
                if category_tokens <= target {
                    break;
                }

                // Oldest message in this category; insertion order is
                // authoritative so the first match is the oldest.
                let Some(pos) = session.messages.iter().position(|m| m.category == category)
                else {
                    break;
                };
                let removed = session.messages.remove(pos);
                debug!(
                    message_id = %removed.id,
                    category = %category,
                    tokens = removed.token_count,
                    "trimmed message"
                );
                report.tokens_reclaimed += removed.token_count;
                report.removed.entry(category).or_default().push(removed.id);
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, MessageContent, MessageRole};

    fn message_of(category: MessageCategory, tokens: usize) -> Message {
        // 4 bytes per token under the byte approximation
        let text = "x".repeat(tokens * 4);
        Message::new(MessageRole::User, MessageContent::Text(text), category)
    }

    fn manager(max_tokens: usize, reserved: usize) -> ContextWindowManager {
        ContextWindowManager::new(ContextWindowConfig {
            max_tokens,
            reserved_tokens: Some(reserved),
            fractions: HashMap::new(),
        })
    }

    #[test]
    fn test_under_budget_is_untouched() {
        let mgr = manager(1000, 100);
        let mut session = Session::new("a");
        session.push(message_of(MessageCategory::Conversation, 100));
        let report = mgr.trim(&mut session);
        assert!(report.is_empty());
        assert_eq!(session.messages.len(), 1);
    }

    #[test]
    fn test_system_prompt_survives_trim() {
        let mgr = manager(1000, 100);
        let mut session = Session::new("a");
        session.push(Message::system_prompt("p".repeat(400)));
        for _ in 0..50 {
            session.push(message_of(MessageCategory::Conversation, 40));
        }
        mgr.trim(&mut session);
        assert!(session
            .messages
            .iter()
            .any(|m| m.category == MessageCategory::SystemPrompt));
        assert!(session.total_tokens() <= 900);
    }

    #[test]
    fn test_oldest_removed_first() {
        let mgr = manager(1000, 100);
        let mut session = Session::new("a");
        for _ in 0..50 {
            session.push(message_of(MessageCategory::Conversation, 40));
        }
        let oldest = session.messages.first().unwrap().id;
        let newest = session.messages.last().unwrap().id;
        let report = mgr.trim(&mut session);
        let removed = &report.removed[&MessageCategory::Conversation];
        assert!(removed.contains(&oldest));
        assert!(!removed.contains(&newest));
        // Remaining messages keep their relative order
        let seqs: Vec<u64> = session.messages.iter().map(|m| m.seq).collect();
        let mut sorted = seqs.clone();
        sorted.sort_unstable();
        assert_eq!(seqs, sorted);
    }

    #[test]
    fn test_trim_is_deterministic() {
        let mgr = manager(1000, 100);
        let mut a = Session::new("a");
        for i in 0..30 {
            let category = if i % 2 == 0 {
                MessageCategory::Conversation
            } else {
                MessageCategory::ToolMemory
            };
            a.push(message_of(category, 50));
        }
        let mut b = a.clone();
        mgr.trim(&mut a);
        mgr.trim(&mut b);
        let ids_a: Vec<Uuid> = a.messages.iter().map(|m| m.id).collect();
        let ids_b: Vec<Uuid> = b.messages.iter().map(|m| m.id).collect();
        assert_eq!(ids_a, ids_b);
    }

    #[test]
    fn test_aggressive_trim_halves_targets() {
        let mgr = manager(1000, 100);
        let mut normal = Session::new("a");
        let mut aggressive = Session::new("a");
        for _ in 0..50 {
            normal.push(message_of(MessageCategory::Conversation, 40));
            aggressive.push(message_of(MessageCategory::Conversation, 40));
        }
        mgr.trim(&mut normal);
        mgr.aggressive_trim(&mut aggressive);
        assert!(aggressive.total_tokens() < normal.total_tokens());
    }

    #[test]
    fn test_oversized_single_message_admitted_until_over_budget() {
        let mgr = manager(1000, 100);
        let mut session = Session::new("a");
        // Larger than the conversation target (270) but under the window:
        // admitted untouched.
        session.push(message_of(MessageCategory::Conversation, 500));
        assert!(mgr.trim(&mut session).is_empty());
        assert_eq!(session.messages.len(), 1);

        // Once the total crosses the window, the next pass enforces the
        // category target and the oversized message goes.
        for _ in 0..11 {
            session.push(message_of(MessageCategory::ToolMemory, 40));
        }
        let report = mgr.trim(&mut session);
        assert_eq!(report.removed[&MessageCategory::Conversation].len(), 1);
    }
}
