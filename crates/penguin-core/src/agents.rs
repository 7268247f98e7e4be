// Agent registry
//
// Agents are id-keyed records owning their conversation; the parent/child
// graph is an adjacency relation derived from parent ids, never
// back-pointers. The registry is single-writer (the core façade) behind a
// read-write lock; the default agent always exists and cannot be deleted.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, RwLock as AsyncRwLock};
use uuid::Uuid;

use crate::context_window::ContextWindowConfig;
use crate::conversation::Conversation;
use crate::engine::AgentHandle;
use crate::error::{CoreError, Result};
use crate::provider::ModelBinding;

/// Where an agent currently is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Idle,
    Running,
    Paused,
    Error,
    Completed,
}

/// A registered agent
#[derive(Debug)]
pub struct AgentRecord {
    pub id: String,
    pub persona: Option<String>,
    pub binding: ModelBinding,
    pub parent: Option<String>,
    pub paused: bool,
    pub execution_state: ExecutionState,
    pub conversation: Arc<AsyncRwLock<Conversation>>,
    /// Serializes engine invocations for this agent
    pub run_lock: Arc<Mutex<()>>,
}

impl AgentRecord {
    /// Cheap handle for the engine
    pub fn handle(&self) -> AgentHandle {
        AgentHandle {
            id: self.id.clone(),
            binding: self.binding.clone(),
            conversation: self.conversation.clone(),
        }
    }
}

/// Serializable agent view for callers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: String,
    pub persona: Option<String>,
    pub model: String,
    pub provider: String,
    pub parent: Option<String>,
    pub children: Vec<String>,
    pub paused: bool,
    pub execution_state: ExecutionState,
    pub session_id: Uuid,
    pub message_count: usize,
    pub token_total: usize,
}

/// Id-keyed agent map with parent/children bookkeeping
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, Arc<AgentRecord>>>,
    default_agent_id: String,
}

impl AgentRegistry {
    /// Create the registry with its default agent already present
    pub fn new(default_agent_id: impl Into<String>, binding: ModelBinding) -> Self {
        let default_agent_id = default_agent_id.into();
        let registry = Self {
            agents: RwLock::new(HashMap::new()),
            default_agent_id: default_agent_id.clone(),
        };
        registry
            .insert(default_agent_id, binding, None, None)
            .expect("default agent creation cannot conflict");
        registry
    }

    pub fn default_agent_id(&self) -> &str {
        &self.default_agent_id
    }

    /// Register a new agent. The parent, when given, must exist.
    pub fn insert(
        &self,
        id: impl Into<String>,
        binding: ModelBinding,
        persona: Option<String>,
        parent: Option<String>,
    ) -> Result<Arc<AgentRecord>> {
        let id = id.into();
        let mut agents = self.agents.write().expect("agent registry lock poisoned");

        if agents.contains_key(&id) {
            return Err(CoreError::Refused(format!("agent '{}' already exists", id)));
        }
        if let Some(parent_id) = &parent {
            if !agents.contains_key(parent_id) {
                return Err(CoreError::agent_not_found(parent_id.clone()));
            }
        }

        let mut conversation = Conversation::new(
            id.clone(),
            ContextWindowConfig::new(binding.context_window),
        );
        if let Some(persona_text) = &persona {
            conversation.set_system_prompt(persona_text.clone());
        }

        let record = Arc::new(AgentRecord {
            id: id.clone(),
            persona,
            binding,
            parent,
            paused: false,
            execution_state: ExecutionState::Idle,
            conversation: Arc::new(AsyncRwLock::new(conversation)),
            run_lock: Arc::new(Mutex::new(())),
        });
        agents.insert(id, record.clone());
        Ok(record)
    }

    /// Fetch a record, erroring with AgentNotFound when absent
    pub fn get(&self, id: &str) -> Result<Arc<AgentRecord>> {
        self.agents
            .read()
            .expect("agent registry lock poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::agent_not_found(id))
    }

    /// Whether an agent exists
    pub fn contains(&self, id: &str) -> bool {
        self.agents
            .read()
            .expect("agent registry lock poisoned")
            .contains_key(id)
    }

    /// All agent ids
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .agents
            .read()
            .expect("agent registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Number of registered agents
    pub fn len(&self) -> usize {
        self.agents
            .read()
            .expect("agent registry lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Children of an agent, derived from parent ids
    pub fn children_of(&self, id: &str) -> Vec<String> {
        let mut children: Vec<String> = self
            .agents
            .read()
            .expect("agent registry lock poisoned")
            .values()
            .filter(|record| record.parent.as_deref() == Some(id))
            .map(|record| record.id.clone())
            .collect();
        children.sort();
        children
    }

    /// Remove an agent. The default agent is refused; children of the
    /// removed agent are detached, not deleted.
    pub fn remove(&self, id: &str) -> Result<Arc<AgentRecord>> {
        if id == self.default_agent_id {
            return Err(CoreError::Refused(
                "the default agent cannot be deleted".to_string(),
            ));
        }
        let mut agents = self.agents.write().expect("agent registry lock poisoned");
        let record = agents
            .remove(id)
            .ok_or_else(|| CoreError::agent_not_found(id))?;

        // Detach children rather than cascading the delete
        let orphans: Vec<String> = agents
            .values()
            .filter(|r| r.parent.as_deref() == Some(id))
            .map(|r| r.id.clone())
            .collect();
        for orphan in orphans {
            let detached = agents.get(&orphan).map(|child| {
                let mut detached = clone_record_shallow(child);
                detached.parent = None;
                detached
            });
            if let Some(detached) = detached {
                agents.insert(orphan, Arc::new(detached));
            }
        }

        Ok(record)
    }

    /// Replace the stored flags for an agent (paused, execution state)
    pub fn update_flags(
        &self,
        id: &str,
        paused: Option<bool>,
        execution_state: Option<ExecutionState>,
    ) -> Result<()> {
        let mut agents = self.agents.write().expect("agent registry lock poisoned");
        let record = agents
            .get(id)
            .ok_or_else(|| CoreError::agent_not_found(id))?;
        let mut updated = clone_record_shallow(record);
        if let Some(paused) = paused {
            updated.paused = paused;
        }
        if let Some(state) = execution_state {
            updated.execution_state = state;
        }
        agents.insert(id.to_string(), Arc::new(updated));
        Ok(())
    }

    /// Build the externally visible profile for an agent
    pub async fn profile(&self, id: &str) -> Result<AgentProfile> {
        let record = self.get(id)?;
        let children = self.children_of(id);
        let conversation = record.conversation.read().await;
        Ok(AgentProfile {
            id: record.id.clone(),
            persona: record.persona.clone(),
            model: record.binding.model.clone(),
            provider: record.binding.provider.clone(),
            parent: record.parent.clone(),
            children,
            paused: record.paused,
            execution_state: record.execution_state,
            session_id: conversation.session().id,
            message_count: conversation.session().messages.len(),
            token_total: conversation.token_total(),
        })
    }
}

/// Copy a record's scalar fields while sharing the conversation and lock
fn clone_record_shallow(record: &AgentRecord) -> AgentRecord {
    AgentRecord {
        id: record.id.clone(),
        persona: record.persona.clone(),
        binding: record.binding.clone(),
        parent: record.parent.clone(),
        paused: record.paused,
        execution_state: record.execution_state,
        conversation: record.conversation.clone(),
        run_lock: record.run_lock.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> AgentRegistry {
        AgentRegistry::new("default", ModelBinding::replay())
    }

    #[test]
    fn test_default_agent_exists() {
        let registry = registry();
        assert!(registry.contains("default"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_default_agent_delete_refused() {
        let registry = registry();
        let err = registry.remove("default").unwrap_err();
        assert_eq!(err.code(), "OPERATION_REFUSED");
    }

    #[test]
    fn test_unknown_agent_is_structured_error() {
        let registry = registry();
        let err = registry.get("ghost").unwrap_err();
        assert_eq!(err.code(), "AGENT_NOT_FOUND");
        assert!(!err.recoverable());
    }

    #[test]
    fn test_parent_child_adjacency() {
        let registry = registry();
        registry
            .insert("worker", ModelBinding::replay(), None, Some("default".into()))
            .unwrap();
        registry
            .insert("helper", ModelBinding::replay(), None, Some("default".into()))
            .unwrap();
        assert_eq!(registry.children_of("default"), vec!["helper", "worker"]);
        assert_eq!(
            registry.get("worker").unwrap().parent.as_deref(),
            Some("default")
        );
    }

    #[test]
    fn test_missing_parent_rejected() {
        let registry = registry();
        let err = registry
            .insert("stray", ModelBinding::replay(), None, Some("ghost".into()))
            .unwrap_err();
        assert_eq!(err.code(), "AGENT_NOT_FOUND");
    }

    #[test]
    fn test_delete_detaches_children() {
        let registry = registry();
        registry
            .insert("mid", ModelBinding::replay(), None, Some("default".into()))
            .unwrap();
        registry
            .insert("leaf", ModelBinding::replay(), None, Some("mid".into()))
            .unwrap();
        registry.remove("mid").unwrap();
        assert!(registry.contains("leaf"));
        assert!(registry.get("leaf").unwrap().parent.is_none());
    }

    #[test]
    fn test_persona_becomes_system_prompt() {
        let registry = registry();
        let record = registry
            .insert(
                "styled",
                ModelBinding::replay(),
                Some("You are terse.".into()),
                None,
            )
            .unwrap();
        let conversation = record.conversation.try_read().unwrap();
        assert_eq!(conversation.system_prompt(), Some("You are terse."));
    }

    #[tokio::test]
    async fn test_profile_reflects_conversation() {
        let registry = registry();
        let profile = registry.profile("default").await.unwrap();
        assert_eq!(profile.id, "default");
        assert_eq!(profile.message_count, 0);
        assert_eq!(profile.execution_state, ExecutionState::Idle);
    }
}
