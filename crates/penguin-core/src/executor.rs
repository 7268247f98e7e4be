// Background agent execution
//
// Runs agents concurrently behind a counted semaphore. Tasks beyond the
// cap wait in Pending until a slot frees. Each task is independently
// cancellable; pause is cooperative and takes effect at the engine's next
// suspension point through the PauseGate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{CoreError, Result};

/// State of a background agent task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    /// Whether the task has finished (no further transitions)
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

/// Cooperative pause switch shared with the engine. The engine parks on
/// `wait_if_paused` at its suspension points.
#[derive(Debug, Clone)]
pub struct PauseGate {
    rx: watch::Receiver<bool>,
    tx: Arc<watch::Sender<bool>>,
}

impl PauseGate {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            rx,
            tx: Arc::new(tx),
        }
    }

    pub fn pause(&self) {
        let _ = self.tx.send(true);
    }

    pub fn resume(&self) {
        let _ = self.tx.send(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.rx.borrow()
    }

    /// Block while the gate is engaged
    pub async fn wait_if_paused(&self) {
        let mut rx = self.rx.clone();
        while *rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Control handles threaded through a running task
#[derive(Debug, Clone)]
pub struct TaskControl {
    pub cancel: CancellationToken,
    pub pause: PauseGate,
}

/// What the executor actually runs. The core façade implements this by
/// driving the engine for the agent.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, agent_id: &str, prompt: &str, control: TaskControl) -> Result<String>;
}

/// Externally visible task snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTask {
    pub agent_id: String,
    pub prompt: String,
    pub state: TaskState,
    pub result: Option<String>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

/// Executor statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorStats {
    pub max_concurrent: usize,
    pub total_tasks: usize,
    pub state_counts: HashMap<TaskState, usize>,
}

struct TaskEntry {
    task: AgentTask,
    cancel: CancellationToken,
    pause: PauseGate,
    state_tx: watch::Sender<TaskState>,
    state_rx: watch::Receiver<TaskState>,
}

/// Concurrency-capped background agent runner
pub struct AgentExecutor {
    runner: Arc<dyn TaskRunner>,
    semaphore: Arc<Semaphore>,
    tasks: Arc<Mutex<HashMap<String, TaskEntry>>>,
    max_concurrent: usize,
}

impl AgentExecutor {
    pub fn new(runner: Arc<dyn TaskRunner>, max_concurrent: usize) -> Self {
        Self {
            runner,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            tasks: Arc::new(Mutex::new(HashMap::new())),
            max_concurrent,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Free slots right now
    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Schedule a background task for an agent. Errors if the agent
    /// already has a non-terminal task; a terminal one is replaced.
    pub async fn spawn(
        &self,
        agent_id: impl Into<String>,
        prompt: impl Into<String>,
        metadata: Option<BTreeMap<String, Value>>,
    ) -> Result<()> {
        let agent_id = agent_id.into();
        let prompt = prompt.into();

        let (cancel, pause, state_tx) = {
            let mut tasks = self.tasks.lock().await;
            if let Some(existing) = tasks.get(&agent_id) {
                if !existing.task.state.is_terminal() {
                    return Err(CoreError::ResourceExhausted(format!(
                        "agent '{}' already has an active task",
                        agent_id
                    )));
                }
            }

            let cancel = CancellationToken::new();
            let pause = PauseGate::new();
            let (state_tx, state_rx) = watch::channel(TaskState::Pending);
            let entry = TaskEntry {
                task: AgentTask {
                    agent_id: agent_id.clone(),
                    prompt: prompt.clone(),
                    state: TaskState::Pending,
                    result: None,
                    error: None,
                    started_at: None,
                    metadata: metadata.unwrap_or_default(),
                },
                cancel: cancel.clone(),
                pause: pause.clone(),
                state_tx: state_tx.clone(),
                state_rx,
            };
            tasks.insert(agent_id.clone(), entry);
            (cancel, pause, state_tx)
        };

        let runner = self.runner.clone();
        let semaphore = self.semaphore.clone();
        let tasks = self.tasks.clone();

        tokio::spawn(async move {
            // Wait for a slot; cancellation is honored while queued
            let permit = tokio::select! {
                permit = semaphore.acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => return,
                },
                _ = cancel.cancelled() => {
                    Self::transition(&tasks, &state_tx, &agent_id, TaskState::Cancelled, None, None).await;
                    return;
                }
            };

            Self::transition(&tasks, &state_tx, &agent_id, TaskState::Running, None, None).await;
            info!(agent_id = %agent_id, "agent task started");

            let control = TaskControl {
                cancel: cancel.clone(),
                pause,
            };
            let outcome = tokio::select! {
                outcome = runner.run(&agent_id, &prompt, control) => outcome,
                _ = cancel.cancelled() => Err(CoreError::Cancelled),
            };

            drop(permit);

            match outcome {
                Ok(result) => {
                    info!(agent_id = %agent_id, "agent task completed");
                    Self::transition(
                        &tasks,
                        &state_tx,
                        &agent_id,
                        TaskState::Completed,
                        Some(result),
                        None,
                    )
                    .await;
                }
                Err(CoreError::Cancelled) => {
                    info!(agent_id = %agent_id, "agent task cancelled");
                    Self::transition(
                        &tasks,
                        &state_tx,
                        &agent_id,
                        TaskState::Cancelled,
                        None,
                        None,
                    )
                    .await;
                }
                Err(err) => {
                    warn!(agent_id = %agent_id, error = %err, "agent task failed");
                    Self::transition(
                        &tasks,
                        &state_tx,
                        &agent_id,
                        TaskState::Failed,
                        None,
                        Some(err.to_string()),
                    )
                    .await;
                }
            }
        });

        Ok(())
    }

    /// Batch spawn; fails fast on the first rejected agent
    pub async fn spawn_many(&self, specs: Vec<(String, String)>) -> Result<()> {
        for (agent_id, prompt) in specs {
            self.spawn(agent_id, prompt, None).await?;
        }
        Ok(())
    }

    /// Block until the agent's task reaches a terminal state
    pub async fn wait_for(&self, agent_id: &str, timeout: Option<Duration>) -> Result<AgentTask> {
        let mut state_rx = {
            let tasks = self.tasks.lock().await;
            let entry = tasks
                .get(agent_id)
                .ok_or_else(|| CoreError::task(format!("no task for agent '{}'", agent_id)))?;
            entry.state_rx.clone()
        };

        let wait = async {
            while !state_rx.borrow().is_terminal() {
                if state_rx.changed().await.is_err() {
                    break;
                }
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| CoreError::task(format!("wait_for '{}' timed out", agent_id)))?,
            None => wait.await,
        }

        self.status(agent_id)
            .await
            .ok_or_else(|| CoreError::task(format!("no task for agent '{}'", agent_id)))
    }

    /// Wait for several agents (all tracked tasks when `ids` is None)
    pub async fn wait_for_all(
        &self,
        ids: Option<Vec<String>>,
        timeout: Option<Duration>,
    ) -> Result<HashMap<String, AgentTask>> {
        let ids = match ids {
            Some(ids) => ids,
            None => self.tasks.lock().await.keys().cloned().collect(),
        };

        let mut results = HashMap::new();
        for agent_id in ids {
            let task = self.wait_for(&agent_id, timeout).await?;
            results.insert(agent_id, task);
        }
        Ok(results)
    }

    /// Engage the pause gate; takes effect at the next suspension point
    pub async fn pause(&self, agent_id: &str) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        let entry = tasks
            .get_mut(agent_id)
            .ok_or_else(|| CoreError::task(format!("no task for agent '{}'", agent_id)))?;
        if entry.task.state != TaskState::Running {
            return Err(CoreError::Refused(format!(
                "task for '{}' is not running",
                agent_id
            )));
        }
        entry.pause.pause();
        entry.task.state = TaskState::Paused;
        let _ = entry.state_tx.send(TaskState::Paused);
        Ok(())
    }

    /// Release the pause gate
    pub async fn resume(&self, agent_id: &str) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        let entry = tasks
            .get_mut(agent_id)
            .ok_or_else(|| CoreError::task(format!("no task for agent '{}'", agent_id)))?;
        if entry.task.state != TaskState::Paused {
            return Err(CoreError::Refused(format!(
                "task for '{}' is not paused",
                agent_id
            )));
        }
        entry.pause.resume();
        entry.task.state = TaskState::Running;
        let _ = entry.state_tx.send(TaskState::Running);
        Ok(())
    }

    /// Cancel the agent's task (no-op once terminal)
    pub async fn cancel(&self, agent_id: &str) -> Result<bool> {
        let tasks = self.tasks.lock().await;
        let Some(entry) = tasks.get(agent_id) else {
            return Ok(false);
        };
        if entry.task.state.is_terminal() {
            return Ok(false);
        }
        // A paused task would never observe cancellation; release it first
        entry.pause.resume();
        entry.cancel.cancel();
        Ok(true)
    }

    /// Cancel everything; returns the number of tasks signalled
    pub async fn cancel_all(&self) -> Result<usize> {
        let ids: Vec<String> = self.tasks.lock().await.keys().cloned().collect();
        let mut cancelled = 0;
        for agent_id in ids {
            if self.cancel(&agent_id).await? {
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    /// Snapshot of one task
    pub async fn status(&self, agent_id: &str) -> Option<AgentTask> {
        self.tasks
            .lock()
            .await
            .get(agent_id)
            .map(|entry| entry.task.clone())
    }

    /// Snapshot of all tracked tasks
    pub async fn status_all(&self) -> HashMap<String, AgentTask> {
        self.tasks
            .lock()
            .await
            .iter()
            .map(|(id, entry)| (id.clone(), entry.task.clone()))
            .collect()
    }

    /// Remove a terminal task from tracking. Refuses non-terminal tasks.
    pub async fn cleanup(&self, agent_id: &str) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        let state = tasks.get(agent_id).map(|entry| entry.task.state);
        match state {
            None => Err(CoreError::task(format!("no task for agent '{}'", agent_id))),
            Some(state) if !state.is_terminal() => Err(CoreError::Refused(format!(
                "task for '{}' is still {:?}",
                agent_id, state
            ))),
            Some(_) => {
                tasks.remove(agent_id);
                Ok(())
            }
        }
    }

    /// Remove all terminal tasks; returns how many were removed
    pub async fn cleanup_all(&self) -> usize {
        let mut tasks = self.tasks.lock().await;
        let terminal: Vec<String> = tasks
            .iter()
            .filter(|(_, e)| e.task.state.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &terminal {
            tasks.remove(id);
        }
        terminal.len()
    }

    /// Counts per state plus the configured cap
    pub async fn stats(&self) -> ExecutorStats {
        let tasks = self.tasks.lock().await;
        let mut state_counts: HashMap<TaskState, usize> = HashMap::new();
        for entry in tasks.values() {
            *state_counts.entry(entry.task.state).or_insert(0) += 1;
        }
        ExecutorStats {
            max_concurrent: self.max_concurrent,
            total_tasks: tasks.len(),
            state_counts,
        }
    }

    /// Number of tasks currently running
    pub async fn running_count(&self) -> usize {
        self.tasks
            .lock()
            .await
            .values()
            .filter(|e| e.task.state == TaskState::Running)
            .count()
    }

    async fn transition(
        tasks: &Mutex<HashMap<String, TaskEntry>>,
        state_tx: &watch::Sender<TaskState>,
        agent_id: &str,
        state: TaskState,
        result: Option<String>,
        error: Option<String>,
    ) {
        let mut tasks = tasks.lock().await;
        if let Some(entry) = tasks.get_mut(agent_id) {
            entry.task.state = state;
            if state == TaskState::Running {
                entry.task.started_at = Some(Utc::now());
            }
            if result.is_some() {
                entry.task.result = result;
            }
            if error.is_some() {
                entry.task.error = error;
            }
        }
        let _ = state_tx.send(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Runner that sleeps briefly and records its peak concurrency
    struct ProbeRunner {
        active: AtomicUsize,
        peak: AtomicUsize,
        fail_agents: Vec<String>,
    }

    impl ProbeRunner {
        fn new() -> Self {
            Self {
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                fail_agents: Vec::new(),
            }
        }

        fn failing_for(agent: &str) -> Self {
            Self {
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                fail_agents: vec![agent.to_string()],
            }
        }
    }

    #[async_trait]
    impl TaskRunner for ProbeRunner {
        async fn run(&self, agent_id: &str, prompt: &str, control: TaskControl) -> Result<String> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            control.pause.wait_if_paused().await;
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            if self.fail_agents.iter().any(|a| a == agent_id) {
                return Err(CoreError::task("intentional failure"));
            }
            Ok(format!("done: {}", prompt))
        }
    }

    #[tokio::test]
    async fn test_concurrency_cap_respected() {
        let runner = Arc::new(ProbeRunner::new());
        let executor = AgentExecutor::new(runner.clone(), 2);
        executor
            .spawn_many(vec![
                ("a".into(), "1".into()),
                ("b".into(), "2".into()),
                ("c".into(), "3".into()),
            ])
            .await
            .unwrap();

        let results = executor.wait_for_all(None, Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.values().all(|t| t.state == TaskState::Completed));
        assert!(runner.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_failure_does_not_sink_others() {
        let runner = Arc::new(ProbeRunner::failing_for("b"));
        let executor = AgentExecutor::new(runner, 2);
        executor
            .spawn_many(vec![
                ("a".into(), "1".into()),
                ("b".into(), "2".into()),
                ("c".into(), "3".into()),
            ])
            .await
            .unwrap();

        let results = executor.wait_for_all(None, Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(results["a"].state, TaskState::Completed);
        assert_eq!(results["b"].state, TaskState::Failed);
        assert!(results["b"].error.as_deref().unwrap().contains("intentional"));
        assert_eq!(results["c"].state, TaskState::Completed);
    }

    #[tokio::test]
    async fn test_duplicate_spawn_rejected() {
        let executor = AgentExecutor::new(Arc::new(ProbeRunner::new()), 2);
        executor.spawn("a", "first", None).await.unwrap();
        let err = executor.spawn("a", "second", None).await.unwrap_err();
        assert_eq!(err.code(), "RESOURCE_EXHAUSTED");
        executor.wait_for("a", Some(Duration::from_secs(5))).await.unwrap();
        // Terminal task may be replaced
        executor.spawn("a", "third", None).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_pending_task() {
        // Cap of 1: the second task queues in Pending
        let executor = AgentExecutor::new(Arc::new(ProbeRunner::new()), 1);
        executor.spawn("a", "busy", None).await.unwrap();
        executor.spawn("b", "queued", None).await.unwrap();
        assert!(executor.cancel("b").await.unwrap());
        let task = executor.wait_for("b", Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(task.state, TaskState::Cancelled);
    }

    #[tokio::test]
    async fn test_cleanup_refuses_active() {
        let executor = AgentExecutor::new(Arc::new(ProbeRunner::new()), 2);
        executor.spawn("a", "work", None).await.unwrap();
        // Likely still pending/running here
        if let Err(err) = executor.cleanup("a").await {
            assert_eq!(err.code(), "OPERATION_REFUSED");
        }
        executor.wait_for("a", Some(Duration::from_secs(5))).await.unwrap();
        executor.cleanup("a").await.unwrap();
        assert!(executor.status("a").await.is_none());
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let executor = AgentExecutor::new(Arc::new(ProbeRunner::new()), 2);
        executor.spawn("a", "work", None).await.unwrap();

        // Wait until it is actually running before pausing
        for _ in 0..100 {
            if executor.running_count().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        if executor.pause("a").await.is_ok() {
            assert_eq!(executor.status("a").await.unwrap().state, TaskState::Paused);
            executor.resume("a").await.unwrap();
        }
        let task = executor.wait_for("a", Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(task.state, TaskState::Completed);
    }

    #[tokio::test]
    async fn test_stats_counts() {
        let executor = AgentExecutor::new(Arc::new(ProbeRunner::new()), 2);
        executor.spawn("a", "work", None).await.unwrap();
        executor.wait_for("a", Some(Duration::from_secs(5))).await.unwrap();
        let stats = executor.stats().await;
        assert_eq!(stats.total_tasks, 1);
        assert_eq!(stats.state_counts.get(&TaskState::Completed), Some(&1));
        assert_eq!(stats.max_concurrent, 2);
    }
}
