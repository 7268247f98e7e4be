// Runtime configuration
//
// Typed defaults with environment overrides. The API binary loads .env
// via dotenvy before building this.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Engine timing and termination knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Iteration cap for run_response
    pub max_response_iterations: usize,
    /// Iteration cap for run_task
    pub max_task_iterations: usize,
    /// Provider connect timeout
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
    /// Idle timeout between stream chunks
    #[serde(with = "duration_secs")]
    pub idle_timeout: Duration,
    /// Appended as a user message between task iterations
    pub continuation_prompt: String,
    /// Stripped responses shorter than this count as trivial
    pub trivial_length: usize,
    /// Consecutive trivial responses that end the loop
    pub trivial_run_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_response_iterations: 10,
            max_task_iterations: 20,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            continuation_prompt: "Continue with the next step.".to_string(),
            trivial_length: 10,
            trivial_run_limit: 3,
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Top-level runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Id of the default agent created at startup
    pub default_agent_id: String,
    /// Executor concurrency cap
    pub max_concurrent_tasks: usize,
    /// Engine knobs
    pub engine: EngineConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            default_agent_id: "default".to_string(),
            max_concurrent_tasks: 10,
            engine: EngineConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Build from environment variables, falling back to defaults.
    /// Recognized: PENGUIN_MAX_CONCURRENT_TASKS, PENGUIN_MAX_ITERATIONS,
    /// PENGUIN_TASK_MAX_ITERATIONS, PENGUIN_DEFAULT_AGENT.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = env_usize("PENGUIN_MAX_CONCURRENT_TASKS") {
            config.max_concurrent_tasks = v.max(1);
        }
        if let Some(v) = env_usize("PENGUIN_MAX_ITERATIONS") {
            config.engine.max_response_iterations = v.max(1);
        }
        if let Some(v) = env_usize("PENGUIN_TASK_MAX_ITERATIONS") {
            config.engine.max_task_iterations = v.max(1);
        }
        if let Ok(v) = std::env::var("PENGUIN_DEFAULT_AGENT") {
            if !v.is_empty() {
                config.default_agent_id = v;
            }
        }

        config
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoreConfig::default();
        assert_eq!(config.max_concurrent_tasks, 10);
        assert_eq!(config.engine.max_response_iterations, 10);
        assert_eq!(config.engine.trivial_run_limit, 3);
        assert_eq!(config.engine.continuation_prompt, "Continue with the next step.");
    }
}
