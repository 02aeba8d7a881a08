//! Orchestrator configuration.

use crate::validation::ValidationFallback;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Tunables for a turn orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Node retries before the DM is asked to intervene.
    pub max_retries: u32,

    /// Clarification rounds before the turn moves on regardless.
    pub max_clarification_rounds: u32,

    /// Generation attempts per character action.
    pub max_validation_attempts: u32,

    /// What to do with an action that still narrates outcomes.
    pub validation_fallback: ValidationFallback,

    /// Lifetime of routed messages.
    pub message_ttl: Duration,

    pub memory_search_limit: usize,
    pub apply_memory_corruption: bool,

    pub consensus_max_rounds: u32,
    pub consensus_timeout: Duration,

    /// Per-job time limit at the dispatch boundary.
    pub job_timeout: Duration,

    /// Concurrent jobs per role queue.
    pub job_concurrency: usize,

    /// Messages fetched when building agent context.
    pub message_history_limit: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_clarification_rounds: 3,
            max_validation_attempts: 3,
            validation_fallback: ValidationFallback::AutoCorrect,
            message_ttl: Duration::from_secs(24 * 60 * 60),
            memory_search_limit: 5,
            apply_memory_corruption: false,
            consensus_max_rounds: 3,
            consensus_timeout: Duration::from_secs(120),
            job_timeout: Duration::from_secs(60),
            job_concurrency: 8,
            message_history_limit: 50,
        }
    }
}

impl OrchestratorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by any `LF_*` variables that parse.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        let read = |key: &str| -> Option<String> { lookup(key).filter(|v| !v.trim().is_empty()) };

        if let Some(v) = parse_var::<u32>("LF_MAX_RETRIES", read("LF_MAX_RETRIES")) {
            config.max_retries = v;
        }
        if let Some(v) =
            parse_var::<u32>("LF_MAX_CLARIFICATION_ROUNDS", read("LF_MAX_CLARIFICATION_ROUNDS"))
        {
            config.max_clarification_rounds = v;
        }
        if let Some(v) =
            parse_var::<u32>("LF_MAX_VALIDATION_ATTEMPTS", read("LF_MAX_VALIDATION_ATTEMPTS"))
        {
            config.max_validation_attempts = v.max(1);
        }
        if let Some(v) =
            parse_var::<ValidationFallback>("LF_VALIDATION_FALLBACK", read("LF_VALIDATION_FALLBACK"))
        {
            config.validation_fallback = v;
        }
        if let Some(v) = parse_var::<u64>("LF_MESSAGE_TTL_SECS", read("LF_MESSAGE_TTL_SECS")) {
            config.message_ttl = Duration::from_secs(v);
        }
        if let Some(v) = parse_var::<usize>("LF_MEMORY_SEARCH_LIMIT", read("LF_MEMORY_SEARCH_LIMIT")) {
            config.memory_search_limit = v;
        }
        if let Some(v) =
            parse_var::<bool>("LF_APPLY_MEMORY_CORRUPTION", read("LF_APPLY_MEMORY_CORRUPTION"))
        {
            config.apply_memory_corruption = v;
        }
        if let Some(v) = parse_var::<u32>("LF_CONSENSUS_MAX_ROUNDS", read("LF_CONSENSUS_MAX_ROUNDS")) {
            config.consensus_max_rounds = v;
        }
        if let Some(v) =
            parse_var::<u64>("LF_CONSENSUS_TIMEOUT_SECS", read("LF_CONSENSUS_TIMEOUT_SECS"))
        {
            config.consensus_timeout = Duration::from_secs(v);
        }
        if let Some(v) = parse_var::<u64>("LF_JOB_TIMEOUT_SECS", read("LF_JOB_TIMEOUT_SECS")) {
            config.job_timeout = Duration::from_secs(v);
        }
        if let Some(v) = parse_var::<usize>("LF_JOB_CONCURRENCY", read("LF_JOB_CONCURRENCY")) {
            config.job_concurrency = v.max(1);
        }
        if let Some(v) =
            parse_var::<usize>("LF_MESSAGE_HISTORY_LIMIT", read("LF_MESSAGE_HISTORY_LIMIT"))
        {
            config.message_history_limit = v;
        }

        config
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_max_clarification_rounds(mut self, rounds: u32) -> Self {
        self.max_clarification_rounds = rounds;
        self
    }

    pub fn with_max_validation_attempts(mut self, attempts: u32) -> Self {
        self.max_validation_attempts = attempts.max(1);
        self
    }

    pub fn with_validation_fallback(mut self, fallback: ValidationFallback) -> Self {
        self.validation_fallback = fallback;
        self
    }

    pub fn with_message_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = ttl;
        self
    }

    pub fn with_memory_search_limit(mut self, limit: usize) -> Self {
        self.memory_search_limit = limit;
        self
    }

    pub fn with_memory_corruption(mut self, apply: bool) -> Self {
        self.apply_memory_corruption = apply;
        self
    }

    pub fn with_consensus(mut self, max_rounds: u32, timeout: Duration) -> Self {
        self.consensus_max_rounds = max_rounds;
        self.consensus_timeout = timeout;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_job_concurrency(mut self, concurrency: usize) -> Self {
        self.job_concurrency = concurrency.max(1);
        self
    }

    pub fn with_message_history_limit(mut self, limit: usize) -> Self {
        self.message_history_limit = limit;
        self
    }
}

fn parse_var<T: FromStr>(key: &str, value: Option<String>) -> Option<T> {
    let raw = value?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring unparsable setting");
            None
        }
    }
}
