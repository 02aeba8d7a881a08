//! Consensus detection over out-of-character discussion.
//!
//! Stance extraction is pluggable. The built-in [`KeywordClassifier`] is
//! lenient toward casual agreement ("sure", "works for me") and strict about
//! rejection: only explicit phrasing counts as disagreement, and anything
//! ambiguous is neutral.

use crate::message::Message;
use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// How many of the newest messages are considered.
const DISCUSSION_WINDOW: usize = 20;

/// How many of an agent's newest contributions are read.
const CONTRIBUTIONS_PER_AGENT: usize = 2;

/// Errors from consensus detection.
#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("Consensus needs at least one agent")]
    NoAgents,

    #[error("Could not classify stance for {agent_id}: {reason}")]
    Classification { agent_id: String, reason: String },
}

impl ConsensusError {
    /// Classifier failures may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConsensusError::Classification { .. })
    }
}

/// Overall agreement state of a discussion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusState {
    Unanimous,
    Majority,
    Conflicted,
    Timeout,
}

/// One agent's position on the current plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stance {
    Agree,
    Disagree,
    Neutral,
    Silent,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AgentPosition {
    pub stance: Stance,
    pub confidence: f32,
}

impl AgentPosition {
    pub fn new(stance: Stance, confidence: f32) -> Self {
        Self {
            stance,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    pub fn silent() -> Self {
        Self::new(Stance::Silent, 1.0)
    }
}

/// Snapshot of a discussion's consensus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub state: ConsensusState,
    pub positions: BTreeMap<String, AgentPosition>,
    pub proceed_with_action: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dissenting_agents: Option<Vec<String>>,
    pub rounds_elapsed: u32,
}

/// Classifies one agent's stance from its latest contributions (newest first).
#[async_trait]
pub trait StanceClassifier: Send + Sync {
    async fn classify(
        &self,
        agent_id: &str,
        contributions: &[&Message],
    ) -> Result<AgentPosition, ConsensusError>;
}

lazy_static::lazy_static! {
    static ref REJECTION: Regex = Regex::new(
        r"(?i)\b(i disagree|disagree|don'?t agree|do not agree|i object|object to|oppose|reject|bad idea|terrible idea|not a good idea|no way|won'?t work|absolutely not|veto|against (this|that|it))\b"
    ).expect("rejection pattern is valid");

    static ref NEGATED_REJECTION: Regex = Regex::new(
        r"(?i)\b(don'?t|do not|doesn'?t|not|never|i'?m not|am not)\s+(disagree|disagreeing|object|objecting|opposed?|against)\b"
    ).expect("negated rejection pattern is valid");

    static ref HEDGE: Regex = Regex::new(
        r"(?i)\b(not sure|unsure|not certain|don'?t know|no idea|maybe)\b"
    ).expect("hedge pattern is valid");

    static ref AGREEMENT: Regex = Regex::new(
        r"(?i)\b(agree|agreed|yes|yeah|yep|sure|ok|okay|sounds good|sounds great|good plan|great plan|works for me|fine by me|let'?s do it|let'?s go|go for it|on board|i'?m in|count me in|do it|makes sense)\b"
    ).expect("agreement pattern is valid");
}

/// Phrase-based classifier with no external calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordClassifier;

impl KeywordClassifier {
    fn stance_of(text: &str) -> (Stance, f32) {
        // "I don't disagree" is not a rejection; judge what is left without it.
        let negated = NEGATED_REJECTION.is_match(text);
        let rest = NEGATED_REJECTION.replace_all(text, " ");

        if REJECTION.is_match(&rest) {
            (Stance::Disagree, 0.9)
        } else if HEDGE.is_match(&rest) {
            (Stance::Neutral, 0.6)
        } else if AGREEMENT.is_match(&rest) || rest.contains("+1") {
            (Stance::Agree, 0.8)
        } else if negated {
            (Stance::Agree, 0.7)
        } else {
            (Stance::Neutral, 0.5)
        }
    }
}

#[async_trait]
impl StanceClassifier for KeywordClassifier {
    async fn classify(
        &self,
        _agent_id: &str,
        contributions: &[&Message],
    ) -> Result<AgentPosition, ConsensusError> {
        for message in contributions {
            let (stance, confidence) = Self::stance_of(&message.content);
            if stance != Stance::Neutral {
                return Ok(AgentPosition::new(stance, confidence));
            }
        }
        Ok(AgentPosition::new(Stance::Neutral, 0.5))
    }
}

/// Classifies a multi-agent discussion into a consensus state.
#[derive(Clone)]
pub struct ConsensusDetector {
    classifier: Arc<dyn StanceClassifier>,
}

impl Default for ConsensusDetector {
    fn default() -> Self {
        Self::new(Arc::new(KeywordClassifier))
    }
}

impl ConsensusDetector {
    pub fn new(classifier: Arc<dyn StanceClassifier>) -> Self {
        Self { classifier }
    }

    /// Each agent's stance over the recent discussion window.
    pub async fn extract_positions(
        &self,
        messages: &[Message],
        agents: &[String],
    ) -> Result<BTreeMap<String, AgentPosition>, ConsensusError> {
        if agents.is_empty() {
            return Err(ConsensusError::NoAgents);
        }

        let window_start = messages.len().saturating_sub(DISCUSSION_WINDOW);
        let window = &messages[window_start..];

        let mut positions = BTreeMap::new();
        for agent_id in agents {
            let latest: Vec<&Message> = window
                .iter()
                .rev()
                .filter(|m| &m.from_agent == agent_id)
                .take(CONTRIBUTIONS_PER_AGENT)
                .collect();

            let position = if latest.is_empty() {
                AgentPosition::silent()
            } else {
                self.classifier.classify(agent_id, &latest).await?
            };
            positions.insert(agent_id.clone(), position);
        }
        Ok(positions)
    }

    /// Classify the discussion, forcing a decision once rounds or time run out.
    pub async fn detect_consensus(
        &self,
        messages: &[Message],
        agents: &[String],
        max_rounds: u32,
        timeout: Duration,
    ) -> Result<ConsensusResult, ConsensusError> {
        let positions = self.extract_positions(messages, agents).await?;
        let rounds_elapsed = rounds_elapsed(messages, agents);

        let dissenters: Vec<String> = positions
            .iter()
            .filter(|(_, p)| p.stance == Stance::Disagree)
            .map(|(id, _)| id.clone())
            .collect();
        let voiced: Vec<&AgentPosition> = positions
            .values()
            .filter(|p| p.stance != Stance::Silent)
            .collect();
        let agree_count = voiced.iter().filter(|p| p.stance == Stance::Agree).count();

        let elapsed = messages
            .iter()
            .map(|m| m.timestamp)
            .min()
            .map(|start| (Utc::now() - start).to_std().unwrap_or_default())
            .unwrap_or_default();
        let out_of_time = rounds_elapsed >= max_rounds || elapsed >= timeout;

        let (state, proceed, dissenting_agents) = if !dissenters.is_empty() {
            (ConsensusState::Conflicted, false, Some(dissenters))
        } else if agree_count > 0 && agree_count == voiced.len() {
            (ConsensusState::Unanimous, true, None)
        } else if agree_count * 2 > agents.len() {
            (ConsensusState::Majority, true, None)
        } else if out_of_time {
            (ConsensusState::Timeout, true, None)
        } else {
            (ConsensusState::Conflicted, false, None)
        };

        debug!(
            state = ?state,
            agents = agents.len(),
            agree = agree_count,
            rounds = rounds_elapsed,
            "Detected consensus"
        );

        Ok(ConsensusResult {
            state,
            positions,
            proceed_with_action: proceed,
            dissenting_agents,
            rounds_elapsed,
        })
    }
}

/// Rounds are the most contributions any one agent has made.
fn rounds_elapsed(messages: &[Message], agents: &[String]) -> u32 {
    agents
        .iter()
        .map(|a| messages.iter().filter(|m| &m.from_agent == a).count())
        .max()
        .unwrap_or(0) as u32
}
