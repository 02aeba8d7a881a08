//! Memory service used for retrieval and consolidation.
//!
//! Memories are temporal edges: each has a validity window and is owned by
//! one agent. Three kinds are tracked:
//! - Episodic: what happened during play
//! - Semantic: general facts about the setting
//! - Procedural: how the agent tends to do things

use crate::id::{EpisodeId, MemoryId};
use crate::message::Message;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

/// Errors from the memory service.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MemoryError {
    #[error("Invalid agent id {0:?}: expected an agent_ or char_ prefix")]
    InvalidAgentId(String),

    #[error("invalid_at {invalid_at} must be after valid_at {valid_at}")]
    InvalidWindow {
        valid_at: DateTime<Utc>,
        invalid_at: DateTime<Utc>,
    },

    #[error("Memory service unavailable: {0}")]
    Unavailable(String),
}

impl MemoryError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, MemoryError::Unavailable(_))
    }
}

/// Check that an id names a player or a character.
pub fn validate_agent_id(agent_id: &str) -> Result<(), MemoryError> {
    let valid = ["agent_", "char_"]
        .iter()
        .any(|p| agent_id.len() > p.len() && agent_id.starts_with(p));
    if valid {
        Ok(())
    } else {
        Err(MemoryError::InvalidAgentId(agent_id.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    Episodic,
    Semantic,
    Procedural,
}

/// What happened to a corrupted recollection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorruptionInfo {
    pub original_fact: String,
    pub corrupted_at: DateTime<Utc>,
    pub kinds: Vec<String>,
}

/// A single remembered fact with its validity window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEdge {
    pub uuid: MemoryId,
    pub fact: String,
    pub valid_at: DateTime<Utc>,
    #[serde(default)]
    pub invalid_at: Option<DateTime<Utc>>,
    pub agent_id: String,
    pub memory_type: MemoryType,
    #[serde(default)]
    pub session_number: Option<u32>,
    #[serde(default)]
    pub turn_number: Option<u32>,
    #[serde(default)]
    pub in_game_day: Option<u32>,
    pub confidence: f32,
    pub importance: f32,
    pub rehearsal_count: u32,
    #[serde(default)]
    pub corruption: Option<CorruptionInfo>,
}

impl MemoryEdge {
    pub fn new(agent_id: impl Into<String>, fact: impl Into<String>, memory_type: MemoryType) -> Self {
        Self {
            uuid: MemoryId::new(),
            fact: fact.into(),
            valid_at: Utc::now(),
            invalid_at: None,
            agent_id: agent_id.into(),
            memory_type,
            session_number: None,
            turn_number: None,
            in_game_day: None,
            confidence: 1.0,
            importance: 0.5,
            rehearsal_count: 0,
            corruption: None,
        }
    }

    pub fn with_importance(mut self, importance: f32) -> Self {
        self.importance = importance.clamp(0.0, 1.0);
        self
    }

    pub fn with_valid_at(mut self, valid_at: DateTime<Utc>) -> Self {
        self.valid_at = valid_at;
        self
    }

    pub fn at(mut self, session_number: u32, turn_number: u32) -> Self {
        self.session_number = Some(session_number);
        self.turn_number = Some(turn_number);
        self
    }

    /// Whether the edge holds at `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.valid_at <= now && self.invalid_at.map_or(true, |end| end > now)
    }
}

/// Parameters for a memory search.
#[derive(Debug, Clone)]
pub struct MemoryQuery {
    pub query: String,
    pub agent_id: String,
    pub session_number: Option<u32>,
    pub turn_number: Option<u32>,
    pub apply_corruption: bool,
    pub limit: usize,
}

impl MemoryQuery {
    pub fn new(query: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            agent_id: agent_id.into(),
            session_number: None,
            turn_number: None,
            apply_corruption: false,
            limit: 5,
        }
    }

    pub fn in_session(mut self, session_number: u32) -> Self {
        self.session_number = Some(session_number);
        self
    }

    pub fn at_turn(mut self, turn_number: u32) -> Self {
        self.turn_number = Some(turn_number);
        self
    }

    pub fn with_corruption(mut self, apply: bool) -> Self {
        self.apply_corruption = apply;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorruptionStats {
    pub agent_id: String,
    pub total_memories: usize,
    pub retrievals: u64,
    pub corrupted_retrievals: u64,
    pub corruption_rate: f32,
}

/// Memory-service collaborator.
#[async_trait]
pub trait MemoryService: Send + Sync {
    /// Valid memories for the agent, best match first. Every returned edge
    /// has its rehearsal count bumped.
    async fn search(&self, query: &MemoryQuery) -> Result<Vec<MemoryEdge>, MemoryError>;

    /// Store a batch of messages as episodic memory owned by `group_id`.
    async fn add_episode(
        &self,
        session_number: u32,
        messages: &[Message],
        reference_time: DateTime<Utc>,
        group_id: &str,
    ) -> Result<EpisodeId, MemoryError>;

    /// Close an edge's validity window. Returns false for an unknown uuid.
    async fn invalidate_memory(
        &self,
        uuid: MemoryId,
        at: Option<DateTime<Utc>>,
    ) -> Result<bool, MemoryError>;

    async fn get_corruption_stats(&self, agent_id: &str) -> Result<CorruptionStats, MemoryError>;
}

lazy_static::lazy_static! {
    static ref NUMBER: Regex = Regex::new(r"\b\d+\b").expect("number pattern is valid");
    static ref ABSOLUTE: Regex = Regex::new(r"(?i)\b(always|never|all|every|none)\b")
        .expect("absolute pattern is valid");
}

/// Distort a recollection the way memory drifts: counts shift by one and
/// absolutes soften. Returns `None` if nothing in the fact can drift.
pub fn corrupt_fact(fact: &str) -> Option<(String, Vec<String>)> {
    let mut kinds = Vec::new();
    let mut text = fact.to_string();

    if NUMBER.is_match(&text) {
        // Counts too large to shift stay as they are.
        let drifted = NUMBER
            .replace_all(&text, |caps: &Captures| {
                caps[0]
                    .parse::<u64>()
                    .ok()
                    .and_then(|n| n.checked_add(1))
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned();
        if drifted != text {
            text = drifted;
            kinds.push("number_drift".to_string());
        }
    }

    if ABSOLUTE.is_match(&text) {
        text = ABSOLUTE
            .replace_all(&text, |caps: &Captures| {
                match caps[0].to_lowercase().as_str() {
                    "always" => "usually",
                    "never" => "rarely",
                    "all" | "every" => "most",
                    _ => "few",
                }
                .to_string()
            })
            .into_owned();
        kinds.push("softened_absolute".to_string());
    }

    (!kinds.is_empty()).then_some((text, kinds))
}

/// Chance that a recollection drifts. Grows with age, shrinks with importance
/// and with rehearsal.
pub fn corruption_probability(edge: &MemoryEdge, now: DateTime<Utc>) -> f32 {
    let age_days = (now - edge.valid_at).num_hours().max(0) as f32 / 24.0;
    let base = 0.05 + 0.02 * age_days;
    let p = base * (1.0 - 0.5 * edge.importance) / (1.0 + 0.1 * edge.rehearsal_count as f32);
    p.clamp(0.0, 0.75)
}

fn keywords(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(|w| w.to_lowercase())
        .collect()
}

#[derive(Debug, Default)]
struct Inner {
    edges: HashMap<MemoryId, MemoryEdge>,
    retrievals: HashMap<String, (u64, u64)>,
    episodes: HashMap<EpisodeId, Vec<MemoryId>>,
}

/// Process-local memory service with keyword ranking.
#[derive(Debug, Default)]
pub struct InMemoryMemoryService {
    inner: RwLock<Inner>,
    certain_corruption: bool,
}

impl InMemoryMemoryService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Corrupt every eligible recollection instead of sampling.
    pub fn with_certain_corruption(mut self) -> Self {
        self.certain_corruption = true;
        self
    }

    fn should_corrupt(&self, edge: &MemoryEdge, now: DateTime<Utc>) -> bool {
        self.certain_corruption
            || rand::thread_rng().gen::<f32>() < corruption_probability(edge, now)
    }

    /// Insert an edge directly.
    pub async fn add_memory(&self, edge: MemoryEdge) -> Result<MemoryId, MemoryError> {
        validate_agent_id(&edge.agent_id)?;
        if let Some(end) = edge.invalid_at {
            if end <= edge.valid_at {
                return Err(MemoryError::InvalidWindow {
                    valid_at: edge.valid_at,
                    invalid_at: end,
                });
            }
        }
        let id = edge.uuid;
        self.inner.write().await.edges.insert(id, edge);
        Ok(id)
    }

    pub async fn get(&self, uuid: MemoryId) -> Option<MemoryEdge> {
        self.inner.read().await.edges.get(&uuid).cloned()
    }

    /// Every edge owned by an agent, valid or not.
    pub async fn memories_for(&self, agent_id: &str) -> Vec<MemoryEdge> {
        let inner = self.inner.read().await;
        let mut edges: Vec<MemoryEdge> = inner
            .edges
            .values()
            .filter(|e| e.agent_id == agent_id)
            .cloned()
            .collect();
        edges.sort_by_key(|e| e.valid_at);
        edges
    }

    pub async fn episode_count(&self) -> usize {
        self.inner.read().await.episodes.len()
    }
}

fn importance_of(message: &Message) -> f32 {
    use crate::message::MessageType::*;
    match message.message_type {
        Outcome | Insight | Roll => 0.8,
        Action | Ruling | Narration => 0.6,
        _ => 0.4,
    }
}

#[async_trait]
impl MemoryService for InMemoryMemoryService {
    async fn search(&self, query: &MemoryQuery) -> Result<Vec<MemoryEdge>, MemoryError> {
        validate_agent_id(&query.agent_id)?;
        if query.limit == 0 {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let wanted = keywords(&query.query);
        let mut inner = self.inner.write().await;

        let mut scored: Vec<(f32, MemoryId)> = inner
            .edges
            .values()
            .filter(|e| e.agent_id == query.agent_id && e.is_valid_at(now))
            .filter(|e| query.session_number.map_or(true, |s| e.session_number == Some(s)))
            .filter(|e| query.turn_number.map_or(true, |t| e.turn_number == Some(t)))
            .filter_map(|e| {
                let overlap = keywords(&e.fact).intersection(&wanted).count();
                if wanted.is_empty() {
                    Some((e.importance, e.uuid))
                } else if overlap > 0 {
                    Some((overlap as f32 * (0.5 + e.importance), e.uuid))
                } else {
                    None
                }
            })
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
        scored.truncate(query.limit);

        let mut results = Vec::with_capacity(scored.len());
        let mut corrupted = 0u64;
        for (_, id) in scored {
            let Some(edge) = inner.edges.get_mut(&id) else {
                continue;
            };
            edge.rehearsal_count += 1;
            let mut recalled = edge.clone();

            if query.apply_corruption && self.should_corrupt(&recalled, now) {
                if let Some((fact, kinds)) = corrupt_fact(&recalled.fact) {
                    recalled.corruption = Some(CorruptionInfo {
                        original_fact: std::mem::replace(&mut recalled.fact, fact),
                        corrupted_at: now,
                        kinds,
                    });
                    recalled.confidence *= 0.8;
                    corrupted += 1;
                }
            }
            results.push(recalled);
        }

        let stats = inner.retrievals.entry(query.agent_id.clone()).or_default();
        stats.0 += results.len() as u64;
        stats.1 += corrupted;

        debug!(
            agent_id = %query.agent_id,
            results = results.len(),
            corrupted,
            "Memory search"
        );
        Ok(results)
    }

    async fn add_episode(
        &self,
        session_number: u32,
        messages: &[Message],
        reference_time: DateTime<Utc>,
        group_id: &str,
    ) -> Result<EpisodeId, MemoryError> {
        validate_agent_id(group_id)?;

        let episode_id = EpisodeId::new();
        let mut inner = self.inner.write().await;
        let mut ids = Vec::with_capacity(messages.len());
        for message in messages {
            let mut edge = MemoryEdge::new(
                group_id,
                format!("{}: {}", message.from_agent, message.content),
                MemoryType::Episodic,
            )
            .with_valid_at(reference_time)
            .with_importance(importance_of(message))
            .at(session_number, message.turn_number);
            edge.session_number = Some(message.session_number.unwrap_or(session_number));
            ids.push(edge.uuid);
            inner.edges.insert(edge.uuid, edge);
        }
        inner.episodes.insert(episode_id, ids);

        debug!(%episode_id, group_id, messages = messages.len(), "Stored episode");
        Ok(episode_id)
    }

    async fn invalidate_memory(
        &self,
        uuid: MemoryId,
        at: Option<DateTime<Utc>>,
    ) -> Result<bool, MemoryError> {
        let mut inner = self.inner.write().await;
        let Some(edge) = inner.edges.get_mut(&uuid) else {
            return Ok(false);
        };
        let at = at.unwrap_or_else(Utc::now);
        if at <= edge.valid_at {
            return Err(MemoryError::InvalidWindow {
                valid_at: edge.valid_at,
                invalid_at: at,
            });
        }
        edge.invalid_at = Some(at);
        Ok(true)
    }

    async fn get_corruption_stats(&self, agent_id: &str) -> Result<CorruptionStats, MemoryError> {
        validate_agent_id(agent_id)?;
        let inner = self.inner.read().await;
        let total_memories = inner.edges.values().filter(|e| e.agent_id == agent_id).count();
        let (retrievals, corrupted_retrievals) =
            inner.retrievals.get(agent_id).copied().unwrap_or((0, 0));
        let corruption_rate = if retrievals == 0 {
            0.0
        } else {
            corrupted_retrievals as f32 / retrievals as f32
        };
        Ok(CorruptionStats {
            agent_id: agent_id.to_string(),
            total_memories,
            retrievals,
            corrupted_retrievals,
            corruption_rate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;
    use crate::state::TurnPhase;
    use chrono::Duration;

    #[tokio::test]
    async fn test_search_skips_invalidated() {
        let memory = InMemoryMemoryService::new();
        let past = Utc::now() - Duration::hours(2);
        let id = memory
            .add_memory(
                MemoryEdge::new("char_zara", "The signal came from a derelict", MemoryType::Episodic)
                    .with_valid_at(past),
            )
            .await
            .unwrap();

        let q = MemoryQuery::new("signal derelict", "char_zara");
        assert_eq!(memory.search(&q).await.unwrap().len(), 1);

        assert!(memory
            .invalidate_memory(id, Some(past + Duration::minutes(30)))
            .await
            .unwrap());
        assert!(memory.search(&q).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rehearsal_increases() {
        let memory = InMemoryMemoryService::new();
        memory
            .add_memory(MemoryEdge::new("agent_alex", "Zara always scans first", MemoryType::Procedural))
            .await
            .unwrap();
        let q = MemoryQuery::new("scans", "agent_alex");
        let first = memory.search(&q).await.unwrap()[0].rehearsal_count;
        let second = memory.search(&q).await.unwrap()[0].rehearsal_count;
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_agent_id_prefix_required() {
        let memory = InMemoryMemoryService::new();
        let err = memory.search(&MemoryQuery::new("x", "zara")).await.unwrap_err();
        assert!(matches!(err, MemoryError::InvalidAgentId(_)));
        assert!(!err.is_retryable());
        assert!(memory.get_corruption_stats("agent_").await.is_err());
    }

    #[tokio::test]
    async fn test_invalidate_before_valid_at_rejected() {
        let memory = InMemoryMemoryService::new();
        let edge = MemoryEdge::new("char_zara", "Engines hum", MemoryType::Semantic);
        let valid_at = edge.valid_at;
        let id = memory.add_memory(edge).await.unwrap();
        let err = memory.invalidate_memory(id, Some(valid_at)).await.unwrap_err();
        assert!(matches!(err, MemoryError::InvalidWindow { .. }));
        assert!(!memory.invalidate_memory(MemoryId::new(), None).await.unwrap());
    }

    #[tokio::test]
    async fn test_corruption_keeps_original() {
        let memory = InMemoryMemoryService::new().with_certain_corruption();
        memory
            .add_memory(MemoryEdge::new("char_zara", "We counted 3 pods, all empty", MemoryType::Episodic))
            .await
            .unwrap();
        let q = MemoryQuery::new("pods", "char_zara").with_corruption(true);
        let recalled = &memory.search(&q).await.unwrap()[0];
        assert_eq!(recalled.fact, "We counted 4 pods, most empty");
        let info = recalled.corruption.as_ref().unwrap();
        assert_eq!(info.original_fact, "We counted 3 pods, all empty");

        let stats = memory.get_corruption_stats("char_zara").await.unwrap();
        assert_eq!(stats.corrupted_retrievals, 1);
        assert_eq!(stats.corruption_rate, 1.0);
    }

    #[test]
    fn test_corrupt_fact_leaves_unshiftable_counts() {
        assert_eq!(corrupt_fact("The beacon repeats 18446744073709551615 times"), None);
        assert_eq!(
            corrupt_fact("The beacon repeats 99999999999999999999999 times"),
            None
        );

        let (text, kinds) =
            corrupt_fact("18446744073709551615 pings, then 7 more, always").unwrap();
        assert_eq!(text, "18446744073709551615 pings, then 8 more, usually");
        assert_eq!(kinds, vec!["number_drift", "softened_absolute"]);
    }

    #[tokio::test]
    async fn test_add_episode_owned_by_group() {
        let memory = InMemoryMemoryService::new();
        let msgs = vec![Message::ic(
            "dm",
            "A signal pulses from deep space",
            MessageType::Narration,
            TurnPhase::DmNarration,
            1,
        )];
        memory.add_episode(2, &msgs, Utc::now(), "char_zara").await.unwrap();
        let stored = memory.memories_for("char_zara").await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].session_number, Some(2));
        assert!(stored[0].fact.contains("signal"));
        assert!(memory.add_episode(2, &msgs, Utc::now(), "dm").await.is_err());
    }

    #[test]
    fn test_corruption_probability_shape() {
        let now = Utc::now();
        let fresh = MemoryEdge::new("char_zara", "x", MemoryType::Episodic);
        let old = fresh.clone().with_valid_at(now - Duration::days(30));
        let vital = old.clone().with_importance(1.0);
        let mut rehearsed = old.clone();
        rehearsed.rehearsal_count = 10;

        let p_old = corruption_probability(&old, now);
        assert!(p_old > corruption_probability(&fresh, now));
        assert!(corruption_probability(&vital, now) < p_old);
        assert!(corruption_probability(&rehearsed, now) < p_old);
    }
}
