//! Three-channel message router.
//!
//! Visibility is fixed:
//!
//! | Channel | Characters            | Players            |
//! |---------|-----------------------|--------------------|
//! | IC      | full content          | 100-char summaries |
//! | OOC     | nothing               | full content       |
//! | P2C     | only their own        | nothing            |
//!
//! A character must never see OOC strategy, and a player must never see raw
//! in-character prose.

use crate::message::{Channel, Message, MessageError};
use crate::state::TurnPhase;
use crate::store::{MessageStore, StoreError};
use crate::id::MessageId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const IC_KEY: &str = "channel:ic";
const IC_SUMMARY_KEY: &str = "channel:ic:summary";
const OOC_KEY: &str = "channel:ooc";
const P2C_PREFIX: &str = "channel:p2c:";
const P2C_INDEX_KEY: &str = "channel:p2c:index";

/// Default time-to-live on every channel key.
pub const DEFAULT_MESSAGE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Longest summary players see for an IC message.
pub const SUMMARY_MAX_CHARS: usize = 100;

/// Errors from routing and retrieval.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("Invalid message: {0}")]
    Message(#[from] MessageError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Stored message is corrupt: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown agent type: {0}")]
    UnknownAgentType(String),
}

/// Which layer an agent belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    /// In-fiction roleplay agent.
    Character,
    /// Strategic out-of-character agent (base persona).
    Player,
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentType::Character => f.write_str("character"),
            AgentType::Player => f.write_str("player"),
        }
    }
}

impl FromStr for AgentType {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "character" => Ok(AgentType::Character),
            "player" | "base_persona" => Ok(AgentType::Player),
            other => Err(RouterError::UnknownAgentType(other.to_string())),
        }
    }
}

/// How many of a message's list appends have landed in the store.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RouteProgress {
    appended: usize,
}

impl RouteProgress {
    pub fn appended(&self) -> usize {
        self.appended
    }
}

/// Outcome of routing one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteResult {
    pub success: bool,
    pub recipients_count: usize,
}

/// What players are allowed to see of an IC message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageSummary {
    pub message_id: MessageId,
    pub from_agent: String,
    pub summary: String,
    pub timestamp: DateTime<Utc>,
    pub phase: TurnPhase,
    pub turn_number: u32,
}

impl MessageSummary {
    fn of(message: &Message) -> Self {
        Self {
            message_id: message.message_id,
            from_agent: message.from_agent.clone(),
            summary: summarize(&message.content),
            timestamp: message.timestamp,
            phase: message.phase,
            turn_number: message.turn_number,
        }
    }
}

/// Truncate to at most [`SUMMARY_MAX_CHARS`] characters.
pub fn summarize(content: &str) -> String {
    let char_count = content.chars().count();
    if char_count <= SUMMARY_MAX_CHARS {
        return content.to_string();
    }
    let truncated: String = content.chars().take(SUMMARY_MAX_CHARS - 3).collect();
    format!("{}...", truncated.trim_end())
}

#[derive(Debug, Default)]
struct Audience {
    characters: BTreeSet<String>,
    players: BTreeSet<String>,
}

/// Routes messages into the backing store and enforces who reads what.
pub struct MessageRouter {
    store: Arc<dyn MessageStore>,
    ttl: Duration,
    audience: RwLock<Audience>,
}

impl MessageRouter {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self {
            store,
            ttl: DEFAULT_MESSAGE_TTL,
            audience: RwLock::new(Audience::default()),
        }
    }

    /// Override the per-key time-to-live.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Register an agent so broadcasts can report their audience size.
    pub fn register_agent(&self, agent_id: impl Into<String>, agent_type: AgentType) {
        if let Ok(mut audience) = self.audience.write() {
            let agent_id = agent_id.into();
            match agent_type {
                AgentType::Character => audience.characters.insert(agent_id),
                AgentType::Player => audience.players.insert(agent_id),
            };
        }
    }

    fn audience_size(&self, agent_type: AgentType) -> usize {
        self.audience
            .read()
            .map(|a| match agent_type {
                AgentType::Character => a.characters.len(),
                AgentType::Player => a.players.len(),
            })
            .unwrap_or(0)
    }

    /// Store a message on its channel.
    pub fn route(&self, message: &Message) -> Result<RouteResult, RouterError> {
        self.resume_route(message, &mut RouteProgress::default())
    }

    /// Store a message, skipping the list appends `progress` says already
    /// landed. A failed call leaves `progress` at the first append that did
    /// not happen, so calling again with it delivers each copy exactly once.
    pub fn resume_route(
        &self,
        message: &Message,
        progress: &mut RouteProgress,
    ) -> Result<RouteResult, RouterError> {
        message.validate()?;
        let payload = serde_json::to_string(message)?;

        let (writes, recipients_count) = match message.channel {
            Channel::Ic => {
                let summary = serde_json::to_string(&MessageSummary::of(message))?;
                let count = match &message.to_agents {
                    Some(to) => to.len(),
                    None => self.audience_size(AgentType::Character),
                };
                (
                    vec![(IC_KEY.to_string(), payload), (IC_SUMMARY_KEY.to_string(), summary)],
                    count,
                )
            }
            Channel::Ooc => {
                let count = match &message.to_agents {
                    Some(to) => to.len(),
                    None => self.audience_size(AgentType::Player),
                };
                (vec![(OOC_KEY.to_string(), payload)], count)
            }
            Channel::P2c => {
                let recipients = message
                    .to_agents
                    .as_ref()
                    .ok_or(MessageError::MissingRecipients)?;
                let writes = recipients
                    .iter()
                    .map(|character_id| (format!("{P2C_PREFIX}{character_id}"), payload.clone()))
                    .collect();
                (writes, recipients.len())
            }
        };

        // Expiry and the P2C index are idempotent; only the appends are counted.
        for (i, (key, value)) in writes.into_iter().enumerate() {
            if i >= progress.appended {
                self.store.push(&key, value)?;
                progress.appended += 1;
            }
            self.store.expire(&key, self.ttl)?;
            if message.channel == Channel::P2c {
                self.store.set_add(P2C_INDEX_KEY, &key)?;
            }
        }
        if message.channel == Channel::P2c {
            self.store.expire(P2C_INDEX_KEY, self.ttl)?;
        }

        debug!(
            channel = %message.channel,
            from = %message.from_agent,
            recipients = recipients_count,
            "Routed message"
        );

        Ok(RouteResult {
            success: true,
            recipients_count,
        })
    }

    fn load(&self, key: &str) -> Result<Vec<Message>, RouterError> {
        self.store
            .range(key)?
            .iter()
            .map(|raw| serde_json::from_str(raw).map_err(RouterError::from))
            .collect()
    }

    /// Everything an agent may read, oldest first, trimmed to the newest `limit`.
    pub fn get_messages_for(
        &self,
        agent_id: &str,
        agent_type: AgentType,
        limit: usize,
    ) -> Result<Vec<Message>, RouterError> {
        let addressed_to = |m: &Message| {
            m.to_agents
                .as_ref()
                .map_or(true, |to| to.iter().any(|a| a == agent_id))
        };

        let mut messages: Vec<Message> = match agent_type {
            AgentType::Character => {
                let mut visible: Vec<Message> =
                    self.load(IC_KEY)?.into_iter().filter(|m| addressed_to(m)).collect();
                visible.extend(self.load(&format!("{P2C_PREFIX}{agent_id}"))?);
                visible
            }
            AgentType::Player => self
                .load(OOC_KEY)?
                .into_iter()
                .filter(|m| addressed_to(m))
                .collect(),
        };

        messages.sort_by_key(|m| m.timestamp);
        let skip = messages.len().saturating_sub(limit);
        Ok(messages.split_off(skip))
    }

    /// String-typed retrieval for callers at the DM boundary.
    pub fn get_messages_for_type(
        &self,
        agent_id: &str,
        agent_type: &str,
        limit: usize,
    ) -> Result<Vec<Message>, RouterError> {
        let agent_type: AgentType = agent_type.parse()?;
        self.get_messages_for(agent_id, agent_type, limit)
    }

    /// IC summaries for players, oldest first, trimmed to the newest `limit`.
    pub fn get_player_summaries(&self, limit: usize) -> Result<Vec<MessageSummary>, RouterError> {
        let mut summaries: Vec<MessageSummary> = self
            .store
            .range(IC_SUMMARY_KEY)?
            .iter()
            .map(|raw| serde_json::from_str(raw).map_err(RouterError::from))
            .collect::<Result<_, _>>()?;
        summaries.sort_by_key(|s| s.timestamp);
        let skip = summaries.len().saturating_sub(limit);
        Ok(summaries.split_off(skip))
    }

    /// Delete every key of one channel. Returns the number of keys removed.
    pub fn clear_channel(&self, channel: Channel) -> Result<usize, RouterError> {
        let mut removed = 0;
        match channel {
            Channel::Ic => {
                removed += self.store.delete(IC_KEY)? as usize;
                removed += self.store.delete(IC_SUMMARY_KEY)? as usize;
            }
            Channel::Ooc => {
                removed += self.store.delete(OOC_KEY)? as usize;
            }
            Channel::P2c => {
                for key in self.store.set_members(P2C_INDEX_KEY)? {
                    removed += self.store.delete(&key)? as usize;
                }
                self.store.delete(P2C_INDEX_KEY)?;
            }
        }
        debug!(channel = %channel, removed, "Cleared channel");
        Ok(removed)
    }

    /// Delete every channel.
    pub fn clear_all(&self) -> Result<usize, RouterError> {
        let mut removed = 0;
        for channel in [Channel::Ic, Channel::Ooc, Channel::P2c] {
            removed += self.clear_channel(channel)?;
        }
        Ok(removed)
    }
}
