//! Who is playing whom.
//!
//! The registry is built once and handed to the orchestrator. It maps each
//! player agent to the character it controls, along with the character's
//! number and the agent handles the job queues call.

use crate::dice::{MAX_CHARACTER_NUMBER, MIN_CHARACTER_NUMBER};
use crate::jobs::{CharacterAgent, PlayerAgent};
use crate::message::DM_SENDER;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub const PLAYER_PREFIX: &str = "agent_";
pub const CHARACTER_PREFIX: &str = "char_";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Invalid player id {0:?}: expected the agent_ prefix")]
    InvalidPlayerId(String),

    #[error("Invalid character id {0:?}: expected the char_ prefix")]
    InvalidCharacterId(String),

    #[error("Character number {0} out of range 2-5")]
    InvalidCharacterNumber(u8),

    #[error("Agent {0} is already registered")]
    Duplicate(String),

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),
}

/// Kind of participant, derived from its id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentKind {
    Dm,
    Player,
    Character,
}

impl AgentKind {
    pub fn of(id: &str) -> Option<Self> {
        if id == DM_SENDER {
            Some(AgentKind::Dm)
        } else if id.len() > PLAYER_PREFIX.len() && id.starts_with(PLAYER_PREFIX) {
            Some(AgentKind::Player)
        } else if id.len() > CHARACTER_PREFIX.len() && id.starts_with(CHARACTER_PREFIX) {
            Some(AgentKind::Character)
        } else {
            None
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentKind::Dm => f.write_str("dm"),
            AgentKind::Player => f.write_str("player"),
            AgentKind::Character => f.write_str("character"),
        }
    }
}

/// One player and the character it controls.
#[derive(Clone)]
pub struct AgentEntry {
    pub agent_id: String,
    pub character_id: String,
    pub character_name: String,
    pub character_number: u8,
    pub player: Arc<dyn PlayerAgent>,
    pub character: Arc<dyn CharacterAgent>,
}

impl fmt::Debug for AgentEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentEntry")
            .field("agent_id", &self.agent_id)
            .field("character_id", &self.character_id)
            .field("character_name", &self.character_name)
            .field("character_number", &self.character_number)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    by_agent: BTreeMap<String, AgentEntry>,
    by_character: BTreeMap<String, String>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        agent_id: impl Into<String>,
        character_id: impl Into<String>,
        character_name: impl Into<String>,
        character_number: u8,
        player: Arc<dyn PlayerAgent>,
        character: Arc<dyn CharacterAgent>,
    ) -> Result<(), RegistryError> {
        let agent_id = agent_id.into();
        let character_id = character_id.into();

        if AgentKind::of(&agent_id) != Some(AgentKind::Player) {
            return Err(RegistryError::InvalidPlayerId(agent_id));
        }
        if AgentKind::of(&character_id) != Some(AgentKind::Character) {
            return Err(RegistryError::InvalidCharacterId(character_id));
        }
        if !(MIN_CHARACTER_NUMBER..=MAX_CHARACTER_NUMBER).contains(&character_number) {
            return Err(RegistryError::InvalidCharacterNumber(character_number));
        }
        if self.by_agent.contains_key(&agent_id) {
            return Err(RegistryError::Duplicate(agent_id));
        }
        if self.by_character.contains_key(&character_id) {
            return Err(RegistryError::Duplicate(character_id));
        }

        self.by_character.insert(character_id.clone(), agent_id.clone());
        self.by_agent.insert(
            agent_id.clone(),
            AgentEntry {
                agent_id,
                character_id,
                character_name: character_name.into(),
                character_number,
                player,
                character,
            },
        );
        Ok(())
    }

    pub fn get(&self, agent_id: &str) -> Result<&AgentEntry, RegistryError> {
        self.by_agent
            .get(agent_id)
            .ok_or_else(|| RegistryError::UnknownAgent(agent_id.to_string()))
    }

    /// The character a player controls.
    pub fn character_for(&self, agent_id: &str) -> Result<&str, RegistryError> {
        self.get(agent_id).map(|e| e.character_id.as_str())
    }

    /// The entry owning a character.
    pub fn by_character(&self, character_id: &str) -> Result<&AgentEntry, RegistryError> {
        self.by_character
            .get(character_id)
            .and_then(|agent_id| self.by_agent.get(agent_id))
            .ok_or_else(|| RegistryError::UnknownAgent(character_id.to_string()))
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.by_agent.contains_key(agent_id)
    }

    pub fn agent_ids(&self) -> impl Iterator<Item = &str> {
        self.by_agent.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_agent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_agent.is_empty()
    }
}
