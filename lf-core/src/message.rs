//! Messages exchanged between the DM, players, and characters.
//!
//! A message is immutable once built. Point-to-character messages can only
//! be built with at least one recipient.

use crate::id::MessageId;
use crate::state::TurnPhase;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Sender id used for everything the DM says.
pub const DM_SENDER: &str = "dm";

/// Errors from building messages.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("P2C messages require at least one recipient")]
    MissingRecipients,

    #[error("Unknown channel: {0}")]
    UnknownChannel(String),
}

/// Visibility channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// In-character: the fiction, seen by characters.
    Ic,
    /// Out-of-character: strategy talk, seen by players.
    Ooc,
    /// Player-to-character: one-way directives to a single character.
    P2c,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Ic => "ic",
            Channel::Ooc => "ooc",
            Channel::P2c => "p2c",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ic" | "in_character" => Ok(Channel::Ic),
            "ooc" | "out_of_character" => Ok(Channel::Ooc),
            "p2c" | "player_to_character" => Ok(Channel::P2c),
            other => Err(MessageError::UnknownChannel(other.to_string())),
        }
    }
}

/// What a message is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Narration,
    Question,
    Answer,
    Intent,
    Discussion,
    Directive,
    Action,
    Ruling,
    Roll,
    Insight,
    Outcome,
    Reaction,
    System,
}

/// A single routed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: MessageId,
    pub channel: Channel,
    /// Agent id, or [`DM_SENDER`].
    pub from_agent: String,
    /// `None` broadcasts to everyone who can see the channel.
    pub to_agents: Option<Vec<String>>,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub message_type: MessageType,
    pub phase: TurnPhase,
    pub turn_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_number: Option<u32>,
}

impl Message {
    fn build(
        channel: Channel,
        from_agent: impl Into<String>,
        to_agents: Option<Vec<String>>,
        content: impl Into<String>,
        message_type: MessageType,
        phase: TurnPhase,
        turn_number: u32,
    ) -> Self {
        Self {
            message_id: MessageId::new(),
            channel,
            from_agent: from_agent.into(),
            to_agents,
            content: content.into(),
            timestamp: Utc::now(),
            message_type,
            phase,
            turn_number,
            session_number: None,
        }
    }

    /// Broadcast an in-character message.
    pub fn ic(
        from_agent: impl Into<String>,
        content: impl Into<String>,
        message_type: MessageType,
        phase: TurnPhase,
        turn_number: u32,
    ) -> Self {
        Self::build(Channel::Ic, from_agent, None, content, message_type, phase, turn_number)
    }

    /// Broadcast an out-of-character message.
    pub fn ooc(
        from_agent: impl Into<String>,
        content: impl Into<String>,
        message_type: MessageType,
        phase: TurnPhase,
        turn_number: u32,
    ) -> Self {
        Self::build(Channel::Ooc, from_agent, None, content, message_type, phase, turn_number)
    }

    /// Build a player-to-character message. Fails without recipients.
    pub fn p2c(
        from_agent: impl Into<String>,
        to_agents: Vec<String>,
        content: impl Into<String>,
        message_type: MessageType,
        phase: TurnPhase,
        turn_number: u32,
    ) -> Result<Self, MessageError> {
        if to_agents.is_empty() {
            return Err(MessageError::MissingRecipients);
        }
        Ok(Self::build(
            Channel::P2c,
            from_agent,
            Some(to_agents),
            content,
            message_type,
            phase,
            turn_number,
        ))
    }

    /// Tag the message with a session number.
    pub fn with_session(mut self, session_number: u32) -> Self {
        self.session_number = Some(session_number);
        self
    }

    /// Check the channel invariants.
    pub fn validate(&self) -> Result<(), MessageError> {
        if self.channel == Channel::P2c
            && self.to_agents.as_ref().map_or(true, |to| to.is_empty())
        {
            return Err(MessageError::MissingRecipients);
        }
        Ok(())
    }

    pub fn is_from_dm(&self) -> bool {
        self.from_agent == DM_SENDER
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_p2c_requires_recipients() {
        let err = Message::p2c(
            "agent_alex",
            vec![],
            "Scan the ship",
            MessageType::Directive,
            TurnPhase::P2cDirective,
            1,
        )
        .unwrap_err();
        assert_eq!(err, MessageError::MissingRecipients);
    }

    #[test]
    fn test_validate_catches_tampered_p2c() {
        let mut msg = Message::p2c(
            "agent_alex",
            vec!["char_zara".to_string()],
            "Scan the ship",
            MessageType::Directive,
            TurnPhase::P2cDirective,
            1,
        )
        .unwrap();
        assert!(msg.validate().is_ok());
        msg.to_agents = None;
        assert_eq!(msg.validate(), Err(MessageError::MissingRecipients));
    }

    #[test]
    fn test_channel_parse() {
        assert_eq!("IC".parse::<Channel>().unwrap(), Channel::Ic);
        assert_eq!("p2c".parse::<Channel>().unwrap(), Channel::P2c);
        assert!(matches!(
            "dm_only".parse::<Channel>(),
            Err(MessageError::UnknownChannel(_))
        ));
    }

    #[test]
    fn test_message_serde_names() {
        let msg = Message::ooc("dm", "Any questions?", MessageType::System, TurnPhase::DmNarration, 2)
            .with_session(4);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["channel"], "ooc");
        assert_eq!(json["phase"], "dm_narration");
        assert_eq!(json["session_number"], 4);
        assert!(msg.is_from_dm());
    }
}
