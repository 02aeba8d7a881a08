//! Turn phases and the turn state threaded through them.
//!
//! `TurnState` is owned by the graph while a turn runs and is checkpointed
//! whenever the turn suspends. Phases only add to it or overwrite their own
//! scratch fields; nothing from a finished phase is dropped except by
//! memory consolidation or an explicit DM rollback.

use crate::consensus::ConsensusResult;
use crate::dice::{LasersFeelingsRoll, RollModifiers, TaskType};
use crate::id::EpisodeId;
use crate::message::Message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error for phase names that are not part of the turn cycle.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Unknown phase: {0}")]
pub struct UnknownPhase(pub String);

/// Every phase of the turn cycle, in nominal order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    DmNarration,
    MemoryRetrieval,
    DmClarificationCollect,
    DmClarificationWait,
    SecondMemoryQuery,
    StrategicIntent,
    P2cDirective,
    CharacterAction,
    DmAdjudication,
    ResolveHelpers,
    DiceResolution,
    LaserFeelingsQuestion,
    DmOutcome,
    CharacterReaction,
    MemoryConsolidation,
    End,
}

impl TurnPhase {
    pub const ALL: [TurnPhase; 16] = [
        TurnPhase::DmNarration,
        TurnPhase::MemoryRetrieval,
        TurnPhase::DmClarificationCollect,
        TurnPhase::DmClarificationWait,
        TurnPhase::SecondMemoryQuery,
        TurnPhase::StrategicIntent,
        TurnPhase::P2cDirective,
        TurnPhase::CharacterAction,
        TurnPhase::DmAdjudication,
        TurnPhase::ResolveHelpers,
        TurnPhase::DiceResolution,
        TurnPhase::LaserFeelingsQuestion,
        TurnPhase::DmOutcome,
        TurnPhase::CharacterReaction,
        TurnPhase::MemoryConsolidation,
        TurnPhase::End,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TurnPhase::DmNarration => "dm_narration",
            TurnPhase::MemoryRetrieval => "memory_retrieval",
            TurnPhase::DmClarificationCollect => "dm_clarification_collect",
            TurnPhase::DmClarificationWait => "dm_clarification_wait",
            TurnPhase::SecondMemoryQuery => "second_memory_query",
            TurnPhase::StrategicIntent => "strategic_intent",
            TurnPhase::P2cDirective => "p2c_directive",
            TurnPhase::CharacterAction => "character_action",
            TurnPhase::DmAdjudication => "dm_adjudication",
            TurnPhase::ResolveHelpers => "resolve_helpers",
            TurnPhase::DiceResolution => "dice_resolution",
            TurnPhase::LaserFeelingsQuestion => "laser_feelings_question",
            TurnPhase::DmOutcome => "dm_outcome",
            TurnPhase::CharacterReaction => "character_reaction",
            TurnPhase::MemoryConsolidation => "memory_consolidation",
            TurnPhase::End => "end",
        }
    }

    /// Phases where the graph suspends for DM input.
    pub fn is_interrupt(&self) -> bool {
        matches!(
            self,
            TurnPhase::DmClarificationWait
                | TurnPhase::DmAdjudication
                | TurnPhase::LaserFeelingsQuestion
                | TurnPhase::DmOutcome
        )
    }

    /// Phases only characters may act in.
    pub fn is_character_only(&self) -> bool {
        matches!(self, TurnPhase::CharacterAction | TurnPhase::CharacterReaction)
    }

    /// Phases only players (and the DM) may act in.
    pub fn is_ooc_only(&self) -> bool {
        matches!(
            self,
            TurnPhase::DmClarificationCollect
                | TurnPhase::DmClarificationWait
                | TurnPhase::StrategicIntent
                | TurnPhase::P2cDirective
        )
    }
}

impl fmt::Display for TurnPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TurnPhase {
    type Err = UnknownPhase;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        TurnPhase::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == wanted)
            .ok_or_else(|| UnknownPhase(s.to_string()))
    }
}

/// A clarifying question raised by a player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarificationQuestion {
    pub agent_id: String,
    pub question: String,
    pub round: u32,
}

/// A question together with the DM's answer, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarificationExchange {
    pub agent_id: String,
    pub question: String,
    pub answer: Option<String>,
    pub round: u32,
}

/// What a character declares it is attempting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterAction {
    pub character_id: String,
    /// Intent only: what the character tries, never what happens.
    pub narrative: String,
    pub task_type: TaskType,
    #[serde(default)]
    pub is_prepared: bool,
    #[serde(default)]
    pub is_expert: bool,
    #[serde(default)]
    pub is_helping: bool,
    /// Set when this character is helping a teammate instead of acting alone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helping_character: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gm_question: Option<String>,
}

impl CharacterAction {
    pub fn new(
        character_id: impl Into<String>,
        narrative: impl Into<String>,
        task_type: TaskType,
    ) -> Self {
        Self {
            character_id: character_id.into(),
            narrative: narrative.into(),
            task_type,
            is_prepared: false,
            is_expert: false,
            is_helping: false,
            helping_character: None,
            gm_question: None,
        }
    }

    pub fn prepared(mut self) -> Self {
        self.is_prepared = true;
        self
    }

    pub fn expert(mut self) -> Self {
        self.is_expert = true;
        self
    }

    pub fn helping(mut self, character_id: impl Into<String>) -> Self {
        self.helping_character = Some(character_id.into());
        self
    }

    pub fn with_gm_question(mut self, question: impl Into<String>) -> Self {
        self.gm_question = Some(question.into());
        self
    }

    pub fn modifiers(&self) -> RollModifiers {
        RollModifiers::new(self.is_prepared, self.is_expert, self.is_helping)
    }
}

/// The DM's ruling on one character's action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjudicationRuling {
    #[serde(default = "default_needs_roll")]
    pub needs_roll: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<TaskType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prepared: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expert: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

fn default_needs_roll() -> bool {
    true
}

impl Default for AdjudicationRuling {
    fn default() -> Self {
        Self {
            needs_roll: true,
            task_type: None,
            prepared: None,
            expert: None,
            notes: None,
        }
    }
}

impl AdjudicationRuling {
    /// Rule that the action simply happens, no dice.
    pub fn no_roll(notes: impl Into<String>) -> Self {
        Self {
            needs_roll: false,
            notes: Some(notes.into()),
            ..Self::default()
        }
    }
}

/// The DM's adjudication of a round of actions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DmAdjudication {
    /// Characters without an entry roll as declared.
    #[serde(default)]
    pub rulings: BTreeMap<String, AdjudicationRuling>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Dice parameters settled by helper resolution, waiting to be rolled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRoll {
    pub character_id: String,
    pub character_number: u8,
    pub task_type: TaskType,
    pub modifiers: RollModifiers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gm_question: Option<String>,
}

/// Kind of DM phase override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideKind {
    Transition,
    Rollback,
}

/// A logged DM override of the normal phase order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseOverride {
    pub kind: OverrideKind,
    pub from: TurnPhase,
    pub to: TurnPhase,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// The record threaded through every phase of one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnState {
    pub current_phase: TurnPhase,
    pub phase_started_at: DateTime<Utc>,
    pub turn_number: u32,
    pub session_number: u32,
    pub dm_narration: String,
    /// Player agent ids taking part in this turn.
    pub active_agents: Vec<String>,
    /// Phases completed so far, in order.
    #[serde(default)]
    pub phase_history: Vec<TurnPhase>,

    // Memory
    #[serde(default)]
    pub retrieved_memories: BTreeMap<String, Vec<String>>,

    // Clarification
    #[serde(default)]
    pub pending_questions: Vec<ClarificationQuestion>,
    #[serde(default)]
    pub clarification_history: Vec<ClarificationExchange>,
    #[serde(default)]
    pub clarification_round: u32,
    #[serde(default)]
    pub clarification_answers: BTreeMap<String, String>,
    #[serde(default)]
    pub force_finish_clarification: bool,

    // Strategy
    #[serde(default)]
    pub strategic_intents: BTreeMap<String, String>,
    #[serde(default)]
    pub ooc_messages: Vec<Message>,
    #[serde(default)]
    pub consensus: Option<ConsensusResult>,
    /// Character id -> directive from its player.
    #[serde(default)]
    pub directives: BTreeMap<String, String>,

    // Action
    #[serde(default)]
    pub character_actions: BTreeMap<String, CharacterAction>,
    #[serde(default)]
    pub validation_attempts: u32,
    #[serde(default)]
    pub validation_failures: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub actions_requiring_review: BTreeSet<String>,

    // Resolution
    #[serde(default)]
    pub adjudication: Option<DmAdjudication>,
    /// Acting character -> teammates helping it.
    #[serde(default)]
    pub helpers: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub pending_rolls: BTreeMap<String, PendingRoll>,
    #[serde(default)]
    pub roll_results: BTreeMap<String, LasersFeelingsRoll>,
    /// Character id -> DM answer to its LASER FEELINGS question.
    #[serde(default)]
    pub laser_feelings_answers: BTreeMap<String, String>,
    /// Characters whose insight has already been delivered.
    #[serde(default)]
    pub laser_feelings_routed: BTreeSet<String>,

    // Outcome
    #[serde(default)]
    pub dm_outcome: Option<String>,
    #[serde(default)]
    pub character_reactions: BTreeMap<String, String>,
    #[serde(default)]
    pub episode_ids: Vec<EpisodeId>,

    // Failure handling
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub dm_intervention_required: bool,
    #[serde(default)]
    pub intervention_reason: Option<String>,
    #[serde(default)]
    pub overrides: Vec<PhaseOverride>,
}

impl TurnState {
    /// Fresh state for a new turn, with zeroed counters.
    pub fn new(
        turn_number: u32,
        session_number: u32,
        dm_narration: impl Into<String>,
        active_agents: Vec<String>,
    ) -> Self {
        Self {
            current_phase: TurnPhase::DmNarration,
            phase_started_at: Utc::now(),
            turn_number,
            session_number,
            dm_narration: dm_narration.into(),
            active_agents,
            phase_history: Vec::new(),
            retrieved_memories: BTreeMap::new(),
            pending_questions: Vec::new(),
            clarification_history: Vec::new(),
            clarification_round: 0,
            clarification_answers: BTreeMap::new(),
            force_finish_clarification: false,
            strategic_intents: BTreeMap::new(),
            ooc_messages: Vec::new(),
            consensus: None,
            directives: BTreeMap::new(),
            character_actions: BTreeMap::new(),
            validation_attempts: 0,
            validation_failures: BTreeMap::new(),
            actions_requiring_review: BTreeSet::new(),
            adjudication: None,
            helpers: BTreeMap::new(),
            pending_rolls: BTreeMap::new(),
            roll_results: BTreeMap::new(),
            laser_feelings_answers: BTreeMap::new(),
            laser_feelings_routed: BTreeSet::new(),
            dm_outcome: None,
            character_reactions: BTreeMap::new(),
            episode_ids: Vec::new(),
            retry_count: 0,
            dm_intervention_required: false,
            intervention_reason: None,
            overrides: Vec::new(),
        }
    }

    /// Mark a phase as the one now running.
    pub fn enter_phase(&mut self, phase: TurnPhase) {
        self.current_phase = phase;
        self.phase_started_at = Utc::now();
    }

    /// Record a phase as completed.
    pub fn complete_phase(&mut self, phase: TurnPhase) {
        self.phase_history.push(phase);
    }

    pub fn has_completed(&self, phase: TurnPhase) -> bool {
        self.phase_history.contains(&phase)
    }

    /// Characters whose roll had at least one LASER FEELINGS die.
    pub fn laser_feelings_characters(&self) -> Vec<&str> {
        self.roll_results
            .iter()
            .filter(|(_, roll)| roll.has_laser_feelings())
            .map(|(id, _)| id.as_str())
            .collect()
    }

    /// LASER FEELINGS characters the DM has not answered yet.
    pub fn unanswered_laser_feelings(&self) -> Vec<&str> {
        self.laser_feelings_characters()
            .into_iter()
            .filter(|id| {
                !self.laser_feelings_answers.contains_key(*id)
                    && !self.laser_feelings_routed.contains(*id)
            })
            .collect()
    }

    /// Record a LASER FEELINGS answer. Empty answers count as declining.
    ///
    /// With no character given, the answer goes to every LASER FEELINGS
    /// character still waiting for one; before dice are rolled it is held
    /// for whichever character rolls one.
    pub fn record_laser_feelings_answer(&mut self, character_id: Option<&str>, answer: &str) {
        let answer = answer.trim();
        if answer.is_empty() {
            return;
        }
        match character_id {
            Some(id) => {
                self.laser_feelings_answers
                    .insert(id.to_string(), answer.to_string());
            }
            None if self.roll_results.is_empty() => {
                self.laser_feelings_answers
                    .insert(ANY_CHARACTER.to_string(), answer.to_string());
            }
            None => {
                let waiting: Vec<String> = self
                    .unanswered_laser_feelings()
                    .into_iter()
                    .map(str::to_string)
                    .collect();
                for id in waiting {
                    self.laser_feelings_answers.insert(id, answer.to_string());
                }
            }
        }
    }

    /// Bind an answer given before the roll to the characters who rolled one.
    pub fn bind_early_laser_feelings_answer(&mut self) {
        if let Some(answer) = self.laser_feelings_answers.remove(ANY_CHARACTER) {
            let waiting: Vec<String> = self
                .unanswered_laser_feelings()
                .into_iter()
                .map(str::to_string)
                .collect();
            for id in waiting {
                self.laser_feelings_answers.insert(id, answer.clone());
            }
        }
    }

    /// Drop everything produced at or after `phase`. Used by DM rollback.
    pub fn clear_from(&mut self, phase: TurnPhase) {
        let at_or_after = |p: TurnPhase| p >= phase;

        if at_or_after(TurnPhase::MemoryRetrieval) {
            self.retrieved_memories.clear();
        }
        if at_or_after(TurnPhase::DmClarificationCollect) {
            self.pending_questions.clear();
            self.clarification_history.clear();
            self.clarification_answers.clear();
            self.clarification_round = 0;
            self.force_finish_clarification = false;
        }
        if at_or_after(TurnPhase::StrategicIntent) {
            self.strategic_intents.clear();
            self.ooc_messages.clear();
            self.consensus = None;
        }
        if at_or_after(TurnPhase::P2cDirective) {
            self.directives.clear();
        }
        if at_or_after(TurnPhase::CharacterAction) {
            self.character_actions.clear();
            self.validation_attempts = 0;
            self.validation_failures.clear();
            self.actions_requiring_review.clear();
        }
        if at_or_after(TurnPhase::DmAdjudication) {
            self.adjudication = None;
        }
        if at_or_after(TurnPhase::ResolveHelpers) {
            self.helpers.clear();
            self.pending_rolls.clear();
        }
        if at_or_after(TurnPhase::DiceResolution) {
            self.roll_results.clear();
        }
        if at_or_after(TurnPhase::LaserFeelingsQuestion) {
            self.laser_feelings_answers.clear();
            self.laser_feelings_routed.clear();
        }
        if at_or_after(TurnPhase::DmOutcome) {
            self.dm_outcome = None;
        }
        if at_or_after(TurnPhase::CharacterReaction) {
            self.character_reactions.clear();
        }
        if at_or_after(TurnPhase::MemoryConsolidation) {
            self.episode_ids.clear();
        }

        self.phase_history.retain(|p| *p < phase);
    }
}

/// Key for a LASER FEELINGS answer given before anyone has rolled.
pub const ANY_CHARACTER: &str = "*";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_names_round_trip_through_parse() {
        for phase in TurnPhase::ALL {
            assert_eq!(phase.as_str().parse::<TurnPhase>().unwrap(), phase);
        }
        assert_eq!(
            "warp_drive".parse::<TurnPhase>(),
            Err(UnknownPhase("warp_drive".to_string()))
        );
    }

    #[test]
    fn test_serde_uses_wire_names() {
        let json = serde_json::to_string(&TurnPhase::LaserFeelingsQuestion).unwrap();
        assert_eq!(json, "\"laser_feelings_question\"");
        let json = serde_json::to_string(&TurnPhase::P2cDirective).unwrap();
        assert_eq!(json, "\"p2c_directive\"");
    }

    #[test]
    fn test_interrupt_points() {
        let interrupts: Vec<_> = TurnPhase::ALL.iter().filter(|p| p.is_interrupt()).collect();
        assert_eq!(
            interrupts,
            vec![
                &TurnPhase::DmClarificationWait,
                &TurnPhase::DmAdjudication,
                &TurnPhase::LaserFeelingsQuestion,
                &TurnPhase::DmOutcome
            ]
        );
    }

    #[test]
    fn test_new_state_is_zeroed() {
        let state = TurnState::new(3, 1, "A signal pulses", vec!["agent_alex".into()]);
        assert_eq!(state.current_phase, TurnPhase::DmNarration);
        assert_eq!(state.retry_count, 0);
        assert_eq!(state.validation_attempts, 0);
        assert!(!state.dm_intervention_required);
    }

    #[test]
    fn test_empty_laser_feelings_answer_is_declined() {
        let mut state = TurnState::new(1, 1, "x", vec![]);
        state.record_laser_feelings_answer(Some("char_zara"), "   ");
        assert!(state.laser_feelings_answers.is_empty());
    }

    #[test]
    fn test_early_answer_binds_after_roll() {
        let mut state = TurnState::new(1, 1, "x", vec![]);
        state.record_laser_feelings_answer(None, "It is a distress call.");
        assert!(state.laser_feelings_answers.contains_key(ANY_CHARACTER));

        let roll = LasersFeelingsRoll::from_rolls(
            3,
            TaskType::Lasers,
            RollModifiers::default(),
            vec![3],
            None,
        )
        .unwrap();
        state.roll_results.insert("char_zara".into(), roll);
        state.bind_early_laser_feelings_answer();

        assert_eq!(
            state.laser_feelings_answers.get("char_zara").map(String::as_str),
            Some("It is a distress call.")
        );
        assert!(!state.laser_feelings_answers.contains_key(ANY_CHARACTER));
        assert!(state.unanswered_laser_feelings().is_empty());
    }

    #[test]
    fn test_clear_from_drops_later_fields_only() {
        let mut state = TurnState::new(1, 1, "x", vec!["agent_alex".into()]);
        state
            .strategic_intents
            .insert("agent_alex".into(), "Investigate".into());
        state.character_actions.insert(
            "char_zara".into(),
            CharacterAction::new("char_zara", "I try to decode it", TaskType::Lasers),
        );
        state.phase_history = vec![
            TurnPhase::DmNarration,
            TurnPhase::StrategicIntent,
            TurnPhase::CharacterAction,
        ];

        state.clear_from(TurnPhase::CharacterAction);

        assert!(state.character_actions.is_empty());
        assert_eq!(state.strategic_intents.len(), 1);
        assert_eq!(
            state.phase_history,
            vec![TurnPhase::DmNarration, TurnPhase::StrategicIntent]
        );
    }
}
