//! The DM-facing turn orchestrator.
//!
//! Every public operation returns a [`TurnResult`] or a [`TurnStatus`].
//! Failures inside a turn surface as `dm_intervention_required` on the
//! result. Only malformed requests and checkpoint I/O failures come back as
//! [`OrchestratorError`].

use crate::checkpoint::{thread_id, Checkpoint, CheckpointError, CheckpointStore};
use crate::config::OrchestratorConfig;
use crate::consensus::{ConsensusDetector, ConsensusResult};
use crate::dice::{DieRoller, LasersFeelingsRoll, RandomRoller};
use crate::graph::{GraphRun, RunOutcome, TurnGraph};
use crate::jobs::WorkQueues;
use crate::memory::{InMemoryMemoryService, MemoryService};
use crate::nodes::NodeContext;
use crate::registry::{AgentKind, AgentRegistry, RegistryError};
use crate::router::{AgentType, MessageRouter};
use crate::state::{
    DmAdjudication, OverrideKind, PhaseOverride, TurnPhase, TurnState, UnknownPhase,
};
use crate::store::InMemoryStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{info, warn};

/// Errors returned to the DM boundary.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Session {0} is already running a turn")]
    SessionBusy(u32),

    #[error("No turn checkpoint for session {0}")]
    NoCheckpoint(u32),

    #[error("Session {0} is not waiting for DM input")]
    NotSuspended(u32),

    #[error("Session {session} is waiting on {awaiting}, not {got}")]
    InputMismatch {
        session: u32,
        awaiting: TurnPhase,
        got: DmInputType,
    },

    #[error("Session {session} already has a turn waiting on {awaiting}")]
    TurnInProgress { session: u32, awaiting: TurnPhase },

    #[error("Cannot roll back to {0}: it has not run this turn")]
    InvalidRollback(TurnPhase),

    #[error("Unknown DM input type: {0}")]
    UnknownInputType(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    UnknownPhase(#[from] UnknownPhase),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Malformed input payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
}

/// The four kinds of DM input a suspended turn accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DmInputType {
    DmClarificationAnswer,
    Adjudication,
    LaserFeelingsAnswer,
    Outcome,
}

impl DmInputType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DmInputType::DmClarificationAnswer => "dm_clarification_answer",
            DmInputType::Adjudication => "adjudication",
            DmInputType::LaserFeelingsAnswer => "laser_feelings_answer",
            DmInputType::Outcome => "outcome",
        }
    }

    /// The interrupt phase this input answers.
    pub fn phase(&self) -> TurnPhase {
        match self {
            DmInputType::DmClarificationAnswer => TurnPhase::DmClarificationWait,
            DmInputType::Adjudication => TurnPhase::DmAdjudication,
            DmInputType::LaserFeelingsAnswer => TurnPhase::LaserFeelingsQuestion,
            DmInputType::Outcome => TurnPhase::DmOutcome,
        }
    }
}

impl fmt::Display for DmInputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DmInputType {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "dm_clarification_answer" | "clarification" => Ok(DmInputType::DmClarificationAnswer),
            "adjudication" => Ok(DmInputType::Adjudication),
            "laser_feelings_answer" => Ok(DmInputType::LaserFeelingsAnswer),
            "outcome" => Ok(DmInputType::Outcome),
            other => Err(OrchestratorError::UnknownInputType(other.to_string())),
        }
    }
}

/// Typed DM input merged into a suspended turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DmInput {
    /// Answers keyed by the asking player's id.
    #[serde(rename = "dm_clarification_answer")]
    ClarificationAnswer {
        #[serde(default)]
        answers: BTreeMap<String, String>,
        #[serde(default)]
        force_finish: bool,
    },
    Adjudication {
        #[serde(default)]
        adjudication: DmAdjudication,
        /// An early answer to a LASER FEELINGS question, if one comes up.
        #[serde(default)]
        laser_feelings_answer: Option<String>,
    },
    LaserFeelingsAnswer {
        /// `None` answers every character still waiting.
        #[serde(default)]
        character_id: Option<String>,
        /// Empty or missing means the DM declined.
        #[serde(default)]
        answer: Option<String>,
    },
    Outcome {
        narration: String,
        #[serde(default)]
        laser_feelings_answer: Option<String>,
    },
}

impl DmInput {
    pub fn kind(&self) -> DmInputType {
        match self {
            DmInput::ClarificationAnswer { .. } => DmInputType::DmClarificationAnswer,
            DmInput::Adjudication { .. } => DmInputType::Adjudication,
            DmInput::LaserFeelingsAnswer { .. } => DmInputType::LaserFeelingsAnswer,
            DmInput::Outcome { .. } => DmInputType::Outcome,
        }
    }

    /// Build typed input from a type name and a JSON object payload.
    pub fn from_typed(input_type: &str, data: serde_json::Value) -> Result<Self, OrchestratorError> {
        let kind: DmInputType = input_type.parse()?;
        let serde_json::Value::Object(mut fields) = data else {
            return Err(OrchestratorError::InvalidInput(
                "DM input data must be a JSON object".to_string(),
            ));
        };
        fields.insert("type".to_string(), kind.as_str().into());
        Ok(serde_json::from_value(serde_json::Value::Object(fields))?)
    }
}

/// Result of running (part of) a turn.
#[derive(Debug, Clone)]
pub struct TurnResult {
    /// False only when the turn needs the DM to intervene.
    pub success: bool,
    pub session_number: u32,
    pub turn_number: u32,
    pub awaiting_dm_input: bool,
    pub awaiting_phase: Option<TurnPhase>,
    pub completed: bool,
    pub dm_intervention_required: bool,
    pub intervention_reason: Option<String>,
    pub consensus: Option<ConsensusResult>,
    pub roll_results: BTreeMap<String, LasersFeelingsRoll>,
    /// Characters whose actions the DM must review before adjudicating.
    pub actions_requiring_review: BTreeSet<String>,
    pub state: TurnState,
}

impl TurnResult {
    fn from_run(run: GraphRun) -> Self {
        let state = run.state;
        let (awaiting_phase, completed) = match &run.outcome {
            RunOutcome::Suspended(phase) => (Some(*phase), false),
            RunOutcome::Completed => (None, true),
            RunOutcome::Escalated { .. } => (None, false),
        };
        Self {
            success: !state.dm_intervention_required,
            session_number: state.session_number,
            turn_number: state.turn_number,
            awaiting_dm_input: awaiting_phase.is_some(),
            awaiting_phase,
            completed,
            dm_intervention_required: state.dm_intervention_required,
            intervention_reason: state.intervention_reason.clone(),
            consensus: state.consensus.clone(),
            roll_results: state.roll_results.clone(),
            actions_requiring_review: state.actions_requiring_review.clone(),
            state,
        }
    }

    /// LASER FEELINGS questions the DM has not answered yet, by character.
    pub fn open_laser_feelings_questions(&self) -> BTreeMap<String, String> {
        self.state
            .unanswered_laser_feelings()
            .into_iter()
            .filter_map(|id| {
                let question = self.roll_results.get(id)?.gm_question.clone()?;
                Some((id.to_string(), question))
            })
            .collect()
    }
}

/// Checkpointed view of a session's turn, without running anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnStatus {
    pub session_number: u32,
    pub turn_number: u32,
    pub current_phase: TurnPhase,
    pub next_node: Option<TurnPhase>,
    pub awaiting_dm_input: bool,
    pub awaiting_phase: Option<TurnPhase>,
    pub completed: bool,
    pub dm_intervention_required: bool,
    pub intervention_reason: Option<String>,
    pub saved_at: DateTime<Utc>,
}

/// Whether an agent may act in a phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseActionCheck {
    pub allowed: bool,
    pub reason: String,
}

impl PhaseActionCheck {
    fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

const OOC_ACTIONS: &[&str] = &["ooc_message", "directive", "question"];
const IC_ACTIONS: &[&str] = &["ic_message", "action", "reaction"];

/// Enforce who may act in which phase.
pub fn validate_phase_action(
    agent_id: &str,
    action_type: &str,
    current_phase: TurnPhase,
) -> PhaseActionCheck {
    let action = action_type.trim().to_lowercase();
    match AgentKind::of(agent_id) {
        None => PhaseActionCheck::deny(format!("Unknown agent id: {agent_id}")),
        Some(AgentKind::Dm) => PhaseActionCheck::allow("The DM may act in any phase"),
        Some(AgentKind::Character) => {
            if current_phase.is_ooc_only() {
                PhaseActionCheck::deny(format!(
                    "Characters cannot act during the out-of-character phase {current_phase}"
                ))
            } else if OOC_ACTIONS.contains(&action.as_str()) {
                PhaseActionCheck::deny(format!(
                    "Characters cannot perform out-of-character action {action}"
                ))
            } else {
                PhaseActionCheck::allow(format!("Character may {action} during {current_phase}"))
            }
        }
        Some(AgentKind::Player) => {
            if current_phase.is_character_only() {
                PhaseActionCheck::deny(format!(
                    "Players cannot act during the character phase {current_phase}"
                ))
            } else if IC_ACTIONS.contains(&action.as_str()) {
                PhaseActionCheck::deny(format!("Players cannot perform in-character action {action}"))
            } else {
                PhaseActionCheck::allow(format!("Player may {action} during {current_phase}"))
            }
        }
    }
}

/// Marks a session busy for as long as it lives.
struct SessionGuard<'a> {
    active: &'a Mutex<HashSet<u32>>,
    session: u32,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        active.remove(&self.session);
    }
}

/// Builder for [`TurnOrchestrator`].
pub struct OrchestratorBuilder {
    registry: AgentRegistry,
    checkpoints: Arc<dyn CheckpointStore>,
    router: Option<Arc<MessageRouter>>,
    memory: Option<Arc<dyn MemoryService>>,
    roller: Option<Arc<dyn DieRoller>>,
    consensus: Option<ConsensusDetector>,
    config: OrchestratorConfig,
}

impl OrchestratorBuilder {
    pub fn with_router(mut self, router: Arc<MessageRouter>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryService>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_roller(mut self, roller: Arc<dyn DieRoller>) -> Self {
        self.roller = Some(roller);
        self
    }

    pub fn with_consensus(mut self, detector: ConsensusDetector) -> Self {
        self.consensus = Some(detector);
        self
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> TurnOrchestrator {
        let config = self.config;
        let router = self.router.unwrap_or_else(|| {
            Arc::new(MessageRouter::new(Arc::new(InMemoryStore::new())).with_ttl(config.message_ttl))
        });
        for entry in self.registry.agent_ids().filter_map(|id| self.registry.get(id).ok()) {
            router.register_agent(entry.agent_id.clone(), AgentType::Player);
            router.register_agent(entry.character_id.clone(), AgentType::Character);
        }

        let ctx = NodeContext {
            router,
            memory: self
                .memory
                .unwrap_or_else(|| Arc::new(InMemoryMemoryService::new())),
            registry: Arc::new(self.registry),
            queues: WorkQueues::new(config.job_concurrency, config.job_timeout),
            consensus: self.consensus.unwrap_or_default(),
            roller: self.roller.unwrap_or_else(|| Arc::new(RandomRoller)),
            config,
        };

        TurnOrchestrator {
            graph: TurnGraph::new(Arc::new(ctx), Arc::clone(&self.checkpoints)),
            checkpoints: self.checkpoints,
            active: Mutex::new(HashSet::new()),
        }
    }
}

/// Runs turn cycles for any number of sessions, one turn at a time each.
pub struct TurnOrchestrator {
    graph: TurnGraph,
    checkpoints: Arc<dyn CheckpointStore>,
    active: Mutex<HashSet<u32>>,
}

impl TurnOrchestrator {
    pub fn builder(registry: AgentRegistry, checkpoints: Arc<dyn CheckpointStore>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            registry,
            checkpoints,
            router: None,
            memory: None,
            roller: None,
            consensus: None,
            config: OrchestratorConfig::default(),
        }
    }

    pub fn router(&self) -> &MessageRouter {
        &self.graph.context().router
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.graph.context().registry
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.graph.context().config
    }

    fn claim(&self, session: u32) -> Result<SessionGuard<'_>, OrchestratorError> {
        let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        if !active.insert(session) {
            return Err(OrchestratorError::SessionBusy(session));
        }
        Ok(SessionGuard {
            active: &self.active,
            session,
        })
    }

    async fn load_state(&self, session: u32) -> Result<Checkpoint, OrchestratorError> {
        self.checkpoints
            .load(&thread_id(session))
            .await?
            .ok_or(OrchestratorError::NoCheckpoint(session))
    }

    /// Start a new turn from the DM's narration.
    pub async fn execute_turn_cycle(
        &self,
        dm_narration: &str,
        active_agents: Vec<String>,
        turn_number: u32,
        session_number: u32,
    ) -> Result<TurnResult, OrchestratorError> {
        if dm_narration.trim().is_empty() {
            return Err(OrchestratorError::InvalidInput("DM narration is empty".to_string()));
        }
        if active_agents.is_empty() {
            return Err(OrchestratorError::InvalidInput("No active agents".to_string()));
        }
        let mut seen = HashSet::new();
        for agent_id in &active_agents {
            if AgentKind::of(agent_id) != Some(AgentKind::Player) {
                return Err(RegistryError::InvalidPlayerId(agent_id.clone()).into());
            }
            self.registry().get(agent_id)?;
            if !seen.insert(agent_id.as_str()) {
                return Err(OrchestratorError::InvalidInput(format!(
                    "Agent {agent_id} listed twice"
                )));
            }
        }

        let _guard = self.claim(session_number)?;

        if let Some(previous) = self.checkpoints.load(&thread_id(session_number)).await? {
            if let Some(awaiting) = previous.awaiting_phase() {
                return Err(OrchestratorError::TurnInProgress {
                    session: session_number,
                    awaiting,
                });
            }
            if previous.state.dm_intervention_required {
                warn!(
                    session = session_number,
                    turn = previous.state.turn_number,
                    "Replacing a turn that was waiting on DM intervention"
                );
            }
        }

        info!(
            session = session_number,
            turn = turn_number,
            agents = active_agents.len(),
            "Starting turn cycle"
        );
        let state = TurnState::new(turn_number, session_number, dm_narration, active_agents);
        let run = self.graph.run(state, TurnPhase::DmNarration, false).await?;
        Ok(TurnResult::from_run(run))
    }

    /// Merge DM input into a suspended turn and continue it.
    pub async fn resume_turn_with_dm_input(
        &self,
        session_number: u32,
        input: DmInput,
    ) -> Result<TurnResult, OrchestratorError> {
        let _guard = self.claim(session_number)?;
        let checkpoint = self.load_state(session_number).await?;
        let awaiting = checkpoint
            .awaiting_phase()
            .ok_or(OrchestratorError::NotSuspended(session_number))?;
        if input.kind().phase() != awaiting {
            return Err(OrchestratorError::InputMismatch {
                session: session_number,
                awaiting,
                got: input.kind(),
            });
        }

        let mut state = checkpoint.state;
        merge_input(&mut state, input)?;
        info!(session = session_number, phase = %awaiting, "Resuming turn");

        let run = self.graph.run(state, awaiting, true).await?;
        Ok(TurnResult::from_run(run))
    }

    /// String-typed resume for callers that only have a type name and JSON.
    pub async fn resume_turn_with_raw_input(
        &self,
        session_number: u32,
        input_type: &str,
        data: serde_json::Value,
    ) -> Result<TurnResult, OrchestratorError> {
        let input = DmInput::from_typed(input_type, data)?;
        self.resume_turn_with_dm_input(session_number, input).await
    }

    /// Jump to any phase and continue from there.
    pub async fn transition_to_phase(
        &self,
        session_number: u32,
        target: &str,
        reason: &str,
    ) -> Result<TurnResult, OrchestratorError> {
        let target: TurnPhase = target.parse()?;
        let _guard = self.claim(session_number)?;
        let mut state = self.load_state(session_number).await?.state;

        self.record_override(&mut state, OverrideKind::Transition, target, reason);
        let run = self.graph.run(state, target, false).await?;
        Ok(TurnResult::from_run(run))
    }

    /// Return to a phase this turn already ran, discarding everything after it.
    pub async fn rollback_to_phase(
        &self,
        session_number: u32,
        target: &str,
        reason: &str,
    ) -> Result<TurnResult, OrchestratorError> {
        let target: TurnPhase = target.parse()?;
        let _guard = self.claim(session_number)?;
        let mut state = self.load_state(session_number).await?.state;

        if !state.has_completed(target) {
            return Err(OrchestratorError::InvalidRollback(target));
        }
        state.clear_from(target);
        self.record_override(&mut state, OverrideKind::Rollback, target, reason);

        let run = self.graph.run(state, target, false).await?;
        Ok(TurnResult::from_run(run))
    }

    fn record_override(&self, state: &mut TurnState, kind: OverrideKind, to: TurnPhase, reason: &str) {
        let from = state.current_phase;
        warn!(
            session = state.session_number,
            kind = ?kind,
            from = %from,
            to = %to,
            reason,
            "DM override"
        );
        state.overrides.push(PhaseOverride {
            kind,
            from,
            to,
            reason: reason.to_string(),
            at: Utc::now(),
        });
        state.dm_intervention_required = false;
        state.intervention_reason = None;
    }

    /// Check whether an agent may act in a phase.
    pub fn validate_phase_action(
        &self,
        agent_id: &str,
        action_type: &str,
        current_phase: TurnPhase,
    ) -> PhaseActionCheck {
        validate_phase_action(agent_id, action_type, current_phase)
    }

    /// Where a session's turn stands.
    pub async fn get_turn_status(&self, session_number: u32) -> Result<TurnStatus, OrchestratorError> {
        let checkpoint = self.load_state(session_number).await?;
        let awaiting_phase = checkpoint.awaiting_phase();
        Ok(TurnStatus {
            session_number,
            turn_number: checkpoint.state.turn_number,
            current_phase: checkpoint.state.current_phase,
            next_node: checkpoint.next_node,
            awaiting_dm_input: awaiting_phase.is_some(),
            awaiting_phase,
            completed: checkpoint.is_complete(),
            dm_intervention_required: checkpoint.state.dm_intervention_required,
            intervention_reason: checkpoint.state.intervention_reason.clone(),
            saved_at: checkpoint.saved_at,
        })
    }

    /// Drop a session's checkpoint. Returns false if there was none.
    pub async fn abandon_turn(&self, session_number: u32) -> Result<bool, OrchestratorError> {
        let _guard = self.claim(session_number)?;
        let removed = self.checkpoints.delete(&thread_id(session_number)).await?;
        if removed {
            warn!(session = session_number, "Turn abandoned");
        }
        Ok(removed)
    }
}

fn merge_input(state: &mut TurnState, input: DmInput) -> Result<(), OrchestratorError> {
    match input {
        DmInput::ClarificationAnswer {
            answers,
            force_finish,
        } => {
            for agent_id in answers.keys() {
                if !state.pending_questions.iter().any(|q| &q.agent_id == agent_id) {
                    return Err(OrchestratorError::InvalidInput(format!(
                        "{agent_id} has no open question"
                    )));
                }
            }
            state.clarification_answers = answers;
            state.force_finish_clarification = force_finish;
        }
        DmInput::Adjudication {
            adjudication,
            laser_feelings_answer,
        } => {
            for character_id in adjudication.rulings.keys() {
                if !state.character_actions.contains_key(character_id) {
                    return Err(OrchestratorError::InvalidInput(format!(
                        "No action from {character_id} to rule on"
                    )));
                }
            }
            state.adjudication = Some(adjudication);
            if let Some(answer) = laser_feelings_answer {
                state.record_laser_feelings_answer(None, &answer);
            }
        }
        DmInput::LaserFeelingsAnswer {
            character_id,
            answer,
        } => {
            if let Some(id) = &character_id {
                if !state.laser_feelings_characters().contains(&id.as_str()) {
                    return Err(OrchestratorError::InvalidInput(format!(
                        "{id} has no LASER FEELINGS question"
                    )));
                }
            }
            state.record_laser_feelings_answer(character_id.as_deref(), answer.as_deref().unwrap_or(""));
        }
        DmInput::Outcome {
            narration,
            laser_feelings_answer,
        } => {
            if narration.trim().is_empty() {
                return Err(OrchestratorError::InvalidInput(
                    "Outcome narration is empty".to_string(),
                ));
            }
            state.dm_outcome = Some(narration);
            if let Some(answer) = laser_feelings_answer {
                state.record_laser_feelings_answer(None, &answer);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_characters_blocked_in_ooc_phases() {
        for phase in TurnPhase::ALL.iter().filter(|p| p.is_ooc_only()) {
            let check = validate_phase_action("char_zara", "ic_message", *phase);
            assert!(!check.allowed, "{phase}");
        }
        assert!(!validate_phase_action("char_zara", "directive", TurnPhase::CharacterAction).allowed);
        assert!(validate_phase_action("char_zara", "action", TurnPhase::CharacterAction).allowed);
    }

    #[test]
    fn test_players_blocked_in_character_phases() {
        assert!(!validate_phase_action("agent_alex", "ooc_message", TurnPhase::CharacterAction).allowed);
        assert!(!validate_phase_action("agent_alex", "ooc_message", TurnPhase::CharacterReaction).allowed);
        assert!(!validate_phase_action("agent_alex", "action", TurnPhase::StrategicIntent).allowed);
        assert!(validate_phase_action("agent_alex", "ooc_message", TurnPhase::StrategicIntent).allowed);
    }

    #[test]
    fn test_dm_and_unknown_ids() {
        assert!(validate_phase_action("dm", "ic_message", TurnPhase::CharacterAction).allowed);
        let check = validate_phase_action("npc_bob", "action", TurnPhase::CharacterAction);
        assert!(!check.allowed);
        assert!(check.reason.contains("npc_bob"));
    }

    #[test]
    fn test_typed_input_parsing() {
        let input = DmInput::from_typed(
            "outcome",
            serde_json::json!({ "narration": "The signal fades." }),
        )
        .unwrap();
        assert_eq!(input.kind(), DmInputType::Outcome);

        let input = DmInput::from_typed(
            "dm_clarification_answer",
            serde_json::json!({ "answers": { "agent_alex": "About a day away." } }),
        )
        .unwrap();
        assert!(matches!(input, DmInput::ClarificationAnswer { force_finish: false, .. }));

        assert!(matches!(
            DmInput::from_typed("pizza", serde_json::json!({})),
            Err(OrchestratorError::UnknownInputType(_))
        ));
        assert!(matches!(
            DmInput::from_typed("outcome", serde_json::json!("text")),
            Err(OrchestratorError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_input_kind_matches_interrupts() {
        for kind in [
            DmInputType::DmClarificationAnswer,
            DmInputType::Adjudication,
            DmInputType::LaserFeelingsAnswer,
            DmInputType::Outcome,
        ] {
            assert!(kind.phase().is_interrupt());
            assert_eq!(kind.as_str().parse::<DmInputType>().unwrap(), kind);
        }
    }

    #[test]
    fn test_outcome_answer_binds_to_waiting_character() {
        use crate::dice::{RollModifiers, TaskType};

        let mut state = TurnState::new(1, 1, "x", vec![]);
        let roll = LasersFeelingsRoll::from_rolls(2, TaskType::Lasers, RollModifiers::default(), vec![2], None)
            .unwrap();
        state.roll_results.insert("char_zara".into(), roll);

        merge_input(
            &mut state,
            DmInput::Outcome {
                narration: "The hatch groans.".into(),
                laser_feelings_answer: Some("They're watching you.".into()),
            },
        )
        .unwrap();
        assert_eq!(
            state.laser_feelings_answers.get("char_zara").map(String::as_str),
            Some("They're watching you.")
        );
    }
}
