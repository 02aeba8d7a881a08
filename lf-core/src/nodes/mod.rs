//! One handler per turn phase.
//!
//! A node takes the turn state by value and returns the updated state plus
//! the messages it wants routed. Routing happens in the graph after the node
//! succeeds, so a failed node leaves no partial messages behind.

mod action;
mod clarification;
mod memory;
mod narration;
mod outcome;
mod planning;
mod resolution;

use crate::config::OrchestratorConfig;
use crate::consensus::{ConsensusDetector, ConsensusError};
use crate::dice::{DiceError, DieRoller};
use crate::jobs::{JobError, WorkQueues};
use crate::memory::{MemoryError, MemoryService};
use crate::message::{Message, MessageError};
use crate::registry::{AgentEntry, AgentRegistry, RegistryError};
use crate::router::{MessageRouter, RouterError};
use crate::state::{TurnPhase, TurnState};
use crate::store::StoreError;
use std::sync::Arc;
use thiserror::Error;

pub(crate) use resolution::route_insights;
pub use resolution::INSIGHT_PREFIX;

/// Errors raised by phase handlers.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Agent job failed: {0}")]
    Job(#[from] JobError),

    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("Consensus error: {0}")]
    Consensus(#[from] ConsensusError),

    #[error("Routing error: {0}")]
    Router(#[from] RouterError),

    #[error("Dice error: {0}")]
    Dice(#[from] DiceError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    #[error("{0}")]
    Invariant(String),
}

impl NodeError {
    /// Transient failures worth a rollback and another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            NodeError::Job(e) => e.is_retryable(),
            NodeError::Memory(e) => e.is_retryable(),
            NodeError::Consensus(e) => e.is_retryable(),
            NodeError::Router(RouterError::Store(StoreError::Unavailable(_))) => true,
            _ => false,
        }
    }
}

/// Collaborators shared by every node of a turn.
pub struct NodeContext {
    pub router: Arc<MessageRouter>,
    pub memory: Arc<dyn MemoryService>,
    pub registry: Arc<AgentRegistry>,
    pub queues: WorkQueues,
    pub consensus: ConsensusDetector,
    pub roller: Arc<dyn DieRoller>,
    pub config: OrchestratorConfig,
}

impl NodeContext {
    /// Registry entries for the turn's active agents, in turn order.
    pub fn active_entries(&self, state: &TurnState) -> Result<Vec<AgentEntry>, NodeError> {
        state
            .active_agents
            .iter()
            .map(|id| self.registry.get(id).cloned().map_err(NodeError::from))
            .collect()
    }
}

/// What a node hands back to the graph.
#[derive(Debug)]
pub struct NodeOutput {
    pub state: TurnState,
    pub messages: Vec<Message>,
}

impl NodeOutput {
    pub fn new(state: TurnState) -> Self {
        Self {
            state,
            messages: Vec::new(),
        }
    }

    pub fn with_messages(state: TurnState, messages: Vec<Message>) -> Self {
        Self { state, messages }
    }
}

/// Run the handler for `phase`.
pub async fn run_node(
    phase: TurnPhase,
    state: TurnState,
    ctx: &NodeContext,
) -> Result<NodeOutput, NodeError> {
    match phase {
        TurnPhase::DmNarration => narration::dm_narration(state, ctx).await,
        TurnPhase::MemoryRetrieval => memory::memory_retrieval(state, ctx).await,
        TurnPhase::DmClarificationCollect => clarification::collect(state, ctx).await,
        TurnPhase::DmClarificationWait => clarification::wait(state, ctx).await,
        TurnPhase::SecondMemoryQuery => memory::second_memory_query(state, ctx).await,
        TurnPhase::StrategicIntent => planning::strategic_intent(state, ctx).await,
        TurnPhase::P2cDirective => planning::p2c_directive(state, ctx).await,
        TurnPhase::CharacterAction => action::character_action(state, ctx).await,
        TurnPhase::DmAdjudication => resolution::dm_adjudication(state, ctx).await,
        TurnPhase::ResolveHelpers => resolution::resolve_helpers(state, ctx).await,
        TurnPhase::DiceResolution => resolution::dice_resolution(state, ctx).await,
        TurnPhase::LaserFeelingsQuestion => resolution::laser_feelings_question(state, ctx).await,
        TurnPhase::DmOutcome => outcome::dm_outcome(state, ctx).await,
        TurnPhase::CharacterReaction => outcome::character_reaction(state, ctx).await,
        TurnPhase::MemoryConsolidation => memory::memory_consolidation(state, ctx).await,
        TurnPhase::End => Ok(NodeOutput::new(state)),
    }
}

/// Tag a message with the turn's session.
pub(crate) fn stamp(message: Message, state: &TurnState) -> Message {
    message.with_session(state.session_number)
}
