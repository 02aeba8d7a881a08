//! The turn-cycle state machine.
//!
//! Edges are an explicit table of `(from, to, guard)` rows. After a phase
//! runs, the first row out of it whose guard holds picks the next phase.
//! One dispatch loop drives everything:
//! ```text
//! dm_narration → memory_retrieval → dm_clarification_collect
//! dm_clarification_collect → dm_clarification_wait   (questions pending)
//!                          → second_memory_query
//! dm_clarification_wait → dm_clarification_collect
//! second_memory_query → strategic_intent → p2c_directive → character_action
//! character_action → dm_adjudication → resolve_helpers → dice_resolution
//! dice_resolution → laser_feelings_question          (unanswered exact match)
//!                 → dm_outcome
//! laser_feelings_question → dm_outcome → character_reaction
//! character_reaction → memory_consolidation → end
//! ```
//! The loop suspends before each interrupt phase and checkpoints the state
//! with that phase as the next node. Resuming runs the interrupt phase with
//! the DM's input already merged into the state.

use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointStore};
use crate::message::Channel;
use crate::nodes::{run_node, NodeContext, NodeError, NodeOutput};
use crate::router::RouteProgress;
use crate::state::{TurnPhase, TurnState};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Guard over the state after the `from` phase completed.
pub type Guard = fn(&TurnState) -> bool;

/// One row of the transition table.
#[derive(Clone, Copy)]
pub struct Edge {
    pub from: TurnPhase,
    pub to: TurnPhase,
    pub guard: Guard,
}

fn always(_: &TurnState) -> bool {
    true
}

fn has_pending_questions(state: &TurnState) -> bool {
    !state.pending_questions.is_empty()
}

fn has_unanswered_laser_feelings(state: &TurnState) -> bool {
    !state.unanswered_laser_feelings().is_empty()
}

const fn edge(from: TurnPhase, to: TurnPhase, guard: Guard) -> Edge {
    Edge { from, to, guard }
}

/// Transition table, in priority order within each `from`.
pub const EDGES: &[Edge] = &[
    edge(TurnPhase::DmNarration, TurnPhase::MemoryRetrieval, always),
    edge(TurnPhase::MemoryRetrieval, TurnPhase::DmClarificationCollect, always),
    edge(TurnPhase::DmClarificationCollect, TurnPhase::DmClarificationWait, has_pending_questions),
    edge(TurnPhase::DmClarificationCollect, TurnPhase::SecondMemoryQuery, always),
    edge(TurnPhase::DmClarificationWait, TurnPhase::DmClarificationCollect, always),
    edge(TurnPhase::SecondMemoryQuery, TurnPhase::StrategicIntent, always),
    edge(TurnPhase::StrategicIntent, TurnPhase::P2cDirective, always),
    edge(TurnPhase::P2cDirective, TurnPhase::CharacterAction, always),
    edge(TurnPhase::CharacterAction, TurnPhase::DmAdjudication, always),
    edge(TurnPhase::DmAdjudication, TurnPhase::ResolveHelpers, always),
    edge(TurnPhase::ResolveHelpers, TurnPhase::DiceResolution, always),
    edge(TurnPhase::DiceResolution, TurnPhase::LaserFeelingsQuestion, has_unanswered_laser_feelings),
    edge(TurnPhase::DiceResolution, TurnPhase::DmOutcome, always),
    edge(TurnPhase::LaserFeelingsQuestion, TurnPhase::DmOutcome, always),
    edge(TurnPhase::DmOutcome, TurnPhase::CharacterReaction, always),
    edge(TurnPhase::CharacterReaction, TurnPhase::MemoryConsolidation, always),
    edge(TurnPhase::MemoryConsolidation, TurnPhase::End, always),
];

/// Phases reachable from `from` in one step.
pub fn allowed_targets(from: TurnPhase) -> Vec<TurnPhase> {
    EDGES.iter().filter(|e| e.from == from).map(|e| e.to).collect()
}

pub fn is_legal_transition(from: TurnPhase, to: TurnPhase) -> bool {
    EDGES.iter().any(|e| e.from == from && e.to == to)
}

/// The phase after `from`, given the state it left behind.
pub fn next_phase(from: TurnPhase, state: &TurnState) -> Option<TurnPhase> {
    EDGES
        .iter()
        .find(|e| e.from == from && (e.guard)(state))
        .map(|e| e.to)
}

/// How a graph run stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Waiting on DM input at this interrupt phase.
    Suspended(TurnPhase),
    Completed,
    /// Retries ran out; the state is the last stable one before `phase`.
    Escalated { phase: TurnPhase, reason: String },
}

#[derive(Debug)]
pub struct GraphRun {
    pub state: TurnState,
    pub outcome: RunOutcome,
}

/// A node's output and how much of it has reached the router.
struct Delivery {
    output: NodeOutput,
    delivered: usize,
    progress: RouteProgress,
}

impl Delivery {
    fn new(output: NodeOutput) -> Self {
        Self {
            output,
            delivered: 0,
            progress: RouteProgress::default(),
        }
    }
}

struct NodeFailure {
    state: TurnState,
    reason: String,
}

/// Drives a turn through its phases.
pub struct TurnGraph {
    ctx: Arc<NodeContext>,
    checkpoints: Arc<dyn CheckpointStore>,
}

impl TurnGraph {
    pub fn new(ctx: Arc<NodeContext>, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        Self { ctx, checkpoints }
    }

    pub fn context(&self) -> &NodeContext {
        &self.ctx
    }

    async fn checkpoint(
        &self,
        state: &TurnState,
        next_node: Option<TurnPhase>,
    ) -> Result<(), CheckpointError> {
        self.checkpoints
            .save(&Checkpoint::new(state.clone(), next_node))
            .await
    }

    /// Run from `start` until the turn suspends, completes, or escalates.
    ///
    /// With `resume` set, `start` runs even if it is an interrupt phase,
    /// because the DM input it waits for has been merged into `state`.
    pub async fn run(
        &self,
        mut state: TurnState,
        start: TurnPhase,
        resume: bool,
    ) -> Result<GraphRun, CheckpointError> {
        let mut phase = start;
        let mut entering_resumed = resume;

        loop {
            state.enter_phase(phase);

            if phase == TurnPhase::End {
                self.checkpoint(&state, None).await?;
                info!(
                    session = state.session_number,
                    turn = state.turn_number,
                    "Turn complete"
                );
                return Ok(GraphRun {
                    state,
                    outcome: RunOutcome::Completed,
                });
            }

            if phase.is_interrupt() && !entering_resumed {
                self.checkpoint(&state, Some(phase)).await?;
                info!(
                    session = state.session_number,
                    phase = %phase,
                    "Awaiting DM input"
                );
                return Ok(GraphRun {
                    state,
                    outcome: RunOutcome::Suspended(phase),
                });
            }
            entering_resumed = false;

            state = match self.execute(phase, state).await {
                Ok(next) => next,
                Err(failure) => return self.escalate(phase, failure).await,
            };
            state.complete_phase(phase);

            let Some(next) = next_phase(phase, &state) else {
                let failure = NodeFailure {
                    reason: format!("No transition out of {phase}"),
                    state,
                };
                return self.escalate(phase, failure).await;
            };
            debug!(from = %phase, to = %next, "Transition");
            phase = next;
        }
    }

    /// Run one node, rolling back and retrying transient failures.
    ///
    /// A node whose messages were only partly delivered is not run again:
    /// the retry resumes delivery from the first message that did not land.
    async fn execute(&self, phase: TurnPhase, state: TurnState) -> Result<TurnState, NodeFailure> {
        let max_retries = self.ctx.config.max_retries;
        let mut stable = state;
        let mut attempts = 0;
        let mut pending: Option<Delivery> = None;

        loop {
            let error = match pending.take() {
                Some(delivery) => match self.deliver(delivery) {
                    Ok(state) => return Ok(state),
                    Err((delivery, e)) => {
                        pending = Some(delivery);
                        e
                    }
                },
                None => match run_node(phase, stable.clone(), &self.ctx).await {
                    Ok(output) => match self.deliver(Delivery::new(output)) {
                        Ok(state) => return Ok(state),
                        Err((delivery, e)) => {
                            pending = Some(delivery);
                            e
                        }
                    },
                    Err(e) => e,
                },
            };

            if !error.is_retryable() {
                return Err(NodeFailure {
                    reason: format!("{phase} failed: {error}"),
                    state: stable,
                });
            }
            if attempts >= max_retries {
                return Err(NodeFailure {
                    reason: format!("{phase} failed after {} retries: {error}", attempts),
                    state: stable,
                });
            }

            attempts += 1;
            stable.retry_count += 1;
            match pending.as_mut() {
                Some(delivery) => {
                    delivery.output.state.retry_count += 1;
                    warn!(
                        phase = %phase,
                        attempt = attempts,
                        max_retries,
                        delivered = delivery.delivered,
                        error = %error,
                        "Routing failed; retrying undelivered messages"
                    );
                }
                None => warn!(
                    phase = %phase,
                    attempt = attempts,
                    max_retries,
                    error = %error,
                    "Phase failed; rolled back to last stable state"
                ),
            }
        }
    }

    fn deliver(&self, mut delivery: Delivery) -> Result<TurnState, (Delivery, NodeError)> {
        while let Some(message) = delivery.output.messages.get(delivery.delivered) {
            if let Err(e) = self.ctx.router.resume_route(message, &mut delivery.progress) {
                return Err((delivery, e.into()));
            }
            if message.channel == Channel::Ooc {
                delivery.output.state.ooc_messages.push(message.clone());
            }
            delivery.delivered += 1;
            delivery.progress = RouteProgress::default();
        }
        info!(
            phase = %delivery.output.state.current_phase,
            messages = delivery.output.messages.len(),
            "Phase finished"
        );
        Ok(delivery.output.state)
    }

    async fn escalate(
        &self,
        phase: TurnPhase,
        failure: NodeFailure,
    ) -> Result<GraphRun, CheckpointError> {
        let mut state = failure.state;
        state.dm_intervention_required = true;
        state.intervention_reason = Some(failure.reason.clone());

        warn!(
            session = state.session_number,
            phase = %phase,
            reason = %failure.reason,
            "DM intervention required"
        );
        self.checkpoint(&state, Some(phase)).await?;

        Ok(GraphRun {
            state,
            outcome: RunOutcome::Escalated {
                phase,
                reason: failure.reason,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dice::{LasersFeelingsRoll, RollModifiers, TaskType};
    use crate::state::ClarificationQuestion;

    #[test]
    fn test_every_non_terminal_phase_has_an_exit() {
        for phase in TurnPhase::ALL {
            if phase != TurnPhase::End {
                assert!(!allowed_targets(phase).is_empty(), "{phase} has no exit");
            }
        }
        assert!(allowed_targets(TurnPhase::End).is_empty());
    }

    #[test]
    fn test_clarification_branch() {
        let mut state = TurnState::new(1, 1, "x", vec![]);
        assert_eq!(
            next_phase(TurnPhase::DmClarificationCollect, &state),
            Some(TurnPhase::SecondMemoryQuery)
        );
        state.pending_questions.push(ClarificationQuestion {
            agent_id: "agent_alex".into(),
            question: "How far away?".into(),
            round: 1,
        });
        assert_eq!(
            next_phase(TurnPhase::DmClarificationCollect, &state),
            Some(TurnPhase::DmClarificationWait)
        );
    }

    #[test]
    fn test_exact_match_branch() {
        let mut state = TurnState::new(1, 1, "x", vec![]);
        let roll = |dice| {
            LasersFeelingsRoll::from_rolls(4, TaskType::Feelings, RollModifiers::default(), dice, None)
                .unwrap()
        };

        state.roll_results.insert("char_zara".into(), roll(vec![6]));
        assert_eq!(
            next_phase(TurnPhase::DiceResolution, &state),
            Some(TurnPhase::DmOutcome)
        );

        state.roll_results.insert("char_zara".into(), roll(vec![4]));
        assert_eq!(
            next_phase(TurnPhase::DiceResolution, &state),
            Some(TurnPhase::LaserFeelingsQuestion)
        );

        state.record_laser_feelings_answer(Some("char_zara"), "They are afraid.");
        assert_eq!(
            next_phase(TurnPhase::DiceResolution, &state),
            Some(TurnPhase::DmOutcome)
        );
    }

    #[test]
    fn test_legal_transitions() {
        assert!(is_legal_transition(TurnPhase::DmNarration, TurnPhase::MemoryRetrieval));
        assert!(is_legal_transition(TurnPhase::DiceResolution, TurnPhase::DmOutcome));
        assert!(!is_legal_transition(TurnPhase::DmNarration, TurnPhase::End));
    }
}
