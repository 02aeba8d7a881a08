use super::{stamp, NodeContext, NodeError, NodeOutput};
use crate::consensus::{ConsensusResult, ConsensusState};
use crate::jobs::{wait_all, DirectiveRequest, DiscussionRequest, IntentRequest};
use crate::message::{Message, MessageType};
use crate::state::{TurnPhase, TurnState};
use std::sync::Arc;
use tracing::{info, warn};

/// Each player settles what it wants its character to do, then the table
/// talks it over until it agrees or runs out of rounds.
pub(super) async fn strategic_intent(
    mut state: TurnState,
    ctx: &NodeContext,
) -> Result<NodeOutput, NodeError> {
    let entries = ctx.active_entries(&state)?;

    let handles: Vec<_> = entries
        .iter()
        .map(|entry| {
            let player = Arc::clone(&entry.player);
            let request = IntentRequest {
                agent_id: entry.agent_id.clone(),
                character_id: entry.character_id.clone(),
                narration: state.dm_narration.clone(),
                memories: state
                    .retrieved_memories
                    .get(&entry.agent_id)
                    .cloned()
                    .unwrap_or_default(),
                clarifications: state.clarification_history.clone(),
            };
            ctx.queues
                .strategic
                .submit(entry.agent_id.clone(), async move { player.formulate_intent(&request).await })
        })
        .collect();

    let mut messages = Vec::new();
    for (agent_id, result) in wait_all(handles).await {
        let intent = result?;
        messages.push(stamp(
            Message::ooc(
                &agent_id,
                intent.clone(),
                MessageType::Intent,
                TurnPhase::StrategicIntent,
                state.turn_number,
            ),
            &state,
        ));
        state.strategic_intents.insert(agent_id, intent);
    }

    if entries.len() > 1 {
        let consensus = discuss(&state, ctx, &mut messages).await?;
        info!(
            session = state.session_number,
            state = ?consensus.state,
            rounds = consensus.rounds_elapsed,
            proceed = consensus.proceed_with_action,
            "Table consensus"
        );
        state.consensus = Some(consensus);
    }

    Ok(NodeOutput::with_messages(state, messages))
}

/// Discussion rounds after the intents are on the table.
async fn discuss(
    state: &TurnState,
    ctx: &NodeContext,
    messages: &mut Vec<Message>,
) -> Result<ConsensusResult, NodeError> {
    let agents = state.active_agents.clone();
    let max_rounds = ctx.config.consensus_max_rounds;
    let timeout = ctx.config.consensus_timeout;

    let mut discussion = messages.clone();
    let mut result = ctx
        .consensus
        .detect_consensus(&discussion, &agents, max_rounds, timeout)
        .await?;

    let mut round = 1;
    while !result.proceed_with_action && round < max_rounds {
        round += 1;
        let handles: Vec<_> = ctx
            .active_entries(state)?
            .into_iter()
            .map(|entry| {
                let player = Arc::clone(&entry.player);
                let request = DiscussionRequest {
                    agent_id: entry.agent_id.clone(),
                    round,
                    intents: state.strategic_intents.clone(),
                    discussion: discussion.clone(),
                };
                ctx.queues
                    .strategic
                    .submit(entry.agent_id, async move { player.discuss(&request).await })
            })
            .collect();

        for (agent_id, reply) in wait_all(handles).await {
            let Some(text) = reply?.filter(|t| !t.trim().is_empty()) else {
                continue;
            };
            let message = stamp(
                Message::ooc(
                    &agent_id,
                    text,
                    MessageType::Discussion,
                    TurnPhase::StrategicIntent,
                    state.turn_number,
                ),
                state,
            );
            discussion.push(message.clone());
            messages.push(message);
        }

        result = ctx
            .consensus
            .detect_consensus(&discussion, &agents, max_rounds, timeout)
            .await?;
    }

    // Silent tables that used every round still have to decide.
    if !result.proceed_with_action && result.dissenting_agents.is_none() {
        result.state = ConsensusState::Timeout;
        result.proceed_with_action = true;
        result.rounds_elapsed = result.rounds_elapsed.max(round);
    }
    if let Some(dissenters) = &result.dissenting_agents {
        warn!(?dissenters, "Table could not agree; players act on their own intents");
    }
    Ok(result)
}

/// Turn each intent into a private directive for the player's character.
pub(super) async fn p2c_directive(
    mut state: TurnState,
    ctx: &NodeContext,
) -> Result<NodeOutput, NodeError> {
    let handles: Vec<_> = ctx
        .active_entries(&state)?
        .into_iter()
        .map(|entry| {
            let player = Arc::clone(&entry.player);
            let request = DirectiveRequest {
                agent_id: entry.agent_id.clone(),
                character_id: entry.character_id.clone(),
                intent: state
                    .strategic_intents
                    .get(&entry.agent_id)
                    .cloned()
                    .unwrap_or_default(),
                consensus: state.consensus.clone(),
            };
            ctx.queues
                .strategic
                .submit(entry.agent_id, async move { player.create_directive(&request).await })
        })
        .collect();

    let mut messages = Vec::new();
    for (agent_id, result) in wait_all(handles).await {
        let mut directive = result?;
        if directive.trim().is_empty() {
            directive = state
                .strategic_intents
                .get(&agent_id)
                .cloned()
                .unwrap_or_default();
        }
        let character_id = ctx.registry.character_for(&agent_id)?.to_string();

        messages.push(stamp(
            Message::p2c(
                &agent_id,
                vec![character_id.clone()],
                directive.clone(),
                MessageType::Directive,
                TurnPhase::P2cDirective,
                state.turn_number,
            )?,
            &state,
        ));
        state.directives.insert(character_id, directive);
    }

    Ok(NodeOutput::with_messages(state, messages))
}
