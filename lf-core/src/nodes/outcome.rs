use super::{route_insights, stamp, NodeContext, NodeError, NodeOutput};
use crate::jobs::{wait_all, ReactionRequest};
use crate::message::{Message, MessageType, DM_SENDER};
use crate::router::AgentType;
use crate::state::{TurnPhase, TurnState};
use std::sync::Arc;
use tracing::info;

/// Narrate what happened, then deliver any LASER FEELINGS answer that came
/// in with the narration.
pub(super) async fn dm_outcome(
    mut state: TurnState,
    _ctx: &NodeContext,
) -> Result<NodeOutput, NodeError> {
    let narration = state
        .dm_outcome
        .clone()
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| NodeError::Invariant("Outcome narration is missing".to_string()))?;

    let mut messages = vec![stamp(
        Message::ic(
            DM_SENDER,
            narration,
            MessageType::Outcome,
            TurnPhase::DmOutcome,
            state.turn_number,
        ),
        &state,
    )];
    messages.extend(route_insights(&mut state, TurnPhase::DmOutcome)?);

    Ok(NodeOutput::with_messages(state, messages))
}

/// Each character reacts in the fiction to the outcome.
pub(super) async fn character_reaction(
    mut state: TurnState,
    ctx: &NodeContext,
) -> Result<NodeOutput, NodeError> {
    let outcome = state.dm_outcome.clone().unwrap_or_default();

    let mut handles = Vec::new();
    for entry in ctx.active_entries(&state)? {
        let insight = state
            .laser_feelings_routed
            .contains(&entry.character_id)
            .then(|| state.laser_feelings_answers.get(&entry.character_id).cloned())
            .flatten();
        let request = ReactionRequest {
            character_id: entry.character_id.clone(),
            outcome: outcome.clone(),
            insight,
            scene: ctx.router.get_messages_for(
                &entry.character_id,
                AgentType::Character,
                ctx.config.message_history_limit,
            )?,
        };
        let character = Arc::clone(&entry.character);
        handles.push(
            ctx.queues
                .character
                .submit(entry.character_id, async move { character.react(&request).await }),
        );
    }

    let mut messages = Vec::new();
    for (character_id, result) in wait_all(handles).await {
        let reaction = result?;
        if reaction.trim().is_empty() {
            continue;
        }
        messages.push(stamp(
            Message::ic(
                &character_id,
                reaction.clone(),
                MessageType::Reaction,
                TurnPhase::CharacterReaction,
                state.turn_number,
            ),
            &state,
        ));
        state.character_reactions.insert(character_id, reaction);
    }

    info!(
        session = state.session_number,
        reactions = state.character_reactions.len(),
        "Characters reacted"
    );
    Ok(NodeOutput::with_messages(state, messages))
}
