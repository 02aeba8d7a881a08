use super::{stamp, NodeContext, NodeError, NodeOutput};
use crate::jobs::{wait_all, ClarificationRequest};
use crate::message::{Message, MessageType, DM_SENDER};
use crate::state::{ClarificationExchange, ClarificationQuestion, TurnPhase, TurnState};
use std::sync::Arc;
use tracing::{debug, info};

/// Ask every player whether it needs anything clarified.
pub(super) async fn collect(
    mut state: TurnState,
    ctx: &NodeContext,
) -> Result<NodeOutput, NodeError> {
    state.pending_questions.clear();

    if state.force_finish_clarification
        || state.clarification_round >= ctx.config.max_clarification_rounds
    {
        debug!(
            round = state.clarification_round,
            forced = state.force_finish_clarification,
            "Clarification closed"
        );
        return Ok(NodeOutput::new(state));
    }

    let round = state.clarification_round + 1;
    let handles: Vec<_> = ctx
        .active_entries(&state)?
        .into_iter()
        .map(|entry| {
            let player = Arc::clone(&entry.player);
            let request = ClarificationRequest {
                agent_id: entry.agent_id.clone(),
                character_id: entry.character_id.clone(),
                narration: state.dm_narration.clone(),
                memories: state
                    .retrieved_memories
                    .get(&entry.agent_id)
                    .cloned()
                    .unwrap_or_default(),
                round,
                previous: state.clarification_history.clone(),
            };
            ctx.queues
                .strategic
                .submit(entry.agent_id, async move { player.clarifying_question(&request).await })
        })
        .collect();

    let mut messages = Vec::new();
    for (agent_id, result) in wait_all(handles).await {
        let Some(question) = result?.filter(|q| !q.trim().is_empty()) else {
            continue;
        };
        messages.push(stamp(
            Message::ooc(
                &agent_id,
                question.clone(),
                MessageType::Question,
                TurnPhase::DmClarificationCollect,
                state.turn_number,
            ),
            &state,
        ));
        state.pending_questions.push(ClarificationQuestion {
            agent_id,
            question,
            round,
        });
    }

    if !state.pending_questions.is_empty() {
        state.clarification_round = round;
        info!(
            session = state.session_number,
            round,
            questions = state.pending_questions.len(),
            "Clarifying questions for the DM"
        );
    }
    Ok(NodeOutput::with_messages(state, messages))
}

/// Pair the DM's answers with the open questions.
pub(super) async fn wait(
    mut state: TurnState,
    _ctx: &NodeContext,
) -> Result<NodeOutput, NodeError> {
    let questions = std::mem::take(&mut state.pending_questions);
    let mut answers = std::mem::take(&mut state.clarification_answers);

    let mut messages = Vec::new();
    for q in questions {
        let answer = answers
            .remove(&q.agent_id)
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty());

        if let Some(text) = &answer {
            messages.push(stamp(
                Message::ooc(
                    DM_SENDER,
                    format!("@{}: {}", q.agent_id, text),
                    MessageType::Answer,
                    TurnPhase::DmClarificationWait,
                    state.turn_number,
                ),
                &state,
            ));
        }
        state.clarification_history.push(ClarificationExchange {
            agent_id: q.agent_id,
            question: q.question,
            answer,
            round: q.round,
        });
    }

    Ok(NodeOutput::with_messages(state, messages))
}
