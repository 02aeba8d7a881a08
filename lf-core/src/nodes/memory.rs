use super::{NodeContext, NodeError, NodeOutput};
use crate::memory::MemoryQuery;
use crate::message::Message;
use crate::router::AgentType;
use crate::state::TurnState;
use chrono::Utc;
use futures::future::join_all;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Query memories for every active player and its character.
async fn recall(
    state: &TurnState,
    ctx: &NodeContext,
    query: &str,
) -> Result<BTreeMap<String, Vec<String>>, NodeError> {
    let mut owners = Vec::new();
    for entry in ctx.active_entries(state)? {
        owners.push(entry.agent_id);
        owners.push(entry.character_id);
    }

    let searches = owners.iter().map(|owner| {
        let q = MemoryQuery::new(query, owner.clone())
            .with_corruption(ctx.config.apply_memory_corruption)
            .with_limit(ctx.config.memory_search_limit);
        async move { ctx.memory.search(&q).await }
    });
    let results = join_all(searches).await;

    let mut recalled = BTreeMap::new();
    for (owner, result) in owners.into_iter().zip(results) {
        let facts: Vec<String> = result?.into_iter().map(|edge| edge.fact).collect();
        debug!(owner = %owner, hits = facts.len(), "Recalled memories");
        recalled.insert(owner, facts);
    }
    Ok(recalled)
}

pub(super) async fn memory_retrieval(
    mut state: TurnState,
    ctx: &NodeContext,
) -> Result<NodeOutput, NodeError> {
    let query = state.dm_narration.clone();
    state.retrieved_memories = recall(&state, ctx, &query).await?;
    Ok(NodeOutput::new(state))
}

/// Search again with what clarification revealed, keeping earlier hits.
pub(super) async fn second_memory_query(
    mut state: TurnState,
    ctx: &NodeContext,
) -> Result<NodeOutput, NodeError> {
    let answers: Vec<&str> = state
        .clarification_history
        .iter()
        .filter_map(|ex| ex.answer.as_deref())
        .collect();
    if answers.is_empty() {
        return Ok(NodeOutput::new(state));
    }

    let query = format!("{} {}", state.dm_narration, answers.join(" "));
    for (owner, facts) in recall(&state, ctx, &query).await? {
        let known = state.retrieved_memories.entry(owner).or_default();
        for fact in facts {
            if !known.contains(&fact) {
                known.push(fact);
            }
        }
    }
    Ok(NodeOutput::new(state))
}

/// Store the turn as an episode for each player and each character.
pub(super) async fn memory_consolidation(
    mut state: TurnState,
    ctx: &NodeContext,
) -> Result<NodeOutput, NodeError> {
    let limit = ctx.config.message_history_limit;
    let this_turn = |m: &Message| {
        m.turn_number == state.turn_number && m.session_number == Some(state.session_number)
    };

    let mut episodes = Vec::new();
    for entry in ctx.active_entries(&state)? {
        for (owner, agent_type) in [
            (&entry.agent_id, AgentType::Player),
            (&entry.character_id, AgentType::Character),
        ] {
            let messages: Vec<Message> = ctx
                .router
                .get_messages_for(owner, agent_type, limit)?
                .into_iter()
                .filter(|m| this_turn(m))
                .collect();
            if messages.is_empty() {
                continue;
            }
            let episode = ctx
                .memory
                .add_episode(state.session_number, &messages, Utc::now(), owner)
                .await?;
            episodes.push(episode);
        }
    }

    info!(
        session = state.session_number,
        turn = state.turn_number,
        episodes = episodes.len(),
        "Consolidated turn into memory"
    );
    state.episode_ids.extend(episodes);
    state.pending_rolls.clear();
    state.pending_questions.clear();
    Ok(NodeOutput::new(state))
}
