use super::{stamp, NodeContext, NodeError, NodeOutput};
use crate::message::{Message, MessageType, DM_SENDER};
use crate::state::{TurnPhase, TurnState};
use tracing::info;

/// Broadcast the DM's scene narration in character.
pub(super) async fn dm_narration(
    state: TurnState,
    ctx: &NodeContext,
) -> Result<NodeOutput, NodeError> {
    // Fail early on agents nobody registered.
    ctx.active_entries(&state)?;

    if state.dm_narration.trim().is_empty() {
        return Err(NodeError::Invariant("DM narration is empty".to_string()));
    }

    info!(
        session = state.session_number,
        turn = state.turn_number,
        agents = state.active_agents.len(),
        "Turn opened"
    );

    let narration = stamp(
        Message::ic(
            DM_SENDER,
            state.dm_narration.clone(),
            MessageType::Narration,
            TurnPhase::DmNarration,
            state.turn_number,
        ),
        &state,
    );
    Ok(NodeOutput::with_messages(state, vec![narration]))
}
