use super::{stamp, NodeContext, NodeError, NodeOutput};
use crate::jobs::{wait_all, ActionRequest};
use crate::message::{Message, MessageType};
use crate::router::AgentType;
use crate::state::{CharacterAction, TurnPhase, TurnState};
use crate::validation::{
    strip_outcome_language, validate_intent, ValidationFallback, ValidationStrictness,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Every character declares an action. Actions that narrate outcomes are
/// regenerated with a stricter instruction; only the offenders go again.
pub(super) async fn character_action(
    mut state: TurnState,
    ctx: &NodeContext,
) -> Result<NodeOutput, NodeError> {
    let max_attempts = ctx.config.max_validation_attempts.max(1);
    let mut pending: Vec<String> = ctx
        .active_entries(&state)?
        .into_iter()
        .map(|e| e.character_id)
        .collect();
    let mut last_violations: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut accepted: BTreeMap<String, CharacterAction> = BTreeMap::new();

    for attempt in 1..=max_attempts {
        if pending.is_empty() {
            break;
        }
        state.validation_attempts = attempt;
        let strictness = ValidationStrictness::for_attempt(attempt);

        let mut handles = Vec::with_capacity(pending.len());
        for character_id in &pending {
            let entry = ctx.registry.by_character(character_id)?;
            let request = ActionRequest {
                character_id: character_id.clone(),
                directive: state.directives.get(character_id).cloned().unwrap_or_default(),
                scene: ctx.router.get_messages_for(
                    character_id,
                    AgentType::Character,
                    ctx.config.message_history_limit,
                )?,
                memories: state
                    .retrieved_memories
                    .get(character_id)
                    .cloned()
                    .unwrap_or_default(),
                strictness,
                attempt,
                previous_violations: last_violations.remove(character_id).unwrap_or_default(),
            };
            let character = Arc::clone(&entry.character);
            handles.push(
                ctx.queues
                    .character
                    .submit(character_id.clone(), async move { character.perform_action(&request).await }),
            );
        }

        let mut retry = Vec::new();
        for (character_id, result) in wait_all(handles).await {
            let mut action = result?;
            action.character_id = character_id.clone();

            let report = validate_intent(&action.narrative);
            if report.is_valid() {
                accepted.insert(character_id, action);
                continue;
            }

            warn!(
                character = %character_id,
                attempt,
                violations = ?report.violations,
                "Action narrates an outcome"
            );
            state
                .validation_failures
                .entry(character_id.clone())
                .or_default()
                .extend(report.violations.iter().cloned());

            if attempt < max_attempts {
                last_violations.insert(character_id.clone(), report.violations);
                retry.push(character_id);
                continue;
            }

            match ctx.config.validation_fallback {
                ValidationFallback::AutoCorrect => {
                    let name = &ctx.registry.by_character(&character_id)?.character_name;
                    action.narrative = strip_outcome_language(&action.narrative, name);
                    info!(character = %character_id, narrative = %action.narrative, "Auto-corrected action");
                }
                ValidationFallback::DmReview => {
                    state.actions_requiring_review.insert(character_id.clone());
                    warn!(character = %character_id, "Action flagged for DM review");
                }
            }
            accepted.insert(character_id, action);
        }
        pending = retry;
    }

    let messages: Vec<Message> = accepted
        .values()
        .map(|action| {
            stamp(
                Message::ic(
                    &action.character_id,
                    action.narrative.clone(),
                    MessageType::Action,
                    TurnPhase::CharacterAction,
                    state.turn_number,
                ),
                &state,
            )
        })
        .collect();
    state.character_actions = accepted;

    Ok(NodeOutput::with_messages(state, messages))
}
