use super::{stamp, NodeContext, NodeError, NodeOutput};
use crate::dice::roll_lasers_feelings;
use crate::message::{Message, MessageError, MessageType, DM_SENDER};
use crate::state::{PendingRoll, TurnPhase, TurnState};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Prefix of the private message carrying a LASER FEELINGS answer.
pub const INSIGHT_PREFIX: &str = "[LASER FEELINGS Insight]:";

/// Announce the DM's rulings to the players.
pub(super) async fn dm_adjudication(
    state: TurnState,
    _ctx: &NodeContext,
) -> Result<NodeOutput, NodeError> {
    let Some(adjudication) = &state.adjudication else {
        debug!("No rulings; every action rolls as declared");
        return Ok(NodeOutput::new(state));
    };

    let mut lines = Vec::new();
    for (character_id, ruling) in &adjudication.rulings {
        let line = if ruling.needs_roll {
            match ruling.task_type {
                Some(task) => format!("{character_id}: roll {task}"),
                None => format!("{character_id}: roll as declared"),
            }
        } else {
            format!("{character_id}: no roll needed")
        };
        match &ruling.notes {
            Some(notes) => lines.push(format!("{line} ({notes})")),
            None => lines.push(line),
        }
    }
    if let Some(notes) = &adjudication.notes {
        lines.push(notes.clone());
    }

    let messages = if lines.is_empty() {
        Vec::new()
    } else {
        vec![stamp(
            Message::ooc(
                DM_SENDER,
                lines.join("\n"),
                MessageType::Ruling,
                TurnPhase::DmAdjudication,
                state.turn_number,
            ),
            &state,
        )]
    };
    Ok(NodeOutput::with_messages(state, messages))
}

/// Settle who helps whom and fix every roll's dice.
///
/// A helper spends its action on a teammate and does not roll. However many
/// teammates help, the actor gets a single helping die.
pub(super) async fn resolve_helpers(
    mut state: TurnState,
    ctx: &NodeContext,
) -> Result<NodeOutput, NodeError> {
    let actions = &state.character_actions;

    let mut helpers: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (id, action) in actions {
        let Some(target) = &action.helping_character else {
            continue;
        };
        let target_acts_alone = actions
            .get(target)
            .is_some_and(|t| t.helping_character.is_none());
        if target != id && target_acts_alone {
            helpers.entry(target.clone()).or_default().push(id.clone());
        }
    }
    let is_helper = |id: &str| helpers.values().any(|hs| hs.iter().any(|h| h == id));

    let mut pending = BTreeMap::new();
    for (id, action) in actions {
        if is_helper(id) {
            continue;
        }
        let ruling = state
            .adjudication
            .as_ref()
            .and_then(|a| a.rulings.get(id))
            .cloned()
            .unwrap_or_default();
        if !ruling.needs_roll {
            debug!(character = %id, "No roll needed");
            continue;
        }

        let entry = ctx.registry.by_character(id)?;
        let mut modifiers = action.modifiers();
        modifiers.prepared = ruling.prepared.unwrap_or(modifiers.prepared);
        modifiers.expert = ruling.expert.unwrap_or(modifiers.expert);
        modifiers.helping = modifiers.helping || helpers.contains_key(id);

        pending.insert(
            id.clone(),
            PendingRoll {
                character_id: id.clone(),
                character_number: entry.character_number,
                task_type: ruling.task_type.unwrap_or(action.task_type),
                modifiers,
                gm_question: action.gm_question.clone(),
            },
        );
    }

    debug!(rolls = pending.len(), helped = helpers.len(), "Helpers resolved");
    state.helpers = helpers;
    state.pending_rolls = pending;
    Ok(NodeOutput::new(state))
}

/// Roll every pending roll and report the dice to the players.
pub(super) async fn dice_resolution(
    mut state: TurnState,
    ctx: &NodeContext,
) -> Result<NodeOutput, NodeError> {
    let mut messages = Vec::new();
    let mut results = BTreeMap::new();

    for (id, pending) in &state.pending_rolls {
        let roll = roll_lasers_feelings(
            pending.character_number,
            pending.task_type,
            pending.modifiers,
            pending.gm_question.clone(),
            ctx.roller.as_ref(),
        )?;
        let name = &ctx.registry.by_character(id)?.character_name;
        debug!(character = %id, dice = %roll.dice_display(), outcome = %roll.outcome, "Rolled");

        let mut report = format!("{name}: {roll}");
        if roll.has_laser_feelings() {
            report.push_str("\nLASER FEELINGS!");
            if let Some(question) = &roll.gm_question {
                report.push_str(&format!(" {name} asks: {question}"));
            }
        }
        messages.push(stamp(
            Message::ooc(
                DM_SENDER,
                report,
                MessageType::Roll,
                TurnPhase::DiceResolution,
                state.turn_number,
            ),
            &state,
        ));
        results.insert(id.clone(), roll);
    }

    state.roll_results = results;
    state.bind_early_laser_feelings_answer();

    info!(
        session = state.session_number,
        rolls = state.roll_results.len(),
        laser_feelings = state.laser_feelings_characters().len(),
        "Dice resolved"
    );
    Ok(NodeOutput::with_messages(state, messages))
}

/// Deliver the DM's LASER FEELINGS answers. Unanswered questions count as
/// declined; the DM can still answer during outcome narration.
pub(super) async fn laser_feelings_question(
    mut state: TurnState,
    _ctx: &NodeContext,
) -> Result<NodeOutput, NodeError> {
    let messages = route_insights(&mut state, TurnPhase::LaserFeelingsQuestion)?;
    let declined = state.unanswered_laser_feelings().len();
    if declined > 0 {
        debug!(declined, "LASER FEELINGS questions left unanswered");
    }
    Ok(NodeOutput::with_messages(state, messages))
}

/// Private insight messages for answered LASER FEELINGS questions not yet
/// delivered. Marks each one delivered.
pub(crate) fn route_insights(
    state: &mut TurnState,
    phase: TurnPhase,
) -> Result<Vec<Message>, MessageError> {
    let ready: Vec<(String, String)> = state
        .laser_feelings_characters()
        .into_iter()
        .filter(|id| !state.laser_feelings_routed.contains(*id))
        .filter_map(|id| {
            state
                .laser_feelings_answers
                .get(id)
                .map(|answer| (id.to_string(), answer.clone()))
        })
        .collect();

    let mut messages = Vec::with_capacity(ready.len());
    for (character_id, answer) in ready {
        let message = Message::p2c(
            DM_SENDER,
            vec![character_id.clone()],
            format!("{INSIGHT_PREFIX} {answer}"),
            MessageType::Insight,
            phase,
            state.turn_number,
        )?;
        messages.push(stamp(message, state));
        info!(character = %character_id, "Delivered LASER FEELINGS insight");
        state.laser_feelings_routed.insert(character_id);
    }
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dice::{LasersFeelingsRoll, RollModifiers, TaskType};

    fn rolled(state: &mut TurnState, id: &str, dice: Vec<u8>) {
        let roll =
            LasersFeelingsRoll::from_rolls(3, TaskType::Lasers, RollModifiers::default(), dice, None)
                .unwrap();
        state.roll_results.insert(id.to_string(), roll);
    }

    #[test]
    fn test_insight_routed_once() {
        let mut state = TurnState::new(1, 1, "x", vec![]);
        rolled(&mut state, "char_zara", vec![3]);
        state.record_laser_feelings_answer(Some("char_zara"), "It's a distress call.");

        let first = route_insights(&mut state, TurnPhase::LaserFeelingsQuestion).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].content, "[LASER FEELINGS Insight]: It's a distress call.");
        assert_eq!(first[0].to_agents, Some(vec!["char_zara".to_string()]));

        let again = route_insights(&mut state, TurnPhase::DmOutcome).unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn test_no_insight_without_exact_match_or_answer() {
        let mut state = TurnState::new(1, 1, "x", vec![]);
        rolled(&mut state, "char_zara", vec![1]);
        rolled(&mut state, "char_rex", vec![3]);
        state.record_laser_feelings_answer(Some("char_zara"), "Irrelevant");
        state.record_laser_feelings_answer(Some("char_rex"), "");

        assert!(route_insights(&mut state, TurnPhase::DmOutcome)
            .unwrap()
            .is_empty());
    }
}
