//! QA tests for retries, escalation and DM overrides.
//!
//! Transient failures roll back to the last stable state and retry. Once the
//! retry budget is spent the DM is asked to intervene, and can push the turn
//! on with a transition or rollback.
//! Run with: `cargo test -p lf-core --test qa_failure_recovery`

use lf_core::state::OverrideKind;
use lf_core::testing::{FlakyMemory, ScriptedCharacter, ScriptedPlayer, TestHarness};
use lf_core::validation::{validate_intent, ValidationFallback, ValidationStrictness};
use lf_core::{DmAdjudication, DmInput, OrchestratorConfig, OrchestratorError, TurnPhase};
use std::sync::Arc;
use std::time::Duration;

fn setup() {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();
}

const NARRATION: &str = "Pirates close in on the Raptor.";

fn harness(player: ScriptedPlayer, character: ScriptedCharacter, config: OrchestratorConfig) -> TestHarness {
    TestHarness::builder()
        .agent("agent_alex", "char_zara", "Zara-7", 3, player, character)
        .dice(vec![1])
        .config(config)
        .build()
        .expect("Failed to build harness")
}

// =============================================================================
// TEST 1: Retries
// =============================================================================

#[tokio::test]
async fn test_transient_job_failures_are_retried() {
    setup();
    let h = harness(
        ScriptedPlayer::new("Evade the pirates").failing_intents(2),
        ScriptedCharacter::new("I try to pull a hard burn"),
        OrchestratorConfig::default().with_max_retries(3),
    );

    let result = h
        .orchestrator
        .execute_turn_cycle(NARRATION, vec!["agent_alex".into()], 1, 1)
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.awaiting_phase, Some(TurnPhase::DmAdjudication));
    assert_eq!(result.state.retry_count, 2);
    assert_eq!(result.state.strategic_intents["agent_alex"], "Evade the pirates");
    assert_eq!(h.player("agent_alex").unwrap().call_count("formulate_intent"), 3);

    // Failed attempts leave nothing behind on the channels.
    let intents = h
        .ooc_messages("agent_alex")
        .unwrap()
        .into_iter()
        .filter(|m| m.message_type == lf_core::MessageType::Intent)
        .count();
    assert_eq!(intents, 1);
}

#[tokio::test]
async fn test_memory_outage_is_retried() {
    setup();
    let memory = Arc::new(FlakyMemory::new(1));
    let h = TestHarness::builder()
        .agent(
            "agent_alex",
            "char_zara",
            "Zara-7",
            3,
            ScriptedPlayer::new("Evade the pirates"),
            ScriptedCharacter::new("I try to pull a hard burn"),
        )
        .memory(memory.clone())
        .build()
        .unwrap();

    let result = h
        .orchestrator
        .execute_turn_cycle(NARRATION, vec!["agent_alex".into()], 1, 1)
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.state.retry_count, 1);
    assert!(memory.searches() >= 3);
}

#[tokio::test]
async fn test_slow_agent_times_out_and_escalates() {
    use async_trait::async_trait;
    use lf_core::jobs::{ClarificationRequest, IntentRequest, JobError, PlayerAgent};

    struct Stalled;

    #[async_trait]
    impl PlayerAgent for Stalled {
        async fn clarifying_question(
            &self,
            _request: &ClarificationRequest,
        ) -> Result<Option<String>, JobError> {
            Ok(None)
        }

        async fn formulate_intent(&self, _request: &IntentRequest) -> Result<String, JobError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("Too late".into())
        }
    }

    setup();
    let mut registry = lf_core::AgentRegistry::new();
    registry
        .register(
            "agent_alex",
            "char_zara",
            "Zara-7",
            3,
            Arc::new(Stalled),
            Arc::new(ScriptedCharacter::new("I try to pull a hard burn")),
        )
        .unwrap();
    let orchestrator = lf_core::TurnOrchestrator::builder(
        registry,
        Arc::new(lf_core::InMemoryCheckpointStore::new()),
    )
    .with_config(
        OrchestratorConfig::default()
            .with_job_timeout(Duration::from_millis(20))
            .with_max_retries(1),
    )
    .build();

    let result = orchestrator
        .execute_turn_cycle(NARRATION, vec!["agent_alex".into()], 1, 1)
        .await
        .unwrap();
    assert!(!result.success);
    assert!(result.dm_intervention_required);
    let reason = result.intervention_reason.unwrap();
    assert!(reason.contains("strategic_intent"), "{reason}");
    assert!(reason.contains("timed out"), "{reason}");
}

#[tokio::test]
async fn test_routing_outage_does_not_resend_insights() {
    use lf_core::message::{Channel, MessageType};
    use lf_core::nodes::INSIGHT_PREFIX;
    use lf_core::store::{InMemoryStore, MessageStore, StoreError};
    use lf_core::MessageRouter;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Drops the first insight pushed to one character's P2C list.
    struct InsightOutage {
        inner: InMemoryStore,
        key: &'static str,
        tripped: AtomicBool,
    }

    impl MessageStore for InsightOutage {
        fn push(&self, key: &str, value: String) -> Result<usize, StoreError> {
            if key == self.key
                && value.contains(INSIGHT_PREFIX)
                && !self.tripped.swap(true, Ordering::SeqCst)
            {
                return Err(StoreError::Unavailable("connection reset".into()));
            }
            self.inner.push(key, value)
        }
        fn range(&self, key: &str) -> Result<Vec<String>, StoreError> {
            self.inner.range(key)
        }
        fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
            self.inner.expire(key, ttl)
        }
        fn set_add(&self, key: &str, member: &str) -> Result<bool, StoreError> {
            self.inner.set_add(key, member)
        }
        fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
            self.inner.set_members(key)
        }
        fn delete(&self, key: &str) -> Result<bool, StoreError> {
            self.inner.delete(key)
        }
        fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
            self.inner.ttl(key)
        }
    }

    setup();
    let router = Arc::new(MessageRouter::new(Arc::new(InsightOutage {
        inner: InMemoryStore::new(),
        key: "channel:p2c:char_zara",
        tripped: AtomicBool::new(false),
    })));
    let h = TestHarness::builder()
        .agent(
            "agent_alex",
            "char_zara",
            "Zara-7",
            3,
            ScriptedPlayer::new("Evade the pirates").with_discussion("Agreed"),
            ScriptedCharacter::new("I try to pull a hard burn"),
        )
        .agent(
            "agent_sam",
            "char_rook",
            "Rook",
            3,
            ScriptedPlayer::new("Man the turret").with_discussion("Agreed"),
            ScriptedCharacter::new("I try to rake their engines"),
        )
        .dice(vec![3])
        .router(router)
        .build()
        .unwrap();
    let orch = &h.orchestrator;

    orch.execute_turn_cycle(
        NARRATION,
        vec!["agent_alex".into(), "agent_sam".into()],
        1,
        1,
    )
    .await
    .unwrap();
    let result = orch
        .resume_turn_with_dm_input(
            1,
            DmInput::Adjudication {
                adjudication: DmAdjudication::default(),
                laser_feelings_answer: Some("They want you alive.".into()),
            },
        )
        .await
        .unwrap();
    assert_eq!(result.awaiting_phase, Some(TurnPhase::DmOutcome));

    let result = orch
        .resume_turn_with_dm_input(
            1,
            DmInput::Outcome {
                narration: "The pirates break off.".into(),
                laser_feelings_answer: None,
            },
        )
        .await
        .unwrap();
    assert!(result.completed);
    assert_eq!(result.state.retry_count, 1);

    for character in ["char_zara", "char_rook"] {
        let insights = h
            .p2c_for(character)
            .unwrap()
            .into_iter()
            .filter(|m| m.message_type == MessageType::Insight)
            .count();
        assert_eq!(insights, 1, "{character} got the wrong number of insights");
    }

    let outcomes = h
        .router
        .get_messages_for("char_rook", lf_core::AgentType::Character, usize::MAX)
        .unwrap()
        .into_iter()
        .filter(|m| m.channel == Channel::Ic && m.message_type == MessageType::Outcome)
        .count();
    assert_eq!(outcomes, 1);
}

// =============================================================================
// TEST 2: Escalation and DM overrides
// =============================================================================

#[tokio::test]
async fn test_exhausted_retries_escalate_then_transition_recovers() {
    setup();
    let h = harness(
        ScriptedPlayer::new("Evade the pirates").failing_intents(3),
        ScriptedCharacter::new("I try to pull a hard burn"),
        OrchestratorConfig::default().with_max_retries(2),
    );
    let orch = &h.orchestrator;

    let result = orch
        .execute_turn_cycle(NARRATION, vec!["agent_alex".into()], 1, 1)
        .await
        .unwrap();
    assert!(!result.success);
    assert!(!result.awaiting_dm_input);
    assert!(result.dm_intervention_required);
    assert_eq!(result.state.retry_count, 2);
    assert!(result.state.strategic_intents.is_empty());

    let status = orch.get_turn_status(1).await.unwrap();
    assert!(status.dm_intervention_required);
    assert_eq!(status.next_node, Some(TurnPhase::StrategicIntent));
    assert_eq!(status.awaiting_phase, None);

    // Interventions are not answered with ordinary DM input.
    assert!(matches!(
        orch.resume_turn_with_dm_input(
            1,
            DmInput::Adjudication {
                adjudication: DmAdjudication::default(),
                laser_feelings_answer: None
            }
        )
        .await,
        Err(OrchestratorError::NotSuspended(1))
    ));

    let result = orch
        .transition_to_phase(1, "strategic_intent", "Pirate comms jammed; try again")
        .await
        .unwrap();
    assert!(result.success);
    assert!(!result.dm_intervention_required);
    assert_eq!(result.intervention_reason, None);
    assert_eq!(result.awaiting_phase, Some(TurnPhase::DmAdjudication));

    let overrides = &result.state.overrides;
    assert_eq!(overrides.len(), 1);
    assert_eq!(overrides[0].kind, OverrideKind::Transition);
    assert_eq!(overrides[0].from, TurnPhase::StrategicIntent);
    assert_eq!(overrides[0].to, TurnPhase::StrategicIntent);
    assert_eq!(overrides[0].reason, "Pirate comms jammed; try again");
}

#[tokio::test]
async fn test_rollback_reruns_character_action() {
    setup();
    let h = harness(
        ScriptedPlayer::new("Evade the pirates"),
        ScriptedCharacter::new("I try to pull a hard burn"),
        OrchestratorConfig::default(),
    );
    let orch = &h.orchestrator;
    orch.execute_turn_cycle(NARRATION, vec!["agent_alex".into()], 1, 1)
        .await
        .unwrap();

    let result = orch
        .rollback_to_phase(1, "character_action", "Zara should act after the new intel")
        .await
        .unwrap();
    assert_eq!(result.awaiting_phase, Some(TurnPhase::DmAdjudication));
    assert_eq!(h.character("char_zara").unwrap().action_requests().len(), 2);
    assert_eq!(result.state.overrides[0].kind, OverrideKind::Rollback);
    assert_eq!(
        result
            .state
            .phase_history
            .iter()
            .filter(|p| **p == TurnPhase::CharacterAction)
            .count(),
        1
    );
    // Earlier phases are kept.
    assert_eq!(result.state.strategic_intents.len(), 1);
}

#[tokio::test]
async fn test_invalid_overrides() {
    setup();
    let h = harness(
        ScriptedPlayer::new("Evade the pirates"),
        ScriptedCharacter::new("I try to pull a hard burn"),
        OrchestratorConfig::default(),
    );
    let orch = &h.orchestrator;
    orch.execute_turn_cycle(NARRATION, vec!["agent_alex".into()], 1, 1)
        .await
        .unwrap();

    assert!(matches!(
        orch.rollback_to_phase(1, "dice_resolution", "not yet").await,
        Err(OrchestratorError::InvalidRollback(TurnPhase::DiceResolution))
    ));
    assert!(matches!(
        orch.transition_to_phase(1, "hyperspace", "no such phase").await,
        Err(OrchestratorError::UnknownPhase(_))
    ));
    assert!(matches!(
        orch.transition_to_phase(7, "dm_outcome", "no turn").await,
        Err(OrchestratorError::NoCheckpoint(7))
    ));
}

#[tokio::test]
async fn test_transition_skips_to_outcome() {
    setup();
    let h = harness(
        ScriptedPlayer::new("Evade the pirates"),
        ScriptedCharacter::new("I try to pull a hard burn"),
        OrchestratorConfig::default(),
    );
    let orch = &h.orchestrator;
    orch.execute_turn_cycle(NARRATION, vec!["agent_alex".into()], 1, 1)
        .await
        .unwrap();

    // Jumping to an interrupt suspends there for input.
    let result = orch
        .transition_to_phase(1, "dm_outcome", "The pirates simply leave")
        .await
        .unwrap();
    assert_eq!(result.awaiting_phase, Some(TurnPhase::DmOutcome));
    assert!(result.roll_results.is_empty());

    let result = orch
        .resume_turn_with_dm_input(
            1,
            DmInput::Outcome {
                narration: "The pirates veer off toward easier prey.".into(),
                laser_feelings_answer: None,
            },
        )
        .await
        .unwrap();
    assert!(result.completed);
}

// =============================================================================
// TEST 3: Outcome-narrating actions
// =============================================================================

#[tokio::test]
async fn test_offending_action_is_regenerated_stricter() {
    setup();
    let h = harness(
        ScriptedPlayer::new("Evade the pirates"),
        ScriptedCharacter::new("I successfully outrun the pirates")
            .then_narrate("I try to outrun the pirates"),
        OrchestratorConfig::default(),
    );
    let result = h
        .orchestrator
        .execute_turn_cycle(NARRATION, vec!["agent_alex".into()], 1, 1)
        .await
        .unwrap();

    let action = &result.state.character_actions["char_zara"];
    assert_eq!(action.narrative, "I try to outrun the pirates");
    assert_eq!(result.state.validation_attempts, 2);
    assert_eq!(
        result.state.validation_failures["char_zara"],
        vec!["successfully".to_string()]
    );

    let requests = h.character("char_zara").unwrap().action_requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].strictness, ValidationStrictness::Standard);
    assert_eq!(requests[1].strictness, ValidationStrictness::Strict);
    assert_eq!(requests[1].previous_violations, vec!["successfully".to_string()]);
}

#[tokio::test]
async fn test_only_offenders_are_regenerated() {
    setup();
    let h = TestHarness::builder()
        .agent(
            "agent_alex",
            "char_zara",
            "Zara-7",
            3,
            ScriptedPlayer::new("Evade the pirates"),
            ScriptedCharacter::new("I fire and it destroys their engines")
                .then_narrate("I fire at their engines"),
        )
        .agent(
            "agent_sam",
            "char_rex",
            "Rex Nova",
            4,
            ScriptedPlayer::new("Keep the ship in one piece"),
            ScriptedCharacter::new("I try to reroute power to the shields"),
        )
        .build()
        .unwrap();
    h.orchestrator
        .execute_turn_cycle(
            NARRATION,
            vec!["agent_alex".into(), "agent_sam".into()],
            1,
            1,
        )
        .await
        .unwrap();

    assert_eq!(h.character("char_zara").unwrap().action_requests().len(), 2);
    assert_eq!(h.character("char_rex").unwrap().action_requests().len(), 1);
}

#[tokio::test]
async fn test_auto_correct_after_final_attempt() {
    setup();
    let h = harness(
        ScriptedPlayer::new("Evade the pirates"),
        ScriptedCharacter::new("I successfully outrun the pirates")
            .then_narrate("I finally break away from the pirates"),
        OrchestratorConfig::default()
            .with_max_validation_attempts(3)
            .with_validation_fallback(ValidationFallback::AutoCorrect),
    );
    let result = h
        .orchestrator
        .execute_turn_cycle(NARRATION, vec!["agent_alex".into()], 1, 1)
        .await
        .unwrap();

    let action = &result.state.character_actions["char_zara"];
    assert!(validate_intent(&action.narrative).is_valid(), "{}", action.narrative);
    assert_eq!(action.narrative, "I break away from the pirates");
    assert_eq!(result.state.validation_attempts, 3);
    assert!(result.actions_requiring_review.is_empty());

    let requests = h.character("char_zara").unwrap().action_requests();
    assert_eq!(requests[2].strictness, ValidationStrictness::Strictest);
}

#[tokio::test]
async fn test_dm_review_fallback_flags_action() {
    setup();
    let h = harness(
        ScriptedPlayer::new("Evade the pirates"),
        ScriptedCharacter::new("I successfully outrun the pirates"),
        OrchestratorConfig::default()
            .with_max_validation_attempts(2)
            .with_validation_fallback(ValidationFallback::DmReview),
    );
    let result = h
        .orchestrator
        .execute_turn_cycle(NARRATION, vec!["agent_alex".into()], 1, 1)
        .await
        .unwrap();

    assert!(result.actions_requiring_review.contains("char_zara"));
    assert_eq!(
        result.state.character_actions["char_zara"].narrative,
        "I successfully outrun the pirates"
    );
    assert_eq!(result.awaiting_phase, Some(TurnPhase::DmAdjudication));
}
