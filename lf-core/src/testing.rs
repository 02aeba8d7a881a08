//! Testing utilities for the turn cycle.
//!
//! This module provides tools for integration testing:
//! - `ScriptedPlayer` and `ScriptedCharacter` for deterministic agents
//! - `FixedDice` for predetermined rolls
//! - `FlakyMemory` for exercising retry paths
//! - `TestHarness` for wiring an orchestrator around them

use crate::checkpoint::{CheckpointStore, InMemoryCheckpointStore};
use crate::config::OrchestratorConfig;
use crate::dice::{DieRoller, TaskType};
use crate::id::{EpisodeId, MemoryId};
use crate::jobs::{
    ActionRequest, CharacterAgent, ClarificationRequest, DirectiveRequest, DiscussionRequest,
    IntentRequest, JobError, PlayerAgent, ReactionRequest,
};
use crate::memory::{
    CorruptionStats, InMemoryMemoryService, MemoryEdge, MemoryError, MemoryQuery, MemoryService,
};
use crate::message::{Channel, Message};
use crate::orchestrator::TurnOrchestrator;
use crate::registry::{AgentRegistry, RegistryError};
use crate::router::{AgentType, MessageRouter, RouterError};
use crate::state::CharacterAction;
use crate::store::InMemoryStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Take one unit from a failure budget, returning true if one was left.
fn spend(budget: &AtomicU32) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// A player that answers from a script.
#[derive(Debug, Default)]
pub struct ScriptedPlayer {
    /// Intent returned every turn.
    intent: String,
    /// Clarifying question to ask in a given round.
    questions: BTreeMap<u32, String>,
    /// Contribution to every discussion round, if any.
    discussion: Option<String>,
    /// Directive override. The intent is used otherwise.
    directive: Option<String>,
    /// How many more intent calls fail before succeeding.
    intent_failures: AtomicU32,
    /// Names of the calls received, in order.
    calls: Mutex<Vec<&'static str>>,
}

impl ScriptedPlayer {
    pub fn new(intent: impl Into<String>) -> Self {
        Self {
            intent: intent.into(),
            ..Self::default()
        }
    }

    pub fn with_question(mut self, round: u32, question: impl Into<String>) -> Self {
        self.questions.insert(round, question.into());
        self
    }

    pub fn with_discussion(mut self, text: impl Into<String>) -> Self {
        self.discussion = Some(text.into());
        self
    }

    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directive = Some(directive.into());
        self
    }

    /// Fail the next `n` intent calls.
    pub fn failing_intents(self, n: u32) -> Self {
        self.intent_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> Vec<&'static str> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self, name: &str) -> usize {
        lock(&self.calls).iter().filter(|c| **c == name).count()
    }

    fn record(&self, name: &'static str) {
        lock(&self.calls).push(name);
    }
}

#[async_trait]
impl PlayerAgent for ScriptedPlayer {
    async fn clarifying_question(
        &self,
        request: &ClarificationRequest,
    ) -> Result<Option<String>, JobError> {
        self.record("clarifying_question");
        Ok(self.questions.get(&request.round).cloned())
    }

    async fn formulate_intent(&self, request: &IntentRequest) -> Result<String, JobError> {
        self.record("formulate_intent");
        if spend(&self.intent_failures) {
            return Err(JobError::failed(&request.agent_id, "scripted intent failure"));
        }
        Ok(self.intent.clone())
    }

    async fn discuss(&self, _request: &DiscussionRequest) -> Result<Option<String>, JobError> {
        self.record("discuss");
        Ok(self.discussion.clone())
    }

    async fn create_directive(&self, request: &DirectiveRequest) -> Result<String, JobError> {
        self.record("create_directive");
        Ok(self
            .directive
            .clone()
            .unwrap_or_else(|| request.intent.clone()))
    }
}

/// A character that acts from a script.
#[derive(Debug)]
pub struct ScriptedCharacter {
    /// Template for every action. The id is filled in by the graph.
    action: CharacterAction,
    /// Narratives for later validation attempts; the last one repeats.
    retries: Vec<String>,
    reaction: String,
    /// How many more action calls fail before succeeding.
    failures: AtomicU32,
    actions_seen: Mutex<Vec<ActionRequest>>,
    reactions_seen: Mutex<Vec<ReactionRequest>>,
}

impl ScriptedCharacter {
    pub fn new(narrative: impl Into<String>) -> Self {
        Self {
            action: CharacterAction::new("", narrative, TaskType::Lasers),
            retries: Vec::new(),
            reaction: "I steady myself.".to_string(),
            failures: AtomicU32::new(0),
            actions_seen: Mutex::new(Vec::new()),
            reactions_seen: Mutex::new(Vec::new()),
        }
    }

    pub fn feelings(mut self) -> Self {
        self.action.task_type = TaskType::Feelings;
        self
    }

    pub fn prepared(mut self) -> Self {
        self.action = self.action.prepared();
        self
    }

    pub fn expert(mut self) -> Self {
        self.action = self.action.expert();
        self
    }

    pub fn helping(mut self, character_id: impl Into<String>) -> Self {
        self.action = self.action.helping(character_id);
        self
    }

    pub fn with_gm_question(mut self, question: impl Into<String>) -> Self {
        self.action = self.action.with_gm_question(question);
        self
    }

    /// Narrative to use on the next validation attempt.
    pub fn then_narrate(mut self, narrative: impl Into<String>) -> Self {
        self.retries.push(narrative.into());
        self
    }

    /// Fail the next `n` action calls.
    pub fn failing(self, n: u32) -> Self {
        self.failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn with_reaction(mut self, reaction: impl Into<String>) -> Self {
        self.reaction = reaction.into();
        self
    }

    pub fn action_requests(&self) -> Vec<ActionRequest> {
        lock(&self.actions_seen).clone()
    }

    pub fn reaction_requests(&self) -> Vec<ReactionRequest> {
        lock(&self.reactions_seen).clone()
    }
}

#[async_trait]
impl CharacterAgent for ScriptedCharacter {
    async fn perform_action(&self, request: &ActionRequest) -> Result<CharacterAction, JobError> {
        lock(&self.actions_seen).push(request.clone());
        if spend(&self.failures) {
            return Err(JobError::failed(&request.character_id, "scripted action failure"));
        }

        let mut action = self.action.clone();
        action.character_id = request.character_id.clone();
        let attempt = request.attempt.saturating_sub(1) as usize;
        if attempt > 0 {
            if let Some(narrative) = self.retries.get(attempt - 1).or(self.retries.last()) {
                action.narrative = narrative.clone();
            }
        }
        Ok(action)
    }

    async fn react(&self, request: &ReactionRequest) -> Result<String, JobError> {
        lock(&self.reactions_seen).push(request.clone());
        Ok(self.reaction.clone())
    }
}

/// Dice that cycle through a fixed sequence.
#[derive(Debug)]
pub struct FixedDice {
    faces: Vec<u8>,
    next: AtomicUsize,
}

impl FixedDice {
    pub fn new(faces: Vec<u8>) -> Self {
        Self {
            faces,
            next: AtomicUsize::new(0),
        }
    }

    pub fn rolled(&self) -> usize {
        self.next.load(Ordering::SeqCst)
    }
}

impl DieRoller for FixedDice {
    fn roll_d6(&self) -> u8 {
        if self.faces.is_empty() {
            return 1;
        }
        let i = self.next.fetch_add(1, Ordering::SeqCst);
        self.faces[i % self.faces.len()]
    }
}

/// An in-memory service whose first searches fail as unavailable.
#[derive(Debug, Default)]
pub struct FlakyMemory {
    inner: InMemoryMemoryService,
    failures: AtomicU32,
    searches: AtomicU32,
}

impl FlakyMemory {
    pub fn new(failures: u32) -> Self {
        Self {
            inner: InMemoryMemoryService::new(),
            failures: AtomicU32::new(failures),
            searches: AtomicU32::new(0),
        }
    }

    pub fn inner(&self) -> &InMemoryMemoryService {
        &self.inner
    }

    pub fn searches(&self) -> u32 {
        self.searches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MemoryService for FlakyMemory {
    async fn search(&self, query: &MemoryQuery) -> Result<Vec<MemoryEdge>, MemoryError> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        if spend(&self.failures) {
            return Err(MemoryError::Unavailable("scripted outage".to_string()));
        }
        self.inner.search(query).await
    }

    async fn add_episode(
        &self,
        session_number: u32,
        messages: &[Message],
        reference_time: DateTime<Utc>,
        group_id: &str,
    ) -> Result<EpisodeId, MemoryError> {
        self.inner
            .add_episode(session_number, messages, reference_time, group_id)
            .await
    }

    async fn invalidate_memory(
        &self,
        uuid: MemoryId,
        at: Option<DateTime<Utc>>,
    ) -> Result<bool, MemoryError> {
        self.inner.invalidate_memory(uuid, at).await
    }

    async fn get_corruption_stats(&self, agent_id: &str) -> Result<CorruptionStats, MemoryError> {
        self.inner.get_corruption_stats(agent_id).await
    }
}

/// A registered player and character pair for the harness.
struct HarnessAgent {
    agent_id: String,
    character_id: String,
    character_name: String,
    character_number: u8,
    player: Arc<ScriptedPlayer>,
    character: Arc<ScriptedCharacter>,
}

/// Builder for [`TestHarness`].
#[derive(Default)]
pub struct TestHarnessBuilder {
    agents: Vec<HarnessAgent>,
    dice: Option<Vec<u8>>,
    config: Option<OrchestratorConfig>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    memory: Option<Arc<dyn MemoryService>>,
    router: Option<Arc<MessageRouter>>,
}

impl TestHarnessBuilder {
    pub fn agent(
        mut self,
        agent_id: &str,
        character_id: &str,
        character_name: &str,
        character_number: u8,
        player: ScriptedPlayer,
        character: ScriptedCharacter,
    ) -> Self {
        self.agents.push(HarnessAgent {
            agent_id: agent_id.to_string(),
            character_id: character_id.to_string(),
            character_name: character_name.to_string(),
            character_number,
            player: Arc::new(player),
            character: Arc::new(character),
        });
        self
    }

    pub fn dice(mut self, faces: Vec<u8>) -> Self {
        self.dice = Some(faces);
        self
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn checkpoints(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn memory(mut self, memory: Arc<dyn MemoryService>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Share a router with another harness, e.g. across a simulated restart.
    pub fn router(mut self, router: Arc<MessageRouter>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn build(self) -> Result<TestHarness, RegistryError> {
        let mut registry = AgentRegistry::new();
        let mut players = BTreeMap::new();
        let mut characters = BTreeMap::new();
        for agent in self.agents {
            registry.register(
                agent.agent_id.clone(),
                agent.character_id.clone(),
                agent.character_name,
                agent.character_number,
                agent.player.clone(),
                agent.character.clone(),
            )?;
            players.insert(agent.agent_id, agent.player);
            characters.insert(agent.character_id, agent.character);
        }

        let config = self.config.unwrap_or_default();
        let checkpoints = self
            .checkpoints
            .unwrap_or_else(|| Arc::new(InMemoryCheckpointStore::new()));
        let router = self.router.unwrap_or_else(|| {
            Arc::new(MessageRouter::new(Arc::new(InMemoryStore::new())).with_ttl(config.message_ttl))
        });
        let memory = self
            .memory
            .unwrap_or_else(|| Arc::new(InMemoryMemoryService::new()));
        let dice = Arc::new(FixedDice::new(self.dice.unwrap_or_else(|| vec![1])));

        let orchestrator = TurnOrchestrator::builder(registry, Arc::clone(&checkpoints))
            .with_router(Arc::clone(&router))
            .with_memory(Arc::clone(&memory))
            .with_roller(dice.clone())
            .with_config(config)
            .build();

        Ok(TestHarness {
            orchestrator,
            router,
            checkpoints,
            memory,
            dice,
            players,
            characters,
        })
    }
}

/// An orchestrator wired to scripted agents and in-memory stores.
pub struct TestHarness {
    pub orchestrator: TurnOrchestrator,
    pub router: Arc<MessageRouter>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub memory: Arc<dyn MemoryService>,
    pub dice: Arc<FixedDice>,
    players: BTreeMap<String, Arc<ScriptedPlayer>>,
    characters: BTreeMap<String, Arc<ScriptedCharacter>>,
}

impl TestHarness {
    pub fn builder() -> TestHarnessBuilder {
        TestHarnessBuilder::default()
    }

    pub fn player(&self, agent_id: &str) -> Option<&ScriptedPlayer> {
        self.players.get(agent_id).map(Arc::as_ref)
    }

    pub fn character(&self, character_id: &str) -> Option<&ScriptedCharacter> {
        self.characters.get(character_id).map(Arc::as_ref)
    }

    /// Private player-to-character messages a character has received.
    pub fn p2c_for(&self, character_id: &str) -> Result<Vec<Message>, RouterError> {
        Ok(self
            .router
            .get_messages_for(character_id, AgentType::Character, usize::MAX)?
            .into_iter()
            .filter(|m| m.channel == Channel::P2c)
            .collect())
    }

    pub fn ic_messages(&self, character_id: &str) -> Result<Vec<Message>, RouterError> {
        Ok(self
            .router
            .get_messages_for(character_id, AgentType::Character, usize::MAX)?
            .into_iter()
            .filter(|m| m.channel == Channel::Ic)
            .collect())
    }

    pub fn ooc_messages(&self, agent_id: &str) -> Result<Vec<Message>, RouterError> {
        self.router
            .get_messages_for(agent_id, AgentType::Player, usize::MAX)
    }
}
