//! Turn-cycle engine for Lasers & Feelings played by AI agents with a human DM.
//!
//! This crate provides:
//! - The Lasers & Feelings dice resolution rules
//! - Channel-isolated message routing (in-character, out-of-character, private)
//! - Consensus detection over player discussion
//! - A checkpointed turn state machine that suspends for DM input
//!
//! Each AI participant is split into a player (strategy, out of character)
//! and the character it controls (in the fiction). Players never speak in
//! character; characters never see the players' table talk.
//!
//! # Quick Start
//!
//! ```ignore
//! use lf_core::{AgentRegistry, DmInput, InMemoryCheckpointStore, TurnOrchestrator};
//! use std::sync::Arc;
//!
//! let mut registry = AgentRegistry::new();
//! registry.register("agent_alex", "char_zara", "Zara-7", 3, player, character)?;
//!
//! let orchestrator =
//!     TurnOrchestrator::builder(registry, Arc::new(InMemoryCheckpointStore::new())).build();
//!
//! let result = orchestrator
//!     .execute_turn_cycle("A signal pulses from deep space.", vec!["agent_alex".into()], 1, 1)
//!     .await?;
//! assert!(result.awaiting_dm_input);
//!
//! let result = orchestrator
//!     .resume_turn_with_dm_input(1, DmInput::Adjudication { adjudication: Default::default(), laser_feelings_answer: None })
//!     .await?;
//! ```

pub mod checkpoint;
pub mod config;
pub mod consensus;
pub mod dice;
pub mod graph;
pub mod id;
pub mod jobs;
pub mod memory;
pub mod message;
pub mod nodes;
pub mod orchestrator;
pub mod registry;
pub mod router;
pub mod state;
pub mod store;
pub mod testing;
pub mod validation;

// Primary public API
pub use checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore};
pub use config::OrchestratorConfig;
pub use consensus::{ConsensusDetector, ConsensusResult, ConsensusState};
pub use dice::{roll_lasers_feelings, LasersFeelingsRoll, RollModifiers, RollOutcome, TaskType};
pub use jobs::{CharacterAgent, JobError, PlayerAgent};
pub use memory::{InMemoryMemoryService, MemoryService};
pub use message::{Channel, Message, MessageType};
pub use orchestrator::{
    DmInput, DmInputType, OrchestratorError, PhaseActionCheck, TurnOrchestrator, TurnResult,
    TurnStatus,
};
pub use registry::AgentRegistry;
pub use router::{AgentType, MessageRouter};
pub use state::{AdjudicationRuling, CharacterAction, DmAdjudication, TurnPhase, TurnState};
pub use testing::{ScriptedCharacter, ScriptedPlayer, TestHarness};
