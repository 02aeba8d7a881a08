//! Lasers & Feelings dice resolution.
//!
//! A character has a single number from 2 to 5. Lasers tasks (technology,
//! science, cold rationality) succeed on dice *under* the number; feelings
//! tasks (intuition, diplomacy, passion) succeed on dice *over* it. A die
//! that lands exactly on the number is a LASER FEELINGS: it counts as a
//! success for either task and lets the character ask the GM a question.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Lowest legal character number.
pub const MIN_CHARACTER_NUMBER: u8 = 2;

/// Highest legal character number.
pub const MAX_CHARACTER_NUMBER: u8 = 5;

/// Base die plus at most two bonus dice.
pub const MAX_DICE: usize = 3;

/// Error type for dice resolution.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DiceError {
    #[error("Character number must be between 2 and 5, got {0}")]
    InvalidCharacterNumber(u8),
    #[error("Die roll must be between 1 and 6, got {0}")]
    InvalidRoll(u8),
    #[error("Unknown task type: {0}")]
    InvalidTaskType(String),
    #[error("Expected between 1 and {max} dice, got {got}")]
    InvalidDiceCount { got: usize, max: usize },
}

/// Which side of the character number a task rolls against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Lasers,
    Feelings,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Lasers => "lasers",
            TaskType::Feelings => "feelings",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = DiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "lasers" => Ok(TaskType::Lasers),
            "feelings" => Ok(TaskType::Feelings),
            other => Err(DiceError::InvalidTaskType(other.to_string())),
        }
    }
}

/// Outcome band, keyed by the number of successful dice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollOutcome {
    /// No successes: things go wrong.
    Failure,
    /// One success: barely manage it, with a complication.
    Barely,
    /// Two successes: clean success.
    Success,
    /// Three successes: critical success with an extra effect.
    Critical,
}

impl RollOutcome {
    pub fn from_successes(successes: u8) -> Self {
        match successes {
            0 => RollOutcome::Failure,
            1 => RollOutcome::Barely,
            2 => RollOutcome::Success,
            _ => RollOutcome::Critical,
        }
    }
}

impl fmt::Display for RollOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RollOutcome::Failure => "failure",
            RollOutcome::Barely => "barely",
            RollOutcome::Success => "success",
            RollOutcome::Critical => "critical",
        };
        f.write_str(label)
    }
}

/// Bonus-die modifiers declared with an action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollModifiers {
    pub prepared: bool,
    pub expert: bool,
    pub helping: bool,
}

impl RollModifiers {
    pub fn new(prepared: bool, expert: bool, helping: bool) -> Self {
        Self {
            prepared,
            expert,
            helping,
        }
    }

    /// One base die, one per modifier, never more than three.
    pub fn dice_count(&self) -> usize {
        let bonus = [self.prepared, self.expert, self.helping]
            .iter()
            .filter(|m| **m)
            .count();
        (1 + bonus).min(MAX_DICE)
    }
}

/// Result of checking a single die.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DieCheck {
    pub success: bool,
    pub laser_feelings: bool,
}

/// Check one die against a character number.
pub fn check_die(roll: u8, character_number: u8, task_type: TaskType) -> Result<DieCheck, DiceError> {
    validate_character_number(character_number)?;
    if !(1..=6).contains(&roll) {
        return Err(DiceError::InvalidRoll(roll));
    }

    if roll == character_number {
        return Ok(DieCheck {
            success: true,
            laser_feelings: true,
        });
    }

    let success = match task_type {
        TaskType::Lasers => roll < character_number,
        TaskType::Feelings => roll > character_number,
    };

    Ok(DieCheck {
        success,
        laser_feelings: false,
    })
}

fn validate_character_number(number: u8) -> Result<(), DiceError> {
    if (MIN_CHARACTER_NUMBER..=MAX_CHARACTER_NUMBER).contains(&number) {
        Ok(())
    } else {
        Err(DiceError::InvalidCharacterNumber(number))
    }
}

/// Immutable result of a Lasers & Feelings roll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LasersFeelingsRoll {
    pub character_number: u8,
    pub task_type: TaskType,
    pub is_prepared: bool,
    pub is_expert: bool,
    pub is_helping: bool,
    pub individual_rolls: Vec<u8>,
    pub die_successes: Vec<bool>,
    /// Indices into `individual_rolls` that landed exactly on the number.
    pub laser_feelings_indices: Vec<usize>,
    pub total_successes: u8,
    pub outcome: RollOutcome,
    /// Question the character wants to ask on a LASER FEELINGS.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gm_question: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl LasersFeelingsRoll {
    /// Resolve an already-rolled set of dice.
    pub fn from_rolls(
        character_number: u8,
        task_type: TaskType,
        modifiers: RollModifiers,
        rolls: Vec<u8>,
        gm_question: Option<String>,
    ) -> Result<Self, DiceError> {
        validate_character_number(character_number)?;
        if rolls.is_empty() || rolls.len() > MAX_DICE {
            return Err(DiceError::InvalidDiceCount {
                got: rolls.len(),
                max: MAX_DICE,
            });
        }

        let mut die_successes = Vec::with_capacity(rolls.len());
        let mut laser_feelings_indices = Vec::new();
        for (index, &roll) in rolls.iter().enumerate() {
            let check = check_die(roll, character_number, task_type)?;
            die_successes.push(check.success);
            if check.laser_feelings {
                laser_feelings_indices.push(index);
            }
        }

        let total_successes = die_successes.iter().filter(|s| **s).count() as u8;

        Ok(Self {
            character_number,
            task_type,
            is_prepared: modifiers.prepared,
            is_expert: modifiers.expert,
            is_helping: modifiers.helping,
            individual_rolls: rolls,
            die_successes,
            laser_feelings_indices,
            total_successes,
            outcome: RollOutcome::from_successes(total_successes),
            gm_question,
            timestamp: Utc::now(),
        })
    }

    /// Whether any die landed exactly on the character number.
    pub fn has_laser_feelings(&self) -> bool {
        !self.laser_feelings_indices.is_empty()
    }

    /// Format the dice for display, starring LASER FEELINGS dice.
    pub fn dice_display(&self) -> String {
        let dice: Vec<String> = self
            .individual_rolls
            .iter()
            .enumerate()
            .map(|(i, roll)| {
                if self.laser_feelings_indices.contains(&i) {
                    format!("{roll}*")
                } else if self.die_successes[i] {
                    format!("{roll}")
                } else {
                    format!("({roll})")
                }
            })
            .collect();
        format!("[{}]", dice.join(", "))
    }
}

impl fmt::Display for LasersFeelingsRoll {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} vs {} ({}) = {} ({} successes)",
            self.dice_display(),
            self.character_number,
            self.task_type,
            self.outcome,
            self.total_successes
        )
    }
}

/// Source of d6 results.
pub trait DieRoller: Send + Sync {
    fn roll_d6(&self) -> u8;
}

/// Uniform d6 from the thread-local RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomRoller;

impl DieRoller for RandomRoller {
    fn roll_d6(&self) -> u8 {
        rand::thread_rng().gen_range(1..=6u8)
    }
}

/// Roll the dice for an action and resolve them.
pub fn roll_lasers_feelings(
    character_number: u8,
    task_type: TaskType,
    modifiers: RollModifiers,
    gm_question: Option<String>,
    roller: &dyn DieRoller,
) -> Result<LasersFeelingsRoll, DiceError> {
    validate_character_number(character_number)?;
    let rolls = (0..modifiers.dice_count()).map(|_| roller.roll_d6()).collect();
    LasersFeelingsRoll::from_rolls(character_number, task_type, modifiers, rolls, gm_question)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_die_rule_all_numbers() {
        for number in MIN_CHARACTER_NUMBER..=MAX_CHARACTER_NUMBER {
            for roll in 1..=6u8 {
                let lasers = check_die(roll, number, TaskType::Lasers).unwrap();
                let feelings = check_die(roll, number, TaskType::Feelings).unwrap();

                if roll == number {
                    assert!(lasers.success && lasers.laser_feelings);
                    assert!(feelings.success && feelings.laser_feelings);
                } else {
                    assert_eq!(lasers.success, roll < number);
                    assert_eq!(feelings.success, roll > number);
                    assert!(!lasers.laser_feelings && !feelings.laser_feelings);
                }
            }
        }
    }

    #[test]
    fn test_number_three_lasers_examples() {
        let m = RollModifiers::default();
        let r = LasersFeelingsRoll::from_rolls(3, TaskType::Lasers, m, vec![2], None).unwrap();
        assert_eq!(r.outcome, RollOutcome::Barely);
        assert!(!r.has_laser_feelings());

        let r = LasersFeelingsRoll::from_rolls(3, TaskType::Lasers, m, vec![3], None).unwrap();
        assert_eq!(r.total_successes, 1);
        assert_eq!(r.laser_feelings_indices, vec![0]);

        let r = LasersFeelingsRoll::from_rolls(3, TaskType::Lasers, m, vec![5], None).unwrap();
        assert_eq!(r.outcome, RollOutcome::Failure);
    }

    #[test]
    fn test_dice_count_scaling() {
        assert_eq!(RollModifiers::new(false, false, false).dice_count(), 1);
        assert_eq!(RollModifiers::new(true, false, false).dice_count(), 2);
        assert_eq!(RollModifiers::new(true, true, false).dice_count(), 3);
        assert_eq!(RollModifiers::new(true, true, true).dice_count(), 3);
    }

    #[test]
    fn test_outcome_bands() {
        let m = RollModifiers::new(true, true, false);
        let r = LasersFeelingsRoll::from_rolls(4, TaskType::Feelings, m, vec![1, 2, 3], None).unwrap();
        assert_eq!(r.outcome, RollOutcome::Failure);
        let r = LasersFeelingsRoll::from_rolls(4, TaskType::Feelings, m, vec![5, 6, 4], None).unwrap();
        assert_eq!(r.outcome, RollOutcome::Critical);
        assert_eq!(r.laser_feelings_indices, vec![2]);
        assert_eq!(r.individual_rolls.len(), r.die_successes.len());
    }

    #[test]
    fn test_validation_errors() {
        let m = RollModifiers::default();
        assert_eq!(
            LasersFeelingsRoll::from_rolls(6, TaskType::Lasers, m, vec![1], None),
            Err(DiceError::InvalidCharacterNumber(6))
        );
        assert_eq!(
            LasersFeelingsRoll::from_rolls(3, TaskType::Lasers, m, vec![7], None),
            Err(DiceError::InvalidRoll(7))
        );
        assert_eq!(
            LasersFeelingsRoll::from_rolls(3, TaskType::Lasers, m, vec![], None),
            Err(DiceError::InvalidDiceCount { got: 0, max: 3 })
        );
        assert!(matches!(
            "lazors".parse::<TaskType>(),
            Err(DiceError::InvalidTaskType(_))
        ));
    }

    #[test]
    fn test_random_roll_range() {
        let m = RollModifiers::new(true, true, true);
        for _ in 0..100 {
            let r = roll_lasers_feelings(3, TaskType::Lasers, m, None, &RandomRoller).unwrap();
            assert_eq!(r.individual_rolls.len(), 3);
            assert!(r.individual_rolls.iter().all(|d| (1..=6).contains(d)));
            assert_eq!(
                r.total_successes as usize,
                r.die_successes.iter().filter(|s| **s).count()
            );
        }
    }

    #[test]
    fn test_display_marks_laser_feelings() {
        let m = RollModifiers::new(true, false, false);
        let r = LasersFeelingsRoll::from_rolls(3, TaskType::Lasers, m, vec![3, 6], None).unwrap();
        assert_eq!(r.dice_display(), "[3*, (6)]");
    }
}
