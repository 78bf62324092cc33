use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod session;

pub use session::{CommitPlan, DrawSession, SessionState, ShuffleTicket};

pub type ParticipantId = i64;

/// Number of re-shuffle steps played before selection unlocks.
pub const DEFAULT_SHUFFLE_STEPS: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Participant {
    pub id: ParticipantId,
    pub name: String,
    pub has_drawn: bool,
    pub is_picked: bool,
    pub picked_who: Option<String>,
}

impl Participant {
    /// A freshly added participant: nothing drawn, nobody picked them.
    pub fn new(id: ParticipantId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            has_drawn: false,
            is_picked: false,
            picked_who: None,
        }
    }

    pub fn reset(&mut self) {
        self.has_drawn = false;
        self.is_picked = false;
        self.picked_who = None;
    }
}

/// Partial update of the mutable draw fields. `None` leaves a field untouched;
/// `picked_who: Some(None)` clears it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParticipantPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_drawn: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_picked: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picked_who: Option<Option<String>>,
}

impl ParticipantPatch {
    pub fn picked() -> Self {
        Self {
            is_picked: Some(true),
            ..Self::default()
        }
    }

    pub fn drawn(target_name: impl Into<String>) -> Self {
        Self {
            has_drawn: Some(true),
            picked_who: Some(Some(target_name.into())),
            ..Self::default()
        }
    }

    pub fn apply(&self, participant: &mut Participant) {
        if let Some(has_drawn) = self.has_drawn {
            participant.has_drawn = has_drawn;
        }
        if let Some(is_picked) = self.is_picked {
            participant.is_picked = is_picked;
        }
        if let Some(picked_who) = &self.picked_who {
            participant.picked_who = picked_who.clone();
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DrawError {
    #[error("cannot {action} while session is {state:?}")]
    IllegalTransition {
        action: &'static str,
        state: SessionState,
    },
    #[error("participant not found")]
    ParticipantNotFound,
    #[error("participant has already drawn")]
    AlreadyDrawn,
    #[error("participant is not in the eligible pool")]
    NotInPool,
    #[error("participant name must not be empty")]
    InvalidName,
}

impl DrawError {
    /// Illegal transitions are dropped silently by callers rather than reported.
    pub fn is_ignorable(&self) -> bool {
        matches!(self, DrawError::IllegalTransition { .. })
    }
}

/// Everyone the actor may still draw: not yet picked by anybody, and not the actor.
pub fn eligible_pool(roster: &[Participant], actor_id: ParticipantId) -> Vec<Participant> {
    roster
        .iter()
        .filter(|p| !p.is_picked && p.id != actor_id)
        .cloned()
        .collect()
}

/// Participants who can still log in to draw.
pub fn selectable_actors(roster: &[Participant]) -> Vec<Participant> {
    roster.iter().filter(|p| !p.has_drawn).cloned().collect()
}

/// One uniform Fisher-Yates pass over the pool.
pub fn shuffle_step<R: Rng + ?Sized>(pool: &mut [Participant], rng: &mut R) {
    pool.shuffle(rng);
}

/// Trimmed roster name, rejecting blank input before it reaches a store.
pub fn validate_name(name: &str) -> Result<&str, DrawError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(DrawError::InvalidName);
    }
    Ok(trimmed)
}
