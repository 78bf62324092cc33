use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{eligible_pool, shuffle_step, DrawError, Participant, ParticipantId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    PoolReady,
    Shuffling,
    Ready,
    Confirming,
    Committed,
    Exhausted,
}

/// Proof that a shuffle was started for a particular session generation.
/// Steps carrying a ticket from an older generation are discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShuffleTicket {
    generation: u64,
}

/// The two writes that finalize a draw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitPlan {
    pub actor_id: ParticipantId,
    pub target_id: ParticipantId,
    pub target_name: String,
    /// The target was already marked picked by an earlier attempt of this commit.
    pub target_claimed: bool,
}

/// One participant's login-through-draw interaction.
///
/// The eligible pool is computed from the roster snapshot handed to [`DrawSession::enter`]
/// and never refreshed; the store's conditional mark-picked catches targets lost to
/// another session in the meantime (see [`DrawSession::target_taken`]).
#[derive(Debug, Clone)]
pub struct DrawSession {
    generation: u64,
    state: SessionState,
    actor: Option<Participant>,
    pool: Vec<Participant>,
    shuffled: bool,
    pending: Option<Participant>,
    committed_target: Option<Participant>,
    commit_in_flight: bool,
    target_claimed: bool,
}

impl Default for DrawSession {
    fn default() -> Self {
        Self::new()
    }
}

impl DrawSession {
    pub fn new() -> Self {
        Self {
            generation: 0,
            state: SessionState::Idle,
            actor: None,
            pool: Vec::new(),
            shuffled: false,
            pending: None,
            committed_target: None,
            commit_in_flight: false,
            target_claimed: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn actor(&self) -> Option<&Participant> {
        self.actor.as_ref()
    }

    pub fn pool(&self) -> &[Participant] {
        &self.pool
    }

    pub fn pending(&self) -> Option<&Participant> {
        self.pending.as_ref()
    }

    pub fn committed_target(&self) -> Option<&Participant> {
        self.committed_target.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_shuffled(&self) -> bool {
        self.shuffled
    }

    pub fn is_shuffling(&self) -> bool {
        self.state == SessionState::Shuffling
    }

    pub fn commit_in_flight(&self) -> bool {
        self.commit_in_flight
    }

    fn illegal(&self, action: &'static str) -> DrawError {
        DrawError::IllegalTransition {
            action,
            state: self.state,
        }
    }

    /// Log `actor_id` in against `roster` and randomize the eligible pool once.
    pub fn enter<R: Rng + ?Sized>(
        &mut self,
        actor_id: ParticipantId,
        roster: &[Participant],
        rng: &mut R,
    ) -> Result<SessionState, DrawError> {
        if self.state != SessionState::Idle {
            return Err(self.illegal("enter"));
        }

        let actor = roster
            .iter()
            .find(|p| p.id == actor_id)
            .ok_or(DrawError::ParticipantNotFound)?;
        if actor.has_drawn {
            return Err(DrawError::AlreadyDrawn);
        }

        let mut pool = eligible_pool(roster, actor_id);
        shuffle_step(&mut pool, rng);

        *self = Self {
            generation: self.generation + 1,
            state: if pool.is_empty() {
                SessionState::Exhausted
            } else {
                SessionState::PoolReady
            },
            actor: Some(actor.clone()),
            pool,
            ..Self::new()
        };
        Ok(self.state)
    }

    /// Re-entering while a shuffle is already running is rejected.
    pub fn start_shuffle(&mut self) -> Result<ShuffleTicket, DrawError> {
        match self.state {
            SessionState::PoolReady | SessionState::Ready => {
                self.state = SessionState::Shuffling;
                Ok(ShuffleTicket {
                    generation: self.generation,
                })
            }
            _ => Err(self.illegal("shuffle")),
        }
    }

    fn check_ticket(&self, ticket: ShuffleTicket, action: &'static str) -> Result<(), DrawError> {
        if ticket.generation != self.generation || self.state != SessionState::Shuffling {
            return Err(self.illegal(action));
        }
        Ok(())
    }

    pub fn shuffle_step<R: Rng + ?Sized>(
        &mut self,
        ticket: ShuffleTicket,
        rng: &mut R,
    ) -> Result<(), DrawError> {
        self.check_ticket(ticket, "shuffle step")?;
        shuffle_step(&mut self.pool, rng);
        Ok(())
    }

    pub fn finish_shuffle(&mut self, ticket: ShuffleTicket) -> Result<(), DrawError> {
        self.check_ticket(ticket, "finish shuffle")?;
        self.shuffled = true;
        self.state = SessionState::Ready;
        Ok(())
    }

    pub fn select(&mut self, target_id: ParticipantId) -> Result<&Participant, DrawError> {
        if self.state != SessionState::Ready || !self.shuffled {
            return Err(self.illegal("select"));
        }
        let target = self
            .pool
            .iter()
            .find(|p| p.id == target_id)
            .ok_or(DrawError::NotInPool)?;

        self.state = SessionState::Confirming;
        Ok(self.pending.insert(target.clone()))
    }

    /// Start committing the pending candidate. Every other transition is ignored
    /// until the commit resolves through `complete_commit`, `abort_commit` or
    /// `target_taken`.
    pub fn begin_commit(&mut self) -> Result<CommitPlan, DrawError> {
        if self.state != SessionState::Confirming || self.commit_in_flight {
            return Err(self.illegal("confirm"));
        }
        let (Some(actor), Some(target)) = (&self.actor, &self.pending) else {
            return Err(self.illegal("confirm"));
        };

        let plan = CommitPlan {
            actor_id: actor.id,
            target_id: target.id,
            target_name: target.name.clone(),
            target_claimed: self.target_claimed,
        };
        self.commit_in_flight = true;
        Ok(plan)
    }

    fn check_in_flight(&self, action: &'static str) -> Result<(), DrawError> {
        if self.state != SessionState::Confirming || !self.commit_in_flight {
            return Err(self.illegal(action));
        }
        Ok(())
    }

    /// The target row is marked picked; a retried commit must not claim it again.
    pub fn record_target_claimed(&mut self) -> Result<(), DrawError> {
        self.check_in_flight("record claim")?;
        self.target_claimed = true;
        Ok(())
    }

    pub fn complete_commit(&mut self) -> Result<&Participant, DrawError> {
        self.check_in_flight("complete commit")?;
        let target = self.pending.take().ok_or(DrawError::NotInPool)?;

        if let Some(actor) = self.actor.as_mut() {
            actor.has_drawn = true;
            actor.picked_who = Some(target.name.clone());
        }
        self.commit_in_flight = false;
        self.target_claimed = false;
        self.state = SessionState::Committed;
        Ok(self.committed_target.insert(target))
    }

    /// A store write failed; stay in `Confirming` so the user can confirm again.
    pub fn abort_commit(&mut self) -> Result<(), DrawError> {
        self.check_in_flight("abort commit")?;
        self.commit_in_flight = false;
        Ok(())
    }

    /// Another session claimed the candidate first. Drop it from the pool and go
    /// back to choosing.
    pub fn target_taken(&mut self) -> Result<SessionState, DrawError> {
        self.check_in_flight("drop taken target")?;
        if let Some(lost) = self.pending.take() {
            self.pool.retain(|p| p.id != lost.id);
        }
        self.commit_in_flight = false;
        self.target_claimed = false;
        self.state = if self.pool.is_empty() {
            SessionState::Exhausted
        } else {
            SessionState::Ready
        };
        Ok(self.state)
    }

    /// `Confirming` backs out to `Ready`; any other non-terminal state leaves the session.
    pub fn cancel(&mut self) -> Result<SessionState, DrawError> {
        match self.state {
            SessionState::Confirming if self.commit_in_flight || self.target_claimed => {
                Err(self.illegal("cancel"))
            }
            SessionState::Confirming => {
                self.pending = None;
                self.state = SessionState::Ready;
                Ok(self.state)
            }
            SessionState::Committed => Err(self.illegal("cancel")),
            _ => self.exit(),
        }
    }

    /// Leave the session from any state. A running shuffle keeps ticking but its
    /// ticket no longer matches. Once the target is claimed the only way out is
    /// finishing the commit.
    pub fn exit(&mut self) -> Result<SessionState, DrawError> {
        if self.commit_in_flight || self.target_claimed {
            return Err(self.illegal("exit"));
        }
        if self.state == SessionState::Idle {
            return Ok(self.state);
        }
        *self = Self {
            generation: self.generation + 1,
            ..Self::new()
        };
        Ok(self.state)
    }
}
