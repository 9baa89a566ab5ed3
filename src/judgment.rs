//! Turn/judgment state machine for one session, as seen by one participant.

use crate::types::{GuessOutcome, OpponentKind, Phase};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JudgmentError {
    #[error("Cannot guess during the {0:?} phase")]
    NotJudging(Phase),
    #[error("A guess was already submitted")]
    AlreadyGuessed,
}

/// A transition caused by an opponent message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub phase: Phase,
    /// Announce the phase on the session channel so the partner follows
    pub broadcast: bool,
}

#[derive(Debug, Clone)]
pub struct JudgmentMachine {
    opponent_kind: OpponentKind,
    phase: Phase,
    opponent_messages: u32,
    threshold: u32,
    analysis_delay: Duration,
    analysis_deadline: Option<Instant>,
    guess: Option<OpponentKind>,
    outcome: Option<GuessOutcome>,
}

impl JudgmentMachine {
    pub fn new(opponent_kind: OpponentKind, threshold: u32, analysis_delay: Duration) -> Self {
        Self {
            opponent_kind,
            phase: Phase::Playing,
            opponent_messages: 0,
            threshold: threshold.max(1),
            analysis_delay,
            analysis_deadline: None,
            guess: None,
            outcome: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn opponent_messages(&self) -> u32 {
        self.opponent_messages
    }

    pub fn outcome(&self) -> Option<GuessOutcome> {
        self.outcome
    }

    pub fn analysis_deadline(&self) -> Option<Instant> {
        self.analysis_deadline
    }

    fn is_valid_transition(kind: OpponentKind, from: Phase, to: Phase) -> bool {
        use Phase::*;

        match (from, to) {
            (Playing, Analyzing) => kind == OpponentKind::Ai,
            (Playing, Judging) => kind == OpponentKind::Human,
            (Analyzing, Judging) => true,
            (Judging, Outcome) => true,
            _ => false,
        }
    }

    fn transition_to(&mut self, to: Phase) -> bool {
        if !Self::is_valid_transition(self.opponent_kind, self.phase, to) {
            tracing::debug!("Ignoring phase change {:?} -> {:?}", self.phase, to);
            return false;
        }
        tracing::debug!("Judgment phase {:?} -> {:?}", self.phase, to);
        self.phase = to;
        true
    }

    /// Count one opponent-authored message; leaves `playing` at the threshold
    pub fn record_opponent_message(&mut self, now: Instant) -> Option<Step> {
        if self.phase != Phase::Playing {
            return None;
        }
        self.opponent_messages += 1;
        if self.opponent_messages < self.threshold {
            return None;
        }

        match self.opponent_kind {
            OpponentKind::Ai => {
                self.transition_to(Phase::Analyzing);
                self.analysis_deadline = Some(now + self.analysis_delay);
                Some(Step {
                    phase: Phase::Analyzing,
                    broadcast: false,
                })
            }
            OpponentKind::Human => {
                self.transition_to(Phase::Judging);
                Some(Step {
                    phase: Phase::Judging,
                    broadcast: true,
                })
            }
        }
    }

    /// Follow a phase announced by the partner.
    ///
    /// Only moves a human session from `playing` to `judging`; anything else
    /// (duplicates, stale or foreign phases) is ignored.
    pub fn apply_remote_phase(&mut self, phase: Phase) -> bool {
        phase == Phase::Judging
            && self.opponent_kind == OpponentKind::Human
            && self.phase == Phase::Playing
            && self.transition_to(Phase::Judging)
    }

    /// Fire the `analyzing` timeout once it has passed
    pub fn poll(&mut self, now: Instant) -> Option<Phase> {
        match self.analysis_deadline {
            Some(deadline) if self.phase == Phase::Analyzing && now >= deadline => {
                self.analysis_deadline = None;
                self.transition_to(Phase::Judging);
                Some(Phase::Judging)
            }
            _ => None,
        }
    }

    /// Lock in the single guess; scoring happens in the caller
    pub fn begin_guess(&mut self, guess: OpponentKind) -> Result<(), JudgmentError> {
        if self.guess.is_some() {
            return Err(JudgmentError::AlreadyGuessed);
        }
        if self.phase != Phase::Judging {
            return Err(JudgmentError::NotJudging(self.phase));
        }
        self.guess = Some(guess);
        Ok(())
    }

    pub fn guess(&self) -> Option<OpponentKind> {
        self.guess
    }

    /// Enter the terminal phase with the scored outcome
    pub fn finish(&mut self, outcome: GuessOutcome) -> Phase {
        if self.guess.is_some() && self.transition_to(Phase::Outcome) {
            self.outcome = Some(outcome);
        }
        self.phase
    }

    /// Tear down all round-local state
    pub fn reset(&mut self) {
        *self = Self::new(self.opponent_kind, self.threshold, self.analysis_delay);
    }
}
