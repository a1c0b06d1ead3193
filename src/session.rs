use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::types::{ActionRecord, Observation};

/// Cooperative cancellation signal. Set by the presentation layer (or a
/// Ctrl-C handler), observed by the loop at every suspension point.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One observe-decide-act cycle: the model's raw response, the actions that
/// were dispatched with their outcomes, and the observation captured after
/// all of them completed.
#[derive(Debug, Clone)]
pub struct Turn {
    pub index: u64,
    pub raw_response: String,
    pub records: Vec<ActionRecord>,
    pub observation: Observation,
}

/// Append-only record of a single automation run. Mutated only by the
/// orchestrator that created it; everyone else reads snapshots.
#[derive(Debug)]
pub struct Session {
    turns: Vec<Turn>,
    max_turns: usize,
    cancel: CancelFlag,
}

impl Session {
    pub fn new(max_turns: usize, cancel: CancelFlag) -> Self {
        Self {
            turns: Vec::new(),
            max_turns,
            cancel,
        }
    }

    pub fn turn_count(&self) -> usize {
        self.turns.len()
    }

    pub fn next_index(&self) -> u64 {
        self.turns.len() as u64
    }

    pub fn at_limit(&self) -> bool {
        self.turns.len() >= self.max_turns
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel.is_set()
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    pub fn push_turn(
        &mut self,
        raw_response: String,
        records: Vec<ActionRecord>,
        observation: Observation,
    ) -> u64 {
        let index = self.next_index();
        self.turns.push(Turn {
            index,
            raw_response,
            records,
            observation,
        });
        index
    }

    /// Read-only copy for external consumers. Turn observations share their
    /// PNG `Arc`s with the live session, so this never copies image bytes.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            turns: self.turns.clone(),
            max_turns: self.max_turns,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub turns: Vec<Turn>,
    pub max_turns: usize,
}

impl SessionSnapshot {
    pub fn latest_observation(&self) -> Option<&Observation> {
        self.turns.last().map(|t| &t.observation)
    }
}

/// How a run ended. The limit outcome is a designed terminal condition,
/// distinct from `Failed`.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed { summary: String },
    Cancelled,
    Failed { reason: String },
    LimitExceeded,
}
