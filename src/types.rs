use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ActionError;

/// A single abstract input operation the model asks the agent to perform.
///
/// The vocabulary is closed: every handler matches exhaustively, so adding a
/// variant is a compile error until each component covers it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum Action {
    Move {
        x: i64,
        y: i64,
    },
    Click {
        x: i64,
        y: i64,
        #[serde(default)]
        button: MouseButton,
        #[serde(default)]
        double: bool,
    },
    TypeText {
        text: String,
    },
    /// An xdotool-style chord such as `Return` or `ctrl+shift+t`.
    KeyPress {
        key: String,
    },
    /// Wheel deltas in notches; positive dy scrolls down, positive dx right.
    Scroll {
        dx: i32,
        dy: i32,
    },
    Screenshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    #[default]
    Left,
    Middle,
    Right,
}

/// What one model response parses to: either a batch of actions to execute
/// in order, or a completion signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Act {
        #[serde(default)]
        actions: Vec<Action>,
    },
    Done {
        summary: String,
    },
}

/// Screen dimensions declared by an observation. Coordinates are validated
/// against `[0, width) x [0, height)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    pub width: u32,
    pub height: u32,
}

impl Bounds {
    pub fn contains(&self, x: i64, y: i64) -> bool {
        x >= 0 && y >= 0 && x < i64::from(self.width) && y < i64::from(self.height)
    }
}

/// A captured screen image plus metadata. Immutable once created; the PNG is
/// shared via `Arc` so session snapshots keep the same reference instead of
/// copying image bytes.
#[derive(Debug, Clone)]
pub struct Observation {
    pub png: Arc<Vec<u8>>,
    pub width: u32,
    pub height: u32,
    pub captured_at: DateTime<Utc>,
}

impl Observation {
    pub fn bounds(&self) -> Bounds {
        Bounds {
            width: self.width,
            height: self.height,
        }
    }
}

/// Outcome of dispatching one action.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    Ok,
    Failed(ActionError),
    /// Not attempted: an earlier action in the same response failed, or
    /// cancellation was observed first.
    Skipped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionRecord {
    pub action: Action,
    pub outcome: ActionOutcome,
}

pub const MAX_TURNS_PER_TASK: usize = 25;

/// Keystroke pacing for synthesized typing.
pub const TYPING_DELAY_MS: u64 = 12;
pub const TYPING_GROUP_SIZE: usize = 50;

/// Wait for the UI to settle after input before capturing the next frame.
pub const SETTLE_DELAY_MS: u64 = 2_000;

pub const INPUT_TIMEOUT_MS: u64 = 10_000;
pub const CAPTURE_TIMEOUT_MS: u64 = 10_000;
pub const MODEL_TIMEOUT_MS: u64 = 120_000;

pub const SCROLL_MAX_NOTCHES: i32 = 20;
