use std::time::Duration;

use tracing::{debug, warn};

use crate::error::ActionError;
use crate::eyes::ScreenCapturer;
use crate::hands::InputSynthesizer;
use crate::session::CancelFlag;
use crate::types::{
    Action, ActionOutcome, ActionRecord, Bounds, Observation, SCROLL_MAX_NOTCHES,
};

/// Bounded retry for transient timeouts. Validation failures are never
/// retried.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_backoff: Duration::from_millis(150),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// attempt=1 -> base * 2^0, attempt=2 -> base * 2^1, ... capped, plus up
    /// to 25% jitter.
    fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let pow = attempt.saturating_sub(1).min(10);
        let ms = self.base_backoff.as_millis() as u64;
        let factor = 1u64.checked_shl(pow).unwrap_or(u64::MAX);
        let backoff = Duration::from_millis(ms.saturating_mul(factor)).min(self.max_backoff);
        let jitter_ms = (backoff.as_millis() as f64 * 0.25 * rand::random::<f64>()) as u64;
        backoff + Duration::from_millis(jitter_ms)
    }
}

/// Validates one action request and dispatches it to the input synthesizer
/// or the screen capturer. Never lets a failure escape as anything but a
/// typed outcome.
pub struct Executor<H, C> {
    hands: H,
    eyes: C,
    pub retry: RetryPolicy,
}

impl<H: InputSynthesizer, C: ScreenCapturer> Executor<H, C> {
    pub fn new(hands: H, eyes: C) -> Self {
        Self {
            hands,
            eyes,
            retry: RetryPolicy::default(),
        }
    }

    /// Capture with the same retry policy as an explicit Screenshot action.
    pub async fn capture(&self) -> Result<Observation, ActionError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.eyes.capture().await {
                Ok(obs) => return Ok(obs),
                Err(err) if err.is_timeout() && attempt <= self.retry.max_retries => {
                    self.backoff(&err, attempt).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Execute a model response's actions strictly in emitted order.
    ///
    /// On the first failure the remaining actions are recorded as `Skipped`
    /// (later actions may depend on the on-screen effect of earlier ones).
    /// Cancellation is checked before every action; once observed, nothing
    /// further reaches the host.
    ///
    /// If the final action was a successful `Screenshot`, its observation is
    /// returned so the caller can use it as the turn's post-action capture
    /// instead of capturing again.
    pub async fn run_actions(
        &self,
        actions: &[Action],
        bounds: Bounds,
        cancel: &CancelFlag,
    ) -> (Vec<ActionRecord>, Option<Observation>) {
        let mut records = Vec::with_capacity(actions.len());
        let mut fresh: Option<Observation> = None;
        let mut skip_rest = false;

        for action in actions {
            if skip_rest || cancel.is_set() {
                records.push(ActionRecord {
                    action: action.clone(),
                    outcome: ActionOutcome::Skipped,
                });
                continue;
            }

            let (outcome, obs) = self.execute(action, bounds).await;
            fresh = obs;
            if let ActionOutcome::Failed(ref err) = outcome {
                warn!(?action, %err, "action failed; skipping the rest of the response");
                skip_rest = true;
            }
            records.push(ActionRecord {
                action: action.clone(),
                outcome,
            });
        }

        let reuse = match records.last() {
            Some(last)
                if matches!(last.action, Action::Screenshot)
                    && last.outcome == ActionOutcome::Ok =>
            {
                fresh
            }
            _ => None,
        };
        (records, reuse)
    }

    /// Validate and dispatch a single action. A successful Screenshot also
    /// yields the captured observation.
    pub async fn execute(
        &self,
        action: &Action,
        bounds: Bounds,
    ) -> (ActionOutcome, Option<Observation>) {
        if let Err(err) = validate(action, bounds) {
            return (ActionOutcome::Failed(err), None);
        }

        match action {
            Action::Screenshot => match self.capture().await {
                Ok(obs) => (ActionOutcome::Ok, Some(obs)),
                Err(err) => (ActionOutcome::Failed(err), None),
            },
            _ => match self.input_with_retry(action).await {
                Ok(()) => (ActionOutcome::Ok, None),
                Err(err) => (ActionOutcome::Failed(err), None),
            },
        }
    }

    async fn input_with_retry(&self, action: &Action) -> Result<(), ActionError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.dispatch_input(action).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_timeout() && attempt <= self.retry.max_retries => {
                    self.backoff(&err, attempt).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn backoff(&self, err: &ActionError, attempt: u32) {
        let delay = self.retry.backoff_for_attempt(attempt);
        debug!(%err, attempt, ?delay, "timeout; retrying after backoff");
        tokio::time::sleep(delay).await;
    }

    async fn dispatch_input(&self, action: &Action) -> Result<(), ActionError> {
        match action {
            Action::Move { x, y } => self.hands.move_cursor(*x, *y).await,
            Action::Click {
                x,
                y,
                button,
                double,
            } => self.hands.click(*x, *y, *button, *double).await,
            Action::TypeText { text } => self.hands.type_text(text).await,
            Action::KeyPress { key } => self.hands.key_press(key).await,
            Action::Scroll { dx, dy } => {
                let dx = (*dx).clamp(-SCROLL_MAX_NOTCHES, SCROLL_MAX_NOTCHES);
                let dy = (*dy).clamp(-SCROLL_MAX_NOTCHES, SCROLL_MAX_NOTCHES);
                self.hands.scroll(dx, dy).await
            }
            // Dispatched to the capturer in `execute`.
            Action::Screenshot => Ok(()),
        }
    }
}

fn validate(action: &Action, bounds: Bounds) -> Result<(), ActionError> {
    match action {
        Action::Move { x, y } | Action::Click { x, y, .. } => {
            if !bounds.contains(*x, *y) {
                return Err(ActionError::OutOfBounds {
                    x: *x,
                    y: *y,
                    width: bounds.width,
                    height: bounds.height,
                });
            }
        }
        Action::TypeText { text } => {
            if text.chars().any(char::is_control) {
                return Err(ActionError::ControlCharacters);
            }
        }
        Action::KeyPress { key } => {
            if key.is_empty() || key.chars().any(char::is_whitespace) {
                return Err(ActionError::BadKeyChord(key.clone()));
            }
        }
        Action::Scroll { .. } | Action::Screenshot => {}
    }
    Ok(())
}
