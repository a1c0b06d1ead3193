use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use crate::brain::{Brain, ModelClient};
use crate::executor::Executor;
use crate::eyes::ScreenCapturer;
use crate::face::AgentEvent;
use crate::hands::InputSynthesizer;
use crate::session::{CancelFlag, Session, SessionSnapshot, TaskOutcome};
use crate::types::{ActionOutcome, Decision, MAX_TURNS_PER_TASK, SETTLE_DELAY_MS};

#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub max_turns: usize,
    /// Wait after input before capturing, so the UI can settle.
    pub settle_delay: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_turns: MAX_TURNS_PER_TASK,
            settle_delay: Duration::from_millis(SETTLE_DELAY_MS),
        }
    }
}

/// Run one task to a terminal outcome.
///
/// The cycle is: ask the model for a decision, execute its actions strictly
/// in order, wait for the UI to settle, capture a fresh observation, append
/// exactly one turn, feed the observation back. The cancellation flag is
/// checked on resumption from every suspension point; the turn limit is
/// checked before each model call.
pub async fn run_task<M, H, C>(
    task: &str,
    brain: &mut Brain<M>,
    executor: &Executor<H, C>,
    cancel: CancelFlag,
    events: &broadcast::Sender<AgentEvent>,
    snapshots: &watch::Sender<Option<SessionSnapshot>>,
    cfg: &LoopConfig,
) -> TaskOutcome
where
    M: ModelClient,
    H: InputSynthesizer,
    C: ScreenCapturer,
{
    info!(%task, "starting task");
    brain.start_task(task);
    let mut session = Session::new(cfg.max_turns, cancel);

    // Seed the loop with an initial observation; nothing can happen blind.
    let mut obs = match executor.capture().await {
        Ok(obs) => obs,
        Err(err) => return fail(events, format!("initial capture failed: {err}")),
    };
    brain.observe(&obs, &[]);
    snapshots.send_replace(Some(session.snapshot()));

    let mut step_count = 0usize;

    loop {
        if session.cancel_requested() {
            return cancelled(events);
        }
        if session.at_limit() {
            info!(turns = session.turn_count(), "turn limit reached");
            let _ = events.send(AgentEvent::TaskLimitReached {
                turns: session.turn_count(),
            });
            return TaskOutcome::LimitExceeded;
        }

        let _ = events.send(AgentEvent::Thinking);
        let reply = match brain.decide().await {
            Ok(reply) => reply,
            Err(err) => return fail(events, format!("model call failed: {err}")),
        };
        if session.cancel_requested() {
            return cancelled(events);
        }

        let actions = match reply.decision {
            Decision::Done { summary } => {
                info!(%summary, "task complete");
                let _ = events.send(AgentEvent::TaskComplete {
                    summary: summary.clone(),
                });
                return TaskOutcome::Completed { summary };
            }
            Decision::Act { actions } => actions,
        };

        for action in &actions {
            step_count += 1;
            let _ = events.send(AgentEvent::Step {
                number: step_count,
                description: format!("{action:?}"),
            });
        }

        let (records, fresh) = executor
            .run_actions(&actions, obs.bounds(), session.cancel_flag())
            .await;
        for rec in &records {
            if let ActionOutcome::Failed(err) = &rec.outcome {
                let _ = events.send(AgentEvent::StepError {
                    message: err.to_string(),
                });
            }
        }
        if session.cancel_requested() {
            return cancelled(events);
        }

        // A trailing Screenshot action already captured this turn's frame.
        let next_obs = match fresh {
            Some(obs) => obs,
            None => {
                if !actions.is_empty() {
                    tokio::time::sleep(cfg.settle_delay).await;
                }
                match executor.capture().await {
                    Ok(obs) => obs,
                    // The loop cannot proceed without an observation.
                    Err(err) => return fail(events, format!("screen capture failed: {err}")),
                }
            }
        };

        let index = session.push_turn(reply.raw, records.clone(), next_obs.clone());
        snapshots.send_replace(Some(session.snapshot()));
        let _ = events.send(AgentEvent::Turn { index });
        brain.observe(&next_obs, &records);
        obs = next_obs;
    }
}

fn cancelled(events: &broadcast::Sender<AgentEvent>) -> TaskOutcome {
    info!("task cancelled");
    let _ = events.send(AgentEvent::TaskCancelled);
    TaskOutcome::Cancelled
}

fn fail(events: &broadcast::Sender<AgentEvent>, reason: String) -> TaskOutcome {
    warn!(%reason, "task failed");
    let _ = events.send(AgentEvent::TaskFailed {
        message: reason.clone(),
    });
    TaskOutcome::Failed { reason }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use chrono::Utc;

    use super::*;
    use crate::brain::ChatMessage;
    use crate::error::{ActionError, ModelError};
    use crate::types::{ActionRecord, MouseButton, Observation};

    #[derive(Default)]
    struct FakeModel {
        responses: Mutex<VecDeque<Result<String, ModelError>>>,
        calls: Mutex<u32>,
    }

    impl FakeModel {
        fn push(&self, raw: impl Into<String>) {
            self.responses.lock().unwrap().push_back(Ok(raw.into()));
        }

        fn push_err(&self, err: ModelError) {
            self.responses.lock().unwrap().push_back(Err(err));
        }

        fn call_count(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    impl ModelClient for FakeModel {
        async fn complete(&self, _messages: &[ChatMessage]) -> Result<String, ModelError> {
            *self.calls.lock().unwrap() += 1;
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ModelError::Transport("no response queued".to_string())))
        }
    }

    #[derive(Default)]
    struct FakeHands {
        calls: Mutex<Vec<String>>,
        cancel_on_call: Option<CancelFlag>,
    }

    impl FakeHands {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) -> Result<(), ActionError> {
            self.calls.lock().unwrap().push(call);
            if let Some(flag) = &self.cancel_on_call {
                flag.set();
            }
            Ok(())
        }
    }

    impl InputSynthesizer for FakeHands {
        async fn move_cursor(&self, x: i64, y: i64) -> Result<(), ActionError> {
            self.record(format!("move {x} {y}"))
        }

        async fn click(
            &self,
            x: i64,
            y: i64,
            _button: MouseButton,
            _double: bool,
        ) -> Result<(), ActionError> {
            self.record(format!("click {x} {y}"))
        }

        async fn type_text(&self, text: &str) -> Result<(), ActionError> {
            self.record(format!("type {text}"))
        }

        async fn key_press(&self, chord: &str) -> Result<(), ActionError> {
            self.record(format!("key {chord}"))
        }

        async fn scroll(&self, dx: i32, dy: i32) -> Result<(), ActionError> {
            self.record(format!("scroll {dx} {dy}"))
        }
    }

    #[derive(Default)]
    struct FakeEyes {
        captures: Mutex<u32>,
        // One entry per upcoming capture: None succeeds, Some fails.
        plan: Mutex<VecDeque<Option<ActionError>>>,
    }

    impl FakeEyes {
        fn push_ok(&self) {
            self.plan.lock().unwrap().push_back(None);
        }

        fn push_failure(&self, err: ActionError) {
            self.plan.lock().unwrap().push_back(Some(err));
        }

        fn capture_count(&self) -> u32 {
            *self.captures.lock().unwrap()
        }
    }

    impl ScreenCapturer for FakeEyes {
        async fn capture(&self) -> Result<Observation, ActionError> {
            *self.captures.lock().unwrap() += 1;
            if let Some(Some(err)) = self.plan.lock().unwrap().pop_front() {
                return Err(err);
            }
            Ok(Observation {
                png: Arc::new(vec![0u8; 8]),
                width: 800,
                height: 600,
                captured_at: Utc::now(),
            })
        }
    }

    struct Harness {
        model: FakeModel,
        hands: FakeHands,
        eyes: FakeEyes,
        cancel: CancelFlag,
        cfg: LoopConfig,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                model: FakeModel::default(),
                hands: FakeHands::default(),
                eyes: FakeEyes::default(),
                cancel: CancelFlag::new(),
                cfg: LoopConfig {
                    max_turns: MAX_TURNS_PER_TASK,
                    settle_delay: Duration::ZERO,
                },
            }
        }

        async fn run(&self) -> (TaskOutcome, Option<SessionSnapshot>) {
            let mut brain = Brain::new(&self.model);
            brain.base_backoff = Duration::from_millis(1);
            let executor = Executor::new(&self.hands, &self.eyes);
            let (event_tx, _) = broadcast::channel(64);
            let (snap_tx, snap_rx) = watch::channel(None);

            let outcome = run_task(
                "test task",
                &mut brain,
                &executor,
                self.cancel.clone(),
                &event_tx,
                &snap_tx,
                &self.cfg,
            )
            .await;

            let snapshot = snap_rx.borrow().clone();
            (outcome, snapshot)
        }
    }

    fn done(summary: &str) -> String {
        format!(r#"{{"decision":"done","summary":"{summary}"}}"#)
    }

    #[tokio::test]
    async fn done_response_completes_without_touching_the_host() {
        let h = Harness::new();
        h.model.push(done("all set"));

        let (outcome, _) = h.run().await;

        assert_eq!(
            outcome,
            TaskOutcome::Completed {
                summary: "all set".to_string()
            }
        );
        assert!(h.hands.calls().is_empty());
        // Seed capture only.
        assert_eq!(h.eyes.capture_count(), 1);
    }

    #[tokio::test]
    async fn actions_run_in_order_with_one_capture_after_the_batch() {
        let h = Harness::new();
        h.model.push(
            r#"{"decision":"act","actions":[{"action":"Click","x":10,"y":10},{"action":"TypeText","text":"ok"}]}"#,
        );
        h.model.push(done("finished"));

        let (outcome, snapshot) = h.run().await;

        assert!(matches!(outcome, TaskOutcome::Completed { .. }));
        assert_eq!(
            h.hands.calls(),
            vec!["click 10 10".to_string(), "type ok".to_string()]
        );
        // Seed + one post-batch capture.
        assert_eq!(h.eyes.capture_count(), 2);

        let snapshot = snapshot.unwrap();
        assert_eq!(snapshot.turns.len(), 1);
        let records: &Vec<ActionRecord> = &snapshot.turns[0].records;
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.outcome == ActionOutcome::Ok));
    }

    #[tokio::test]
    async fn out_of_bounds_click_fails_locally_and_the_run_continues() {
        let h = Harness::new();
        h.model.push(
            r#"{"decision":"act","actions":[{"action":"Click","x":-5,"y":10},{"action":"TypeText","text":"ok"}]}"#,
        );
        h.model.push(done("recovered"));

        let (outcome, snapshot) = h.run().await;

        assert!(matches!(outcome, TaskOutcome::Completed { .. }));
        assert!(h.hands.calls().is_empty());

        let snapshot = snapshot.unwrap();
        let records = &snapshot.turns[0].records;
        assert!(matches!(
            records[0].outcome,
            ActionOutcome::Failed(ActionError::OutOfBounds { .. })
        ));
        assert_eq!(records[1].outcome, ActionOutcome::Skipped);
    }

    #[tokio::test]
    async fn model_retry_budget_exhaustion_fails_the_session() {
        let h = Harness::new();
        for _ in 0..3 {
            h.model
                .push_err(ModelError::Transport("connection refused".to_string()));
        }

        let (outcome, _) = h.run().await;

        assert!(matches!(outcome, TaskOutcome::Failed { .. }));
        assert_eq!(h.model.call_count(), 3);
        assert!(h.hands.calls().is_empty());
        assert_eq!(h.eyes.capture_count(), 1);
    }

    #[tokio::test]
    async fn turn_limit_ends_the_run_as_limit_exceeded() {
        let mut h = Harness::new();
        h.cfg.max_turns = 1;
        h.model.push(r#"{"decision":"act","actions":[]}"#);

        let (outcome, snapshot) = h.run().await;

        assert_eq!(outcome, TaskOutcome::LimitExceeded);
        assert_eq!(h.model.call_count(), 1);
        assert_eq!(snapshot.unwrap().turns.len(), 1);
    }

    #[tokio::test]
    async fn cancellation_during_execution_skips_the_rest_and_cancels() {
        let mut h = Harness::new();
        h.hands.cancel_on_call = Some(h.cancel.clone());
        h.model.push(
            r#"{"decision":"act","actions":[{"action":"Move","x":1,"y":1},{"action":"Move","x":2,"y":2}]}"#,
        );

        let (outcome, _) = h.run().await;

        assert_eq!(outcome, TaskOutcome::Cancelled);
        assert_eq!(h.hands.calls(), vec!["move 1 1".to_string()]);
    }

    #[tokio::test]
    async fn turn_indices_stay_contiguous_across_cycles() {
        let h = Harness::new();
        h.model.push(r#"{"decision":"act","actions":[]}"#);
        h.model.push(r#"{"decision":"act","actions":[]}"#);
        h.model.push(done("ok"));

        let (_, snapshot) = h.run().await;

        let indices: Vec<u64> = snapshot.unwrap().turns.iter().map(|t| t.index).collect();
        assert_eq!(indices, vec![0, 1]);
    }

    #[tokio::test]
    async fn seed_capture_failure_fails_before_any_model_call() {
        let h = Harness::new();
        h.eyes
            .push_failure(ActionError::Capture("no display".to_string()));

        let (outcome, _) = h.run().await;

        assert!(matches!(outcome, TaskOutcome::Failed { .. }));
        assert_eq!(h.model.call_count(), 0);
    }

    #[tokio::test]
    async fn post_action_capture_failure_fails_the_session() {
        let h = Harness::new();
        h.model
            .push(r#"{"decision":"act","actions":[{"action":"Move","x":1,"y":1}]}"#);
        // Seed succeeds; the post-action capture fails.
        h.eyes.push_ok();
        h.eyes.push_failure(ActionError::Capture("gone".to_string()));

        let (outcome, _) = h.run().await;
        assert!(matches!(outcome, TaskOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn trailing_screenshot_action_replaces_the_post_batch_capture() {
        let h = Harness::new();
        h.model
            .push(r#"{"decision":"act","actions":[{"action":"Screenshot"}]}"#);
        h.model.push(done("looked"));

        let (outcome, snapshot) = h.run().await;

        assert!(matches!(outcome, TaskOutcome::Completed { .. }));
        // Seed + the Screenshot action itself; no extra post-batch capture.
        assert_eq!(h.eyes.capture_count(), 2);
        assert_eq!(snapshot.unwrap().turns.len(), 1);
    }
}
